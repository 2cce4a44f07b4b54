//! OpenAI-compatible adapter.
//!
//! Works with OpenAI, Ollama, vLLM, LM Studio, OpenRouter, and any other
//! endpoint following the OpenAI chat completions contract.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tenex_domain::config::ProviderConfig;
use tenex_domain::error::{Error, Result};
use tenex_domain::stream::{BoxStream, StreamEvent, Usage};
use tenex_domain::tool::{ContentPart, Message, MessageContent, Role, ToolDefinition};

use crate::traits::{ChatRequest, LlmProvider};
use crate::util::from_reqwest;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn from_config(slug: &str, cfg: &ProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            // Connect guard only; streaming reads are governed by the
            // caller's timeouts.
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(from_reqwest)?;

        Ok(Self {
            id: slug.to_string(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.resolve_api_key(),
            default_model: cfg.model.clone(),
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
            client,
        })
    }

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(url)
            .header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }
        builder
    }

    fn wire_request(&self, req: &ChatRequest) -> WireRequest {
        WireRequest {
            model: req
                .model
                .clone()
                .unwrap_or_else(|| self.default_model.clone()),
            messages: req.messages.iter().map(WireMessage::from_message).collect(),
            stream: true,
            stream_options: serde_json::json!({"include_usage": true}),
            tools: req.tools.iter().map(wire_tool).collect(),
            temperature: req.temperature.or(self.temperature),
            max_tokens: req.max_tokens.or(self.max_tokens),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire request types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    stream_options: Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

/// One message in chat-completions form. `content` serializes as
/// `null` for assistant turns that only carry tool calls.
#[derive(Serialize)]
struct WireMessage {
    role: Role,
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: &'static str,
    function: WireFunction,
}

#[derive(Serialize)]
struct WireFunction {
    name: String,
    /// JSON-encoded argument object, as the wire format demands.
    arguments: String,
}

impl WireMessage {
    fn from_message(msg: &Message) -> Self {
        let mut wire = WireMessage {
            role: msg.role,
            content: Some(msg.content.extract_all_text()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        };
        let MessageContent::Parts(parts) = &msg.content else {
            return wire;
        };
        for part in parts {
            match part {
                ContentPart::ToolUse { id, name, input } if msg.role == Role::Assistant => {
                    wire.tool_calls.push(WireToolCall {
                        id: id.clone(),
                        call_type: "function",
                        function: WireFunction {
                            name: name.clone(),
                            arguments: input.to_string(),
                        },
                    });
                }
                ContentPart::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } if msg.role == Role::Tool => {
                    wire.tool_call_id = Some(tool_use_id.clone());
                    wire.content = Some(content.clone());
                }
                _ => {}
            }
        }
        if !wire.tool_calls.is_empty() && wire.content.as_deref() == Some("") {
            wire.content = None;
        }
        wire
    }
}

/// A [`ToolDefinition`] already is the `function` object of the wire
/// format; it only needs the envelope.
fn wire_tool(def: &ToolDefinition) -> Value {
    serde_json::json!({"type": "function", "function": def})
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream chunk decoding
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: DeltaContent,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct DeltaContent {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<DeltaToolCall>,
}

#[derive(Deserialize)]
struct DeltaToolCall {
    #[serde(default)]
    index: u64,
    id: Option<String>,
    #[serde(default)]
    function: DeltaFunction,
}

#[derive(Deserialize, Default)]
struct DeltaFunction {
    name: Option<String>,
    arguments: Option<String>,
}

/// Decode one frame payload into stream events. A single chunk may
/// carry text, tool-call fragments, and a finish reason at once; each
/// becomes its own event, in that order.
fn events_of_payload(data: &str) -> Vec<Result<StreamEvent>> {
    if data == "[DONE]" {
        return vec![Ok(StreamEvent::Done {
            usage: None,
            finish_reason: Some("stop".into()),
        })];
    }
    let chunk: StreamChunk = match serde_json::from_str(data) {
        Ok(chunk) => chunk,
        Err(e) => return vec![Err(Error::Json(e))],
    };

    let usage = chunk.usage;
    let Some(choice) = chunk.choices.into_iter().next() else {
        // Usage-only trailer emitted by stream_options.include_usage.
        return match usage {
            Some(usage) => vec![Ok(StreamEvent::Done {
                usage: Some(usage),
                finish_reason: None,
            })],
            None => Vec::new(),
        };
    };

    let mut events = Vec::new();
    for call in choice.delta.tool_calls {
        let DeltaFunction { name, arguments } = call.function;
        match call.id {
            // The first fragment of a call announces its id and name,
            // and may already carry argument bytes.
            Some(id) => {
                events.push(Ok(StreamEvent::ToolCallStarted {
                    call_id: id.clone(),
                    tool_name: name.unwrap_or_default(),
                }));
                if let Some(delta) = arguments {
                    if !delta.is_empty() {
                        events.push(Ok(StreamEvent::ToolCallDelta { call_id: id, delta }));
                    }
                }
            }
            // Later fragments are keyed by stream index only.
            None => {
                if let Some(delta) = arguments {
                    events.push(Ok(StreamEvent::ToolCallDelta {
                        call_id: call.index.to_string(),
                        delta,
                    }));
                }
            }
        }
    }
    if let Some(text) = choice.delta.content {
        if !text.is_empty() {
            events.push(Ok(StreamEvent::Token { text }));
        }
    }
    if let Some(reason) = choice.finish_reason {
        events.push(Ok(StreamEvent::Done {
            usage,
            finish_reason: Some(reason),
        }));
    }
    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.wire_request(req);

        tracing::debug!(provider = %self.id, url = %url, "chat stream request");

        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let err_text = resp.text().await.map_err(from_reqwest)?;
            return Err(Error::Http(format!(
                "{}: HTTP {} - {}",
                self.id,
                status.as_u16(),
                err_text
            )));
        }

        Ok(crate::sse::decode_response(resp, events_of_payload))
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}
