//! End-to-end scenarios over the in-memory relay with scripted LLM
//! providers: simple reply, delegation fan-out/fan-in, duplicate
//! delivery across a restart, stop mid-stream, and orphaned replies.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use tenex_daemon::agents::{AgentStore, StoredAgent};
use tenex_daemon::project::{ProjectRuntime, SharedDeps};
use tenex_daemon::subscriptions::SubscriptionManager;
use tenex_domain::agent::{AgentDefinition, ProjectDefinition};
use tenex_domain::config::Config;
use tenex_domain::event::Event;
use tenex_domain::kind;
use tenex_domain::stream::{BoxStream, StreamEvent};
use tenex_domain::Result;
use tenex_providers::{ChatRequest, LlmProvider, ProviderRegistry};
use tenex_relay::{InMemoryRelay, RelayClient};

const PM_PK: &str = "pm-pubkey";
const DEV_PK: &str = "dev-pubkey";
const QA_PK: &str = "qa-pubkey";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted provider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum Script {
    /// Play these events, then end the stream.
    Events(Vec<StreamEvent>),
    /// Play these events, then hang until the stream is dropped.
    Hang(Vec<StreamEvent>),
}

struct ScriptedProvider {
    id: String,
    turns: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    fn new(id: &str, turns: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    fn last_request(&self) -> Option<ChatRequest> {
        self.requests.lock().last().cloned()
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        self.requests.lock().push(req.clone());
        let script = self
            .turns
            .lock()
            .pop_front()
            .unwrap_or_else(|| Script::Events(vec![token("ok"), done()]));
        match script {
            Script::Events(events) => Ok(Box::pin(futures_util::stream::iter(
                events.into_iter().map(Ok),
            ))),
            Script::Hang(events) => Ok(Box::pin(
                futures_util::stream::iter(events.into_iter().map(Ok))
                    .chain(futures_util::stream::pending()),
            )),
        }
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

use futures_util::StreamExt as _;

fn token(text: &str) -> StreamEvent {
    StreamEvent::Token { text: text.into() }
}

fn done() -> StreamEvent {
    StreamEvent::Done {
        usage: None,
        finish_reason: Some("stop".into()),
    }
}

fn tool_call(name: &str, arguments: serde_json::Value) -> StreamEvent {
    StreamEvent::ToolCallFinished {
        call_id: format!("call-{name}"),
        tool_name: name.into(),
        arguments,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Harness {
    _tmp: tempfile::TempDir,
    relay: Arc<InMemoryRelay>,
    deps: SharedDeps,
    definition: ProjectDefinition,
    runtime: Option<ProjectRuntime>,
    project_id: String,
}

fn stored_agent(slug: &str, pubkey: &str, tools: &[&str]) -> StoredAgent {
    StoredAgent {
        definition: AgentDefinition {
            slug: slug.into(),
            pubkey: pubkey.into(),
            name: slug.to_uppercase(),
            role: format!("{slug} agent"),
            instructions: format!("You are the {slug}."),
            tools: tools.iter().map(|t| t.to_string()).collect::<BTreeSet<_>>(),
            llm_config: Some(slug.to_string()),
            is_pm: false,
        },
        nsec: Some(format!("{slug}-secret")),
    }
}

async fn start_harness(providers: HashMap<String, Arc<dyn LlmProvider>>) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.data.root = tmp.path().to_path_buf();
    let config = Arc::new(config);

    let relay = Arc::new(InMemoryRelay::new());
    let agent_store = Arc::new(AgentStore::open(&config.data.agents_dir()).unwrap());
    agent_store.save(stored_agent("pm", PM_PK, &["delegate"])).unwrap();
    agent_store.save(stored_agent("dev", DEV_PK, &[])).unwrap();
    agent_store.save(stored_agent("qa", QA_PK, &[])).unwrap();

    let (activations_tx, _activations_rx) = tokio::sync::mpsc::channel(16);
    let subscriptions = SubscriptionManager::new(
        relay.clone() as Arc<dyn RelayClient>,
        vec![],
        activations_tx,
    );
    subscriptions.start();

    let deps = SharedDeps {
        config,
        relay: relay.clone() as Arc<dyn RelayClient>,
        providers: Arc::new(ProviderRegistry::with_providers(providers, None)),
        agent_store,
        subscriptions,
    };

    let definition = ProjectDefinition {
        d_tag: "testproj".into(),
        owner_pubkey: "owner-pk".into(),
        title: "Test Project".into(),
        agents: vec![PM_PK.into(), DEV_PK.into(), QA_PK.into()],
        pm: Some(PM_PK.into()),
        mcp_servers: vec![],
    };
    let project_id = definition.address();
    let runtime = ProjectRuntime::start(definition.clone(), deps.clone())
        .await
        .unwrap();

    Harness {
        _tmp: tmp,
        relay,
        deps,
        definition,
        runtime: Some(runtime),
        project_id,
    }
}

async fn wait_for<T>(mut probe: impl FnMut() -> Option<T>) -> T {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(value) = probe() {
            return value;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 5s"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn thread_root(id: &str, author: &str, content: &str, project_id: &str) -> Event {
    Event {
        id: id.into(),
        pubkey: author.into(),
        created_at: chrono::Utc::now().timestamp(),
        kind: kind::THREAD_ROOT,
        tags: vec![vec!["a".into(), project_id.into()]],
        content: content.into(),
        sig: "sig".into(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// S1 — simple reply
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn simple_reply_routes_to_pm() {
    let pm = ScriptedProvider::new("pm", vec![Script::Events(vec![token("Hello back!"), done()])]);
    let mut providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();
    providers.insert("pm".into(), pm.clone());
    let h = start_harness(providers).await;

    h.relay
        .inject(thread_root("x", "user-pk", "Hello", &h.project_id));

    let reply = wait_for(|| {
        h.relay
            .published_of_kind(kind::GENERIC_REPLY)
            .into_iter()
            .find(|e| e.pubkey == PM_PK)
    })
    .await;

    assert!(!reply.content.is_empty());
    assert_eq!(reply.content, "Hello back!");
    let root_ref = reply.root_ref().unwrap();
    assert_eq!(root_ref.id, "x");
    assert_eq!(root_ref.marker.as_deref(), Some("root"));

    let ctx = &h.runtime.as_ref().unwrap().ctx;
    let conv = wait_for(|| ctx.conversations.get("x")).await;
    assert_eq!(conv.root_event_id, "x");
    // Streaming frames were published for UI consumers.
    assert!(!h.relay.published_of_kind(kind::STREAMING_EPHEMERAL).is_empty());
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// S2 — delegation fan-out / fan-in
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn delegation_fans_out_and_reactivates_delegator_once() {
    let pm = ScriptedProvider::new(
        "pm",
        vec![
            Script::Events(vec![tool_call(
                "delegate",
                serde_json::json!({"recipients": ["dev", "qa"], "content": "summarize the repo"}),
            )]),
            Script::Events(vec![token("Combined summary of both reports."), done()]),
        ],
    );
    let dev = ScriptedProvider::new(
        "dev",
        vec![Script::Events(vec![tool_call(
            "complete",
            serde_json::json!({"content": "dev report"}),
        )])],
    );
    let qa = ScriptedProvider::new(
        "qa",
        vec![Script::Events(vec![tool_call(
            "complete",
            serde_json::json!({"content": "qa report"}),
        )])],
    );
    let mut providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();
    providers.insert("pm".into(), pm.clone());
    providers.insert("dev".into(), dev.clone());
    providers.insert("qa".into(), qa.clone());
    let h = start_harness(providers).await;

    h.relay
        .inject(thread_root("root-1", "user-pk", "Please summarize", &h.project_id));

    // Two tasks, each p-tagged to exactly one recipient, e-tagged to
    // the conversation root.
    let tasks = wait_for(|| {
        let tasks = h.relay.published_of_kind(kind::DELEGATION_TASK);
        (tasks.len() == 2).then_some(tasks)
    })
    .await;
    let mut recipients: Vec<String> = tasks
        .iter()
        .map(|t| t.p_tags().first().unwrap().to_string())
        .collect();
    recipients.sort();
    assert_eq!(recipients, vec![DEV_PK, QA_PK]);
    for task in &tasks {
        assert_eq!(task.pubkey, PM_PK);
        assert_eq!(task.root_ref().unwrap().id, "root-1");
        assert_eq!(task.p_tags().len(), 1);
    }

    // Both recipients answer with delegation responses.
    let responses = wait_for(|| {
        let responses = h.relay.published_of_kind(kind::DELEGATION_RESPONSE);
        (responses.len() == 2).then_some(responses)
    })
    .await;
    for response in &responses {
        assert_eq!(response.p_tags(), vec![PM_PK]);
    }

    // The batch completes and the PM produces the synthesis.
    let synthesis = wait_for(|| {
        h.relay
            .published_of_kind(kind::GENERIC_REPLY)
            .into_iter()
            .find(|e| e.pubkey == PM_PK && e.content.contains("Combined summary"))
    })
    .await;
    assert_eq!(synthesis.root_ref().unwrap().id, "root-1");

    // Exactly one re-activation: the PM saw two model calls in total,
    // and the second one carried both responses in a single block.
    assert_eq!(pm.request_count(), 2);
    let last = pm.last_request().unwrap();
    let joined: String = last
        .messages
        .iter()
        .map(|m| m.content.extract_all_text())
        .collect::<Vec<_>>()
        .join("\n");
    assert!(joined.contains("All delegated tasks have completed"));
    assert!(joined.contains("dev report"));
    assert!(joined.contains("qa report"));

    // Registry bookkeeping: the batch is complete with matching key
    // sets.
    let ctx = &h.runtime.as_ref().unwrap().ctx;
    let batches = ctx.delegations.batches_for_conversation("root-1");
    assert_eq!(batches.len(), 1);
    assert_eq!(
        batches[0].state,
        tenex_domain::delegation::BatchState::Complete
    );
    assert!(batches[0].task_ids.keys().eq(batches[0].responses.keys()));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// S3 — duplicate delivery across a restart
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn duplicate_delivery_after_restart_produces_no_second_reply() {
    let pm = ScriptedProvider::new(
        "pm",
        vec![
            Script::Events(vec![token("First answer."), done()]),
            // A second invocation would consume this and publish again.
            Script::Events(vec![token("Second answer."), done()]),
        ],
    );
    let mut providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();
    providers.insert("pm".into(), pm.clone());
    let mut h = start_harness(providers).await;

    h.relay
        .inject(thread_root("dup-root", "user-pk", "Hello", &h.project_id));
    wait_for(|| {
        h.relay
            .published_of_kind(kind::GENERIC_REPLY)
            .into_iter()
            .find(|e| e.pubkey == PM_PK)
    })
    .await;
    // Let the executor finish persisting.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Crash before the debounced cache write: stop the runtime, then
    // discard the processed-event cache as if it never flushed.
    h.runtime.take().unwrap().stop().await;
    let cache_path = h
        .deps
        .config
        .data
        .project_dir(&h.project_id)
        .join("processed-events.json");
    std::fs::remove_file(&cache_path).unwrap();

    let runtime = ProjectRuntime::start(h.definition.clone(), h.deps.clone())
        .await
        .unwrap();

    // The transport re-delivers the same event.
    h.relay.redeliver("dup-root");
    tokio::time::sleep(Duration::from_millis(300)).await;

    let replies: Vec<Event> = h
        .relay
        .published_of_kind(kind::GENERIC_REPLY)
        .into_iter()
        .filter(|e| e.pubkey == PM_PK)
        .collect();
    assert_eq!(replies.len(), 1, "duplicate delivery must not re-publish");
    assert_eq!(pm.request_count(), 1, "the model must not be called again");

    runtime.stop().await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// S4 — stop request mid-stream
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn stop_request_cancels_streaming_turn() {
    let pm = ScriptedProvider::new(
        "pm",
        vec![Script::Hang(vec![token("I am thinking about "), token("this ")])],
    );
    let mut providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();
    providers.insert("pm".into(), pm.clone());
    let h = start_harness(providers).await;

    h.relay
        .inject(thread_root("stop-root", "user-pk", "Long task", &h.project_id));

    // Streaming started: frames are flowing.
    wait_for(|| {
        (!h.relay.published_of_kind(kind::STREAMING_EPHEMERAL).is_empty()).then_some(())
    })
    .await;

    h.relay.inject(Event {
        id: "stop-1".into(),
        pubkey: "user-pk".into(),
        created_at: chrono::Utc::now().timestamp(),
        kind: kind::STOP_REQUEST,
        tags: vec![
            vec!["e".into(), "stop-root".into(), String::new(), "root".into()],
            vec!["p".into(), PM_PK.into()],
        ],
        content: String::new(),
        sig: "sig".into(),
    });

    let cancelled = wait_for(|| {
        h.relay
            .published_of_kind(kind::GENERIC_REPLY)
            .into_iter()
            .find(|e| e.pubkey == PM_PK && e.content.contains("[cancelled]"))
    })
    .await;
    // Partial text survives in the cancellation reply.
    assert!(cancelled.content.contains("I am thinking about"));

    let ctx = &h.runtime.as_ref().unwrap().ctx;
    wait_for(|| ctx.operations.is_empty().then_some(())).await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// S5 — orphaned replies
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn orphan_reply_recovers_thread_from_relay() {
    let pm = ScriptedProvider::new("pm", vec![Script::Events(vec![token("Recovered."), done()])]);
    let mut providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();
    providers.insert("pm".into(), pm.clone());
    let h = start_harness(providers).await;

    // The root exists on the relay but was never routed to the daemon
    // (no project or agent tags).
    h.relay.inject(Event {
        id: "old-root".into(),
        pubkey: "user-pk".into(),
        created_at: 100,
        kind: kind::THREAD_ROOT,
        tags: vec![],
        content: "an old thread".into(),
        sig: "sig".into(),
    });

    // A reply referencing it arrives, addressed to the PM.
    h.relay.inject(Event {
        id: "late-reply".into(),
        pubkey: "user-pk".into(),
        created_at: 200,
        kind: kind::GENERIC_REPLY,
        tags: vec![
            vec!["e".into(), "old-root".into(), String::new(), "root".into()],
            vec!["p".into(), PM_PK.into()],
        ],
        content: "picking this back up".into(),
        sig: "sig".into(),
    });

    let ctx = &h.runtime.as_ref().unwrap().ctx;
    let conv = wait_for(|| ctx.conversations.get("old-root")).await;
    assert_eq!(conv.root_event_id, "old-root");
    wait_for(|| {
        ctx.conversations
            .get("old-root")
            .filter(|c| c.contains_event("late-reply"))
    })
    .await;
    assert_eq!(conv.metadata.get("orphaned"), None);

    // The PM answers in the recovered conversation.
    let reply = wait_for(|| {
        h.relay
            .published_of_kind(kind::GENERIC_REPLY)
            .into_iter()
            .find(|e| e.pubkey == PM_PK)
    })
    .await;
    assert_eq!(reply.root_ref().unwrap().id, "old-root");
}

#[tokio::test]
async fn unrecoverable_orphan_becomes_annotated_root() {
    let pm = ScriptedProvider::new("pm", vec![Script::Events(vec![token("Noted."), done()])]);
    let mut providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();
    providers.insert("pm".into(), pm.clone());
    let h = start_harness(providers).await;

    h.relay.inject(Event {
        id: "lost-reply".into(),
        pubkey: "user-pk".into(),
        created_at: 200,
        kind: kind::GENERIC_REPLY,
        tags: vec![
            vec!["e".into(), "missing-root".into(), String::new(), "root".into()],
            vec!["p".into(), PM_PK.into()],
        ],
        content: "replying into the void".into(),
        sig: "sig".into(),
    });

    let ctx = &h.runtime.as_ref().unwrap().ctx;
    let conv = wait_for(|| ctx.conversations.get("lost-reply")).await;
    assert_eq!(conv.root_event_id, "lost-reply");
    assert_eq!(conv.metadata.get("orphaned").map(String::as_str), Some("true"));
}
