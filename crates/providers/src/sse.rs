//! SSE decoding for streaming chat completions.

use crate::util::from_reqwest;
use tenex_domain::error::Result;
use tenex_domain::stream::{BoxStream, StreamEvent};

/// Incremental decoder for `text/event-stream` bodies.
///
/// Frames are separated by a blank line. Only `data:` lines matter for
/// the chat-completion protocols; when a frame carries several, they
/// are joined with a newline per the SSE specification.
#[derive(Default)]
pub(crate) struct SseDecoder {
    pending: String,
}

impl SseDecoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Feed one body chunk; returns the payload of every frame the
    /// chunk completed. Incomplete trailing input stays buffered.
    pub(crate) fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.pending.push_str(chunk);
        let mut payloads = Vec::new();
        while let Some(end) = self.pending.find("\n\n") {
            let frame: String = self.pending.drain(..end + 2).collect();
            if let Some(payload) = frame_payload(&frame) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// Payload of a trailing frame the server never terminated.
    pub(crate) fn finish(self) -> Option<String> {
        frame_payload(&self.pending)
    }
}

fn frame_payload(frame: &str) -> Option<String> {
    let data: Vec<&str> = frame
        .lines()
        .filter_map(|line| line.trim().strip_prefix("data:"))
        .map(str::trim)
        .filter(|payload| !payload.is_empty())
        .collect();
    if data.is_empty() {
        None
    } else {
        Some(data.join("\n"))
    }
}

/// Turn an SSE `reqwest::Response` into a stream of provider events.
///
/// `parse` maps one frame payload to zero or more events and is `FnMut`
/// so parsers may keep assembly state across frames. When the body ends
/// without a terminal chunk, a fallback `Done` is appended so the
/// caller's turn accounting always converges.
pub(crate) fn decode_response<F>(
    response: reqwest::Response,
    mut parse: F,
) -> BoxStream<'static, Result<StreamEvent>>
where
    F: FnMut(&str) -> Vec<Result<StreamEvent>> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut response = response;
        let mut decoder = SseDecoder::new();
        let mut saw_done = false;

        loop {
            let chunk = match response.chunk().await {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(from_reqwest(e));
                    return;
                }
            };
            let Some(bytes) = chunk else { break };
            for payload in decoder.feed(&String::from_utf8_lossy(&bytes)) {
                for event in parse(&payload) {
                    saw_done |= matches!(&event, Ok(StreamEvent::Done { .. }));
                    yield event;
                }
            }
        }

        if let Some(tail) = decoder.finish() {
            for event in parse(&tail) {
                saw_done |= matches!(&event, Ok(StreamEvent::Done { .. }));
                yield event;
            }
        }
        if !saw_done {
            yield Ok(StreamEvent::Done { usage: None, finish_reason: None });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_complete_across_chunk_boundaries() {
        let mut decoder = SseDecoder::new();
        assert_eq!(decoder.feed("data: one\n\ndata: tw"), vec!["one"]);
        assert_eq!(decoder.feed("o\n\n"), vec!["two"]);
    }

    #[test]
    fn multiple_data_lines_join_with_newline() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.feed("data: first\ndata: second\n\n");
        assert_eq!(payloads, vec!["first\nsecond"]);
    }

    #[test]
    fn non_data_lines_are_ignored() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.feed("event: message\nid: 7\nretry: 100\ndata: payload\n\n");
        assert_eq!(payloads, vec!["payload"]);
    }

    #[test]
    fn empty_frames_yield_nothing() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(": keepalive\n\n\n\n").is_empty());
    }

    #[test]
    fn finish_flushes_unterminated_frame() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed("data: tail").is_empty());
        assert_eq!(decoder.finish().as_deref(), Some("tail"));
        assert_eq!(SseDecoder::new().finish(), None);
    }
}
