//! Production relay client: a pool of WebSocket connections, one per
//! configured relay URL.
//!
//! Wire framing (JSON arrays over text frames):
//! - client → relay: `["REQ", subId, filter…]`, `["CLOSE", subId]`,
//!   `["EVENT", event]`
//! - relay → client: `["EVENT", subId, event]`, `["EOSE", subId]`,
//!   `["OK", eventId, accepted, message]`, `["NOTICE", message]`
//!
//! Each connection runs one background task that reconnects with
//! exponential backoff (100 ms → 30 s) and re-issues the consolidated
//! subscription after every reconnect. Inbound events are deduplicated
//! across relays before fan-out.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use tenex_domain::event::Event;
use tenex_domain::{Error, Result};

use crate::filter::Filter;
use crate::traits::RelayClient;

/// Subscription id of the daemon's consolidated live subscription.
const LIVE_SUB_ID: &str = "live";

/// Cross-relay inbound dedup window.
const SEEN_CAP: usize = 8192;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reconnect policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Controls how a connection reconnects after a drop: exponential
/// back-off between attempts, reset once a connect succeeds.
#[derive(Clone, Copy)]
struct ReconnectPolicy {
    initial_delay: Duration,
    max_delay: Duration,
}

impl ReconnectPolicy {
    const RELAY: Self = Self {
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(30),
    };

    /// Delay before the given attempt (0-indexed).
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.initial_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
            .min(self.max_delay)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared pool state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct SeenSet {
    order: VecDeque<String>,
    set: HashSet<String>,
}

impl SeenSet {
    fn insert(&mut self, id: &str) -> bool {
        if !self.set.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > SEEN_CAP {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }
}

enum FetchMsg {
    Event(Event),
    Eose,
}

struct FetchState {
    filters: Vec<Filter>,
    tx: mpsc::UnboundedSender<FetchMsg>,
}

struct Shared {
    subscription: Mutex<Vec<Filter>>,
    events_tx: broadcast::Sender<Event>,
    seen: Mutex<SeenSet>,
    fetches: Mutex<HashMap<String, FetchState>>,
    closed: AtomicBool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RelayPool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ConnHandle {
    url: String,
    cmd_tx: mpsc::UnboundedSender<String>,
    task: tokio::task::JoinHandle<()>,
}

/// Pool of relay connections behind the [`RelayClient`] contract.
pub struct RelayPool {
    conns: Vec<ConnHandle>,
    shared: Arc<Shared>,
}

impl RelayPool {
    pub fn connect(urls: &[String]) -> Self {
        let (events_tx, _) = broadcast::channel(1024);
        let shared = Arc::new(Shared {
            subscription: Mutex::new(Vec::new()),
            events_tx,
            seen: Mutex::new(SeenSet {
                order: VecDeque::new(),
                set: HashSet::new(),
            }),
            fetches: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        let conns = urls
            .iter()
            .map(|url| {
                let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
                let task = tokio::spawn(connection_loop(
                    url.clone(),
                    shared.clone(),
                    cmd_rx,
                ));
                ConnHandle {
                    url: url.clone(),
                    cmd_tx,
                    task,
                }
            })
            .collect();

        Self { conns, shared }
    }

    fn send_all(&self, frame: String) -> Result<()> {
        let mut delivered = false;
        for conn in &self.conns {
            if conn.cmd_tx.send(frame.clone()).is_ok() {
                delivered = true;
            } else {
                tracing::warn!(url = %conn.url, "relay connection task is gone");
            }
        }
        if delivered {
            Ok(())
        } else {
            Err(Error::Transport("no live relay connections".into()))
        }
    }

    pub fn relay_count(&self) -> usize {
        self.conns.len()
    }
}

fn req_frame(sub_id: &str, filters: &[Filter]) -> String {
    let mut arr = vec![
        serde_json::Value::String("REQ".into()),
        serde_json::Value::String(sub_id.into()),
    ];
    for f in filters {
        arr.push(serde_json::to_value(f).unwrap_or_default());
    }
    serde_json::Value::Array(arr).to_string()
}

#[async_trait::async_trait]
impl RelayClient for RelayPool {
    async fn update_subscription(&self, filters: Vec<Filter>) -> Result<()> {
        *self.shared.subscription.lock() = filters.clone();
        self.send_all(req_frame(LIVE_SUB_ID, &filters))
    }

    async fn publish(&self, event: Event) -> Result<()> {
        let frame = serde_json::json!(["EVENT", event]).to_string();
        self.send_all(frame)
    }

    async fn fetch(&self, filters: Vec<Filter>, timeout: Duration) -> Result<Vec<Event>> {
        let sub_id = format!("fetch-{}", uuid::Uuid::new_v4());
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.shared.fetches.lock().insert(
            sub_id.clone(),
            FetchState {
                filters: filters.clone(),
                tx,
            },
        );
        let sent = self.send_all(req_frame(&sub_id, &filters));
        if sent.is_err() {
            self.shared.fetches.lock().remove(&sub_id);
            return sent.map(|_| Vec::new());
        }

        let mut events: Vec<Event> = Vec::new();
        let mut eose_remaining = self.conns.len();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(FetchMsg::Event(event))) => {
                    if !events.iter().any(|e| e.id == event.id) {
                        events.push(event);
                    }
                }
                Ok(Some(FetchMsg::Eose)) => {
                    eose_remaining = eose_remaining.saturating_sub(1);
                    if eose_remaining == 0 {
                        break;
                    }
                }
                // Channel closed or timeout: return what we have.
                Ok(None) | Err(_) => break,
            }
        }

        self.shared.fetches.lock().remove(&sub_id);
        let _ = self.send_all(serde_json::json!(["CLOSE", sub_id]).to_string());
        Ok(events)
    }

    fn incoming(&self) -> broadcast::Receiver<Event> {
        self.shared.events_tx.subscribe()
    }

    async fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        for conn in &self.conns {
            conn.task.abort();
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-connection task
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn connection_loop(
    url: String,
    shared: Arc<Shared>,
    mut cmd_rx: mpsc::UnboundedReceiver<String>,
) {
    let policy = ReconnectPolicy::RELAY;
    let mut attempt: u32 = 0;

    loop {
        if shared.closed.load(Ordering::Acquire) {
            return;
        }

        let socket = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((socket, _)) => {
                tracing::info!(url = %url, "relay connected");
                attempt = 0;
                socket
            }
            Err(e) => {
                let delay = policy.delay_for_attempt(attempt);
                attempt += 1;
                tracing::warn!(url = %url, error = %e, delay_ms = delay.as_millis() as u64, "relay connect failed");
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        let (mut sink, mut stream) = socket.split();

        // Re-issue the consolidated subscription and any in-flight
        // fetches on every (re)connect.
        let mut initial_frames = Vec::new();
        {
            let sub = shared.subscription.lock();
            if !sub.is_empty() {
                initial_frames.push(req_frame(LIVE_SUB_ID, &sub));
            }
        }
        {
            let fetches = shared.fetches.lock();
            for (sub_id, fetch) in fetches.iter() {
                initial_frames.push(req_frame(sub_id, &fetch.filters));
            }
        }
        let mut send_failed = false;
        for frame in initial_frames {
            if sink.send(WsMessage::Text(frame)).await.is_err() {
                send_failed = true;
                break;
            }
        }
        if send_failed {
            let delay = policy.delay_for_attempt(attempt);
            attempt += 1;
            tokio::time::sleep(delay).await;
            continue;
        }

        // Pump commands and inbound frames until either side fails.
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(frame) => {
                            if sink.send(WsMessage::Text(frame)).await.is_err() {
                                tracing::warn!(url = %url, "relay send failed, reconnecting");
                                break;
                            }
                        }
                        // Pool dropped: shut the connection down.
                        None => return,
                    }
                }
                msg = stream.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            handle_frame(&url, &shared, &text);
                        }
                        Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {}
                        Some(Ok(WsMessage::Close(_))) | None => {
                            tracing::info!(url = %url, "relay closed connection");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!(url = %url, error = %e, "relay read error");
                            break;
                        }
                    }
                }
            }
        }

        if shared.closed.load(Ordering::Acquire) {
            return;
        }
        let delay = policy.delay_for_attempt(attempt);
        attempt += 1;
        tokio::time::sleep(delay).await;
    }
}

fn handle_frame(url: &str, shared: &Shared, text: &str) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        tracing::debug!(url = %url, "ignoring unparseable relay frame");
        return;
    };
    let Some(arr) = value.as_array() else { return };
    match arr.first().and_then(|v| v.as_str()) {
        Some("EVENT") => {
            let (Some(sub_id), Some(raw)) = (arr.get(1).and_then(|v| v.as_str()), arr.get(2))
            else {
                return;
            };
            let Ok(event) = serde_json::from_value::<Event>(raw.clone()) else {
                tracing::debug!(url = %url, "dropping malformed event");
                return;
            };
            if sub_id == LIVE_SUB_ID {
                if shared.seen.lock().insert(&event.id) {
                    let _ = shared.events_tx.send(event);
                }
            } else if let Some(fetch) = shared.fetches.lock().get(sub_id) {
                let _ = fetch.tx.send(FetchMsg::Event(event));
            }
        }
        Some("EOSE") => {
            if let Some(sub_id) = arr.get(1).and_then(|v| v.as_str()) {
                if let Some(fetch) = shared.fetches.lock().get(sub_id) {
                    let _ = fetch.tx.send(FetchMsg::Eose);
                }
            }
        }
        Some("OK") => {
            let accepted = arr.get(2).and_then(|v| v.as_bool()).unwrap_or(false);
            if !accepted {
                tracing::warn!(
                    url = %url,
                    event_id = arr.get(1).and_then(|v| v.as_str()).unwrap_or(""),
                    message = arr.get(3).and_then(|v| v.as_str()).unwrap_or(""),
                    "relay rejected event"
                );
            }
        }
        Some("NOTICE") => {
            tracing::debug!(
                url = %url,
                notice = arr.get(1).and_then(|v| v.as_str()).unwrap_or(""),
                "relay notice"
            );
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn req_frame_includes_all_filters() {
        let frame = req_frame(
            "live",
            &[
                Filter::new().kinds([11]),
                Filter::new().authors(["alice"]),
            ],
        );
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value[0], "REQ");
        assert_eq!(value[1], "live");
        assert_eq!(value[2]["kinds"][0], 11);
        assert_eq!(value[3]["authors"][0], "alice");
    }

    #[test]
    fn reconnect_delay_grows_and_caps() {
        let policy = ReconnectPolicy::RELAY;
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn seen_set_is_bounded() {
        let mut seen = SeenSet {
            order: VecDeque::new(),
            set: HashSet::new(),
        };
        for i in 0..(SEEN_CAP + 10) {
            assert!(seen.insert(&format!("id-{i}")));
        }
        assert_eq!(seen.set.len(), SEEN_CAP);
        // The oldest entries were evicted and count as unseen again.
        assert!(seen.insert("id-0"));
        // Recent entries still dedupe.
        assert!(!seen.insert(&format!("id-{}", SEEN_CAP + 9)));
    }
}
