//! One WebSocket connection: outbound channel, reliable-send table,
//! topic bindings.
//!
//! `send_reliable` wraps a payload in the reliability envelope and
//! keeps a record until the client ACKs it or the timeout fires — no
//! automatic retries; the timeout is the caller's signal (a client
//! behind on ACKs recovers via cursor resume, not re-sends).

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use convoy_domain::{now_millis, Event};
use convoy_protocol::{ControlMessage, Frame, ReliableEnvelope};
use convoy_queue::{QueueEntry, QueueSubscription};

/// Frames the writer task can put on the socket.
pub enum WsOutbound {
    Text(String),
    Ping,
    Close,
}

/// Callbacks for one reliable send.
pub struct ReliableOptions {
    pub timeout: Duration,
    pub on_ack: Option<Box<dyn FnOnce() + Send>>,
    pub on_timeout: Option<Box<dyn FnOnce() + Send>>,
}

impl ReliableOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            on_ack: None,
            on_timeout: None,
        }
    }
}

struct PendingReliable {
    on_ack: Option<Box<dyn FnOnce() + Send>>,
    timeout_task: tokio::task::JoinHandle<()>,
}

pub struct Connection {
    pub connection_id: String,
    outbound: mpsc::Sender<WsOutbound>,
    default_reliable_timeout: Duration,
    reliable: Mutex<HashMap<String, PendingReliable>>,
    /// Live queue subscriptions keyed by topic.
    bindings: Mutex<HashMap<String, QueueSubscription>>,
    /// Entry pump feeding `send_reliable`; installed by the socket task.
    delivery: Mutex<Option<mpsc::Sender<QueueEntry>>>,
    pub connected_at: i64,
    last_seen: Mutex<i64>,
}

impl Connection {
    pub fn new(
        connection_id: String,
        outbound: mpsc::Sender<WsOutbound>,
        default_reliable_timeout: Duration,
    ) -> Self {
        let now = now_millis();
        Self {
            connection_id,
            outbound,
            default_reliable_timeout,
            reliable: Mutex::new(HashMap::new()),
            bindings: Mutex::new(HashMap::new()),
            delivery: Mutex::new(None),
            connected_at: now,
            last_seen: Mutex::new(now),
        }
    }

    // ── Plain sends ──────────────────────────────────────────────────

    pub fn send_text(&self, text: String) {
        if self.outbound.try_send(WsOutbound::Text(text)).is_err() {
            tracing::warn!(
                connection_id = %self.connection_id,
                "outbound channel full, dropping frame"
            );
        }
    }

    pub fn send_event(&self, event: &Event) {
        self.send_text(Frame::Event(event.clone()).encode());
    }

    pub fn send_ping(&self) -> bool {
        self.outbound.try_send(WsOutbound::Ping).is_ok()
    }

    pub fn request_close(&self) {
        let _ = self.outbound.try_send(WsOutbound::Close);
    }

    // ── Reliable sends ───────────────────────────────────────────────

    /// Send a payload wrapped in the reliability envelope. Returns the
    /// envelope id. Never blocks and never errors on network failure;
    /// the timeout path is the sole signal.
    pub fn send_reliable(self: &Arc<Self>, payload: Value, options: ReliableOptions) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let envelope = ReliableEnvelope::new(&id, payload);

        let weak: Weak<Connection> = Arc::downgrade(self);
        let task_id = id.clone();
        let mut on_timeout = options.on_timeout;
        let timeout = options.timeout;
        let timeout_task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(connection) = weak.upgrade() else {
                return;
            };
            if connection.reliable.lock().remove(&task_id).is_some() {
                tracing::debug!(
                    connection_id = %connection.connection_id,
                    envelope_id = %task_id,
                    "reliable send timed out"
                );
                if let Some(callback) = on_timeout.take() {
                    callback();
                }
            }
        });

        self.reliable.lock().insert(
            id.clone(),
            PendingReliable {
                on_ack: options.on_ack,
                timeout_task,
            },
        );

        self.send_text(Frame::Reliable(envelope).encode());
        id
    }

    /// Deliver one queue entry under the reliable envelope.
    pub fn send_queue_entry(self: &Arc<Self>, entry: &QueueEntry) {
        let control = Frame::Control(ControlMessage::QueueEntry {
            topic: entry.topic.clone(),
            cursor: entry.cursor.clone(),
            event: entry.event.clone(),
        });
        let payload = serde_json::from_str(&control.encode()).unwrap_or(Value::Null);
        let connection_id = self.connection_id.clone();
        let cursor = entry.cursor.clone();
        let options = ReliableOptions {
            timeout: self.default_reliable_timeout,
            on_ack: None,
            on_timeout: Some(Box::new(move || {
                // The entry stays in the queue; the client catches up
                // through cursor resume on its next subscribe.
                tracing::debug!(
                    connection_id = %connection_id,
                    cursor = %cursor,
                    "queue entry delivery unacknowledged"
                );
            })),
        };
        self.send_reliable(payload, options);
    }

    /// Client ACKed an envelope: evict the record, cancel its timeout.
    pub fn handle_ack(&self, id: &str) {
        if let Some(mut pending) = self.reliable.lock().remove(id) {
            pending.timeout_task.abort();
            if let Some(callback) = pending.on_ack.take() {
                callback();
            }
        } else {
            tracing::debug!(
                connection_id = %self.connection_id,
                envelope_id = %id,
                "ack for unknown envelope"
            );
        }
    }

    pub fn pending_reliable(&self) -> usize {
        self.reliable.lock().len()
    }

    /// Wait for outstanding reliable sends to be ACKed or to time out,
    /// up to `max_wait`.
    pub async fn drain_pending(&self, max_wait: Duration) {
        let deadline = tokio::time::Instant::now() + max_wait;
        while self.pending_reliable() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    // ── Topic bindings ───────────────────────────────────────────────

    pub fn set_delivery(&self, sender: mpsc::Sender<QueueEntry>) {
        *self.delivery.lock() = Some(sender);
    }

    pub fn delivery_sender(&self) -> Option<mpsc::Sender<QueueEntry>> {
        self.delivery.lock().clone()
    }

    /// Attach a live subscription for a topic, replacing any previous
    /// one.
    pub fn bind_topic(&self, topic: &str, subscription: QueueSubscription) {
        if let Some(previous) = self.bindings.lock().insert(topic.to_owned(), subscription) {
            previous.unsubscribe();
        }
    }

    pub fn unbind_topic(&self, topic: &str) {
        if let Some(subscription) = self.bindings.lock().remove(topic) {
            subscription.unsubscribe();
        }
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        self.bindings.lock().keys().cloned().collect()
    }

    // ── Liveness ─────────────────────────────────────────────────────

    pub fn touch(&self) {
        *self.last_seen.lock() = now_millis();
    }

    pub fn last_seen(&self) -> i64 {
        *self.last_seen.lock()
    }

    /// Drop subscriptions and outstanding reliable state (disconnect).
    pub fn teardown(&self) {
        for (_, subscription) in self.bindings.lock().drain() {
            subscription.unsubscribe();
        }
        for (_, pending) in self.reliable.lock().drain() {
            pending.timeout_task.abort();
        }
        *self.delivery.lock() = None;
    }
}
