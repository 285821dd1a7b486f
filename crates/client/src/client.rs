//! The client: connection lifecycle, frame dispatch, ACKs and resume.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use convoy_domain::{Event, EventCategory, EventContext, EventPayload};
use convoy_protocol::{ControlMessage, Frame, ReliableAck};

use crate::reconnect::ReconnectBackoff;
use crate::storage::KvStorage;
use crate::types::{ClientError, CloseHandler, ErrorHandler, EventHandler, OpenHandler};

pub(crate) struct ClientInner {
    pub(crate) url: String,
    pub(crate) base_client_id: String,
    pub(crate) instance_id: String,
    pub(crate) connection_timeout: Duration,
    pub(crate) backoff: ReconnectBackoff,
    pub(crate) storage: Arc<dyn KvStorage>,
    pub(crate) topics: Mutex<HashSet<String>>,
    pub(crate) outbound: Mutex<Option<mpsc::Sender<String>>>,
    pub(crate) pending: Mutex<HashMap<String, oneshot::Sender<Event>>>,
    pub(crate) on_message: Mutex<Vec<EventHandler>>,
    pub(crate) on_open: Mutex<Vec<OpenHandler>>,
    pub(crate) on_close: Mutex<Vec<CloseHandler>>,
    pub(crate) on_error: Mutex<Vec<ErrorHandler>>,
    pub(crate) shutdown: CancellationToken,
}

/// Handle to the client; cheap to clone, clones share the connection.
///
/// Create via [`ConvoyClientBuilder`](crate::builder::ConvoyClientBuilder).
#[derive(Clone)]
pub struct ConvoyClient {
    pub(crate) inner: Arc<ClientInner>,
}

impl ConvoyClient {
    /// `{base_client_id}:{instance_id}` — the identity consumers and
    /// cursors are keyed by.
    pub fn client_id(&self) -> String {
        format!("{}:{}", self.inner.base_client_id, self.inner.instance_id)
    }

    fn cursor_key(&self, topic: &str) -> String {
        format!("convoy.cursor.{}.{topic}", self.client_id())
    }

    /// The last ACKed cursor stored for a topic, if any.
    pub fn stored_cursor(&self, topic: &str) -> Option<String> {
        self.inner.storage.get(&self.cursor_key(topic))
    }

    // ── Handler registration ─────────────────────────────────────────

    pub fn on_message(&self, handler: impl Fn(&Event) + Send + Sync + 'static) {
        self.inner.on_message.lock().push(Arc::new(handler));
    }

    pub fn on_open(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.inner.on_open.lock().push(Arc::new(handler));
    }

    pub fn on_close(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.inner.on_close.lock().push(Arc::new(handler));
    }

    pub fn on_error(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        self.inner.on_error.lock().push(Arc::new(handler));
    }

    // ── Topics ───────────────────────────────────────────────────────

    /// Subscribe to a topic. Takes effect immediately when connected
    /// and re-applies automatically on every reconnect, resuming from
    /// the stored cursor.
    pub fn subscribe(&self, topic: &str) {
        self.inner.topics.lock().insert(topic.to_owned());
        self.send_subscribe(topic);
    }

    pub fn unsubscribe(&self, topic: &str) {
        self.inner.topics.lock().remove(topic);
        self.try_send_text(
            Frame::Control(ControlMessage::QueueUnsubscribe {
                topic: topic.to_owned(),
                client_id: self.client_id(),
            })
            .encode(),
        );
    }

    fn send_subscribe(&self, topic: &str) {
        self.try_send_text(
            Frame::Control(ControlMessage::QueueSubscribe {
                topic: topic.to_owned(),
                client_id: self.client_id(),
                after_cursor: self.stored_cursor(topic),
            })
            .encode(),
        );
    }

    fn resubscribe_all(&self) {
        let topics: Vec<String> = self.inner.topics.lock().iter().cloned().collect();
        for topic in topics {
            self.send_subscribe(&topic);
        }
    }

    // ── Sending ──────────────────────────────────────────────────────

    /// Send a plain event frame.
    pub fn send(&self, event: &Event) -> Result<(), ClientError> {
        let text = serde_json::to_string(event)?;
        let sender = self
            .inner
            .outbound
            .lock()
            .clone()
            .ok_or(ClientError::NotConnected)?;
        sender
            .try_send(text)
            .map_err(|_| ClientError::NotConnected)
    }

    fn try_send_text(&self, text: String) {
        if let Some(sender) = self.inner.outbound.lock().clone() {
            if sender.try_send(text).is_err() {
                tracing::warn!("outbound channel full, dropping frame");
            }
        }
    }

    /// Emit a `*_request` command event and await the matching
    /// response (direct or via `queue_entry`); times out after
    /// `timeout`. The pending record is removed on every exit path, so
    /// a late response is dropped rather than dispatched.
    pub async fn request(
        &self,
        kind: &str,
        mut data: Value,
        timeout: Duration,
    ) -> Result<Event, ClientError> {
        let object = data
            .as_object_mut()
            .ok_or_else(|| ClientError::Other("request data must be a JSON object".into()))?;
        let request_id = uuid::Uuid::new_v4().to_string();
        object.insert("requestId".into(), Value::String(request_id.clone()));

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(request_id.clone(), tx);

        let event = Event::command_request(kind, data, EventContext::default());
        if let Err(error) = self.send(&event) {
            self.inner.pending.lock().remove(&request_id);
            return Err(error);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ClientError::Shutdown),
            Err(_) => {
                self.inner.pending.lock().remove(&request_id);
                Err(ClientError::Timeout(format!(
                    "no response to {kind} within {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Spawn the connection loop.
    pub fn start(&self) -> tokio::task::JoinHandle<Result<(), ClientError>> {
        let client = self.clone();
        tokio::spawn(async move { client.run().await })
    }

    /// Connect, dispatch, and reconnect with back-off until `close()`
    /// or `max_retries` exhaustion.
    pub async fn run(&self) -> Result<(), ClientError> {
        let mut attempt: u32 = 0;

        loop {
            if self.inner.shutdown.is_cancelled() {
                return Err(ClientError::Shutdown);
            }

            let result = tokio::select! {
                r = self.connect_and_run() => r,
                _ = self.inner.shutdown.cancelled() => {
                    tracing::info!(client_id = %self.client_id(), "client shutdown requested");
                    return Err(ClientError::Shutdown);
                }
            };

            match result {
                Ok(()) => {
                    tracing::info!(client_id = %self.client_id(), "connection closed");
                    attempt = 0;
                }
                Err(error) => {
                    tracing::warn!(
                        client_id = %self.client_id(),
                        attempt,
                        error = %error,
                        "connection failed"
                    );
                    for handler in self.inner.on_error.lock().clone() {
                        handler(&error.to_string());
                    }
                }
            }

            if self.inner.backoff.should_give_up(attempt) {
                return Err(ClientError::ReconnectExhausted(attempt));
            }

            let delay = self.inner.backoff.delay_for_attempt(attempt);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.inner.shutdown.cancelled() => return Err(ClientError::Shutdown),
            }
            attempt += 1;
        }
    }

    /// Close the connection and stop reconnecting.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
        *self.inner.outbound.lock() = None;
    }

    /// Close and release handlers and pending requests.
    pub fn dispose(&self) {
        self.close();
        self.inner.on_message.lock().clear();
        self.inner.on_open.lock().clear();
        self.inner.on_close.lock().clear();
        self.inner.on_error.lock().clear();
        self.inner.pending.lock().clear();
    }

    async fn connect_and_run(&self) -> anyhow::Result<()> {
        tracing::info!(url = %self.inner.url, client_id = %self.client_id(), "connecting");

        let connect = tokio_tungstenite::connect_async(&self.inner.url);
        let (ws, _response) = tokio::time::timeout(self.inner.connection_timeout, connect)
            .await
            .map_err(|_| anyhow::anyhow!("connection timeout"))??;
        let (mut sink, mut stream) = ws.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(64);
        *self.inner.outbound.lock() = Some(outbound_tx);

        // Writer task: forwards outbound frames to the socket.
        let writer = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        });

        for handler in self.inner.on_open.lock().clone() {
            handler();
        }
        // Resume every subscribed topic from its stored cursor.
        self.resubscribe_all();

        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => self.dispatch_text(&text),
                Ok(Message::Close(_)) => break,
                // Binary frames are reserved; WS ping/pong is handled
                // by tungstenite.
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(error = %error, "websocket read failed");
                    break;
                }
            }
        }

        *self.inner.outbound.lock() = None;
        writer.abort();
        for handler in self.inner.on_close.lock().clone() {
            handler();
        }
        Ok(())
    }

    // ── Inbound dispatch ─────────────────────────────────────────────

    pub(crate) fn dispatch_text(&self, text: &str) {
        match Frame::decode(text) {
            None => tracing::debug!("ignoring unparseable frame"),
            Some(Frame::Reliable(envelope)) => {
                // ACK before dispatching the inner payload.
                self.try_send_text(Frame::Ack(ReliableAck::new(&envelope.id)).encode());
                match Frame::decode_value(envelope.payload) {
                    Some(frame) => self.dispatch_frame(frame),
                    None => tracing::debug!(id = %envelope.id, "reliable payload undecodable"),
                }
            }
            Some(frame) => self.dispatch_frame(frame),
        }
    }

    fn dispatch_frame(&self, frame: Frame) {
        match frame {
            Frame::Reliable(_) => {
                tracing::debug!("nested reliable envelope dropped");
            }
            Frame::Ack(ack) => {
                tracing::trace!(id = %ack.id, "reliable ack received");
            }
            Frame::Control(control) => self.handle_control(control),
            Frame::Event(event) => self.handle_event(event, None),
        }
    }

    fn handle_control(&self, control: ControlMessage) {
        match control {
            ControlMessage::QueueEntry {
                topic,
                cursor,
                event,
            } => self.handle_event(event, Some((topic, cursor))),
            ControlMessage::QueueSubscribed {
                topic,
                latest_cursor,
            } => {
                tracing::debug!(
                    topic = %topic,
                    latest_cursor = ?latest_cursor,
                    "subscription confirmed"
                );
            }
            other => {
                tracing::debug!(
                    control = ?std::mem::discriminant(&other),
                    "unexpected control message from server"
                );
            }
        }
    }

    /// Dispatch one event. A response matching a pending request
    /// resolves it and bypasses the handler chain; an unmatched command
    /// response is dropped (it belongs to a request that already timed
    /// out, or to another client). Queue-carried events are ACKed after
    /// dispatch and their cursor persisted.
    fn handle_event(&self, event: Event, entry: Option<(String, String)>) {
        let is_command_response = matches!(event.payload, EventPayload::CommandResponse { .. });
        let correlated = matches!(
            event.category,
            EventCategory::Response | EventCategory::Error
        );

        let mut dispatched = false;
        if correlated {
            if let Some(request_id) = event.request_id() {
                if let Some(tx) = self.inner.pending.lock().remove(request_id) {
                    let _ = tx.send(event.clone());
                    dispatched = true;
                } else if is_command_response {
                    tracing::debug!(
                        request_id = %request_id,
                        "dropping response with no pending request"
                    );
                    dispatched = true;
                }
            }
        }

        if !dispatched {
            for handler in self.inner.on_message.lock().clone() {
                handler(&event);
            }
        }

        if let Some((topic, cursor)) = entry {
            self.ack_entry(&topic, &cursor);
        }
    }

    fn ack_entry(&self, topic: &str, cursor: &str) {
        self.try_send_text(
            Frame::Control(ControlMessage::QueueAck {
                topic: topic.to_owned(),
                client_id: self.client_id(),
                cursor: cursor.to_owned(),
            })
            .encode(),
        );
        self.inner.storage.set(&self.cursor_key(topic), cursor);
    }
}
