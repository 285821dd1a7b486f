//! WebSocket endpoint for event-stream connections.
//!
//! Flow:
//! 1. Client connects to the configured path and is assigned a
//!    `connection_id`; the server sends `connection_established`.
//! 2. The connection is subscribed to the `global` topic.
//! 3. Bidirectional frame loop: queue control messages, reliable
//!    envelopes/ACKs, and plain events, dispatched by discriminator.
//! 4. Server pings every heartbeat interval and closes after one
//!    missed interval.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use convoy_domain::event::ConnectionEstablished;
use convoy_domain::{now_millis, Event, EventContext, EventPayload};
use convoy_protocol::{ControlMessage, Frame, ReliableAck};
use convoy_queue::{QueueEntry, GLOBAL_TOPIC};

use crate::agents::is_user_message_request;
use crate::connection::{Connection, WsOutbound};
use crate::delivery::subscribe_with_replay;
use crate::state::AppState;

/// GET handler — upgrade to WebSocket.
pub async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    let connection_id = uuid::Uuid::new_v4().to_string();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<WsOutbound>(256);
    let connection = Arc::new(Connection::new(
        connection_id.clone(),
        outbound_tx,
        Duration::from_millis(state.config.server.reliable_timeout_ms),
    ));

    // Writer task: forwards outbound frames to the socket.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let message = match frame {
                WsOutbound::Text(text) => Message::Text(text),
                WsOutbound::Ping => Message::Ping(Vec::new()),
                WsOutbound::Close => {
                    let _ = ws_sink.send(Message::Close(None)).await;
                    break;
                }
            };
            if ws_sink.send(message).await.is_err() {
                break;
            }
        }
    });

    // Delivery pump: queue entries → reliable sends, serialized per
    // connection so per-topic order is preserved.
    let (delivery_tx, mut delivery_rx) = mpsc::channel::<QueueEntry>(256);
    connection.set_delivery(delivery_tx);
    let pump_connection = connection.clone();
    let pump = tokio::spawn(async move {
        while let Some(entry) = delivery_rx.recv().await {
            pump_connection.send_queue_entry(&entry);
        }
    });

    state.connections.register(connection.clone());

    connection.send_event(&Event::new(
        EventPayload::ConnectionEstablished(ConnectionEstablished {
            connection_id: connection_id.clone(),
        }),
        EventContext::default(),
    ));

    // Every connection starts on the global broadcast topic; explicit
    // `queue_subscribe` later rebinds it to the client's durable
    // consumer.
    if let Err(error) =
        subscribe_with_replay(&state.queue, &connection, GLOBAL_TOPIC, &connection_id, None).await
    {
        tracing::warn!(
            connection_id = %connection_id,
            error = %error,
            "global subscription failed"
        );
    }

    // Heartbeat: ping on the interval, close after one silent interval.
    let heartbeat = spawn_heartbeat(&state, &connection);

    tracing::info!(connection_id = %connection_id, "connection open");

    while let Some(Ok(message)) = ws_stream.next().await {
        match message {
            Message::Text(text) => handle_frame(&state, &connection, &text).await,
            // axum answers pings itself; both directions prove liveness.
            Message::Ping(_) | Message::Pong(_) => connection.touch(),
            Message::Close(_) => break,
            Message::Binary(_) => {
                tracing::debug!(connection_id = %connection_id, "binary frames are reserved");
            }
        }
    }

    // Cleanup: detach subscriptions, drop reliable state, deregister.
    if let Some(task) = heartbeat {
        task.abort();
    }
    pump.abort();
    writer.abort();
    connection.teardown();
    state.connections.remove(&connection_id);
    // The implicit global consumer is connection-scoped and can never
    // resume; drop it so it stops pinning retention.
    let _ = state.queue.delete_consumer(&connection_id, GLOBAL_TOPIC);
    tracing::info!(connection_id = %connection_id, "connection closed");
}

fn spawn_heartbeat(
    state: &AppState,
    connection: &Arc<Connection>,
) -> Option<tokio::task::JoinHandle<()>> {
    let interval_ms = state.config.server.heartbeat_interval_ms;
    if interval_ms == 0 {
        return None;
    }
    let connection = connection.clone();
    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
        interval.tick().await;
        loop {
            interval.tick().await;
            if now_millis() - connection.last_seen() > interval_ms as i64 * 2 {
                tracing::warn!(
                    connection_id = %connection.connection_id,
                    "no pong within heartbeat window, closing"
                );
                connection.request_close();
                break;
            }
            if !connection.send_ping() {
                break;
            }
        }
    }))
}

async fn handle_frame(state: &AppState, connection: &Arc<Connection>, text: &str) {
    connection.touch();
    match Frame::decode(text) {
        None => {
            tracing::debug!(
                connection_id = %connection.connection_id,
                "ignoring unparseable frame"
            );
        }
        Some(Frame::Reliable(envelope)) => {
            // ACK first, then dispatch the inner payload.
            connection.send_text(Frame::Ack(ReliableAck::new(&envelope.id)).encode());
            match Frame::decode_value(envelope.payload) {
                Some(Frame::Control(control)) => handle_control(state, connection, control).await,
                Some(Frame::Event(event)) => handle_event(state, event),
                _ => tracing::debug!("reliable payload undecodable"),
            }
        }
        Some(Frame::Ack(ack)) => connection.handle_ack(&ack.id),
        Some(Frame::Control(control)) => handle_control(state, connection, control).await,
        Some(Frame::Event(event)) => handle_event(state, event),
    }
}

async fn handle_control(state: &AppState, connection: &Arc<Connection>, control: ControlMessage) {
    match control {
        ControlMessage::QueueSubscribe {
            topic,
            client_id,
            after_cursor,
        } => {
            if let Err(error) =
                subscribe_with_replay(&state.queue, connection, &topic, &client_id, after_cursor)
                    .await
            {
                tracing::warn!(
                    connection_id = %connection.connection_id,
                    topic = %topic,
                    error = %error,
                    "subscribe failed"
                );
            }
        }
        ControlMessage::QueueAck {
            topic,
            client_id,
            cursor,
        } => {
            if let Err(error) = state.queue.ensure_consumer(&client_id, &topic) {
                tracing::warn!(error = %error, "ack consumer setup failed");
                return;
            }
            if let Err(error) = state.queue.ack(&client_id, &topic, &cursor).await {
                tracing::warn!(
                    client_id = %client_id,
                    topic = %topic,
                    cursor = %cursor,
                    error = %error,
                    "queue ack failed"
                );
            }
        }
        ControlMessage::QueueUnsubscribe { topic, .. } => {
            connection.unbind_topic(&topic);
        }
        // Server-to-client shapes arriving inbound are a client bug.
        other => {
            tracing::debug!(
                control = ?std::mem::discriminant(&other),
                "unexpected inbound control message"
            );
        }
    }
}

/// Plain events from the client: `user_message` requests route into
/// the agent runtime; everything else (commands included) goes onto
/// the bus. Non-broadcastable events never reach the queue, so raw
/// requests stay process-internal.
fn handle_event(state: &AppState, event: Event) {
    if is_user_message_request(&event) {
        state.agents.handle_user_message(&event);
    } else {
        state.bus.emit(event);
    }
}
