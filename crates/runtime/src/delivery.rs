//! Event flow wiring: bus → queue, ACK → persistence, and the
//! replay-then-live subscribe path connections use.

use std::sync::Arc;

use convoy_bus::EventBus;
use convoy_domain::event::ErrorMessage;
use convoy_domain::{Event, EventCategory, EventContext, EventPayload, Result};
use convoy_protocol::{ControlMessage, Frame, REPLAY_PAGE_LIMIT};
use convoy_queue::{EntryHandler, TopicQueue, GLOBAL_TOPIC};
use convoy_sessions::{MessageRecord, SessionStore};

use crate::agents::{is_user_message_request, AgentRuntime};
use crate::connection::Connection;

/// Routing key: the event's session, else the global broadcast topic.
pub fn topic_for(event: &Event) -> String {
    event
        .context
        .session_id
        .clone()
        .unwrap_or_else(|| GLOBAL_TOPIC.to_owned())
}

/// Bind bus, queue, session store and agent runtime together:
///
/// - `user_message` requests route into the engine;
/// - broadcastable bus events append to their topic;
/// - consumer ACKs persist the message events they cover;
/// - queue-internal failures surface as `error_message` events.
pub fn wire_event_flow(
    bus: &EventBus,
    queue: &Arc<TopicQueue>,
    sessions: &Arc<SessionStore>,
    agents: &Arc<AgentRuntime>,
) {
    {
        let agents = agents.clone();
        bus.on("user_message", move |event| {
            if is_user_message_request(event) {
                agents.handle_user_message(event);
            }
            Ok(())
        });
    }

    {
        let queue = queue.clone();
        bus.on_any(move |event| {
            if !event.broadcastable() {
                return Ok(());
            }
            queue.append(&topic_for(event), event)?;
            Ok(())
        });
    }

    {
        let sessions = sessions.clone();
        queue.set_on_ack(Arc::new(move |notice| {
            for entry in &notice.entries {
                if entry.event.category != EventCategory::Message {
                    continue;
                }
                let Some(session_id) = entry.event.context.session_id.as_deref() else {
                    continue;
                };
                let Some(record) = MessageRecord::from_event(&entry.event, session_id) else {
                    continue;
                };
                match sessions.insert_message(&record) {
                    Ok(()) => {
                        let _ = sessions.touch_session(session_id);
                    }
                    Err(error) => tracing::warn!(
                        message_id = %record.message_id,
                        session_id = %session_id,
                        error = %error,
                        "failed to persist acked message"
                    ),
                }
            }
        }));
    }

    {
        let bus = bus.clone();
        queue.set_error_hook(Arc::new(move |error| {
            bus.emit(Event::new(
                EventPayload::ErrorMessage(ErrorMessage {
                    message: format!("queue: {error}"),
                    detail: None,
                }),
                EventContext::default(),
            ));
        }));
    }
}

/// Handle a `queue_subscribe`: resolve the consumer, confirm, replay
/// everything past the resume cursor in reliable envelopes, then hand
/// off to live delivery without a gap.
pub async fn subscribe_with_replay(
    queue: &Arc<TopicQueue>,
    connection: &Arc<Connection>,
    topic: &str,
    client_id: &str,
    after_cursor: Option<String>,
) -> Result<()> {
    queue.ensure_consumer(client_id, topic)?;

    // An explicit resume cursor is also an ACK: the client saw
    // everything up to it in a previous session.
    if let Some(cursor) = &after_cursor {
        queue.ack(client_id, topic, cursor).await?;
    }

    let latest = queue.latest_cursor(topic)?;
    connection.send_text(
        Frame::Control(ControlMessage::QueueSubscribed {
            topic: topic.to_owned(),
            latest_cursor: latest.clone(),
        })
        .encode(),
    );

    // Resume point: explicit cursor, else the consumer's stored ACK,
    // else the tail (a fresh consumer starts live).
    let mut after = match after_cursor {
        Some(cursor) => Some(cursor),
        None => queue.get_consumer_cursor(client_id, topic)?.or(latest),
    };

    let delivery = connection.delivery_sender();
    loop {
        let handler: EntryHandler = {
            let delivery = delivery.clone();
            Arc::new(move |entry| {
                if let Some(sender) = &delivery {
                    if sender.try_send(entry.clone()).is_err() {
                        tracing::warn!(
                            topic = %entry.topic,
                            cursor = %entry.cursor,
                            "delivery channel full, dropping live entry"
                        );
                    }
                }
            })
        };

        let (page, subscription) =
            queue.subscribe_from(client_id, topic, after.as_deref(), REPLAY_PAGE_LIMIT, handler)?;
        let full_page = page.len() >= REPLAY_PAGE_LIMIT;
        if let Some(last) = page.last() {
            after = Some(last.cursor.clone());
        }
        for entry in &page {
            connection.send_queue_entry(entry);
        }

        if full_page {
            // More backlog may exist; detach and take another page.
            subscription.unsubscribe();
            continue;
        }
        connection.bind_topic(topic, subscription);
        break;
    }

    tracing::debug!(
        connection_id = %connection.connection_id,
        client_id = %client_id,
        topic = %topic,
        "subscription active"
    );
    Ok(())
}
