//! Process-local, synchronous pub/sub with typed subscriptions.
//!
//! Dispatch model:
//! - `emit` pushes onto a FIFO drain queue; one drainer at a time runs
//!   handlers to completion per event. Re-entrant `emit` calls from
//!   inside a handler append to the queue and are drained before the
//!   outer `emit` returns.
//! - A handler that fails (or panics) is reported through the error hook
//!   and never prevents later handlers from seeing the event; nothing
//!   propagates to the emitter.
//! - `request()` correlates a `*_request` command event with the
//!   response event carrying the same `data.requestId`, with a timeout.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use convoy_domain::{Error, Event, EventCategory, EventContext, Result};

/// A subscriber callback. Errors are isolated per handler.
pub type Handler = Arc<dyn Fn(&Event) -> Result<()> + Send + Sync>;

/// Hook invoked when a handler fails or panics.
pub type ErrorHook = Arc<dyn Fn(&Event, &Error) + Send + Sync>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subscriptions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Subscriber {
    id: u64,
    /// `None` subscribes to every event.
    kind: Option<String>,
    /// Restrict to command-category events (`on_command` sugar).
    command_only: bool,
    handler: Handler,
}

/// Handle returned by `on`/`on_any`; call [`Subscription::unsubscribe`]
/// to deregister. Dropping the handle leaves the subscriber attached.
pub struct Subscription {
    id: u64,
    inner: Arc<Inner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        self.inner
            .subscribers
            .lock()
            .retain(|s| s.id != self.id);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bus
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Inner {
    subscribers: Mutex<Vec<Subscriber>>,
    queue: Mutex<VecDeque<Event>>,
    draining: AtomicBool,
    next_id: AtomicU64,
    pending: Mutex<HashMap<String, oneshot::Sender<Event>>>,
    error_hook: Mutex<Option<ErrorHook>>,
}

/// The process-local event bus. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let bus = Self {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(Vec::new()),
                queue: Mutex::new(VecDeque::new()),
                draining: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                error_hook: Mutex::new(None),
            }),
        };

        // Internal matcher: completes pending request() calls. Runs as a
        // normal subscriber so correlation follows dispatch order.
        let inner = bus.inner.clone();
        bus.on_any(move |event| {
            if matches!(
                event.category,
                EventCategory::Response | EventCategory::Error
            ) {
                if let Some(request_id) = event.request_id() {
                    if let Some(tx) = inner.pending.lock().remove(request_id) {
                        let _ = tx.send(event.clone());
                    }
                }
            }
            Ok(())
        });

        bus
    }

    /// Replace the handler-failure hook. Failures are always logged.
    pub fn set_error_hook(&self, hook: ErrorHook) {
        *self.inner.error_hook.lock() = Some(hook);
    }

    /// Subscribe to an exact event type.
    pub fn on(
        &self,
        kind: impl Into<String>,
        handler: impl Fn(&Event) -> Result<()> + Send + Sync + 'static,
    ) -> Subscription {
        self.register(Some(kind.into()), false, Arc::new(handler))
    }

    /// Subscribe to every event.
    pub fn on_any(
        &self,
        handler: impl Fn(&Event) -> Result<()> + Send + Sync + 'static,
    ) -> Subscription {
        self.register(None, false, Arc::new(handler))
    }

    /// Subscribe to a command-category event type.
    pub fn on_command(
        &self,
        kind: impl Into<String>,
        handler: impl Fn(&Event) -> Result<()> + Send + Sync + 'static,
    ) -> Subscription {
        self.register(Some(kind.into()), true, Arc::new(handler))
    }

    fn register(&self, kind: Option<String>, command_only: bool, handler: Handler) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().push(Subscriber {
            id,
            kind,
            command_only,
            handler,
        });
        Subscription {
            id,
            inner: self.inner.clone(),
        }
    }

    /// Emit an event. Dispatches synchronously to all matching
    /// subscribers in registration order; never fails.
    pub fn emit(&self, event: Event) {
        self.inner.queue.lock().push_back(event);

        // One drainer at a time. A re-entrant (or concurrent) emit just
        // enqueues; the active drainer picks it up before returning.
        if self
            .inner
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        loop {
            let next = self.inner.queue.lock().pop_front();
            match next {
                Some(event) => self.dispatch(&event),
                None => {
                    self.inner.draining.store(false, Ordering::Release);
                    // An emit may have raced between pop and store; only
                    // resume if we can reclaim the drainer slot.
                    if self.inner.queue.lock().is_empty()
                        || self
                            .inner
                            .draining
                            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                            .is_err()
                    {
                        break;
                    }
                }
            }
        }
    }

    fn dispatch(&self, event: &Event) {
        // Snapshot so handlers can (un)subscribe during dispatch.
        let handlers: Vec<Handler> = {
            let subscribers = self.inner.subscribers.lock();
            subscribers
                .iter()
                .filter(|s| match &s.kind {
                    Some(kind) => {
                        kind == event.kind()
                            && (!s.command_only
                                || matches!(
                                    event.category,
                                    EventCategory::Request | EventCategory::Response
                                ))
                    }
                    None => true,
                })
                .map(|s| s.handler.clone())
                .collect()
        };

        for handler in handlers {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(event)));
            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(_) => Error::Other("subscriber panicked".into()),
            };
            tracing::warn!(
                event_type = %event.kind(),
                error = %error,
                "bus subscriber failed"
            );
            if let Some(hook) = self.inner.error_hook.lock().clone() {
                hook(event, &error);
            }
        }
    }

    /// Emit a `*_request` command event and await the matching response.
    ///
    /// `data` must be a JSON object; a fresh `requestId` is inserted.
    /// Errors on timeout or on an error-category response. The pending
    /// entry is removed on every exit path.
    pub async fn request(
        &self,
        kind: &str,
        mut data: Value,
        context: EventContext,
        timeout: Duration,
    ) -> Result<Event> {
        let map = data
            .as_object_mut()
            .ok_or_else(|| Error::Validation("request data must be a JSON object".into()))?;
        let request_id = uuid::Uuid::new_v4().to_string();
        map.insert("requestId".into(), Value::String(request_id.clone()));

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(request_id.clone(), tx);

        self.emit(Event::command_request(kind, data, context));

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => {
                if response.category == EventCategory::Error {
                    Err(Error::Other(format!(
                        "request {kind} failed: {}",
                        response.payload.data_value()
                    )))
                } else {
                    Ok(response)
                }
            }
            Ok(Err(_)) => {
                // Sender dropped without completing: bus went away.
                Err(Error::Disposed("bus dropped pending request".into()))
            }
            Err(_) => {
                self.inner.pending.lock().remove(&request_id);
                Err(Error::Timeout(format!(
                    "no response to {kind} within {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    /// Number of registered subscribers (including the internal matcher).
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Number of in-flight `request()` calls.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_domain::event::{TextDelta, UserMessage};
    use convoy_domain::EventPayload;
    use parking_lot::Mutex as PlMutex;
    use serde_json::json;

    fn text_event(text: &str) -> Event {
        Event::at(
            EventPayload::TextDelta(TextDelta {
                index: 0,
                text: text.into(),
            }),
            1,
            EventContext::for_agent("a1"),
        )
    }

    #[test]
    fn typed_subscription_receives_only_its_type() {
        let bus = EventBus::new();
        let seen = Arc::new(PlMutex::new(Vec::new()));

        let seen_typed = seen.clone();
        bus.on("text_delta", move |e| {
            seen_typed.lock().push(e.kind().to_owned());
            Ok(())
        });

        bus.emit(text_event("a"));
        bus.emit(Event::user_request(
            UserMessage {
                id: None,
                content: "hi".into(),
            },
            EventContext::default(),
        ));

        assert_eq!(seen.lock().as_slice(), ["text_delta"]);
    }

    #[test]
    fn dispatch_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(PlMutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = order.clone();
            bus.on_any(move |_| {
                order.lock().push(tag);
                Ok(())
            });
        }

        bus.emit(text_event("x"));
        assert_eq!(order.lock().as_slice(), ["first", "second", "third"]);
    }

    #[test]
    fn failing_handler_does_not_block_later_ones() {
        let bus = EventBus::new();
        let reached = Arc::new(PlMutex::new(false));

        bus.on_any(|_| Err(Error::Other("boom".into())));
        let reached2 = reached.clone();
        bus.on_any(move |_| {
            *reached2.lock() = true;
            Ok(())
        });

        bus.emit(text_event("x"));
        assert!(*reached.lock());
    }

    #[test]
    fn panicking_handler_is_isolated_and_hooked() {
        let bus = EventBus::new();
        let hook_fired = Arc::new(PlMutex::new(false));
        let reached = Arc::new(PlMutex::new(false));

        let hook_fired2 = hook_fired.clone();
        bus.set_error_hook(Arc::new(move |_, _| {
            *hook_fired2.lock() = true;
        }));

        bus.on_any(|_| panic!("kaboom"));
        let reached2 = reached.clone();
        bus.on_any(move |_| {
            *reached2.lock() = true;
            Ok(())
        });

        bus.emit(text_event("x"));
        assert!(*hook_fired.lock());
        assert!(*reached.lock());
    }

    #[test]
    fn reentrant_emit_drains_before_outer_returns() {
        let bus = EventBus::new();
        let order = Arc::new(PlMutex::new(Vec::new()));

        let bus2 = bus.clone();
        let order2 = order.clone();
        bus.on("text_delta", move |e| {
            if let EventPayload::TextDelta(d) = &e.payload {
                order2.lock().push(d.text.clone());
                if d.text == "outer" {
                    bus2.emit(text_event("inner"));
                }
            }
            Ok(())
        });

        bus.emit(text_event("outer"));
        // Inner emit was queued during dispatch and drained before return.
        assert_eq!(order.lock().as_slice(), ["outer", "inner"]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(PlMutex::new(0));

        let count2 = count.clone();
        let sub = bus.on_any(move |_| {
            *count2.lock() += 1;
            Ok(())
        });

        bus.emit(text_event("a"));
        sub.unsubscribe();
        bus.emit(text_event("b"));

        assert_eq!(*count.lock(), 1);
    }

    #[tokio::test]
    async fn request_resolves_on_matching_response() {
        let bus = EventBus::new();

        // Responder: answers any image_create_request.
        let bus2 = bus.clone();
        bus.on_command("image_create_request", move |event| {
            let request_id = event.request_id().unwrap().to_owned();
            bus2.emit(Event::command_response(
                "image_create_response",
                &request_id,
                json!({"imageId": "img1"}),
                EventContext::default(),
            ));
            Ok(())
        });

        let response = bus
            .request(
                "image_create_request",
                json!({"definitionName": "base"}),
                EventContext::default(),
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        assert_eq!(response.kind(), "image_create_response");
        assert_eq!(
            response.payload.data_value()["imageId"],
            json!("img1")
        );
        assert_eq!(bus.pending_requests(), 0);
    }

    #[tokio::test]
    async fn request_times_out_and_cleans_pending() {
        let bus = EventBus::new();

        let result = bus
            .request(
                "image_create_request",
                json!({}),
                EventContext::default(),
                Duration::from_millis(50),
            )
            .await;

        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(bus.pending_requests(), 0);

        // A late response finds no pending entry and is simply dropped.
        bus.emit(Event::command_response(
            "image_create_response",
            "stale-id",
            json!({}),
            EventContext::default(),
        ));
        assert_eq!(bus.pending_requests(), 0);
    }

    #[tokio::test]
    async fn request_rejects_non_object_data() {
        let bus = EventBus::new();
        let result = bus
            .request(
                "x_request",
                json!("not an object"),
                EventContext::default(),
                Duration::from_millis(10),
            )
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }
}
