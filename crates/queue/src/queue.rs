//! The topic queue: append / per-consumer read / ACK / cleanup.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use convoy_domain::config::QueueConfig;
use convoy_domain::{now_millis, Error, Event, Result};

use crate::cursor::CursorAllocator;
use crate::store::{Consumer, QueueEntry, QueueStore};

/// Default page size for [`TopicQueue::read`].
pub const DEFAULT_READ_LIMIT: usize = 100;

const ACK_RETRY_ATTEMPTS: u32 = 3;
const ACK_RETRY_BASE: Duration = Duration::from_millis(50);

/// Fired when an ACK advances a consumer cursor; `entries` is the range
/// the ACK newly covered, in cursor order.
#[derive(Debug, Clone)]
pub struct AckNotice {
    pub consumer_id: String,
    pub topic: String,
    pub cursor: String,
    pub entries: Vec<QueueEntry>,
}

pub type AckCallback = Arc<dyn Fn(&AckNotice) + Send + Sync>;
pub type QueueErrorHook = Arc<dyn Fn(&Error) + Send + Sync>;
pub type EntryHandler = Arc<dyn Fn(&QueueEntry) + Send + Sync>;

struct SubscriberEntry {
    id: u64,
    consumer_id: String,
    handler: EntryHandler,
}

type SubscriberMap = Arc<Mutex<HashMap<String, Vec<SubscriberEntry>>>>;

/// Handle for a live subscription; `unsubscribe()` detaches the handler.
pub struct QueueSubscription {
    id: u64,
    topic: String,
    subscribers: SubscriberMap,
}

impl QueueSubscription {
    pub fn unsubscribe(self) {
        let mut subscribers = self.subscribers.lock();
        if let Some(list) = subscribers.get_mut(&self.topic) {
            list.retain(|s| s.id != self.id);
        }
    }
}

pub struct TopicQueue {
    store: QueueStore,
    allocator: CursorAllocator,
    config: QueueConfig,
    /// Serializes allocate → persist → notify so per-topic delivery
    /// order equals append order.
    append_lock: Mutex<()>,
    subscribers: SubscriberMap,
    on_ack: Mutex<Option<AckCallback>>,
    error_hook: Mutex<Option<QueueErrorHook>>,
    next_sub_id: AtomicU64,
}

impl TopicQueue {
    pub fn open(db_path: &Path, config: QueueConfig) -> Result<Self> {
        Ok(Self::with_store(QueueStore::open(db_path)?, config))
    }

    pub fn in_memory(config: QueueConfig) -> Result<Self> {
        Ok(Self::with_store(QueueStore::open_in_memory()?, config))
    }

    fn with_store(store: QueueStore, config: QueueConfig) -> Self {
        Self {
            store,
            allocator: CursorAllocator::new(),
            config,
            append_lock: Mutex::new(()),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            on_ack: Mutex::new(None),
            error_hook: Mutex::new(None),
            next_sub_id: AtomicU64::new(1),
        }
    }

    /// Register the ACK callback (e.g. "persist this message now").
    pub fn set_on_ack(&self, callback: AckCallback) {
        *self.on_ack.lock() = Some(callback);
    }

    /// Register the hook for queue-internal failures (ACK retry
    /// exhaustion); callers typically forward these to the bus as
    /// `error_message` events.
    pub fn set_error_hook(&self, hook: QueueErrorHook) {
        *self.error_hook.lock() = Some(hook);
    }

    // ── Append ───────────────────────────────────────────────────────

    /// Append an event to a topic. Assigns a cursor strictly greater
    /// than every prior cursor on the topic, persists the entry, then
    /// notifies live subscribers. Persistence failures propagate.
    pub fn append(&self, topic: &str, event: &Event) -> Result<String> {
        self.append_at(topic, event, now_millis())
    }

    fn append_at(&self, topic: &str, event: &Event, created_at: i64) -> Result<String> {
        let _serial = self.append_lock.lock();

        let cursor = self.allocator.next(topic, created_at, || {
            self.store.latest_cursor(topic).ok().flatten()
        });
        let entry = QueueEntry {
            topic: topic.to_owned(),
            cursor: cursor.clone(),
            event: event.clone(),
            created_at,
        };
        self.store.insert_entry(&entry)?;

        // Notify under the append lock: delivery order per topic must
        // match cursor order. Handlers are expected to hand off fast
        // (e.g. bounded-channel try_send).
        let handlers: Vec<EntryHandler> = {
            let subscribers = self.subscribers.lock();
            subscribers
                .get(topic)
                .map(|list| list.iter().map(|s| s.handler.clone()).collect())
                .unwrap_or_default()
        };
        for handler in handlers {
            handler(&entry);
        }

        Ok(cursor)
    }

    // ── Consumers ────────────────────────────────────────────────────

    /// Create a fresh consumer with no cursor (it has read nothing).
    pub fn create_consumer(&self, topic: &str) -> Result<String> {
        let consumer_id = uuid::Uuid::new_v4().to_string();
        self.ensure_consumer(&consumer_id, topic)?;
        Ok(consumer_id)
    }

    /// Create a consumer under a caller-chosen id (e.g. a transport
    /// client id), or just bump its activity when it already exists.
    /// The cursor is untouched either way.
    pub fn ensure_consumer(&self, consumer_id: &str, topic: &str) -> Result<()> {
        self.store.insert_consumer(&Consumer {
            consumer_id: consumer_id.to_owned(),
            topic: topic.to_owned(),
            cursor: None,
            last_activity_at: now_millis(),
        })?;
        tracing::debug!(consumer_id = %consumer_id, topic = %topic, "consumer ready");
        Ok(())
    }

    /// Up to `limit` entries strictly after the consumer's cursor, in
    /// cursor order. Does not advance the cursor. `limit == 0` returns
    /// an empty page.
    pub fn read(&self, consumer_id: &str, topic: &str, limit: usize) -> Result<Vec<QueueEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let consumer = self
            .store
            .get_consumer(consumer_id, topic)?
            .ok_or_else(|| Error::NotFound(format!("consumer {consumer_id} on {topic}")))?;
        self.store
            .entries_after(topic, consumer.cursor.as_deref(), limit)
    }

    /// Cursor-addressed page scan, independent of any consumer (the
    /// transport replay path).
    pub fn read_after(
        &self,
        topic: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<QueueEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.store.entries_after(topic, after, limit)
    }

    /// Advance the consumer cursor to `max(current, cursor)`, bump
    /// activity, and fire the ACK callback with the newly covered
    /// entries. Transient persistence failures retry with bounded
    /// backoff; exhaustion surfaces through the error hook and the
    /// returned error.
    pub async fn ack(&self, consumer_id: &str, topic: &str, cursor: &str) -> Result<()> {
        let now = now_millis();
        let mut attempt: u32 = 0;
        let previous = loop {
            match self.store.advance_consumer(consumer_id, topic, cursor, now) {
                Ok(previous) => break previous,
                Err(Error::NotFound(message)) => return Err(Error::NotFound(message)),
                Err(error) => {
                    attempt += 1;
                    if attempt >= ACK_RETRY_ATTEMPTS {
                        tracing::error!(
                            consumer_id = %consumer_id,
                            topic = %topic,
                            cursor = %cursor,
                            error = %error,
                            "ack failed after retries"
                        );
                        if let Some(hook) = self.error_hook.lock().clone() {
                            hook(&error);
                        }
                        return Err(error);
                    }
                    tokio::time::sleep(ACK_RETRY_BASE * 2u32.pow(attempt - 1)).await;
                }
            }
        };

        let advanced = previous.as_deref().map(|p| p < cursor).unwrap_or(true);
        if advanced {
            if let Some(callback) = self.on_ack.lock().clone() {
                let entries = self
                    .store
                    .entries_between(topic, previous.as_deref(), cursor)
                    .unwrap_or_default();
                callback(&AckNotice {
                    consumer_id: consumer_id.to_owned(),
                    topic: topic.to_owned(),
                    cursor: cursor.to_owned(),
                    entries,
                });
            }
        }
        Ok(())
    }

    pub fn get_consumer_cursor(&self, consumer_id: &str, topic: &str) -> Result<Option<String>> {
        Ok(self
            .store
            .get_consumer(consumer_id, topic)?
            .ok_or_else(|| Error::NotFound(format!("consumer {consumer_id} on {topic}")))?
            .cursor)
    }

    /// Delete a consumer and detach its live subscriptions. A deleted
    /// consumer's cursor has no further retention effect.
    pub fn delete_consumer(&self, consumer_id: &str, topic: &str) -> Result<()> {
        self.store.delete_consumer(consumer_id, topic)?;
        if let Some(list) = self.subscribers.lock().get_mut(topic) {
            list.retain(|s| s.consumer_id != consumer_id);
        }
        Ok(())
    }

    /// Live delivery of entries appended from now on. Replay up to the
    /// present goes through [`read`](Self::read) /
    /// [`read_after`](Self::read_after) first.
    pub fn subscribe(
        &self,
        consumer_id: &str,
        topic: &str,
        handler: EntryHandler,
    ) -> Result<QueueSubscription> {
        self.store
            .get_consumer(consumer_id, topic)?
            .ok_or_else(|| Error::NotFound(format!("consumer {consumer_id} on {topic}")))?;

        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .entry(topic.to_owned())
            .or_default()
            .push(SubscriberEntry {
                id,
                consumer_id: consumer_id.to_owned(),
                handler,
            });

        Ok(QueueSubscription {
            id,
            topic: topic.to_owned(),
            subscribers: self.subscribers.clone(),
        })
    }

    /// Atomically read one backlog page after `after` and attach a live
    /// subscription, under the append lock — no entry can slip between
    /// the scan and the attach. When the returned page is full
    /// (`len() == limit`), callers should drop the subscription, send
    /// the page, and call again from the page's last cursor.
    pub fn subscribe_from(
        &self,
        consumer_id: &str,
        topic: &str,
        after: Option<&str>,
        limit: usize,
        handler: EntryHandler,
    ) -> Result<(Vec<QueueEntry>, QueueSubscription)> {
        let _serial = self.append_lock.lock();
        let backlog = self.store.entries_after(topic, after, limit)?;
        let subscription = self.subscribe(consumer_id, topic, handler)?;
        Ok((backlog, subscription))
    }

    pub fn latest_cursor(&self, topic: &str) -> Result<Option<String>> {
        self.store.latest_cursor(topic)
    }

    // ── Cleanup ──────────────────────────────────────────────────────

    /// Run one retention pass; returns the number of entries deleted.
    pub fn cleanup(&self) -> Result<usize> {
        self.cleanup_at(now_millis())
    }

    /// Retention pass against an explicit clock (tests age entries by
    /// moving `now` forward).
    ///
    /// Order matters: stale consumers are purged first so their cursors
    /// stop protecting entries, then per topic the age+cursor rule and
    /// the size cap apply.
    pub fn cleanup_at(&self, now: i64) -> Result<usize> {
        let purged = self
            .store
            .purge_stale_consumers(now - self.config.consumer_ttl_ms)?;

        let mut deleted = 0;
        for topic in self.store.topics()? {
            let min_cursor = self.store.min_live_cursor(&topic)?;
            deleted += self.store.delete_expired(
                &topic,
                now - self.config.message_ttl_ms,
                min_cursor.as_deref(),
            )?;
            deleted += self
                .store
                .trim_to_cap(&topic, self.config.max_entries_per_topic)?;
        }

        if purged > 0 || deleted > 0 {
            tracing::info!(
                purged_consumers = purged,
                deleted_entries = deleted,
                "queue cleanup pass"
            );
        }
        Ok(deleted)
    }

    /// Spawn the periodic cleanup task. Returns `None` when disabled
    /// (`cleanup_interval_ms == 0`). The task stops when the queue is
    /// dropped.
    pub fn start_cleanup_task(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        let interval_ms = self.config.cleanup_interval_ms;
        if interval_ms == 0 {
            return None;
        }
        let queue: Weak<TopicQueue> = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
            // First tick fires immediately; skip it.
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(queue) = queue.upgrade() else {
                    break;
                };
                if let Err(error) = queue.cleanup() {
                    tracing::warn!(error = %error, "queue cleanup failed");
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_domain::event::TextDelta;
    use convoy_domain::{EventContext, EventPayload};

    fn config() -> QueueConfig {
        QueueConfig::default()
    }

    fn queue() -> TopicQueue {
        TopicQueue::in_memory(config()).unwrap()
    }

    fn event(text: &str) -> Event {
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
    fn append_assigns_monotonic_cursors() {
        let queue = queue();
        let c1 = queue.append("s1", &event("e1")).unwrap();
        let c2 = queue.append("s1", &event("e2")).unwrap();
        let c3 = queue.append("s1", &event("e3")).unwrap();
        assert!(c1 < c2 && c2 < c3);
    }

    #[test]
    fn read_does_not_advance_and_ack_does() {
        let queue = queue();
        let consumer = queue.create_consumer("s1").unwrap();
        queue.append("s1", &event("e1")).unwrap();
        queue.append("s1", &event("e2")).unwrap();

        let page = queue.read(&consumer, "s1", DEFAULT_READ_LIMIT).unwrap();
        assert_eq!(page.len(), 2);

        // Reading again returns the same page: cursor unchanged.
        let again = queue.read(&consumer, "s1", DEFAULT_READ_LIMIT).unwrap();
        assert_eq!(again.len(), 2);
        assert_eq!(queue.get_consumer_cursor(&consumer, "s1").unwrap(), None);

        // ACK the first entry; re-read returns strictly after it.
        futures_block(queue.ack(&consumer, "s1", &page[0].cursor)).unwrap();
        let rest = queue.read(&consumer, "s1", DEFAULT_READ_LIMIT).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].cursor, page[1].cursor);
    }

    /// Minimal current-thread executor for the async ack in sync tests.
    fn futures_block<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap()
            .block_on(future)
    }

    #[test]
    fn zero_limit_reads_nothing() {
        let queue = queue();
        let consumer = queue.create_consumer("s1").unwrap();
        queue.append("s1", &event("e1")).unwrap();
        assert!(queue.read(&consumer, "s1", 0).unwrap().is_empty());
        assert_eq!(queue.get_consumer_cursor(&consumer, "s1").unwrap(), None);
    }

    #[test]
    fn read_unknown_consumer_is_not_found() {
        let queue = queue();
        assert!(matches!(
            queue.read("ghost", "s1", 10),
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn ack_is_max_merge() {
        let queue = queue();
        let consumer = queue.create_consumer("s1").unwrap();
        let c1 = queue.append("s1", &event("e1")).unwrap();
        let c2 = queue.append("s1", &event("e2")).unwrap();

        queue.ack(&consumer, "s1", &c2).await.unwrap();
        // Stale ACK does not regress the cursor.
        queue.ack(&consumer, "s1", &c1).await.unwrap();
        assert_eq!(
            queue.get_consumer_cursor(&consumer, "s1").unwrap(),
            Some(c2)
        );
    }

    #[tokio::test]
    async fn ack_unknown_consumer_is_not_found() {
        let queue = queue();
        assert!(matches!(
            queue.ack("ghost", "s1", "c1").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn on_ack_receives_newly_covered_entries() {
        let queue = queue();
        let notices: Arc<Mutex<Vec<AckNotice>>> = Arc::new(Mutex::new(Vec::new()));
        let notices2 = notices.clone();
        queue.set_on_ack(Arc::new(move |notice| {
            notices2.lock().push(notice.clone());
        }));

        let consumer = queue.create_consumer("s1").unwrap();
        let c1 = queue.append("s1", &event("e1")).unwrap();
        let c2 = queue.append("s1", &event("e2")).unwrap();

        queue.ack(&consumer, "s1", &c2).await.unwrap();
        {
            let notices = notices.lock();
            assert_eq!(notices.len(), 1);
            assert_eq!(notices[0].entries.len(), 2);
            assert_eq!(notices[0].entries[0].cursor, c1);
        }

        // A stale ACK covers nothing: no callback.
        queue.ack(&consumer, "s1", &c1).await.unwrap();
        assert_eq!(notices.lock().len(), 1);
    }

    #[test]
    fn subscribe_delivers_live_appends_in_order() {
        let queue = queue();
        let consumer = queue.create_consumer("s1").unwrap();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let seen2 = seen.clone();
        let subscription = queue
            .subscribe(
                &consumer,
                "s1",
                Arc::new(move |entry| {
                    seen2.lock().push(entry.cursor.clone());
                }),
            )
            .unwrap();

        let c1 = queue.append("s1", &event("e1")).unwrap();
        let c2 = queue.append("s1", &event("e2")).unwrap();
        // Other topics do not leak in.
        queue.append("other", &event("x")).unwrap();

        assert_eq!(seen.lock().as_slice(), [c1.clone(), c2.clone()]);

        subscription.unsubscribe();
        queue.append("s1", &event("e3")).unwrap();
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn resume_scan_skips_acked_prefix() {
        // Queue on topic S holds c1 < c2 < c3; resuming after c2 must
        // deliver only c3.
        let queue = queue();
        queue.append("s1", &event("e1")).unwrap();
        let c2 = queue.append("s1", &event("e2")).unwrap();
        let c3 = queue.append("s1", &event("e3")).unwrap();

        let replay = queue.read_after("s1", Some(&c2), 1_000).unwrap();
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].cursor, c3);

        let later = queue.append("s1", &event("e4")).unwrap();
        let replay = queue.read_after("s1", Some(&c2), 1_000).unwrap();
        assert_eq!(
            replay.iter().map(|e| e.cursor.clone()).collect::<Vec<_>>(),
            [c3, later]
        );
    }

    #[tokio::test]
    async fn multi_consumer_retention() {
        // Two consumers; one ACKs everything, the other nothing. Fresh
        // entries survive cleanup; once the first entry ages past the
        // TTL it is deleted even though the idle consumer never ACKed.
        let queue = queue();
        let ttl = config().message_ttl_ms;

        let c_fast = queue.create_consumer("s1").unwrap();
        let _c_slow = queue.create_consumer("s1").unwrap();

        let base = now_millis();
        let cur1 = queue.append_at("s1", &event("e1"), base).unwrap();
        let _cur2 = queue.append_at("s1", &event("e2"), base + 10_000).unwrap();
        let cur3 = queue.append_at("s1", &event("e3"), base + 10_000).unwrap();

        queue.ack(&c_fast, "s1", &cur3).await.unwrap();

        // TTL not yet elapsed: nothing is deleted.
        assert_eq!(queue.cleanup_at(base + 60_000).unwrap(), 0);
        assert_eq!(queue.read_after("s1", None, 100).unwrap().len(), 3);

        // First entry ages out; the newer two are still under the
        // TTL, so only it is deleted.
        let deleted = queue.cleanup_at(base + ttl + 5_000).unwrap();
        assert_eq!(deleted, 1);
        let rest = queue.read_after("s1", None, 100).unwrap();
        assert_eq!(rest.len(), 2);
        assert!(rest.iter().all(|e| e.cursor != cur1));
    }

    #[tokio::test]
    async fn unacked_entries_survive_below_ttl() {
        let queue = queue();
        let consumer = queue.create_consumer("s1").unwrap();
        let c1 = queue.append("s1", &event("e1")).unwrap();

        queue.cleanup().unwrap();
        let page = queue.read(&consumer, "s1", 10).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].cursor, c1);
    }

    #[test]
    fn size_cap_trims_oldest() {
        let mut config = config();
        config.max_entries_per_topic = 3;
        let queue = TopicQueue::in_memory(config).unwrap();

        for i in 0..5 {
            queue.append("s1", &event(&format!("e{i}"))).unwrap();
        }
        let deleted = queue.cleanup().unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(queue.read_after("s1", None, 100).unwrap().len(), 3);
    }

    #[test]
    fn stale_consumers_are_purged_and_release_retention() {
        let queue = queue();
        let consumer = queue.create_consumer("s1").unwrap();
        let base = now_millis();
        queue.append_at("s1", &event("e1"), base).unwrap();

        // Far future: the consumer TTL and message TTL both pass; with
        // the consumer purged nothing protects the entry.
        let far = base + config().consumer_ttl_ms + config().message_ttl_ms + 10_000;
        let deleted = queue.cleanup_at(far).unwrap();
        assert_eq!(deleted, 1);
        assert!(matches!(
            queue.get_consumer_cursor(&consumer, "s1"),
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn ensure_consumer_is_idempotent_and_keeps_cursor() {
        let queue = queue();
        queue.ensure_consumer("client-1", "s1").unwrap();
        let c1 = queue.append("s1", &event("e1")).unwrap();
        queue.ack("client-1", "s1", &c1).await.unwrap();

        // Re-ensuring (a reconnect) keeps the ACKed cursor.
        queue.ensure_consumer("client-1", "s1").unwrap();
        assert_eq!(
            queue.get_consumer_cursor("client-1", "s1").unwrap(),
            Some(c1)
        );
    }

    #[test]
    fn subscribe_from_hands_off_without_gap() {
        let queue = queue();
        let consumer = queue.create_consumer("s1").unwrap();
        let c1 = queue.append("s1", &event("e1")).unwrap();
        let c2 = queue.append("s1", &event("e2")).unwrap();

        let live: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let live2 = live.clone();
        let (backlog, subscription) = queue
            .subscribe_from(
                &consumer,
                "s1",
                Some(&c1),
                100,
                Arc::new(move |entry| {
                    live2.lock().push(entry.cursor.clone());
                }),
            )
            .unwrap();

        assert_eq!(
            backlog.iter().map(|e| e.cursor.clone()).collect::<Vec<_>>(),
            [c2]
        );

        // Everything appended after the handoff arrives live.
        let c3 = queue.append("s1", &event("e3")).unwrap();
        assert_eq!(live.lock().as_slice(), [c3]);
        subscription.unsubscribe();
    }

    #[test]
    fn delete_consumer_detaches_subscription() {
        let queue = queue();
        let consumer = queue.create_consumer("s1").unwrap();
        let seen: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));

        let seen2 = seen.clone();
        let _subscription = queue
            .subscribe(
                &consumer,
                "s1",
                Arc::new(move |_| {
                    *seen2.lock() += 1;
                }),
            )
            .unwrap();

        queue.append("s1", &event("e1")).unwrap();
        queue.delete_consumer(&consumer, "s1").unwrap();
        queue.append("s1", &event("e2")).unwrap();

        assert_eq!(*seen.lock(), 1);
    }
}
