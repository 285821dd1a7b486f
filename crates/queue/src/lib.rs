//! Durable, per-topic, at-least-once broadcast queue.
//!
//! Entries are append-only with strictly monotonic, lexicographically
//! sortable cursors per topic. Each consumer owns an independent ACK
//! cursor; retention is driven by the minimum live cursor plus age and
//! size caps. SQLite is the backing store.

pub mod cursor;
pub mod queue;
pub mod store;

pub use cursor::CursorAllocator;
pub use queue::{
    AckCallback, AckNotice, EntryHandler, QueueErrorHook, QueueSubscription, TopicQueue,
    DEFAULT_READ_LIMIT,
};
pub use store::{Consumer, QueueEntry, QueueStore};

/// The distinguished broadcast topic every connection starts on.
pub const GLOBAL_TOPIC: &str = "global";
