//! Session, image, container and message records with their SQLite
//! store.
//!
//! A session is created before its agent and exclusively owns that
//! agent's message collection; an agent is owned by exactly one
//! container. Messages persist only when a client ACKs the queue entry
//! that carried them — the store just provides the operations, the
//! runtime wires the ACK callback.

pub mod records;
pub mod store;

pub use records::{ContainerRecord, ImageKind, ImageRecord, MessageRecord, SessionRecord};
pub use store::SessionStore;
