//! Shared domain types for the Convoy runtime.
//!
//! Everything that crosses a crate boundary lives here: the [`Event`]
//! record and its payload taxonomy, the shared [`Error`] type, and the
//! TOML-backed configuration structs.

pub mod config;
pub mod error;
pub mod event;

pub use config::{Config, ConfigIssue, ConfigSeverity};
pub use error::{Error, Result};
pub use event::{
    now_millis, Event, EventCategory, EventContext, EventIntent, EventPayload, EventSource,
    LifecycleState, StopReason, Usage,
};
