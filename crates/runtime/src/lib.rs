//! The Convoy runtime: WebSocket server, reliable delivery, and the
//! glue binding bus, engine, queue and session storage together.
//!
//! Event flow for one user message:
//!
//! ```text
//! client ── user_message ──► ws ──► bus ──► agent runtime ──► engine
//!                                                               │
//!                                              outputs (bus, broadcastable)
//!                                                               ▼
//!                                         queue.append(session topic)
//!                                                               ▼
//!                                  send_reliable per subscribed connection
//!                                                               ▼
//!                                     client ACK → cursor advance → persist
//! ```

pub mod agents;
pub mod bootstrap;
pub mod commands;
pub mod connection;
pub mod delivery;
pub mod registry;
pub mod server;
pub mod state;
pub mod ws;

pub use bootstrap::{build_app_state, spawn_background_tasks};
pub use server::ConvoyServer;
pub use state::AppState;
