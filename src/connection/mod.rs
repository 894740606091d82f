//! Connection Module
//!
//! One TCP connection to one server, and the watchdog that replaces it when
//! it drops.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Endpoint                             │
//! │          (owns the ConnectionHandle + command queue)        │
//! └───────┬─────────────────────────────────────▲───────────────┘
//!         │ send(bytes)                          │ on_reply / on_connection_lost
//!         ▼                                      │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Connection task                          │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐      │
//! │  │ Write batch │    │ Read bytes  │───>│ Parse RESP  │      │
//! │  └─────────────┘    └─────────────┘    └─────────────┘      │
//! └─────────────────────────────────────────────────────────────┘
//!         ▲
//!         │ connect + activate (after a loss)
//! ┌───────┴──────────────┐
//! │  ConnectionWatchdog  │
//! └──────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Async I/O**: one Tokio task per connection, nothing blocks the caller
//! - **Pipelining**: queued writes are batched into a single flush
//! - **Reconnect**: exponential backoff, suspendable while closing
//! - **Statistics**: connection and traffic counters shared per client

pub mod handler;
pub mod watchdog;

// Re-export commonly used types
pub use handler::{
    connect, spawn_connection, ConnectionError, ConnectionEvents, ConnectionHandle,
    ConnectionStats,
};
pub use watchdog::ConnectionWatchdog;
