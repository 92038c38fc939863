//! Relay harness.
//!
//! Runnable service around the dispatcher: Postgres-backed queue and store,
//! a websocket endpoint that wires one dispatcher per worker connection, and
//! manual-testing helpers.

pub mod config;
pub mod enqueue;
pub mod migrate;
pub mod pgqueue;
pub mod server;
pub mod store;
pub mod trace;
