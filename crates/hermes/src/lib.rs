//! hermes relay server: token-authenticated fan-out from HTTP services to
//! WebSocket communicators.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Fan-out of published messages into per-communicator envelopes.
pub mod broadcast;
/// CLI argument parsing and server configuration.
pub mod config;
/// Relay descriptor model and the hot-reloaded configuration store.
pub mod configuration;
mod connection;
/// Error types for relay operations.
pub mod error;
/// Prometheus metrics collection and HTTP endpoint.
pub mod metrics;
/// Name-based table of connected communicators.
pub mod registry;
/// HTTP routes and shared server state.
pub mod server;
/// Persisted bearer-token identities.
pub mod tokens;
/// Filesystem notifications for the relay descriptor.
pub mod watch;

pub use server::{run, run_with_shutdown, ServerState};
