#![deny(unsafe_code)]
//! Core runtime of an MCP server that supervises concurrent agent CLI
//! sessions.
//!
//! The server spawns one child process per session, frames its JSONL
//! stdout into ordered stream records with backpressure all the way to the
//! child's pipe (`stream_events`), and snapshots project trees into a
//! content-addressed store (`content_store`). This crate wires those
//! pieces together:
//!
//! - [`locator::BinaryLocator`] discovers and validates the external agent
//!   CLI, caching the result across restarts.
//! - [`registry::ProcessRegistry`] durably records every spawned child and
//!   reconciles records against the OS on startup, marking stale pids
//!   `Orphaned`.
//! - [`session::SessionSupervisor`] owns the session state machine:
//!   spawn, stream, stdin writes, deadlines, idle timeouts, cancellation
//!   with a kill-grace escalation, and terminal bookkeeping.
//! - [`checkpoint::CheckpointManager`] snapshots and restores working
//!   trees, with named refs as GC roots.
//! - [`mcp::McpFrontend`] dispatches decoded requests and streams
//!   per-session notifications back to the peer.
//!
//! The binary (`src/main.rs`) adds the thin stdio transport, signal
//! handling, and periodic GC; everything here is transport-free.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod events;
pub mod locator;
pub mod mcp;
pub mod paths;
pub mod registry;
pub mod session;

pub use config::ServerConfig;
pub use error::{ErrorCode, McpErrorPayload, ServerError};
pub use events::{EventBus, ServerEvent};
pub use paths::StateLayout;
