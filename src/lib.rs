//! Hive: the durable coordination substrate for a fleet of AI coding
//! agents sharing one repository.
//!
//! Every coordination fact is an append-only event; projections
//! materialize events into queryable work items ("beads"), a dependency
//! graph with a blocked-work cache, inter-agent messages, reservations,
//! and decision traces. The same database carries a semantic memory store
//! (vector + FTS) and the session index that makes past agent transcripts
//! searchable.
//!
//! # Modules
//!
//! - [`db`] — SQLite adapter: WAL management, busy-retry, migrations
//! - [`store`] — event log, projections, dependency graph, coordination
//! - [`sync`] — byte-stable JSONL export/import, 3-way merge, flusher
//! - [`memory`] — semantic memory with time-decayed hybrid retrieval
//! - [`embedding`] — HTTP client for the external embedding model
//! - [`session`] — watcher, parsers, indexer, staleness, viewer
//! - [`server`] — the event log over HTTP with SSE live tails

pub mod db;
pub mod embedding;
pub mod error;
pub mod lock;
pub mod memory;
pub mod model;
pub mod server;
pub mod session;
pub mod store;
pub mod sync;

pub use error::{HiveError, Result};
