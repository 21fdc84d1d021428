//! notecount - permission-scoped annotation counts per URL.
//!
//! An incremental indexer keeps one counter per (URL, audience) pair in a
//! key-value store, and a small HTTP service answers "how many annotations
//! on this page can I see?" by summing the counters for the caller's own
//! scope and each of their groups.

pub mod aggregator;
pub mod api;
pub mod cli;
pub mod config;
pub mod fetcher;
pub mod indexer;
pub mod loader;
pub mod models;
pub mod scope;
pub mod server;
pub mod store;
