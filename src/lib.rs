//! Offline-capable caching proxy for a PEP 503 package index.
//!
//! Listings are fetched from the upstream index, stored in SQLite and served
//! with every artifact link rewritten to point back at this proxy. Artifact
//! downloads are streamed to the client while being written into a local
//! cache, so the next request for the same file never leaves the machine.

pub mod address;
pub mod cache;
pub mod config;
pub mod error;
pub mod http_retry;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod server;
pub mod store;
pub mod upstream;
