// ABOUTME: Library root for subgraph-replicator
// ABOUTME: Incremental, resumable replication of subgraph events into PostgreSQL

pub mod commands;
pub mod config;
pub mod cursor;
pub mod entities;
pub mod error;
pub mod loader;
pub mod postgres;
pub mod registry;
pub mod source;
pub mod store;
pub mod sync;
pub mod transform;
pub mod utils;

pub use error::IngestError;
