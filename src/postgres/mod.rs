// ABOUTME: PostgreSQL connection management for the target store
// ABOUTME: Re-exports the TLS-aware connect helpers

pub mod connection;

pub use connection::{connect, connect_with_retry, init_tls_policy};
