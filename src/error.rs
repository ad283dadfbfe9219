// ABOUTME: Error taxonomy for the ingestion engine
// ABOUTME: Separates cycle-terminal errors from locally recovered row and entity errors

use thiserror::Error;

/// Errors raised by the ingestion engine.
///
/// Only `TransientSource`, `Store` and `FatalConfig` ever escape a cycle.
/// Row- and entity-level failures are caught where they happen and folded into
/// the cycle report; their variants exist so that the report can carry a typed
/// cause.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Network failure, timeout, non-success status or GraphQL `errors` from the source.
    #[error("source request for '{event_type}' failed: {reason}")]
    TransientSource { event_type: String, reason: String },

    /// A record's nested/optional field could not be projected.
    #[error("malformed field '{field}' in record {record}: {reason}")]
    MalformedRecord {
        record: String,
        field: String,
        reason: String,
    },

    /// One entity type's upsert batch failed.
    #[error("entity upsert for '{entity_type}' failed: {reason}")]
    EntityResolution { entity_type: String, reason: String },

    /// One event row could not be written.
    #[error("row {id} could not be written: {reason}")]
    RowConflict { id: String, reason: String },

    /// Registry or configuration inconsistency detected at startup.
    #[error("invalid configuration: {0}")]
    FatalConfig(String),

    /// The store could not open a session, read a cursor or commit.
    #[error("store operation '{operation}' failed: {reason}")]
    Store { operation: String, reason: String },
}

impl IngestError {
    /// Returns `true` if the next scheduled invocation may simply retry the cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientSource { .. } | Self::Store { .. })
    }

    pub fn source(event_type: &str, err: impl std::fmt::Display) -> Self {
        Self::TransientSource {
            event_type: event_type.to_string(),
            reason: err.to_string(),
        }
    }

    pub fn store(operation: &str, err: &anyhow::Error) -> Self {
        Self::Store {
            operation: operation.to_string(),
            // {:#} keeps the full context chain on one line
            reason: format!("{:#}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(IngestError::source("operatorRegistereds", "timeout").is_transient());
        assert!(IngestError::store("commit", &anyhow::anyhow!("connection reset")).is_transient());
        assert!(!IngestError::FatalConfig("missing rule".to_string()).is_transient());
        assert!(!IngestError::RowConflict {
            id: "tx-1".to_string(),
            reason: "bad".to_string()
        }
        .is_transient());
    }

    #[test]
    fn test_store_error_keeps_context_chain() {
        let err = anyhow::anyhow!("connection refused").context("Failed to open session");
        let wrapped = IngestError::store("begin", &err);
        let message = wrapped.to_string();
        assert!(message.contains("Failed to open session"));
        assert!(message.contains("connection refused"));
    }
}
