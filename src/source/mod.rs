// ABOUTME: Event source seam - one bounded fetch per planned request
// ABOUTME: Implemented over GraphQL for production and by scripted sources in tests

pub mod graphql;
pub mod planner;

pub use graphql::GraphqlSource;
pub use planner::QueryPlanner;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::cursor::Cursor;
use crate::error::IngestError;

/// Which slice of the log a request selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchScope {
    /// Records after the request cursor, ordered by block.
    Forward,
    /// Records of one block ordered by `id`, strictly after `after_id` when given.
    /// Used to page through a block that does not fit in one page.
    Block {
        block_number: i64,
        after_id: Option<String>,
    },
}

/// One bounded fetch, produced by the [`QueryPlanner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// GraphQL list field, which is also the event type name.
    pub list_field: String,
    pub document: String,
    pub page_size: usize,
    /// Cursor the filter was built from. Block scans carry the block-only cursor of their block.
    pub cursor: Option<Cursor>,
    pub scope: FetchScope,
}

/// Executes fetch requests against the indexed log.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Fetch one page. Any transport, status or GraphQL error is a
    /// [`IngestError::TransientSource`].
    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<Map<String, Value>>, IngestError>;
}
