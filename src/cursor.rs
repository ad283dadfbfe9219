// ABOUTME: Resume position tracking per event type
// ABOUTME: Reads the high-water mark from the target table and decides where each fetch resumes

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

use crate::error::IngestError;
use crate::registry::EventTypeDescriptor;
use crate::store::EventStore;
use crate::utils::quote_ident;

/// Resume position of an event type: the order key of the last ingested record.
///
/// Ordering is lexicographic on `(block_number, log_index)`. A cursor without a
/// log index sorts before every log-level cursor of the same block, so mixing the
/// two granularities never moves the cursor backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor {
    pub block_number: i64,
    pub log_index: Option<i64>,
}

impl Cursor {
    pub fn new(block_number: i64, log_index: i64) -> Self {
        Self {
            block_number,
            log_index: Some(log_index),
        }
    }

    /// Block-only cursor, used when the table carries no log index.
    pub fn block_only(block_number: i64) -> Self {
        Self {
            block_number,
            log_index: None,
        }
    }

    /// Parse a position from raw field values.
    ///
    /// Accepts JSON integers and numeric strings (GraphQL `BigInt` arrives as a string).
    /// Returns `None` when the block number is missing or not integral.
    pub fn from_values(block_number: Option<&Value>, log_index: Option<&Value>) -> Option<Self> {
        let block_number = block_number.and_then(parse_position_value)?;
        Some(Self {
            block_number,
            log_index: log_index.and_then(parse_position_value),
        })
    }

    /// Returns `true` if a record at `self` is strictly newer than `cursor`.
    pub fn is_after(&self, cursor: &Cursor) -> bool {
        self > cursor
    }
}

impl Ord for Cursor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.block_number
            .cmp(&other.block_number)
            .then_with(|| self.log_index.cmp(&other.log_index))
    }
}

impl PartialOrd for Cursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.log_index {
            Some(log_index) => write!(f, "({}, {})", self.block_number, log_index),
            None => write!(f, "({}, -)", self.block_number),
        }
    }
}

/// Parse an integral position value from a JSON number or numeric string.
pub fn parse_position_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Build the query that reads the high-water mark of an event table.
///
/// With a `log_index` column the most advanced `(block_number, log_index)` pair is
/// returned; rows whose log index is null sort last within their block so they never
/// hide a log-level position. Without the column only `max(block_number)` is read.
pub fn position_query(table: &str, has_log_index: bool) -> String {
    let table = quote_ident(table);
    if has_log_index {
        format!(
            "SELECT block_number::bigint, log_index::bigint FROM {} \
             ORDER BY block_number DESC, log_index DESC NULLS LAST LIMIT 1",
            table
        )
    } else {
        format!("SELECT max(block_number)::bigint, NULL::bigint FROM {}", table)
    }
}

/// Reads and advances the resume position of one event type.
pub struct CursorTracker<'a> {
    store: &'a dyn EventStore,
}

impl<'a> CursorTracker<'a> {
    pub fn new(store: &'a dyn EventStore) -> Self {
        Self { store }
    }

    /// Read the last durably ingested position for the descriptor's table.
    ///
    /// `None` means the table is empty and the cycle should backfill from genesis.
    pub async fn read(&self, descriptor: &EventTypeDescriptor) -> Result<Option<Cursor>, IngestError> {
        let cursor = self
            .store
            .read_position(&descriptor.table_name)
            .await
            .map_err(|e| IngestError::store("read cursor", &e))?;

        match cursor {
            Some(c) if c.log_index.is_none() => tracing::debug!(
                "Cursor for {} is block-only at {}; same-block rows may be re-delivered",
                descriptor.graphql_name,
                c
            ),
            Some(c) => tracing::debug!("Cursor for {} is {}", descriptor.graphql_name, c),
            None => tracing::debug!(
                "No rows in {} yet; backfilling {} from genesis",
                descriptor.table_name,
                descriptor.graphql_name
            ),
        }

        Ok(cursor)
    }

    /// Compute the cursor after a page: the maximum of the current position and every
    /// position that was durably written. Never moves backwards.
    pub fn advance<I>(current: Option<Cursor>, written: I) -> Option<Cursor>
    where
        I: IntoIterator<Item = Cursor>,
    {
        written.into_iter().fold(current, |acc, position| match acc {
            Some(c) if c >= position => Some(c),
            _ => Some(position),
        })
    }

    /// Where a cycle starts fetching, given the stored high-water mark: the start of
    /// its block.
    ///
    /// A cycle that stopped after a full page may have stored only part of that
    /// block, including rows with a higher log index than ones it never saw. The
    /// block is read again and its unchanged rows are skipped by the loader.
    pub fn resume_from(stored: Option<Cursor>) -> Option<Cursor> {
        stored.map(|c| Cursor::block_only(c.block_number))
    }

    /// Resume position after a page that filled its request.
    ///
    /// The source orders by block only, so the last block of a full page may go on
    /// in the next page with lower log indexes. Every earlier block is complete.
    pub fn after_full_page(current: Option<Cursor>, last_block: i64) -> Option<Cursor> {
        Self::advance(current, [Cursor::block_only(last_block)])
    }
}
