// ABOUTME: Storage seam for event and entity tables
// ABOUTME: Defines the store/session traits, column types and coerced row values

pub mod coerce;
pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cursor::Cursor;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Column name to introspected column type, in table order. Empty means the table does not exist.
pub type TableSchema = IndexMap<String, ColumnType>;

/// Target column types the coercion layer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Json,
    Jsonb,
    SmallInt,
    Integer,
    BigInt,
    Numeric,
    Boolean,
    Real,
    Double,
    Text,
    Bytea,
    Timestamp,
    TimestampTz,
    TextArray,
    SmallIntArray,
    IntegerArray,
    BigIntArray,
    NumericArray,
    /// Anything else; written as text and left for the server to cast.
    Other,
}

impl ColumnType {
    /// Map an `information_schema.columns.udt_name` to a column type.
    ///
    /// Array types carry a leading underscore (`_text`, `_int8`).
    pub fn from_udt_name(udt_name: &str) -> Self {
        match udt_name {
            "json" => ColumnType::Json,
            "jsonb" => ColumnType::Jsonb,
            "int2" => ColumnType::SmallInt,
            "int4" => ColumnType::Integer,
            "int8" => ColumnType::BigInt,
            "numeric" => ColumnType::Numeric,
            "bool" => ColumnType::Boolean,
            "float4" => ColumnType::Real,
            "float8" => ColumnType::Double,
            "text" | "varchar" | "bpchar" | "name" | "citext" => ColumnType::Text,
            "bytea" => ColumnType::Bytea,
            "timestamp" => ColumnType::Timestamp,
            "timestamptz" => ColumnType::TimestampTz,
            "_text" | "_varchar" | "_bpchar" => ColumnType::TextArray,
            "_int2" => ColumnType::SmallIntArray,
            "_int4" => ColumnType::IntegerArray,
            "_int8" => ColumnType::BigIntArray,
            "_numeric" => ColumnType::NumericArray,
            _ => ColumnType::Other,
        }
    }

    /// Whether `IS DISTINCT FROM` needs a cast: plain `json` has no equality operator.
    pub fn needs_jsonb_comparison(&self) -> bool {
        matches!(self, ColumnType::Json)
    }
}

/// A value coerced to its target column type, ready to bind.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Json(Value),
    SmallInt(i16),
    Integer(i32),
    BigInt(i64),
    /// Exact decimal digits, cast server-side from text.
    Numeric(String),
    Boolean(bool),
    Real(f32),
    Double(f64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    TextArray(Vec<String>),
    SmallIntArray(Vec<i16>),
    IntegerArray(Vec<i32>),
    BigIntArray(Vec<i64>),
    NumericArray(Vec<String>),
}

impl SqlValue {
    /// Integral view used when reading positions back out of stored rows.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::SmallInt(v) => Some(i64::from(*v)),
            SqlValue::Integer(v) => Some(i64::from(*v)),
            SqlValue::BigInt(v) => Some(*v),
            SqlValue::Numeric(s) | SqlValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

/// One row coerced against its table's schema. `values` always includes `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRow {
    pub id: String,
    pub values: IndexMap<String, SqlValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PreparedRow {
    /// Columns an upsert may overwrite on conflict: everything except `id` and `created_at`.
    pub fn mutable_columns(&self) -> impl Iterator<Item = (&String, &SqlValue)> {
        self.values
            .iter()
            .filter(|(name, _)| name.as_str() != "id" && name.as_str() != "created_at")
    }
}

/// How one event-row upsert was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    Updated,
    /// The stored row already matched; nothing was written.
    Skipped,
}

/// Tally of write outcomes over a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteCounts {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
}

impl WriteCounts {
    pub fn record(&mut self, outcome: WriteOutcome) {
        match outcome {
            WriteOutcome::Inserted => self.inserted += 1,
            WriteOutcome::Updated => self.updated += 1,
            WriteOutcome::Skipped => self.skipped += 1,
        }
    }

    pub fn add(&mut self, other: WriteCounts) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
    }

    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.skipped
    }
}

/// Read side of the target plus the factory for write sessions.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Introspect a table's columns. An empty schema means the table does not exist.
    async fn table_columns(&self, table: &str) -> Result<TableSchema>;

    /// Highest `(block_number, log_index)` stored in an event table.
    async fn read_position(&self, table: &str) -> Result<Option<Cursor>>;

    /// Open a transaction-scoped session. Dropping it without `commit` rolls back.
    async fn begin(&self) -> Result<Box<dyn StoreSession>>;
}

/// One transaction. Savepoints let callers isolate failures inside it.
#[async_trait]
pub trait StoreSession: Send {
    async fn savepoint(&mut self, name: &str) -> Result<()>;

    async fn release_savepoint(&mut self, name: &str) -> Result<()>;

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()>;

    /// Insert entity rows; existing ids only get `updated_at` refreshed.
    ///
    /// Each row is one atomic `INSERT ... ON CONFLICT` statement so concurrent cycles
    /// touching the same lookup table never race. A refreshed row counts as updated;
    /// an existing row in a table without `updated_at` is left alone and counts as skipped.
    async fn upsert_entity_rows(&mut self, table: &str, rows: &[PreparedRow]) -> Result<WriteCounts>;

    /// Insert-or-compare-and-update one event row.
    async fn upsert_event_row(&mut self, table: &str, row: &PreparedRow) -> Result<WriteOutcome>;

    async fn commit(self: Box<Self>) -> Result<()>;
}
