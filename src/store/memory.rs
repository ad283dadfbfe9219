// ABOUTME: In-memory event store with the same upsert and transaction semantics as Postgres
// ABOUTME: Used by tests and dry runs; all data is lost when the process exits

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    ColumnType, EventStore, PreparedRow, SqlValue, StoreSession, TableSchema, WriteCounts, WriteOutcome,
};
use crate::cursor::Cursor;

/// A stored row: column name to value.
pub type StoredRow = IndexMap<String, SqlValue>;

#[derive(Debug, Default, Clone)]
struct MemoryTable {
    schema: TableSchema,
    rows: IndexMap<String, StoredRow>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<String, MemoryTable>,
    failing: HashSet<String>,
}

/// In-memory store. Tables must be declared before use, just as the Postgres
/// store requires them to exist.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a table with its column types.
    pub fn with_table(self, table: &str, columns: &[(&str, ColumnType)]) -> Self {
        self.create_table(table, columns);
        self
    }

    pub fn create_table(&self, table: &str, columns: &[(&str, ColumnType)]) {
        let schema = columns
            .iter()
            .map(|(name, ty)| (name.to_string(), *ty))
            .collect();
        self.lock().tables.insert(
            table.to_string(),
            MemoryTable {
                schema,
                rows: IndexMap::new(),
            },
        );
    }

    /// Make every subsequent write to `table` fail, as a constraint violation would.
    pub fn fail_writes_to(&self, table: &str) {
        self.lock().failing.insert(table.to_string());
    }

    pub fn row(&self, table: &str, id: &str) -> Option<StoredRow> {
        self.lock()
            .tables
            .get(table)
            .and_then(|t| t.rows.get(id).cloned())
    }

    /// Ids of a table in insertion order.
    pub fn ids(&self, table: &str) -> Vec<String> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map_or(0, |t| t.rows.len())
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn table_columns(&self, table: &str) -> Result<TableSchema> {
        Ok(self
            .lock()
            .tables
            .get(table)
            .map(|t| t.schema.clone())
            .unwrap_or_default())
    }

    async fn read_position(&self, table: &str) -> Result<Option<Cursor>> {
        let state = self.lock();
        let t = state
            .tables
            .get(table)
            .ok_or_else(|| anyhow!("Table '{}' does not exist in the target database", table))?;
        let has_log_index = t.schema.contains_key("log_index");

        Ok(t.rows
            .values()
            .filter_map(|row| {
                let block_number = row.get("block_number").and_then(SqlValue::as_i64)?;
                let log_index = if has_log_index {
                    row.get("log_index").and_then(SqlValue::as_i64)
                } else {
                    None
                };
                Some(Cursor {
                    block_number,
                    log_index,
                })
            })
            .max())
    }

    async fn begin(&self) -> Result<Box<dyn StoreSession>> {
        Ok(Box::new(MemorySession {
            store: self.clone(),
            pending: IndexMap::new(),
            savepoints: Vec::new(),
        }))
    }
}

type PendingWrites = IndexMap<(String, String), StoredRow>;

/// Staged writes over the shared state. Nothing is visible to other sessions
/// until `commit`; dropping the session discards everything.
pub struct MemorySession {
    store: MemoryStore,
    pending: PendingWrites,
    savepoints: Vec<(String, PendingWrites)>,
}

impl MemorySession {
    fn existing(&self, table: &str, id: &str) -> Result<Option<StoredRow>> {
        let key = (table.to_string(), id.to_string());
        if let Some(row) = self.pending.get(&key) {
            return Ok(Some(row.clone()));
        }
        let state = self.store.lock();
        if state.failing.contains(table) {
            bail!("simulated write failure on table '{}'", table);
        }
        let t = state
            .tables
            .get(table)
            .ok_or_else(|| anyhow!("relation \"{}\" does not exist", table))?;
        Ok(t.rows.get(id).cloned())
    }
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn savepoint(&mut self, name: &str) -> Result<()> {
        self.savepoints.push((name.to_string(), self.pending.clone()));
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<()> {
        let position = self
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| anyhow!("savepoint \"{}\" does not exist", name))?;
        self.savepoints.truncate(position);
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        let position = self
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| anyhow!("savepoint \"{}\" does not exist", name))?;
        // The savepoint itself survives a rollback to it
        self.savepoints.truncate(position + 1);
        self.pending = self.savepoints[position].1.clone();
        Ok(())
    }

    async fn upsert_entity_rows(&mut self, table: &str, rows: &[PreparedRow]) -> Result<WriteCounts> {
        let mut counts = WriteCounts::default();
        for row in rows {
            let stored = match self.existing(table, &row.id)? {
                Some(mut existing) => match row.values.get("updated_at") {
                    Some(updated_at) => {
                        existing.insert("updated_at".to_string(), updated_at.clone());
                        counts.record(WriteOutcome::Updated);
                        existing
                    }
                    None => {
                        counts.record(WriteOutcome::Skipped);
                        continue;
                    }
                },
                None => {
                    counts.record(WriteOutcome::Inserted);
                    row.values.clone()
                }
            };
            self.pending
                .insert((table.to_string(), row.id.clone()), stored);
        }
        Ok(counts)
    }

    async fn upsert_event_row(&mut self, table: &str, row: &PreparedRow) -> Result<WriteOutcome> {
        let (outcome, stored) = match self.existing(table, &row.id)? {
            None => (WriteOutcome::Inserted, row.values.clone()),
            Some(existing) => {
                let unchanged = row
                    .mutable_columns()
                    .filter(|(name, _)| name.as_str() != "updated_at")
                    .all(|(name, value)| existing.get(name).unwrap_or(&SqlValue::Null) == value);
                if unchanged {
                    return Ok(WriteOutcome::Skipped);
                }
                let mut merged = row.values.clone();
                if let Some(created_at) = existing.get("created_at") {
                    merged.insert("created_at".to_string(), created_at.clone());
                }
                (WriteOutcome::Updated, merged)
            }
        };

        self.pending
            .insert((table.to_string(), row.id.clone()), stored);
        Ok(outcome)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemorySession { store, pending, .. } = *self;
        let mut state = store.lock();
        for ((table, id), row) in pending {
            let t = state
                .tables
                .get_mut(&table)
                .ok_or_else(|| anyhow!("relation \"{}\" does not exist", table))?;
            let row = match t.rows.get(&id).and_then(|r| r.get("created_at")) {
                // Another session may have created the row since it was staged
                Some(created_at) => {
                    let mut row = row;
                    row.insert("created_at".to_string(), created_at.clone());
                    row
                }
                None => row,
            };
            t.rows.insert(id, row);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn store() -> MemoryStore {
        MemoryStore::new().with_table(
            "events",
            &[
                ("id", ColumnType::Text),
                ("block_number", ColumnType::BigInt),
                ("log_index", ColumnType::Integer),
                ("created_at", ColumnType::TimestampTz),
                ("updated_at", ColumnType::TimestampTz),
            ],
        )
    }

    fn row(id: &str, block: i64, log: i32) -> PreparedRow {
        let now = Utc::now();
        PreparedRow {
            id: id.to_string(),
            values: IndexMap::from([
                ("id".to_string(), SqlValue::Text(id.to_string())),
                ("block_number".to_string(), SqlValue::BigInt(block)),
                ("log_index".to_string(), SqlValue::Integer(log)),
                ("created_at".to_string(), SqlValue::Timestamp(now)),
                ("updated_at".to_string(), SqlValue::Timestamp(now)),
            ]),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_writes_are_invisible_until_commit() {
        let store = store();
        let mut session = store.begin().await.unwrap();
        session.upsert_event_row("events", &row("a", 1, 0)).await.unwrap();
        assert_eq!(store.row_count("events"), 0);

        session.commit().await.unwrap();
        assert_eq!(store.row_count("events"), 1);

        let mut dropped = store.begin().await.unwrap();
        dropped.upsert_event_row("events", &row("b", 2, 0)).await.unwrap();
        drop(dropped);
        assert_eq!(store.ids("events"), vec!["a"]);
    }

    #[tokio::test]
    async fn test_rollback_to_savepoint_discards_later_writes() {
        let store = store();
        let mut session = store.begin().await.unwrap();
        session.upsert_event_row("events", &row("a", 1, 0)).await.unwrap();
        session.savepoint("event_row").await.unwrap();
        session.upsert_event_row("events", &row("b", 1, 1)).await.unwrap();
        session.rollback_to_savepoint("event_row").await.unwrap();
        session.release_savepoint("event_row").await.unwrap();
        session.commit().await.unwrap();

        assert_eq!(store.ids("events"), vec!["a"]);
    }

    #[tokio::test]
    async fn test_read_position_is_max_composite() {
        let store = store();
        let mut session = store.begin().await.unwrap();
        for (id, block, log) in [("a", 100, 3), ("b", 101, 0), ("c", 101, 2), ("d", 99, 9)] {
            session.upsert_event_row("events", &row(id, block, log)).await.unwrap();
        }
        session.commit().await.unwrap();

        assert_eq!(
            store.read_position("events").await.unwrap(),
            Some(Cursor::new(101, 2))
        );
        assert!(store.read_position("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_identical_row_is_skipped() {
        let store = store();
        let mut session = store.begin().await.unwrap();
        let first = row("a", 1, 0);
        assert_eq!(
            session.upsert_event_row("events", &first).await.unwrap(),
            WriteOutcome::Inserted
        );
        assert_eq!(
            session.upsert_event_row("events", &row("a", 1, 0)).await.unwrap(),
            WriteOutcome::Skipped
        );
        assert_eq!(
            session.upsert_event_row("events", &row("a", 2, 0)).await.unwrap(),
            WriteOutcome::Updated
        );
        session.commit().await.unwrap();

        let stored = store.row("events", "a").unwrap();
        assert_eq!(stored["block_number"], SqlValue::BigInt(2));
        assert_eq!(stored["created_at"], SqlValue::Timestamp(first.created_at));
    }

    #[tokio::test]
    async fn test_entity_upsert_counts_touches_as_updates() {
        let store = MemoryStore::new()
            .with_table(
                "operators",
                &[
                    ("id", ColumnType::Text),
                    ("created_at", ColumnType::TimestampTz),
                    ("updated_at", ColumnType::TimestampTz),
                ],
            )
            .with_table("tags", &[("id", ColumnType::Text)]);
        let entity = |id: &str, with_updated_at: bool| {
            let mut row = row(id, 0, 0);
            row.values.retain(|name, _| name == "id" || (with_updated_at && name.ends_with("_at")));
            row
        };

        let mut session = store.begin().await.unwrap();
        let counts = session
            .upsert_entity_rows("operators", &[entity("0xa", true), entity("0xb", true)])
            .await
            .unwrap();
        assert_eq!((counts.inserted, counts.updated, counts.skipped), (2, 0, 0));

        let counts = session
            .upsert_entity_rows("operators", &[entity("0xa", true), entity("0xc", true)])
            .await
            .unwrap();
        assert_eq!((counts.inserted, counts.updated, counts.skipped), (1, 1, 0));

        session.upsert_entity_rows("tags", &[entity("t", false)]).await.unwrap();
        let counts = session.upsert_entity_rows("tags", &[entity("t", false)]).await.unwrap();
        assert_eq!((counts.inserted, counts.updated, counts.skipped), (0, 0, 1));
    }
}
