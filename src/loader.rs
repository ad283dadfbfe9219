// ABOUTME: Writes a transformed page with idempotent conflict resolution
// ABOUTME: Isolates each row in a savepoint and classifies inserted/updated/skipped/errored

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cursor::Cursor;
use crate::error::IngestError;
use crate::registry::EventTypeDescriptor;
use crate::store::coerce::prepare_row;
use crate::store::{EventStore, WriteOutcome};
use crate::transform::EventRecord;

const SAVEPOINT: &str = "event_row";

/// Why one row was not written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
    /// Row identity, when one could be derived.
    pub id: Option<String>,
    pub cause: String,
}

/// Result of loading one page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpsertOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errored: usize,
    pub errors: Vec<RowError>,
    /// Positions of every row that is now durably stored (inserted, updated or skipped),
    /// block-only when the table has no `log_index` column.
    #[serde(skip)]
    pub written_positions: Vec<Cursor>,
}

impl UpsertOutcome {
    pub fn written(&self) -> usize {
        self.inserted + self.updated + self.skipped
    }

    pub fn merge(&mut self, other: UpsertOutcome) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.errored += other.errored;
        self.errors.extend(other.errors);
        self.written_positions.extend(other.written_positions);
    }

    fn record_error(&mut self, table: &str, error: IngestError, id: Option<&str>) {
        tracing::warn!("Failed to write row to {}: {}", table, error);
        self.errored += 1;
        self.errors.push(RowError {
            id: id.map(str::to_string),
            cause: error.to_string(),
        });
    }
}

/// Loads pages of event rows into one descriptor's table.
pub struct UpsertLoader<'a> {
    store: &'a dyn EventStore,
}

impl<'a> UpsertLoader<'a> {
    pub fn new(store: &'a dyn EventStore) -> Self {
        Self { store }
    }

    /// Write a page in one transaction, one savepoint per row.
    ///
    /// A failing row is rolled back to its savepoint, counted and logged; the rest of
    /// the page still commits. Only session-level failures are returned as errors.
    pub async fn load(
        &self,
        descriptor: &EventTypeDescriptor,
        records: &[EventRecord],
    ) -> Result<UpsertOutcome, IngestError> {
        let table = descriptor.table_name.as_str();
        let mut outcome = UpsertOutcome::default();
        if records.is_empty() {
            return Ok(outcome);
        }

        let schema = self
            .store
            .table_columns(table)
            .await
            .map_err(|e| IngestError::store("introspect table", &e))?;
        if schema.is_empty() {
            return Err(IngestError::Store {
                operation: "introspect table".to_string(),
                reason: format!("table '{}' does not exist in the target database", table),
            });
        }

        let mut session = self
            .store
            .begin()
            .await
            .map_err(|e| IngestError::store("begin event session", &e))?;
        let mut positions = Vec::new();
        // Report positions the way the table can store them, so the cursor never
        // claims a log index that read_position cannot return
        let stores_log_index = schema.contains_key("log_index");

        for record in records {
            let Some(id) = record.id.as_deref() else {
                let error = IngestError::RowConflict {
                    id: "<none>".to_string(),
                    reason: "record has no derivable identity".to_string(),
                };
                outcome.record_error(table, error, None);
                continue;
            };

            let columns = record
                .columns
                .iter()
                .map(|(k, v)| (k.as_str(), v))
                .chain(std::iter::once(("raw_data", &record.raw as &Value)));
            let row = match prepare_row(table, &schema, id, columns, record.created_at, record.updated_at) {
                Ok(row) => row,
                Err(e) => {
                    let error = IngestError::RowConflict {
                        id: id.to_string(),
                        reason: format!("{:#}", e),
                    };
                    outcome.record_error(table, error, Some(id));
                    continue;
                }
            };

            session
                .savepoint(SAVEPOINT)
                .await
                .map_err(|e| IngestError::store("row savepoint", &e))?;

            match session.upsert_event_row(table, &row).await {
                Ok(result) => {
                    session
                        .release_savepoint(SAVEPOINT)
                        .await
                        .map_err(|e| IngestError::store("row savepoint", &e))?;
                    match result {
                        WriteOutcome::Inserted => outcome.inserted += 1,
                        WriteOutcome::Updated => outcome.updated += 1,
                        WriteOutcome::Skipped => outcome.skipped += 1,
                    }
                    if let Some(position) = record.position {
                        positions.push(if stores_log_index {
                            position
                        } else {
                            Cursor::block_only(position.block_number)
                        });
                    }
                }
                Err(e) => {
                    session
                        .rollback_to_savepoint(SAVEPOINT)
                        .await
                        .map_err(|e| IngestError::store("row rollback", &e))?;
                    session
                        .release_savepoint(SAVEPOINT)
                        .await
                        .map_err(|e| IngestError::store("row savepoint", &e))?;
                    let error = IngestError::RowConflict {
                        id: id.to_string(),
                        reason: format!("{:#}", e),
                    };
                    outcome.record_error(table, error, Some(id));
                }
            }
        }

        session
            .commit()
            .await
            .map_err(|e| IngestError::store("commit events", &e))?;

        // Positions only count once the transaction holding them is durable
        outcome.written_positions = positions;
        Ok(outcome)
    }
}
