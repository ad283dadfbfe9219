// ABOUTME: PostgreSQL implementation of the event store
// ABOUTME: Introspects target tables and upserts rows inside savepoint-isolated transactions

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Row};

use super::{
    ColumnType, EventStore, PreparedRow, SqlValue, StoreSession, TableSchema, WriteCounts, WriteOutcome,
};
use crate::cursor::{position_query, Cursor};
use crate::utils::{quote_ident, sanitize_url, validate_postgres_identifier};

type Param = Box<dyn ToSql + Sync + Send>;

/// Introspected table: coercion types plus the raw `udt_name` for server-side casts.
#[derive(Debug, Clone, Default)]
struct PgTable {
    columns: TableSchema,
    udt_names: HashMap<String, String>,
}

type TableCache = Arc<Mutex<HashMap<String, Arc<PgTable>>>>;

/// Event store backed by an existing PostgreSQL schema.
///
/// Reads (introspection, cursors) share one connection. Every write session opens
/// its own connection so that its transaction cannot interleave with another cycle's.
pub struct PostgresStore {
    url: String,
    connect_timeout: Duration,
    statement_timeout: Duration,
    reader: Client,
    tables: TableCache,
}

impl PostgresStore {
    pub async fn connect(
        url: &str,
        connect_timeout: Duration,
        statement_timeout: Duration,
    ) -> Result<Self> {
        let reader = crate::postgres::connect_with_retry(url, connect_timeout)
            .await
            .context("Failed to connect to target database")?;
        reader
            .batch_execute(&statement_timeout_sql(statement_timeout, false))
            .await
            .context("Failed to set statement timeout")?;

        tracing::info!("Connected to target {}", sanitize_url(url));

        Ok(Self {
            url: url.to_string(),
            connect_timeout,
            statement_timeout,
            reader,
            tables: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn table(&self, table: &str) -> Result<Arc<PgTable>> {
        let cached = lock(&self.tables).get(table).cloned();
        if let Some(cached) = cached {
            return Ok(cached);
        }

        let rows = self
            .reader
            .query(
                "SELECT column_name::text, udt_name::text
                 FROM information_schema.columns
                 WHERE table_schema = current_schema() AND table_name = $1
                 ORDER BY ordinal_position",
                &[&table],
            )
            .await
            .with_context(|| format!("Failed to get columns for {}", table))?;

        let mut introspected = PgTable::default();
        for row in rows {
            let name: String = row.get(0);
            let udt: String = row.get(1);
            introspected
                .columns
                .insert(name.clone(), ColumnType::from_udt_name(&udt));
            introspected.udt_names.insert(name, udt);
        }

        let introspected = Arc::new(introspected);
        // A missing table may be created later; only cache what exists
        if !introspected.columns.is_empty() {
            lock(&self.tables).insert(table.to_string(), introspected.clone());
        }
        Ok(introspected)
    }
}

#[async_trait]
impl EventStore for PostgresStore {
    async fn table_columns(&self, table: &str) -> Result<TableSchema> {
        Ok(self.table(table).await?.columns.clone())
    }

    async fn read_position(&self, table: &str) -> Result<Option<Cursor>> {
        let schema = self.table(table).await?;
        if schema.columns.is_empty() {
            bail!("Table '{}' does not exist in the target database", table);
        }

        let query = position_query(table, schema.columns.contains_key("log_index"));
        let row = self
            .reader
            .query_opt(&query, &[])
            .await
            .with_context(|| format!("Failed to read position from {}", table))?;

        Ok(row.and_then(|row| {
            let block: Option<i64> = row.get(0);
            let log_index: Option<i64> = row.get(1);
            block.map(|block_number| Cursor {
                block_number,
                log_index,
            })
        }))
    }

    async fn begin(&self) -> Result<Box<dyn StoreSession>> {
        let client = crate::postgres::connect_with_retry(&self.url, self.connect_timeout)
            .await
            .context("Failed to open store session")?;
        client
            .batch_execute(&format!(
                "BEGIN; {}",
                statement_timeout_sql(self.statement_timeout, true)
            ))
            .await
            .context("Failed to begin transaction")?;

        Ok(Box::new(PostgresSession {
            client,
            tables: self.tables.clone(),
        }))
    }
}

/// One open transaction. Dropping it closes the connection and the server rolls back.
pub struct PostgresSession {
    client: Client,
    tables: TableCache,
}

impl PostgresSession {
    fn table(&self, table: &str) -> Result<Arc<PgTable>> {
        lock(&self.tables)
            .get(table)
            .cloned()
            .with_context(|| format!("Table '{}' was not introspected before writing", table))
    }
}

#[async_trait]
impl StoreSession for PostgresSession {
    async fn savepoint(&mut self, name: &str) -> Result<()> {
        validate_postgres_identifier(name)?;
        self.client
            .batch_execute(&format!("SAVEPOINT {}", quote_ident(name)))
            .await
            .with_context(|| format!("Failed to create savepoint {}", name))
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<()> {
        validate_postgres_identifier(name)?;
        self.client
            .batch_execute(&format!("RELEASE SAVEPOINT {}", quote_ident(name)))
            .await
            .with_context(|| format!("Failed to release savepoint {}", name))
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        validate_postgres_identifier(name)?;
        self.client
            .batch_execute(&format!("ROLLBACK TO SAVEPOINT {}", quote_ident(name)))
            .await
            .with_context(|| format!("Failed to roll back to savepoint {}", name))
    }

    async fn upsert_entity_rows(&mut self, table: &str, rows: &[PreparedRow]) -> Result<WriteCounts> {
        let schema = self.table(table)?;
        let mut counts = WriteCounts::default();

        for row in rows {
            let columns = bound_columns(&schema, row);
            let query = build_entity_upsert(table, &columns);
            let params = to_params(&columns, row);
            let refs: Vec<&(dyn ToSql + Sync)> =
                params.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();

            let returned = self
                .client
                .query_opt(&query, &refs)
                .await
                .with_context(|| format!("Failed to upsert {} into {}", row.id, table))?;
            counts.record(classify(returned));
        }

        Ok(counts)
    }

    async fn upsert_event_row(&mut self, table: &str, row: &PreparedRow) -> Result<WriteOutcome> {
        let schema = self.table(table)?;
        let columns = bound_columns(&schema, row);
        let query = build_event_upsert(table, &columns);
        let params = to_params(&columns, row);
        let refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();

        let returned = self
            .client
            .query_opt(&query, &refs)
            .await
            .with_context(|| format!("Failed to upsert {} into {}", row.id, table))?;

        Ok(classify(returned))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.client
            .batch_execute("COMMIT")
            .await
            .context("Failed to commit transaction")
    }
}

/// No returned row means the conflict clause wrote nothing.
fn classify(returned: Option<Row>) -> WriteOutcome {
    match returned {
        None => WriteOutcome::Skipped,
        Some(r) => match r.get::<_, Option<bool>>(0) {
            Some(true) => WriteOutcome::Inserted,
            _ => WriteOutcome::Updated,
        },
    }
}

/// `RETURNING` expression that is true for a freshly inserted row.
fn fresh_row_marker(columns: &[BoundColumn]) -> &'static str {
    let has = |name: &str| columns.iter().any(|c| c.name == name);
    if has("created_at") && has("updated_at") {
        "(t.\"created_at\" = t.\"updated_at\")"
    } else {
        // Without timestamp columns, fall back to the system column marking fresh tuples
        "(t.xmax = 0)"
    }
}

/// A column as it is bound into a statement.
#[derive(Debug, Clone)]
struct BoundColumn {
    name: String,
    ty: ColumnType,
    udt: String,
}

fn bound_columns(schema: &PgTable, row: &PreparedRow) -> Vec<BoundColumn> {
    row.values
        .keys()
        .map(|name| BoundColumn {
            name: name.clone(),
            ty: schema.columns.get(name).copied().unwrap_or(ColumnType::Other),
            udt: schema.udt_names.get(name).cloned().unwrap_or_else(|| "text".to_string()),
        })
        .collect()
}

/// Placeholder for one parameter. Types without a direct binary binding are sent as
/// text and cast server-side.
fn placeholder(index: usize, column: &BoundColumn) -> String {
    match column.ty {
        ColumnType::Numeric => format!("${}::text::numeric", index),
        ColumnType::NumericArray => format!("${}::text[]::numeric[]", index),
        ColumnType::Other => format!("${}::text::{}", index, quote_ident(&column.udt)),
        _ => format!("${}", index),
    }
}

fn comparable(prefix: &str, column: &BoundColumn) -> String {
    let expr = format!("{}.{}", prefix, quote_ident(&column.name));
    if column.ty.needs_jsonb_comparison() {
        format!("{}::jsonb", expr)
    } else {
        expr
    }
}

/// Build the insert-or-compare-and-update statement for one event row.
///
/// ```sql
/// INSERT INTO "t" AS t ("id", "block_number", "raw_data", "created_at", "updated_at")
/// VALUES ($1, $2, $3, $4, $5)
/// ON CONFLICT ("id") DO UPDATE SET "block_number" = EXCLUDED."block_number", ...,
///   "updated_at" = EXCLUDED."updated_at"
/// WHERE (t."block_number", t."raw_data"::jsonb) IS DISTINCT FROM (EXCLUDED."block_number", EXCLUDED."raw_data"::jsonb)
/// RETURNING (created_at = updated_at)
/// ```
///
/// No returned row means the stored row was identical and nothing was written.
fn build_event_upsert(table: &str, columns: &[BoundColumn]) -> String {
    let names: Vec<String> = columns.iter().map(|c| quote_ident(&c.name)).collect();
    let placeholders: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| placeholder(i + 1, c))
        .collect();

    let compared: Vec<&BoundColumn> = columns
        .iter()
        .filter(|c| !matches!(c.name.as_str(), "id" | "created_at" | "updated_at"))
        .collect();

    let conflict = if compared.is_empty() {
        "DO NOTHING".to_string()
    } else {
        let mut assignments: Vec<String> = compared
            .iter()
            .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(&c.name)))
            .collect();
        if columns.iter().any(|c| c.name == "updated_at") {
            assignments.push("\"updated_at\" = EXCLUDED.\"updated_at\"".to_string());
        }
        let current: Vec<String> = compared.iter().map(|c| comparable("t", c)).collect();
        let incoming: Vec<String> = compared.iter().map(|c| comparable("EXCLUDED", c)).collect();
        format!(
            "DO UPDATE SET {} WHERE ({}) IS DISTINCT FROM ({})",
            assignments.join(", "),
            current.join(", "),
            incoming.join(", ")
        )
    };

    format!(
        "INSERT INTO {} AS t ({}) VALUES ({}) ON CONFLICT (\"id\") {} RETURNING {}",
        quote_ident(table),
        names.join(", "),
        placeholders.join(", "),
        conflict,
        fresh_row_marker(columns)
    )
}

/// Build the entity upsert: insert, or only refresh `updated_at` when the id exists.
///
/// Returns the same fresh-row marker as the event upsert; with `DO NOTHING` an
/// existing id returns no row.
fn build_entity_upsert(table: &str, columns: &[BoundColumn]) -> String {
    let names: Vec<String> = columns.iter().map(|c| quote_ident(&c.name)).collect();
    let placeholders: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| placeholder(i + 1, c))
        .collect();

    let conflict = if columns.iter().any(|c| c.name == "updated_at") {
        "DO UPDATE SET \"updated_at\" = EXCLUDED.\"updated_at\""
    } else {
        "DO NOTHING"
    };

    format!(
        "INSERT INTO {} AS t ({}) VALUES ({}) ON CONFLICT (\"id\") {} RETURNING {}",
        quote_ident(table),
        names.join(", "),
        placeholders.join(", "),
        conflict,
        fresh_row_marker(columns)
    )
}

fn to_params(columns: &[BoundColumn], row: &PreparedRow) -> Vec<Param> {
    columns
        .iter()
        .map(|c| to_param(c.ty, row.values.get(&c.name).unwrap_or(&SqlValue::Null)))
        .collect()
}

/// Convert a coerced value into a typed parameter. `NULL` still needs the column's
/// Rust type so the driver accepts it.
fn to_param(ty: ColumnType, value: &SqlValue) -> Param {
    match value {
        SqlValue::Null => null_param(ty),
        SqlValue::Json(v) => Box::new(v.clone()),
        SqlValue::SmallInt(v) => Box::new(*v),
        SqlValue::Integer(v) => Box::new(*v),
        SqlValue::BigInt(v) => Box::new(*v),
        SqlValue::Numeric(s) | SqlValue::Text(s) => Box::new(s.clone()),
        SqlValue::Boolean(v) => Box::new(*v),
        SqlValue::Real(v) => Box::new(*v),
        SqlValue::Double(v) => Box::new(*v),
        SqlValue::Bytes(v) => Box::new(v.clone()),
        SqlValue::Timestamp(v) => match ty {
            ColumnType::Timestamp => Box::new(v.naive_utc()),
            _ => Box::new(*v),
        },
        SqlValue::TextArray(v) | SqlValue::NumericArray(v) => Box::new(v.clone()),
        SqlValue::SmallIntArray(v) => Box::new(v.clone()),
        SqlValue::IntegerArray(v) => Box::new(v.clone()),
        SqlValue::BigIntArray(v) => Box::new(v.clone()),
    }
}

fn null_param(ty: ColumnType) -> Param {
    match ty {
        ColumnType::Json | ColumnType::Jsonb => Box::new(None::<serde_json::Value>),
        ColumnType::SmallInt => Box::new(None::<i16>),
        ColumnType::Integer => Box::new(None::<i32>),
        ColumnType::BigInt => Box::new(None::<i64>),
        ColumnType::Boolean => Box::new(None::<bool>),
        ColumnType::Real => Box::new(None::<f32>),
        ColumnType::Double => Box::new(None::<f64>),
        ColumnType::Bytea => Box::new(None::<Vec<u8>>),
        ColumnType::Timestamp => Box::new(None::<chrono::NaiveDateTime>),
        ColumnType::TimestampTz => Box::new(None::<chrono::DateTime<chrono::Utc>>),
        ColumnType::TextArray | ColumnType::NumericArray => Box::new(None::<Vec<String>>),
        ColumnType::SmallIntArray => Box::new(None::<Vec<i16>>),
        ColumnType::IntegerArray => Box::new(None::<Vec<i32>>),
        ColumnType::BigIntArray => Box::new(None::<Vec<i64>>),
        ColumnType::Numeric | ColumnType::Text | ColumnType::Other => Box::new(None::<String>),
    }
}

fn statement_timeout_sql(timeout: Duration, local: bool) -> String {
    format!(
        "SET {}statement_timeout = {}",
        if local { "LOCAL " } else { "" },
        timeout.as_millis()
    )
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
