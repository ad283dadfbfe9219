// ABOUTME: Normalizes fetched pages into flat, schema-ready event records
// ABOUTME: Flattens nested objects, renames columns, keeps the raw payload and stamps times

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::cursor::Cursor;
use crate::error::IngestError;
use crate::registry::{EventTypeDescriptor, IdentityRule, BLOCK_FIELD, LOG_FIELD};

/// A source field, classified once at the boundary.
///
/// Downstream code matches on this instead of re-inspecting JSON shapes. `null`
/// is treated the same as an absent field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue<'a> {
    Scalar(&'a Value),
    Object(&'a Map<String, Value>),
    Missing,
}

impl<'a> FieldValue<'a> {
    pub fn parse(record: &'a Map<String, Value>, field: &str) -> Self {
        Self::from_value(record.get(field))
    }

    pub fn from_value(value: Option<&'a Value>) -> Self {
        match value {
            None | Some(Value::Null) => FieldValue::Missing,
            Some(Value::Object(map)) => FieldValue::Object(map),
            Some(other) => FieldValue::Scalar(other),
        }
    }

    /// Identity carried by this field: a bare string/number, or `object[id_field]`.
    pub fn identity(&self, id_field: &str) -> Option<String> {
        match self {
            FieldValue::Scalar(v) => scalar_identity(v),
            FieldValue::Object(map) => map.get(id_field).and_then(scalar_identity),
            FieldValue::Missing => None,
        }
    }

    /// Sub-field of an object, classified in turn.
    pub fn sub(&self, name: &str) -> FieldValue<'a> {
        match self {
            FieldValue::Object(map) => FieldValue::from_value(map.get(name)),
            _ => FieldValue::Missing,
        }
    }

    /// Owned JSON for persisting; `Missing` becomes `null`.
    pub fn to_value(&self) -> Value {
        match self {
            FieldValue::Scalar(v) => (*v).clone(),
            FieldValue::Object(map) => Value::Object((*map).clone()),
            FieldValue::Missing => Value::Null,
        }
    }
}

fn scalar_identity(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// One transformed row.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    /// Natural identity; `None` when the identity rule could not derive one.
    pub id: Option<String>,
    pub position: Option<Cursor>,
    /// Target column to value, in descriptor field order. Excludes `id`.
    pub columns: IndexMap<String, Value>,
    /// The fetched record, verbatim.
    pub raw: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EventRecord {
    /// The original record as an object.
    pub fn source(&self) -> Option<&Map<String, Value>> {
        self.raw.as_object()
    }
}

/// Pure page-to-rows normalization for one descriptor.
pub struct RecordTransformer<'a> {
    descriptor: &'a EventTypeDescriptor,
}

impl<'a> RecordTransformer<'a> {
    pub fn new(descriptor: &'a EventTypeDescriptor) -> Self {
        Self { descriptor }
    }

    /// Transform a page. Every row of the page shares one `now`, so fresh rows have
    /// `created_at == updated_at`. Never fails: malformed fields project to `null`.
    pub fn transform_page(&self, page: &[Map<String, Value>], now: DateTime<Utc>) -> Vec<EventRecord> {
        page.iter().map(|record| self.transform(record, now)).collect()
    }

    fn transform(&self, record: &Map<String, Value>, now: DateTime<Utc>) -> EventRecord {
        let d = self.descriptor;
        let id = self.identity(record);
        let mut columns = IndexMap::new();

        for field in &d.fields {
            let value = FieldValue::parse(record, field);

            if let Some(column) = d.target_column(field, None) {
                columns.insert(column.to_string(), value.to_value());
            }

            let Some(subs) = d.nested_fields.get(field) else {
                continue;
            };
            if let FieldValue::Scalar(v) = value {
                let err = IngestError::MalformedRecord {
                    record: id.clone().unwrap_or_else(|| "<no id>".to_string()),
                    field: field.clone(),
                    reason: format!("expected an object, got {}", v),
                };
                tracing::debug!("{}; projecting nulls", err);
            }
            for sub in subs {
                if let Some(column) = d.target_column(field, Some(sub)) {
                    columns.insert(column.to_string(), value.sub(sub).to_value());
                }
            }
        }

        EventRecord {
            position: Cursor::from_values(record.get(BLOCK_FIELD), record.get(LOG_FIELD)),
            id,
            columns,
            raw: Value::Object(record.clone()),
            created_at: now,
            updated_at: now,
        }
    }

    fn identity(&self, record: &Map<String, Value>) -> Option<String> {
        match &self.descriptor.identity {
            IdentityRule::Field { field } => FieldValue::parse(record, field).identity("id"),
            IdentityRule::TransactionLog {
                transaction_field,
                log_field,
            } => {
                let tx = FieldValue::parse(record, transaction_field).identity("id")?;
                let log = FieldValue::parse(record, log_field).identity("id")?;
                Some(format!("{}-{}", tx, log))
            }
        }
    }
}
