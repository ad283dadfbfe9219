// ABOUTME: Lookup-entity references and the extraction rules that find them in a page
// ABOUTME: Produces deduplicated, deterministically ordered reference sets per entity type

pub mod resolver;

pub use resolver::{
    CompositeKeyHandler, EntityContext, EntityDependencyResolver, EntityHandler, EntityOutcome,
    EntityStats, ForeignKeyHandler, SimpleAddressHandler,
};

use serde::Serialize;
use std::collections::BTreeSet;

use crate::registry::ExtractionRule;
use crate::transform::{EventRecord, FieldValue};

/// Key of one lookup entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(untagged)]
pub enum EntityKey {
    /// Natural key, usually an address.
    Simple(String),
    /// `{parent}-{sub_id}` with its components.
    Composite {
        key: String,
        parent: String,
        sub_id: String,
    },
}

impl EntityKey {
    pub fn composite(parent: &str, sub_id: &str) -> Self {
        EntityKey::Composite {
            key: format!("{}-{}", parent, sub_id),
            parent: parent.to_string(),
            sub_id: sub_id.to_string(),
        }
    }

    /// The value stored in the entity table's `id` column.
    pub fn id(&self) -> &str {
        match self {
            EntityKey::Simple(id) => id,
            EntityKey::Composite { key, .. } => key,
        }
    }
}

/// An entity an event row refers to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct EntityReference {
    pub entity_type: String,
    pub key: EntityKey,
}

/// Run one extraction rule over a transformed page.
///
/// Records whose field is absent, or whose composite parts cannot be derived, are
/// skipped rather than failed.
pub fn extract_references(
    entity_type: &str,
    rule: &ExtractionRule,
    records: &[EventRecord],
) -> BTreeSet<EntityReference> {
    let mut references = BTreeSet::new();
    let mut skipped = 0usize;

    for record in records {
        let Some(source) = record.source() else {
            skipped += 1;
            continue;
        };
        let value = FieldValue::parse(source, rule.field());

        let key = match rule {
            ExtractionRule::Direct { id_field, .. } => value.identity(id_field).map(EntityKey::Simple),
            ExtractionRule::Composite {
                sub_id_field,
                parent_field,
                id_field,
                ..
            } => composite_key(&value, sub_id_field, parent_field.as_deref(), id_field),
        };

        match key {
            Some(key) => {
                references.insert(EntityReference {
                    entity_type: entity_type.to_string(),
                    key,
                });
            }
            None if matches!(value, FieldValue::Missing) => {}
            None => skipped += 1,
        }
    }

    if skipped > 0 {
        tracing::debug!(
            "Skipped {} record(s) with no derivable {} reference from '{}'",
            skipped,
            entity_type,
            rule.field()
        );
    }

    references
}

fn composite_key(
    value: &FieldValue<'_>,
    sub_id_field: &str,
    parent_field: Option<&str>,
    id_field: &str,
) -> Option<EntityKey> {
    if !matches!(value, FieldValue::Object(_)) {
        return None;
    }

    let sub_id = value.sub(sub_id_field).identity("id")?;
    let parent = match parent_field {
        Some(field) => value.sub(field).identity(id_field)?,
        None => {
            let id = value.sub(id_field).identity("id")?;
            let prefix = id.split('-').next().unwrap_or_default();
            if prefix.is_empty() || prefix == id {
                return None;
            }
            prefix.to_string()
        }
    };

    Some(EntityKey::composite(&parent, &sub_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::{json, Value};

    fn records(values: Value) -> Vec<EventRecord> {
        let now = Utc::now();
        values
            .as_array()
            .unwrap()
            .iter()
            .map(|raw| EventRecord {
                id: raw.get("id").and_then(Value::as_str).map(str::to_string),
                position: None,
                columns: Default::default(),
                raw: raw.clone(),
                created_at: now,
                updated_at: now,
            })
            .collect()
    }

    fn direct(field: &str) -> ExtractionRule {
        ExtractionRule::Direct {
            field: field.to_string(),
            id_field: "id".to_string(),
        }
    }

    fn composite(parent_field: Option<&str>) -> ExtractionRule {
        ExtractionRule::Composite {
            field: "operatorSet".to_string(),
            sub_id_field: "operatorSetId".to_string(),
            parent_field: parent_field.map(str::to_string),
            id_field: "id".to_string(),
        }
    }

    #[test]
    fn test_direct_accepts_objects_and_bare_ids() {
        let page = records(json!([
            {"id": "a", "operator": {"id": "0xA"}},
            {"id": "b", "operator": "0xB"},
            {"id": "c", "operator": {"id": "0xA"}},
            {"id": "d", "operator": null},
            {"id": "e", "operator": {"address": "0xC"}}
        ]));
        let refs = extract_references("Operator", &direct("operator"), &page);
        let ids: Vec<&str> = refs.iter().map(|r| r.key.id()).collect();
        assert_eq!(ids, vec!["0xA", "0xB"]);
    }

    #[test]
    fn test_composite_from_id_prefix() {
        let page = records(json!([
            {"id": "a", "operatorSet": {"id": "0xavs-1", "operatorSetId": "1"}},
            {"id": "b", "operatorSet": {"id": "0xavs-2", "operatorSetId": 2}},
            {"id": "c", "operatorSet": {"id": "0xavs-3"}},
            {"id": "d", "operatorSet": {"id": "noprefix", "operatorSetId": "4"}},
            {"id": "e", "operatorSet": "0xavs-5"}
        ]));
        let refs = extract_references("OperatorSet", &composite(None), &page);
        let keys: Vec<EntityKey> = refs.into_iter().map(|r| r.key).collect();
        assert_eq!(
            keys,
            vec![EntityKey::composite("0xavs", "1"), EntityKey::composite("0xavs", "2")]
        );
    }

    #[test]
    fn test_composite_from_parent_field() {
        let page = records(json!([
            {"id": "a", "operatorSet": {"avs": {"id": "0xavs"}, "operatorSetId": "7"}},
            {"id": "b", "operatorSet": {"avs": "0xother", "operatorSetId": "8"}},
            {"id": "c", "operatorSet": {"operatorSetId": "9"}}
        ]));
        let refs = extract_references("OperatorSet", &composite(Some("avs")), &page);
        let ids: Vec<&str> = refs.iter().map(|r| r.key.id()).collect();
        assert_eq!(ids, vec!["0xavs-7", "0xother-8"]);
    }

    #[test]
    fn test_composite_extraction_is_deterministic() {
        let page = records(json!([
            {"id": "b", "operatorSet": {"id": "0xz-2", "operatorSetId": "2"}},
            {"id": "a", "operatorSet": {"id": "0xa-1", "operatorSetId": "1"}},
            {"id": "c", "operatorSet": {"id": "0xz-2", "operatorSetId": "2"}}
        ]));
        let first = extract_references("OperatorSet", &composite(None), &page);
        let mut reversed = page.clone();
        reversed.reverse();
        let second = extract_references("OperatorSet", &composite(None), &reversed);
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }
}
