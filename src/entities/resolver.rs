// ABOUTME: Ensures every referenced lookup entity exists before event rows are written
// ABOUTME: Dispatches per entity kind to a registered upsert handler, isolating each type in a savepoint

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use super::{extract_references, EntityKey, EntityReference};
use crate::error::IngestError;
use crate::registry::{EntityKind, EntityTypeDefinition, EventTypeDescriptor, Registry};
use crate::store::coerce::prepare_row;
use crate::store::{EventStore, StoreSession, WriteCounts};
use crate::transform::EventRecord;

const SAVEPOINT: &str = "entity_batch";

/// Rows written for one entity type.
///
/// Write counts include parent rows written by foreign-key handlers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityStats {
    /// Distinct references found in the page.
    pub references: usize,
    pub writes: WriteCounts,
}

impl EntityStats {
    fn new(references: usize, writes: WriteCounts) -> Self {
        Self { references, writes }
    }

    pub fn rows(&self) -> usize {
        self.writes.total()
    }
}

/// Per-entity-type result surfaced in the cycle report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntityOutcome {
    Upserted(EntityStats),
    Failed { reason: String },
}

impl EntityOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, EntityOutcome::Failed { .. })
    }

    /// Fold a later page's outcome into this one. A failure on any page sticks.
    pub fn merge(&mut self, other: EntityOutcome) {
        match (&mut *self, other) {
            (EntityOutcome::Upserted(total), EntityOutcome::Upserted(more)) => {
                total.references += more.references;
                total.writes.add(more.writes);
            }
            (EntityOutcome::Upserted(_), failed @ EntityOutcome::Failed { .. }) => *self = failed,
            (EntityOutcome::Failed { .. }, _) => {}
        }
    }
}

/// What a handler needs besides the session.
pub struct EntityContext<'a> {
    pub store: &'a dyn EventStore,
    pub registry: &'a Registry,
    pub definition: &'a EntityTypeDefinition,
    pub now: DateTime<Utc>,
}

/// Upsert routine for one entity kind.
#[async_trait]
pub trait EntityHandler: Send + Sync {
    fn kind(&self) -> EntityKind;

    async fn upsert(
        &self,
        ctx: &EntityContext<'_>,
        session: &mut dyn StoreSession,
        references: &BTreeSet<EntityReference>,
    ) -> Result<EntityStats>;
}

/// `(id, address)` rows keyed by a bare address.
pub struct SimpleAddressHandler;

#[async_trait]
impl EntityHandler for SimpleAddressHandler {
    fn kind(&self) -> EntityKind {
        EntityKind::SimpleAddress
    }

    async fn upsert(
        &self,
        ctx: &EntityContext<'_>,
        session: &mut dyn StoreSession,
        references: &BTreeSet<EntityReference>,
    ) -> Result<EntityStats> {
        let ids: BTreeSet<&str> = references.iter().map(|r| r.key.id()).collect();
        let writes = write_address_rows(ctx, session, &ctx.definition.table, &ids).await?;
        Ok(EntityStats::new(references.len(), writes))
    }
}

/// `(id, parent, sub_id)` rows keyed by a derived composite key.
pub struct CompositeKeyHandler;

#[async_trait]
impl EntityHandler for CompositeKeyHandler {
    fn kind(&self) -> EntityKind {
        EntityKind::CompositeKey
    }

    async fn upsert(
        &self,
        ctx: &EntityContext<'_>,
        session: &mut dyn StoreSession,
        references: &BTreeSet<EntityReference>,
    ) -> Result<EntityStats> {
        let writes = write_composite_rows(ctx, session, references).await?;
        Ok(EntityStats::new(references.len(), writes))
    }
}

/// Composite rows whose parent lives in another entity table; parents go first.
pub struct ForeignKeyHandler;

#[async_trait]
impl EntityHandler for ForeignKeyHandler {
    fn kind(&self) -> EntityKind {
        EntityKind::ForeignKey
    }

    async fn upsert(
        &self,
        ctx: &EntityContext<'_>,
        session: &mut dyn StoreSession,
        references: &BTreeSet<EntityReference>,
    ) -> Result<EntityStats> {
        let def = ctx.definition;
        let parent_name = def
            .parent_entity
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("entity '{}' has no parent_entity", def.name))?;
        let parent = ctx
            .registry
            .entity(parent_name)
            .ok_or_else(|| anyhow::anyhow!("parent entity '{}' is not registered", parent_name))?;

        let parents: BTreeSet<&str> = references
            .iter()
            .filter_map(|r| match &r.key {
                EntityKey::Composite { parent, .. } => Some(parent.as_str()),
                EntityKey::Simple(_) => None,
            })
            .collect();

        let mut writes = write_address_rows(ctx, session, &parent.table, &parents).await?;
        writes.add(write_composite_rows(ctx, session, references).await?);

        Ok(EntityStats::new(references.len(), writes))
    }
}

async fn write_address_rows(
    ctx: &EntityContext<'_>,
    session: &mut dyn StoreSession,
    table: &str,
    ids: &BTreeSet<&str>,
) -> Result<WriteCounts> {
    let rows = ids
        .iter()
        .map(|id| {
            (
                id.to_string(),
                IndexMap::from([("address".to_string(), Value::String(id.to_string()))]),
            )
        })
        .collect();
    write_rows(ctx, session, table, rows).await
}

async fn write_composite_rows(
    ctx: &EntityContext<'_>,
    session: &mut dyn StoreSession,
    references: &BTreeSet<EntityReference>,
) -> Result<WriteCounts> {
    let def = ctx.definition;
    let (Some(parent_column), Some(sub_id_column)) = (&def.parent_column, &def.sub_id_column) else {
        bail!("entity '{}' has no parent/sub-id columns", def.name);
    };

    let rows = references
        .iter()
        .filter_map(|r| match &r.key {
            EntityKey::Composite {
                key,
                parent,
                sub_id,
            } => Some((
                key.clone(),
                IndexMap::from([
                    (parent_column.clone(), Value::String(parent.clone())),
                    (sub_id_column.clone(), Value::String(sub_id.clone())),
                ]),
            )),
            EntityKey::Simple(id) => {
                tracing::warn!("Ignoring non-composite key {} for entity {}", id, def.name);
                None
            }
        })
        .collect();
    write_rows(ctx, session, &def.table, rows).await
}

async fn write_rows(
    ctx: &EntityContext<'_>,
    session: &mut dyn StoreSession,
    table: &str,
    rows: Vec<(String, IndexMap<String, Value>)>,
) -> Result<WriteCounts> {
    if rows.is_empty() {
        return Ok(WriteCounts::default());
    }

    let schema = ctx.store.table_columns(table).await?;
    if schema.is_empty() {
        bail!("Table '{}' does not exist in the target database", table);
    }

    let prepared = rows
        .iter()
        .map(|(id, columns)| {
            prepare_row(
                table,
                &schema,
                id,
                columns.iter().map(|(k, v)| (k.as_str(), v)),
                ctx.now,
                ctx.now,
            )
        })
        .collect::<Result<Vec<_>>>()?;

    session.upsert_entity_rows(table, &prepared).await
}

/// Registered table of upsert handlers keyed by entity kind.
pub struct EntityDependencyResolver {
    registry: Arc<Registry>,
    handlers: HashMap<EntityKind, Arc<dyn EntityHandler>>,
}

impl EntityDependencyResolver {
    /// Resolver with the built-in handler for every entity kind.
    pub fn new(registry: Arc<Registry>) -> Self {
        let mut resolver = Self {
            registry,
            handlers: HashMap::new(),
        };
        resolver.register(Arc::new(SimpleAddressHandler));
        resolver.register(Arc::new(CompositeKeyHandler));
        resolver.register(Arc::new(ForeignKeyHandler));
        resolver
    }

    /// Register (or replace) the handler for its kind.
    pub fn register(&mut self, handler: Arc<dyn EntityHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    /// Upsert every entity the page references, one savepoint per entity type, and
    /// commit before returning so the entities are durable ahead of the event load.
    ///
    /// A failing entity type is rolled back and reported; it never blocks the others.
    /// Only session-level failures (begin, savepoint bookkeeping, commit) are errors.
    pub async fn resolve(
        &self,
        store: &dyn EventStore,
        descriptor: &EventTypeDescriptor,
        records: &[EventRecord],
        now: DateTime<Utc>,
    ) -> Result<IndexMap<String, EntityOutcome>, IngestError> {
        let mut outcomes = IndexMap::new();
        if descriptor.entity_dependencies.is_empty() || records.is_empty() {
            return Ok(outcomes);
        }

        let mut session = store
            .begin()
            .await
            .map_err(|e| IngestError::store("begin entity session", &e))?;

        for (entity, rule) in descriptor.dependencies() {
            let references = extract_references(entity, rule, records);
            if references.is_empty() {
                outcomes.insert(entity.to_string(), EntityOutcome::Upserted(EntityStats::default()));
                continue;
            }

            let Some(definition) = self.registry.entity(entity) else {
                outcomes.insert(entity.to_string(), failed(entity, "entity type is not registered"));
                continue;
            };
            let Some(handler) = self.handlers.get(&definition.kind) else {
                outcomes.insert(
                    entity.to_string(),
                    failed(entity, format!("no handler registered for kind {:?}", definition.kind)),
                );
                continue;
            };

            let ctx = EntityContext {
                store,
                registry: self.registry.as_ref(),
                definition: definition.as_ref(),
                now,
            };

            session
                .savepoint(SAVEPOINT)
                .await
                .map_err(|e| IngestError::store("entity savepoint", &e))?;

            match handler.upsert(&ctx, &mut *session, &references).await {
                Ok(stats) => {
                    session
                        .release_savepoint(SAVEPOINT)
                        .await
                        .map_err(|e| IngestError::store("entity savepoint", &e))?;
                    tracing::debug!(
                        "Upserted {} {} reference(s) for {}: {} inserted, {} updated, {} skipped",
                        stats.references,
                        entity,
                        descriptor.graphql_name,
                        stats.writes.inserted,
                        stats.writes.updated,
                        stats.writes.skipped
                    );
                    outcomes.insert(entity.to_string(), EntityOutcome::Upserted(stats));
                }
                Err(e) => {
                    tracing::warn!(
                        "Entity upsert for {} failed while syncing {}: {:?}",
                        entity,
                        descriptor.graphql_name,
                        e
                    );
                    session
                        .rollback_to_savepoint(SAVEPOINT)
                        .await
                        .map_err(|e| IngestError::store("entity rollback", &e))?;
                    session
                        .release_savepoint(SAVEPOINT)
                        .await
                        .map_err(|e| IngestError::store("entity savepoint", &e))?;
                    outcomes.insert(entity.to_string(), failed(entity, format!("{:#}", e)));
                }
            }
        }

        session
            .commit()
            .await
            .map_err(|e| IngestError::store("commit entities", &e))?;

        Ok(outcomes)
    }
}

fn failed(entity: &str, reason: impl Into<String>) -> EntityOutcome {
    EntityOutcome::Failed {
        reason: IngestError::EntityResolution {
            entity_type: entity.to_string(),
            reason: reason.into(),
        }
        .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ColumnType, MemoryStore, SqlValue};
    use serde_json::json;

    const REGISTRY: &str = r#"
        [entities.Operator]
        table = "operators"
        kind = "simple_address"

        [entities.AVS]
        table = "avs"
        kind = "simple_address"

        [entities.OperatorSet]
        table = "operator_sets"
        kind = "foreign_key"
        parent_entity = "AVS"
        parent_column = "avs_id"
        sub_id_column = "operator_set_id"

        [events.allocationEvents]
        table_name = "allocation_events"
        group_name = "allocation_manager_events"
        fields = ["id", "logIndex", "blockNumber", "operator", "operatorSet"]
        nested_fields = { operator = ["id"], operatorSet = ["id", "operatorSetId"] }
        entity_dependencies = ["Operator", "OperatorSet"]
        column_mapping = { logIndex = "log_index", blockNumber = "block_number" }

        [events.allocationEvents.entity_extractors.Operator]
        rule = "direct"
        field = "operator"

        [events.allocationEvents.entity_extractors.OperatorSet]
        rule = "composite"
        field = "operatorSet"
        sub_id_field = "operatorSetId"
    "#;

    fn lookup_columns(extra: &[(&'static str, ColumnType)]) -> Vec<(&'static str, ColumnType)> {
        let mut columns = vec![("id", ColumnType::Text)];
        columns.extend_from_slice(extra);
        columns.push(("created_at", ColumnType::TimestampTz));
        columns.push(("updated_at", ColumnType::TimestampTz));
        columns
    }

    fn store() -> MemoryStore {
        MemoryStore::new()
            .with_table("operators", &lookup_columns(&[("address", ColumnType::Text)]))
            .with_table("avs", &lookup_columns(&[("address", ColumnType::Text)]))
            .with_table(
                "operator_sets",
                &lookup_columns(&[
                    ("avs_id", ColumnType::Text),
                    ("operator_set_id", ColumnType::BigInt),
                ]),
            )
    }

    fn stats(references: usize, (inserted, updated): (usize, usize)) -> EntityStats {
        EntityStats {
            references,
            writes: WriteCounts {
                inserted,
                updated,
                skipped: 0,
            },
        }
    }

    fn page() -> Vec<EventRecord> {
        let now = Utc::now();
        [
            json!({"id": "t-0", "operator": {"id": "0xop"}, "operatorSet": {"id": "0xavs-1", "operatorSetId": "1"}}),
            json!({"id": "t-1", "operator": "0xop2", "operatorSet": {"id": "0xavs-1", "operatorSetId": "1"}}),
        ]
        .into_iter()
        .map(|raw| EventRecord {
            id: raw["id"].as_str().map(str::to_string),
            position: None,
            columns: IndexMap::new(),
            raw,
            created_at: now,
            updated_at: now,
        })
        .collect()
    }

    #[tokio::test]
    async fn test_resolve_writes_parents_before_composites() {
        let registry = Arc::new(Registry::from_toml_str(REGISTRY).unwrap());
        registry.validate().unwrap();
        let descriptor = registry.get("allocationEvents").unwrap().clone();
        let store = store();
        let resolver = EntityDependencyResolver::new(registry);

        let outcomes = resolver
            .resolve(&store, &descriptor, &page(), Utc::now())
            .await
            .unwrap();

        assert_eq!(outcomes["Operator"], EntityOutcome::Upserted(stats(2, (2, 0))));
        // One AVS parent plus one operator set
        assert_eq!(outcomes["OperatorSet"], EntityOutcome::Upserted(stats(1, (2, 0))));
        assert_eq!(store.ids("operators"), vec!["0xop", "0xop2"]);
        assert_eq!(store.ids("avs"), vec!["0xavs"]);
        let set = store.row("operator_sets", "0xavs-1").unwrap();
        assert_eq!(set["avs_id"], SqlValue::Text("0xavs".to_string()));
        assert_eq!(set["operator_set_id"], SqlValue::BigInt(1));
    }

    #[tokio::test]
    async fn test_failing_entity_type_is_isolated() {
        let registry = Arc::new(Registry::from_toml_str(REGISTRY).unwrap());
        let descriptor = registry.get("allocationEvents").unwrap().clone();
        let store = store();
        store.fail_writes_to("avs");
        let resolver = EntityDependencyResolver::new(registry);

        let outcomes = resolver
            .resolve(&store, &descriptor, &page(), Utc::now())
            .await
            .unwrap();

        assert!(!outcomes["Operator"].is_failed());
        assert!(outcomes["OperatorSet"].is_failed());
        assert_eq!(store.row_count("operators"), 2);
        assert_eq!(store.row_count("operator_sets"), 0);
    }

    #[tokio::test]
    async fn test_existing_entity_is_only_touched() {
        let registry = Arc::new(Registry::from_toml_str(REGISTRY).unwrap());
        let descriptor = registry.get("allocationEvents").unwrap().clone();
        let store = store();
        let resolver = EntityDependencyResolver::new(registry);

        let first = Utc::now();
        resolver.resolve(&store, &descriptor, &page(), first).await.unwrap();
        let later = first + chrono::Duration::seconds(60);
        let outcomes = resolver.resolve(&store, &descriptor, &page(), later).await.unwrap();

        let row = store.row("operators", "0xop").unwrap();
        assert_eq!(row["created_at"], SqlValue::Timestamp(first));
        assert_eq!(row["updated_at"], SqlValue::Timestamp(later));

        assert_eq!(outcomes["Operator"], EntityOutcome::Upserted(stats(2, (0, 2))));
        assert_eq!(outcomes["OperatorSet"], EntityOutcome::Upserted(stats(1, (0, 2))));
    }

    #[test]
    fn test_merge_sums_write_counts() {
        let mut total = EntityOutcome::Upserted(stats(2, (2, 0)));
        total.merge(EntityOutcome::Upserted(stats(1, (0, 1))));
        assert_eq!(total, EntityOutcome::Upserted(stats(3, (2, 1))));
        let EntityOutcome::Upserted(summed) = &total else {
            unreachable!()
        };
        assert_eq!(summed.rows(), 3);

        total.merge(EntityOutcome::Failed {
            reason: "boom".to_string(),
        });
        total.merge(EntityOutcome::Upserted(stats(1, (1, 0))));
        assert!(total.is_failed());
    }
}
