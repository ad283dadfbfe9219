// ABOUTME: Descriptor registry - the data table that drives every ingestion cycle
// ABOUTME: Loads event and entity definitions from TOML and validates them at startup

pub mod descriptor;

pub use descriptor::{
    EntityKind, EntityTypeDefinition, EventTypeDescriptor, ExtractionRule, IdentityRule,
    BLOCK_FIELD, ID_FIELD, LOG_FIELD, RESERVED_COLUMNS,
};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use crate::error::IngestError;
use crate::utils::validate_postgres_identifier;

/// Registry shipped with the binary, covering the core restaking-protocol events.
const BUILTIN_REGISTRY: &str = include_str!("../../config/registry.toml");

#[derive(Debug, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    entities: IndexMap<String, EntityTypeDefinition>,
    #[serde(default)]
    events: IndexMap<String, EventTypeDescriptor>,
}

/// Process-wide, read-only mapping of event type name to descriptor.
#[derive(Debug, Clone)]
pub struct Registry {
    events: IndexMap<String, Arc<EventTypeDescriptor>>,
    entities: IndexMap<String, Arc<EntityTypeDefinition>>,
}

impl Registry {
    /// Parse a registry document. Does not validate; call [`Registry::validate`].
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let document: RegistryDocument =
            toml::from_str(contents).context("Failed to parse registry document")?;

        let entities = document
            .entities
            .into_iter()
            .map(|(name, mut def)| {
                def.name = name.clone();
                (name, Arc::new(def))
            })
            .collect();
        let events = document
            .events
            .into_iter()
            .map(|(name, mut descriptor)| {
                descriptor.graphql_name = name.clone();
                (name, Arc::new(descriptor))
            })
            .collect();

        Ok(Self { events, entities })
    }

    /// Load and validate a registry from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read registry from {:?}", path))?;
        let registry = Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to load registry from {:?}", path))?;
        registry.validate()?;
        Ok(registry)
    }

    /// The embedded default registry, validated.
    pub fn builtin() -> Result<Self> {
        let registry = Self::from_toml_str(BUILTIN_REGISTRY)?;
        registry.validate()?;
        Ok(registry)
    }

    /// Load from `path` when given, otherwise fall back to the embedded registry.
    pub fn load_or_builtin(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Self::builtin(),
        }
    }

    pub fn get(&self, graphql_name: &str) -> Option<&Arc<EventTypeDescriptor>> {
        self.events.get(graphql_name)
    }

    pub fn entity(&self, name: &str) -> Option<&Arc<EntityTypeDefinition>> {
        self.entities.get(name)
    }

    pub fn events(&self) -> impl Iterator<Item = &Arc<EventTypeDescriptor>> {
        self.events.values()
    }

    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntityTypeDefinition>> {
        self.entities.values()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Distinct group tags in declaration order.
    pub fn groups(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.events
            .values()
            .map(|d| d.group_name.as_str())
            .filter(|g| seen.insert(*g))
            .collect()
    }

    /// Select descriptors by name and/or group. Empty `names` and no group selects everything.
    pub fn select(
        &self,
        names: &[String],
        group: Option<&str>,
    ) -> Result<Vec<Arc<EventTypeDescriptor>>, IngestError> {
        for name in names {
            if !self.events.contains_key(name) {
                return Err(IngestError::FatalConfig(format!(
                    "unknown event type '{}'",
                    name
                )));
            }
        }
        if let Some(group) = group {
            if !self.events.values().any(|d| d.group_name == group) {
                return Err(IngestError::FatalConfig(format!("unknown group '{}'", group)));
            }
        }

        Ok(self
            .events
            .values()
            .filter(|d| names.is_empty() || names.contains(&d.graphql_name))
            .filter(|d| group.map_or(true, |g| d.group_name == g))
            .cloned()
            .collect())
    }

    /// Stable digest of the registry contents, recorded in the sync journal.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, def) in &self.entities {
            hasher.update(name.as_bytes());
            hasher.update(serde_json::to_vec(def.as_ref()).unwrap_or_default());
        }
        for (name, descriptor) in &self.events {
            hasher.update(name.as_bytes());
            hasher.update(serde_json::to_vec(descriptor.as_ref()).unwrap_or_default());
        }
        format!("{:x}", hasher.finalize())
    }

    /// Check registry consistency. Every problem found here is fatal at startup so that
    /// no inconsistency can surface as a per-row failure later.
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.events.is_empty() {
            return Err(fatal("registry defines no event types"));
        }

        for def in self.entities.values() {
            self.validate_entity(def)?;
        }

        let mut tables: HashSet<&str> = HashSet::new();
        for descriptor in self.events.values() {
            if !tables.insert(descriptor.table_name.as_str()) {
                return Err(fatal(format!(
                    "table '{}' is targeted by more than one event type",
                    descriptor.table_name
                )));
            }
            self.validate_descriptor(descriptor)?;
        }

        Ok(())
    }

    fn validate_entity(&self, def: &EntityTypeDefinition) -> Result<(), IngestError> {
        identifier(&def.table, &format!("entity '{}' table", def.name))?;

        if def.kind.is_composite() {
            for (label, column) in [
                ("parent_column", &def.parent_column),
                ("sub_id_column", &def.sub_id_column),
            ] {
                let column = column.as_deref().ok_or_else(|| {
                    fatal(format!("composite entity '{}' requires {}", def.name, label))
                })?;
                identifier(column, &format!("entity '{}' {}", def.name, label))?;
            }
        }

        if def.kind == EntityKind::ForeignKey {
            let parent = def.parent_entity.as_deref().ok_or_else(|| {
                fatal(format!(
                    "foreign-key entity '{}' requires parent_entity",
                    def.name
                ))
            })?;
            match self.entities.get(parent) {
                Some(p) if p.kind == EntityKind::SimpleAddress => {}
                Some(_) => {
                    return Err(fatal(format!(
                        "parent '{}' of entity '{}' must be a simple_address entity",
                        parent, def.name
                    )))
                }
                None => {
                    return Err(fatal(format!(
                        "entity '{}' references unknown parent entity '{}'",
                        def.name, parent
                    )))
                }
            }
        }

        Ok(())
    }

    fn validate_descriptor(&self, d: &EventTypeDescriptor) -> Result<(), IngestError> {
        let name = &d.graphql_name;
        identifier(&d.table_name, &format!("event '{}' table", name))?;

        let fields: HashSet<&str> = d.fields.iter().map(String::as_str).collect();
        for required in std::iter::once(BLOCK_FIELD).chain(d.identity.source_fields()) {
            if !fields.contains(required) {
                return Err(fatal(format!(
                    "event '{}' must fetch field '{}'",
                    name, required
                )));
            }
        }
        if d.column_mapping.get(BLOCK_FIELD).map(String::as_str) != Some("block_number") {
            return Err(fatal(format!(
                "event '{}' must map '{}' to column 'block_number'",
                name, BLOCK_FIELD
            )));
        }
        if let Some(column) = d.column_mapping.get(LOG_FIELD) {
            if column != "log_index" {
                return Err(fatal(format!(
                    "event '{}' must map '{}' to column 'log_index', not '{}'",
                    name, LOG_FIELD, column
                )));
            }
        }

        for parent in d.nested_fields.keys() {
            if !fields.contains(parent.as_str()) {
                return Err(fatal(format!(
                    "event '{}' declares nested field '{}' that it does not fetch",
                    name, parent
                )));
            }
        }

        let mut columns: HashSet<&str> = HashSet::new();
        for column in d.column_mapping.values() {
            identifier(column, &format!("event '{}' column", name))?;
            if RESERVED_COLUMNS.contains(&column.as_str()) {
                return Err(fatal(format!(
                    "event '{}' maps a field onto reserved column '{}'",
                    name, column
                )));
            }
            if !columns.insert(column.as_str()) {
                return Err(fatal(format!(
                    "event '{}' maps more than one field onto column '{}'",
                    name, column
                )));
            }
        }

        for entity in &d.entity_dependencies {
            let def = self.entities.get(entity).ok_or_else(|| {
                fatal(format!(
                    "event '{}' depends on unknown entity type '{}'",
                    name, entity
                ))
            })?;
            let rule = d.entity_extractors.get(entity).ok_or_else(|| {
                fatal(format!(
                    "event '{}' has no extraction rule for entity type '{}'",
                    name, entity
                ))
            })?;
            if !fields.contains(rule.field()) {
                return Err(fatal(format!(
                    "extraction rule for '{}' in event '{}' reads unfetched field '{}'",
                    entity,
                    name,
                    rule.field()
                )));
            }
            if rule.is_composite() != def.kind.is_composite() {
                return Err(fatal(format!(
                    "extraction rule for '{}' in event '{}' does not match entity kind {:?}",
                    entity, name, def.kind
                )));
            }
        }

        for entity in d.entity_extractors.keys() {
            if !d.entity_dependencies.contains(entity) {
                tracing::warn!(
                    "Event '{}' defines an extraction rule for '{}' but does not depend on it",
                    name,
                    entity
                );
            }
        }

        Ok(())
    }
}

fn fatal(message: impl Into<String>) -> IngestError {
    IngestError::FatalConfig(message.into())
}

fn identifier(value: &str, label: &str) -> Result<(), IngestError> {
    validate_postgres_identifier(value).map_err(|e| fatal(format!("{}: {}", label, e)))
}
