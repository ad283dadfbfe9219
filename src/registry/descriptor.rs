// ABOUTME: Typed event-type descriptors and entity-type definitions
// ABOUTME: Pure data deserialized from the registry document; never mutated after load

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Source field carrying the block number of every event.
pub const BLOCK_FIELD: &str = "blockNumber";
/// Source field carrying the log index of every event.
pub const LOG_FIELD: &str = "logIndex";
/// Entity id the source keys and sorts every record by.
pub const ID_FIELD: &str = "id";

/// Columns the engine writes itself; descriptors may not map source fields onto them.
pub const RESERVED_COLUMNS: &[&str] = &["id", "raw_data", "created_at", "updated_at"];

/// How a record's natural identity is derived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IdentityRule {
    /// Take the identity verbatim from one field.
    Field {
        #[serde(default = "default_id_field")]
        field: String,
    },
    /// Derive `{transactionHash}-{logIndex}` from the log position.
    TransactionLog {
        #[serde(default = "default_tx_field")]
        transaction_field: String,
        #[serde(default = "default_log_field")]
        log_field: String,
    },
}

impl Default for IdentityRule {
    fn default() -> Self {
        IdentityRule::Field {
            field: default_id_field(),
        }
    }
}

impl IdentityRule {
    /// Source fields the rule reads.
    pub fn source_fields(&self) -> Vec<&str> {
        match self {
            IdentityRule::Field { field } => vec![field.as_str()],
            IdentityRule::TransactionLog {
                transaction_field,
                log_field,
            } => vec![transaction_field.as_str(), log_field.as_str()],
        }
    }
}

/// Closed set of lookup-entity shapes. Selects the upsert handler at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Keyed by a bare address; row is `(id, address)`.
    SimpleAddress,
    /// Keyed by `{parent}-{sub}`; row is `(id, parent, sub)`.
    CompositeKey,
    /// Composite key whose parent must exist in another entity table first.
    ForeignKey,
}

impl EntityKind {
    pub fn is_composite(&self) -> bool {
        matches!(self, EntityKind::CompositeKey | EntityKind::ForeignKey)
    }
}

/// A lookup-entity type such as `Operator` or `OperatorSet`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityTypeDefinition {
    /// Entity tag; filled in from the registry key.
    #[serde(skip_deserializing, default)]
    pub name: String,
    pub table: String,
    pub kind: EntityKind,
    /// Column holding the parent component of a composite key.
    #[serde(default)]
    pub parent_column: Option<String>,
    /// Column holding the sub-id component of a composite key.
    #[serde(default)]
    pub sub_id_column: Option<String>,
    /// Entity tag of the parent (foreign-key kind only).
    #[serde(default)]
    pub parent_entity: Option<String>,
}

/// Rule that pulls entity references out of a page of records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ExtractionRule {
    /// The field holds either a bare identifier or an object with an identity field.
    Direct {
        field: String,
        #[serde(default = "default_id_field")]
        id_field: String,
    },
    /// The field holds an object from which a `{parent}-{sub}` key is derived.
    Composite {
        field: String,
        sub_id_field: String,
        /// Sub-field naming the parent; when absent the prefix of the object id is used.
        #[serde(default)]
        parent_field: Option<String>,
        #[serde(default = "default_id_field")]
        id_field: String,
    },
}

impl ExtractionRule {
    pub fn field(&self) -> &str {
        match self {
            ExtractionRule::Direct { field, .. } | ExtractionRule::Composite { field, .. } => field,
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, ExtractionRule::Composite { .. })
    }
}

/// Static description of one event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTypeDescriptor {
    /// GraphQL list field, e.g. `allocationEvents`; filled in from the registry key.
    #[serde(skip_deserializing, default)]
    pub graphql_name: String,
    pub table_name: String,
    pub fields: Vec<String>,
    #[serde(default)]
    pub nested_fields: IndexMap<String, Vec<String>>,
    #[serde(default)]
    pub column_mapping: IndexMap<String, String>,
    #[serde(default)]
    pub identity: IdentityRule,
    #[serde(default)]
    pub entity_dependencies: Vec<String>,
    #[serde(default)]
    pub entity_extractors: IndexMap<String, ExtractionRule>,
    pub group_name: String,
    #[serde(default)]
    pub contract_source: Option<String>,
}

impl EventTypeDescriptor {
    /// Target column for a source field, if the descriptor persists it.
    ///
    /// Flattened nested fields may be mapped as either `parent.sub` or `parent_sub`.
    pub fn target_column(&self, parent: &str, sub: Option<&str>) -> Option<&str> {
        match sub {
            None => self.column_mapping.get(parent).map(String::as_str),
            Some(sub) => self
                .column_mapping
                .get(&format!("{}.{}", parent, sub))
                .or_else(|| self.column_mapping.get(&format!("{}_{}", parent, sub)))
                .map(String::as_str),
        }
    }

    /// Whether the descriptor fetches a log index for its records.
    pub fn has_log_index(&self) -> bool {
        self.fields.iter().any(|f| f == LOG_FIELD)
    }

    /// Entity dependencies paired with their extraction rules, in declaration order.
    ///
    /// Dependencies without a rule are skipped; `Registry::validate` rejects them at startup.
    pub fn dependencies(&self) -> impl Iterator<Item = (&str, &ExtractionRule)> {
        self.entity_dependencies
            .iter()
            .filter_map(|entity| {
                self.entity_extractors
                    .get(entity)
                    .map(|rule| (entity.as_str(), rule))
            })
    }
}

fn default_id_field() -> String {
    "id".to_string()
}

fn default_tx_field() -> String {
    "transactionHash".to_string()
}

fn default_log_field() -> String {
    LOG_FIELD.to_string()
}
