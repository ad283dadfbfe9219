// ABOUTME: Integration tests for registry loading, selection and validation
// ABOUTME: Exercises the embedded registry and registries loaded from disk

use subgraph_replicator::registry::{EntityKind, ExtractionRule, Registry};
use subgraph_replicator::IngestError;
use tempfile::tempdir;

const MINIMAL: &str = r#"
[entities.Operator]
table = "operators"
kind = "simple_address"

[events.operatorRegistereds]
table_name = "operator_registered_events"
group_name = "delegation_manager_events"
fields = ["id", "blockNumber", "logIndex", "operator"]
entity_dependencies = ["Operator"]
column_mapping = { blockNumber = "block_number", logIndex = "log_index" }

[events.operatorRegistereds.entity_extractors.Operator]
rule = "direct"
field = "operator"
"#;

#[test]
fn test_builtin_registry_covers_core_events() {
    let registry = Registry::builtin().unwrap();

    for name in [
        "operatorRegistereds",
        "operatorAVSRegistrationStatusUpdateds",
        "allocationDelaySets",
        "allocationEvents",
        "operatorAddedToOperatorSets",
        "deposits",
    ] {
        assert!(registry.get(name).is_some(), "missing {}", name);
    }

    let operator_set = registry.entity("OperatorSet").unwrap();
    assert_eq!(operator_set.kind, EntityKind::ForeignKey);
    assert_eq!(operator_set.parent_entity.as_deref(), Some("AVS"));

    let allocation = registry.get("allocationEvents").unwrap();
    assert!(matches!(
        allocation.entity_extractors.get("OperatorSet"),
        Some(ExtractionRule::Composite { .. })
    ));
}

#[test]
fn test_every_group_selects_its_events() {
    let registry = Registry::builtin().unwrap();
    let mut total = 0;
    for group in registry.groups() {
        let selected = registry.select(&[], Some(group)).unwrap();
        assert!(!selected.is_empty());
        assert!(selected.iter().all(|d| d.group_name == group));
        total += selected.len();
    }
    assert_eq!(total, registry.len());
}

#[test]
fn test_select_unknown_names_is_fatal() {
    let registry = Registry::builtin().unwrap();
    let err = registry.select(&["nope".to_string()], None).unwrap_err();
    assert!(matches!(err, IngestError::FatalConfig(_)));
    assert!(matches!(
        registry.select(&[], Some("no_such_group")),
        Err(IngestError::FatalConfig(_))
    ));
}

#[test]
fn test_load_from_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("registry.toml");
    std::fs::write(&path, MINIMAL).unwrap();

    let registry = Registry::load(&path).unwrap();
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.groups(), vec!["delegation_manager_events"]);

    let same = Registry::load_or_builtin(Some(&path)).unwrap();
    assert_eq!(same.fingerprint(), registry.fingerprint());
    assert_ne!(registry.fingerprint(), Registry::builtin().unwrap().fingerprint());
}

#[test]
fn test_load_rejects_inconsistent_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("registry.toml");
    // Depends on Operator without declaring the entity type
    let broken = MINIMAL.replace("[entities.Operator]\ntable = \"operators\"\nkind = \"simple_address\"\n", "");
    std::fs::write(&path, broken).unwrap();

    let err = Registry::load(&path).unwrap_err();
    assert!(format!("{:#}", err).contains("unknown entity type 'Operator'"));
}

#[test]
fn test_load_reports_missing_file() {
    let dir = tempdir().unwrap();
    let err = Registry::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(err.to_string().contains("Failed to read registry"));
}
