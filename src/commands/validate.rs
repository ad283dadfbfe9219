// ABOUTME: Validate command - checks configuration, registry and optionally the target schema
// ABOUTME: Reports every missing table or mandatory column before any cycle runs

use anyhow::{bail, Result};

use crate::config::Config;
use crate::registry::Registry;
use crate::store::{EventStore, PostgresStore};
use crate::utils::sanitize_url;

pub async fn validate(config: &Config, check_target: bool) -> Result<()> {
    config.validate()?;
    let registry = super::load_registry(config)?;
    println!(
        "✓ Configuration and registry are valid ({} event types, {} entity types)",
        registry.len(),
        registry.entities().count()
    );

    if !check_target {
        return Ok(());
    }

    let target_url = config.require_target_url()?;
    let store = PostgresStore::connect(
        &target_url,
        config.connect_timeout(),
        config.statement_timeout(),
    )
    .await?;

    let problems = check_tables(&store, &registry).await?;
    if !problems.is_empty() {
        for problem in &problems {
            println!("✗ {}", problem);
        }
        bail!(
            "{} problem(s) found in target {}",
            problems.len(),
            sanitize_url(&target_url)
        );
    }

    println!("✓ Every event and entity table exists in {}", sanitize_url(&target_url));
    Ok(())
}

/// Every table the registry writes must exist with its mandatory columns.
pub async fn check_tables(store: &dyn EventStore, registry: &Registry) -> Result<Vec<String>> {
    let mut problems = Vec::new();

    let event_tables = registry
        .events()
        .map(|d| (d.table_name.as_str(), vec!["id", "block_number"]));
    let entity_tables = registry.entities().map(|e| {
        let mut required = vec!["id"];
        required.extend(e.parent_column.as_deref());
        required.extend(e.sub_id_column.as_deref());
        (e.table.as_str(), required)
    });

    for (table, required) in event_tables.chain(entity_tables) {
        let columns = store.table_columns(table).await?;
        if columns.is_empty() {
            problems.push(format!("table '{}' does not exist", table));
            continue;
        }
        for column in required {
            if !columns.contains_key(column) {
                problems.push(format!("table '{}' has no '{}' column", table, column));
            }
        }
    }
    Ok(problems)
}
