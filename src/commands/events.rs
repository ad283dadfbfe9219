// ABOUTME: Events command - lists the event types in the registry
// ABOUTME: Optionally filtered by group

use anyhow::Result;

use crate::config::Config;

pub fn events(config: &Config, group: Option<&str>) -> Result<()> {
    let registry = super::load_registry(config)?;
    let descriptors = registry.select(&[], group)?;

    println!(
        "{:<40} {:<45} {:<28} ENTITIES",
        "EVENT TYPE", "TABLE", "GROUP"
    );
    for d in &descriptors {
        println!(
            "{:<40} {:<45} {:<28} {}",
            d.graphql_name,
            d.table_name,
            d.group_name,
            d.entity_dependencies.join(", ")
        );
    }
    println!();
    println!(
        "{} event type(s) in {} group(s)",
        descriptors.len(),
        registry.groups().len()
    );
    Ok(())
}
