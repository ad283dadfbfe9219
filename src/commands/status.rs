// ABOUTME: Status command - prints the sync journal
// ABOUTME: Warns when the registry changed since the journal was written

use anyhow::{Context, Result};

use crate::config::Config;
use crate::sync::cycle::display_cursor;
use crate::sync::SyncState;

pub async fn status(config: &Config, json: bool) -> Result<()> {
    let path = config.state_path();
    if !path.exists() {
        println!("No sync journal at {:?}. Run `subgraph-replicator sync` first.", path);
        return Ok(());
    }

    let state = SyncState::load(&path).await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&state).context("Failed to serialize sync state")?
        );
        return Ok(());
    }

    match super::load_registry(config) {
        Ok(registry) if state.registry_changed(&registry.fingerprint()) => {
            tracing::warn!(
                "The registry changed since the last recorded sync; reports below may describe old descriptors"
            );
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("Could not load registry to compare fingerprints: {:#}", e),
    }

    println!("Endpoint: {}", state.endpoint);
    println!("Target:   {}", state.target_url);
    println!("Updated:  {}", state.updated_at.to_rfc3339());
    println!();
    println!(
        "{:<40} {:<12} {:<16} {:>8} {:>8} {:>8} {:>8}  LAST SUCCESS",
        "EVENT TYPE", "STATUS", "CURSOR", "FETCHED", "INSERTED", "UPDATED", "ERRORED"
    );

    for entry in state.events.values() {
        let r = &entry.last_report;
        let status = serde_json::to_value(r.status)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        println!(
            "{:<40} {:<12} {:<16} {:>8} {:>8} {:>8} {:>8}  {}",
            entry.event_type,
            status,
            display_cursor(entry.last_cursor),
            r.fetched,
            r.inserted,
            r.updated,
            r.errored,
            entry
                .last_success_at
                .map_or_else(|| "never".to_string(), |t| t.to_rfc3339())
        );
        if let Some(error) = &r.error {
            println!("    last error ({} consecutive): {}", entry.consecutive_failures, error);
        }
        let failed = r.failed_entities();
        if !failed.is_empty() {
            println!("    entity upserts failed: {}", failed.join(", "));
        }
    }
    Ok(())
}
