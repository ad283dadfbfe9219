// ABOUTME: Sync command - runs ingestion cycles once or as an interval daemon
// ABOUTME: Wires the GraphQL source and PostgreSQL store into the cycle runner

use anyhow::{bail, Context, Result};
use std::sync::Arc;

use crate::config::Config;
use crate::source::GraphqlSource;
use crate::store::PostgresStore;
use crate::sync::{CycleRunner, DaemonConfig, PassStats, SyncDaemon};
use crate::utils::sanitize_url;

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Event types to sync; empty means every event type in the registry
    pub events: Vec<String>,
    pub group: Option<String>,
    /// Run one pass and print the reports instead of starting the daemon
    pub once: bool,
}

pub async fn sync(config: &Config, options: SyncOptions) -> Result<()> {
    config.validate()?;
    let registry = Arc::new(super::load_registry(config)?);
    let descriptors = registry.select(&options.events, options.group.as_deref())?;
    if descriptors.is_empty() {
        bail!("No event types selected");
    }

    let endpoint = config.require_endpoint()?;
    let target_url = config.require_target_url()?;
    let api_key = config.api_key();
    if api_key.is_none() {
        tracing::warn!("No subgraph API key configured; sending unauthenticated requests");
    }

    let source = GraphqlSource::new(endpoint, api_key, config.source_timeout())?;
    let store = PostgresStore::connect(
        &target_url,
        config.connect_timeout(),
        config.statement_timeout(),
    )
    .await
    .with_context(|| format!("Failed to open target {}", sanitize_url(&target_url)))?;

    tracing::info!(
        "Syncing {} event type(s) into {}",
        descriptors.len(),
        sanitize_url(&target_url)
    );

    let runner = CycleRunner::new(
        registry.clone(),
        Arc::new(source),
        Arc::new(store),
        config.cycle_settings(),
    );
    let daemon = SyncDaemon::new(
        runner,
        descriptors,
        DaemonConfig {
            sync_interval: config.sync_interval(),
            state_path: config.state_path(),
            endpoint: endpoint.to_string(),
            target_url: target_url.clone(),
            registry_fingerprint: registry.fingerprint(),
        },
    );

    if options.once {
        let reports = daemon.run_pass().await;
        println!(
            "{}",
            serde_json::to_string_pretty(&reports).context("Failed to serialize cycle reports")?
        );

        let stats = PassStats::from_reports(&reports);
        if !stats.is_success() {
            bail!(
                "{} of {} event type(s) failed; see the reports above",
                stats.failed,
                stats.event_types
            );
        }
        return Ok(());
    }

    tracing::info!("Starting continuous sync daemon...");
    tracing::info!("Press Ctrl+C to stop");

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Received shutdown signal");
        let _ = shutdown_tx.send(());
    });

    daemon.run(shutdown_rx).await
}
