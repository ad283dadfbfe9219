// ABOUTME: SyncDaemon - runs ingestion cycles at a fixed interval until shutdown
// ABOUTME: Records every cycle's reports in the SyncState journal

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

use super::cycle::{CycleReport, CycleRunner};
use super::state::SyncState;
use crate::registry::EventTypeDescriptor;

/// Configuration for the SyncDaemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Interval between sync passes
    pub sync_interval: Duration,
    /// Path of the sync journal
    pub state_path: PathBuf,
    /// Source endpoint, recorded in the journal
    pub endpoint: String,
    /// Target database URL, recorded sanitized in the journal
    pub target_url: String,
    pub registry_fingerprint: String,
}

/// Totals of one pass over every selected event type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassStats {
    pub event_types: usize,
    pub failed: usize,
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub errored: usize,
}

impl PassStats {
    pub fn from_reports(reports: &[CycleReport]) -> Self {
        reports.iter().fold(
            Self {
                event_types: reports.len(),
                ..Self::default()
            },
            |mut stats, r| {
                stats.failed += usize::from(r.is_failed());
                stats.fetched += r.fetched;
                stats.inserted += r.inserted;
                stats.updated += r.updated;
                stats.errored += r.errored;
                stats
            },
        )
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

pub struct SyncDaemon {
    runner: CycleRunner,
    descriptors: Vec<Arc<EventTypeDescriptor>>,
    config: DaemonConfig,
}

impl SyncDaemon {
    pub fn new(runner: CycleRunner, descriptors: Vec<Arc<EventTypeDescriptor>>, config: DaemonConfig) -> Self {
        Self {
            runner,
            descriptors,
            config,
        }
    }

    /// Run one cycle for every selected event type and journal the reports.
    ///
    /// A journal that cannot be written is logged; it never fails the pass.
    pub async fn run_pass(&self) -> Vec<CycleReport> {
        let reports = self.runner.run_all(&self.descriptors).await;

        let mut state = SyncState::load_or_new(
            &self.config.state_path,
            &self.config.endpoint,
            &self.config.target_url,
            &self.config.registry_fingerprint,
        )
        .await;
        for report in &reports {
            state.record(report);
        }
        state.registry_fingerprint = self.config.registry_fingerprint.clone();
        if let Err(e) = state.save(&self.config.state_path).await {
            tracing::warn!("Failed to update sync journal: {:?}", e);
        }

        reports
    }

    /// Run passes at the configured interval until a shutdown signal arrives.
    /// A pass in flight is abandoned on shutdown; uncommitted sessions roll back.
    pub async fn run(&self, mut shutdown: tokio::sync::broadcast::Receiver<()>) -> Result<()> {
        let mut ticker = interval(self.config.sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut passes = 0u64;

        tracing::info!(
            "Starting SyncDaemon for {} event type(s) with sync_interval={:?}",
            self.descriptors.len(),
            self.config.sync_interval
        );

        loop {
            tokio::select! {
                biased; // Check shutdown first

                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping SyncDaemon");
                    break;
                }

                _ = ticker.tick() => {
                    passes += 1;
                    tracing::info!("Starting sync pass {}", passes);

                    tokio::select! {
                        biased;

                        _ = shutdown.recv() => {
                            tracing::info!("Shutdown signal received during sync pass, aborting");
                            break;
                        }

                        reports = self.run_pass() => {
                            let stats = PassStats::from_reports(&reports);
                            tracing::info!(
                                "Sync pass {} completed: {} event types, {} fetched, {} inserted, {} updated",
                                passes,
                                stats.event_types,
                                stats.fetched,
                                stats.inserted,
                                stats.updated
                            );
                            if !stats.is_success() || stats.errored > 0 {
                                tracing::warn!(
                                    "Sync pass {} had {} failed event type(s) and {} row error(s)",
                                    passes,
                                    stats.failed,
                                    stats.errored
                                );
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }
}
