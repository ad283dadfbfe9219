// ABOUTME: SyncState journal - the last cycle report per event type
// ABOUTME: Persisted as JSON for the status command; cursors always come from the target tables

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;

use super::cycle::{CycleReport, CycleStatus};
use crate::cursor::Cursor;
use crate::utils::sanitize_url;

/// Journal entry for one event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSyncState {
    pub event_type: String,
    pub table: String,
    /// Cursor reached by the most recent cycle that got past reading it.
    pub last_cursor: Option<Cursor>,
    /// When a cycle last finished with `success` or `no_new_data`
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_report: CycleReport,
}

impl EventSyncState {
    fn new(report: &CycleReport) -> Self {
        Self {
            event_type: report.event_type.clone(),
            table: report.table.clone(),
            last_cursor: None,
            last_success_at: None,
            consecutive_failures: 0,
            last_report: report.clone(),
        }
    }

    fn update(&mut self, report: &CycleReport) {
        if report.cursor.is_some() {
            self.last_cursor = report.cursor;
        }
        match report.status {
            CycleStatus::Failed => self.consecutive_failures += 1,
            CycleStatus::Success | CycleStatus::NoNewData => {
                self.consecutive_failures = 0;
                self.last_success_at = Some(report.started_at);
            }
        }
        self.table = report.table.clone();
        self.last_report = report.clone();
    }
}

/// Overall journal for one endpoint/target pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    /// Source endpoint, reduced to scheme and host (gateway URLs embed the API key).
    pub endpoint: String,
    /// Target database URL (sanitized - no password)
    pub target_url: String,
    /// Fingerprint of the registry used by the last recorded cycle
    pub registry_fingerprint: String,
    /// Per-event-type entries, keyed by event type name
    pub events: BTreeMap<String, EventSyncState>,
    /// Version of the journal format
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncState {
    pub fn new(endpoint: &str, target_url: &str, registry_fingerprint: &str) -> Self {
        let now = Utc::now();
        Self {
            endpoint: endpoint_origin(endpoint),
            target_url: sanitize_url(target_url),
            registry_fingerprint: registry_fingerprint.to_string(),
            events: BTreeMap::new(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record a cycle report, replacing the event type's previous report.
    pub fn record(&mut self, report: &CycleReport) {
        self.events
            .entry(report.event_type.clone())
            .or_insert_with(|| EventSyncState::new(report))
            .update(report);
        self.updated_at = Utc::now();
    }

    pub fn get(&self, event_type: &str) -> Option<&EventSyncState> {
        self.events.get(event_type)
    }

    /// Returns `true` if the journal was written with a different registry.
    pub fn registry_changed(&self, fingerprint: &str) -> bool {
        self.registry_fingerprint != fingerprint
    }

    /// Load state from a JSON file
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read sync state from {:?}", path))?;
        let state: SyncState = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse sync state from {:?}", path))?;
        Ok(state)
    }

    /// Load the journal at `path`, or start a new one when it is missing or unreadable.
    pub async fn load_or_new(path: &Path, endpoint: &str, target_url: &str, fingerprint: &str) -> Self {
        if !path.exists() {
            return Self::new(endpoint, target_url, fingerprint);
        }
        match Self::load(path).await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!("Starting a new sync journal: {:?}", e);
                Self::new(endpoint, target_url, fingerprint)
            }
        }
    }

    /// Save state to a JSON file
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        let contents =
            serde_json::to_string_pretty(self).context("Failed to serialize sync state")?;
        fs::write(path, contents)
            .await
            .with_context(|| format!("Failed to write sync state to {:?}", path))?;
        Ok(())
    }

    /// `~/.subgraph-replicator/sync-state.json`, or a relative path when there is no home directory.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_default()
            .join(".subgraph-replicator")
            .join("sync-state.json")
    }
}

fn endpoint_origin(endpoint: &str) -> String {
    match url::Url::parse(endpoint) {
        Ok(parsed) => parsed.origin().ascii_serialization(),
        Err(_) => "<invalid url>".to_string(),
    }
}
