// ABOUTME: CycleRunner - one incremental ingestion cycle per event type
// ABOUTME: Fetch, transform, resolve entities and load page by page until caught up

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

use crate::cursor::{Cursor, CursorTracker};
use crate::entities::{EntityDependencyResolver, EntityOutcome};
use crate::error::IngestError;
use crate::loader::{RowError, UpsertLoader};
use crate::registry::{EventTypeDescriptor, Registry, ID_FIELD};
use crate::source::{EventSource, FetchRequest, QueryPlanner};
use crate::store::EventStore;
use crate::transform::RecordTransformer;

/// Final status of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Success,
    NoNewData,
    Failed,
}

/// Where a cycle currently is. Transitions are logged at debug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Fetching,
    Transforming,
    ResolvingEntities,
    Loading,
    Failed,
}

/// Outcome of one event type's cycle, surfaced to the CLI and the state journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub event_type: String,
    pub table: String,
    pub status: CycleStatus,
    pub started_at: DateTime<Utc>,
    pub pages: usize,
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errored: usize,
    pub row_errors: Vec<RowError>,
    /// Per entity type, across every page of the cycle.
    pub entities: IndexMap<String, EntityOutcome>,
    pub previous_cursor: Option<Cursor>,
    pub cursor: Option<Cursor>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl CycleReport {
    fn new(descriptor: &EventTypeDescriptor) -> Self {
        Self {
            event_type: descriptor.graphql_name.clone(),
            table: descriptor.table_name.clone(),
            status: CycleStatus::NoNewData,
            started_at: Utc::now(),
            pages: 0,
            fetched: 0,
            inserted: 0,
            updated: 0,
            skipped: 0,
            errored: 0,
            row_errors: Vec::new(),
            entities: IndexMap::new(),
            previous_cursor: None,
            cursor: None,
            error: None,
            duration_ms: 0,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == CycleStatus::Failed
    }

    /// Entity types whose upsert failed at least once during the cycle.
    pub fn failed_entities(&self) -> Vec<&str> {
        self.entities
            .iter()
            .filter(|(_, outcome)| outcome.is_failed())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Tunables for a [`CycleRunner`].
#[derive(Debug, Clone, Copy)]
pub struct CycleSettings {
    pub page_size: usize,
    pub max_pages_per_cycle: usize,
    pub concurrency: usize,
}

impl Default for CycleSettings {
    fn default() -> Self {
        Self {
            page_size: 1000,
            max_pages_per_cycle: 100,
            concurrency: 4,
        }
    }
}

/// Composition root of the engine: wires planner, source, transformer, entity
/// resolver, loader and cursor tracker for every event type.
pub struct CycleRunner {
    source: Arc<dyn EventSource>,
    store: Arc<dyn EventStore>,
    resolver: EntityDependencyResolver,
    planner: QueryPlanner,
    max_pages: usize,
    concurrency: usize,
}

impl CycleRunner {
    pub fn new(
        registry: Arc<Registry>,
        source: Arc<dyn EventSource>,
        store: Arc<dyn EventStore>,
        settings: CycleSettings,
    ) -> Self {
        Self {
            source,
            store,
            resolver: EntityDependencyResolver::new(registry),
            planner: QueryPlanner::new(settings.page_size),
            max_pages: settings.max_pages_per_cycle.max(1),
            concurrency: settings.concurrency.max(1),
        }
    }

    /// Replace the entity resolver, e.g. to register custom handlers.
    pub fn with_resolver(mut self, resolver: EntityDependencyResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Run one cycle for each descriptor, up to `concurrency` at a time.
    /// Reports come back in the order the descriptors were given.
    pub async fn run_all(&self, descriptors: &[Arc<EventTypeDescriptor>]) -> Vec<CycleReport> {
        let mut reports: Vec<(usize, CycleReport)> = stream::iter(descriptors.iter().enumerate())
            .map(|(i, descriptor)| async move { (i, self.run(descriptor).await) })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        reports.sort_by_key(|(i, _)| *i);
        reports.into_iter().map(|(_, report)| report).collect()
    }

    /// Run one cycle. Never returns an error: a failure is recorded in the report
    /// with status `failed` and the durable cursor stays where the last committed page left it.
    pub async fn run(&self, descriptor: &EventTypeDescriptor) -> CycleReport {
        let start = Instant::now();
        let mut report = CycleReport::new(descriptor);
        let mut phase = CyclePhase::Idle;

        match self.ingest(descriptor, &mut report, &mut phase).await {
            Ok(()) => {
                // Re-read rows that were skipped as unchanged are not new data
                report.status = if report.inserted + report.updated + report.errored > 0 {
                    CycleStatus::Success
                } else {
                    CycleStatus::NoNewData
                };
                transition(descriptor, &mut phase, CyclePhase::Idle);
            }
            Err(e) => {
                transition(descriptor, &mut phase, CyclePhase::Failed);
                tracing::error!("Sync cycle for {} failed: {}", descriptor.graphql_name, e);
                report.status = CycleStatus::Failed;
                report.error = Some(e.to_string());
            }
        }

        report.duration_ms = start.elapsed().as_millis() as u64;

        match report.status {
            CycleStatus::NoNewData => tracing::info!(
                "No new data for {} (cursor {})",
                descriptor.graphql_name,
                display_cursor(report.cursor)
            ),
            _ => tracing::info!(
                "Completed sync for {}: {} fetched, {} inserted, {} updated, {} skipped, {} errored, cursor {} -> {} in {}ms",
                descriptor.graphql_name,
                report.fetched,
                report.inserted,
                report.updated,
                report.skipped,
                report.errored,
                display_cursor(report.previous_cursor),
                display_cursor(report.cursor),
                report.duration_ms
            ),
        }

        report
    }

    async fn ingest(
        &self,
        descriptor: &EventTypeDescriptor,
        report: &mut CycleReport,
        phase: &mut CyclePhase,
    ) -> Result<(), IngestError> {
        let stored = CursorTracker::new(self.store.as_ref()).read(descriptor).await?;
        report.previous_cursor = stored;
        report.cursor = stored;

        let page_size = self.planner.page_size();
        let mut resume = CursorTracker::resume_from(stored);

        for _ in 0..self.max_pages {
            let request = self.planner.plan(descriptor, resume);
            let Some(page) = self.ingest_page(descriptor, &request, report, phase).await? else {
                return Ok(());
            };

            let next = match page.last_block {
                Some(last_block) if page.len >= page_size => {
                    let next = CursorTracker::after_full_page(resume, last_block);
                    if next == resume && page.first_block == Some(last_block) {
                        // One block fills the whole page
                        if !self.scan_block(descriptor, last_block, report, phase).await? {
                            return Ok(());
                        }
                        Some(Cursor::block_only(last_block.saturating_add(1)))
                    } else {
                        next
                    }
                }
                _ => CursorTracker::advance(resume, page.written),
            };

            if next == resume {
                // Fetching again would return the same page
                tracing::debug!(
                    "Resume position for {} did not move past {}; ending cycle",
                    descriptor.graphql_name,
                    display_cursor(resume)
                );
                return Ok(());
            }
            resume = next;
        }

        tracing::info!(
            "Reached {} pages for {}; remaining records will be fetched next cycle",
            self.max_pages,
            descriptor.graphql_name
        );
        Ok(())
    }

    /// Read one block completely, a page at a time in `id` order. Returns false when
    /// the block could not be paged to its end.
    async fn scan_block(
        &self,
        descriptor: &EventTypeDescriptor,
        block_number: i64,
        report: &mut CycleReport,
        phase: &mut CyclePhase,
    ) -> Result<bool, IngestError> {
        tracing::debug!(
            "{}: block {} fills a page of {} records; paging it by id",
            descriptor.graphql_name,
            block_number,
            self.planner.page_size()
        );

        let mut after_id: Option<String> = None;
        loop {
            let request = self.planner.plan_block(descriptor, block_number, after_id.as_deref());
            let Some(page) = self.ingest_page(descriptor, &request, report, phase).await? else {
                return Ok(true);
            };
            if page.len < self.planner.page_size() {
                return Ok(true);
            }
            match page.last_id {
                Some(id) if after_id.as_deref() != Some(id.as_str()) => after_id = Some(id),
                _ => {
                    tracing::warn!(
                        "Cannot page past id {} in block {} of {}; the block will be read again next cycle",
                        after_id.as_deref().unwrap_or("none"),
                        block_number,
                        descriptor.graphql_name
                    );
                    return Ok(false);
                }
            }
        }
    }

    /// Fetch one page and run it through transform, entity resolution and load.
    /// Returns `None` when the source has nothing left for the request.
    async fn ingest_page(
        &self,
        descriptor: &EventTypeDescriptor,
        request: &FetchRequest,
        report: &mut CycleReport,
        phase: &mut CyclePhase,
    ) -> Result<Option<PageSummary>, IngestError> {
        let store = self.store.as_ref();

        transition(descriptor, phase, CyclePhase::Fetching);
        let page = self.source.fetch(request).await?;
        if page.is_empty() {
            return Ok(None);
        }
        report.pages += 1;
        report.fetched += page.len();

        transition(descriptor, phase, CyclePhase::Transforming);
        let now = Utc::now();
        let records = RecordTransformer::new(descriptor).transform_page(&page, now);

        transition(descriptor, phase, CyclePhase::ResolvingEntities);
        let outcomes = self.resolver.resolve(store, descriptor, &records, now).await?;
        for (entity, outcome) in outcomes {
            match report.entities.get_mut(&entity) {
                Some(total) => total.merge(outcome),
                None => {
                    report.entities.insert(entity, outcome);
                }
            }
        }

        transition(descriptor, phase, CyclePhase::Loading);
        let outcome = UpsertLoader::new(store).load(descriptor, &records).await?;
        report.inserted += outcome.inserted;
        report.updated += outcome.updated;
        report.skipped += outcome.skipped;
        report.errored += outcome.errored;
        report.row_errors.extend(outcome.errors);
        report.cursor = CursorTracker::advance(report.cursor, outcome.written_positions.iter().copied());

        let blocks = records.iter().filter_map(|r| r.position.map(|p| p.block_number));
        Ok(Some(PageSummary {
            len: page.len(),
            first_block: blocks.clone().min(),
            last_block: blocks.max(),
            last_id: page
                .last()
                .and_then(|r| r.get(ID_FIELD))
                .and_then(Value::as_str)
                .map(str::to_string),
            written: outcome.written_positions,
        }))
    }
}

/// What one loaded page tells the cycle about where to fetch next.
struct PageSummary {
    len: usize,
    first_block: Option<i64>,
    last_block: Option<i64>,
    /// `id` of the last fetched record, for paging inside a block.
    last_id: Option<String>,
    written: Vec<Cursor>,
}

fn transition(descriptor: &EventTypeDescriptor, phase: &mut CyclePhase, next: CyclePhase) {
    if *phase != next {
        tracing::debug!("{}: {:?} -> {:?}", descriptor.graphql_name, phase, next);
        *phase = next;
    }
}

pub(crate) fn display_cursor(cursor: Option<Cursor>) -> String {
    cursor.map_or_else(|| "none".to_string(), |c| c.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_serializes_status_in_snake_case() {
        let descriptor = Registry::builtin().unwrap().get("deposits").unwrap().clone();
        let mut report = CycleReport::new(&descriptor);
        report.status = CycleStatus::NoNewData;
        report.cursor = Some(Cursor::new(10, 2));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "no_new_data");
        assert_eq!(json["event_type"], "deposits");
        assert_eq!(json["cursor"]["block_number"], 10);

        let back: CycleReport = serde_json::from_value(json).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn test_failed_entities() {
        let descriptor = Registry::builtin().unwrap().get("deposits").unwrap().clone();
        let mut report = CycleReport::new(&descriptor);
        report
            .entities
            .insert("Staker".to_string(), EntityOutcome::Upserted(Default::default()));
        report.entities.insert(
            "Strategy".to_string(),
            EntityOutcome::Failed {
                reason: "boom".to_string(),
            },
        );
        assert_eq!(report.failed_entities(), vec!["Strategy"]);
    }

    #[test]
    fn test_display_cursor() {
        assert_eq!(display_cursor(None), "none");
        assert_eq!(display_cursor(Some(Cursor::new(1, 2))), "(1, 2)");
    }
}
