// ABOUTME: Sync orchestration - per-event-type cycles, the interval daemon and the journal
// ABOUTME: Re-exports the types the CLI drives

pub mod cycle;
pub mod daemon;
pub mod state;

pub use cycle::{CyclePhase, CycleReport, CycleRunner, CycleSettings, CycleStatus};
pub use daemon::{DaemonConfig, PassStats, SyncDaemon};
pub use state::{EventSyncState, SyncState};
