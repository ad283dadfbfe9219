// ABOUTME: Command implementations behind the CLI
// ABOUTME: Exports sync, status, events, validate and plan

pub mod events;
pub mod plan;
pub mod status;
pub mod sync;
pub mod validate;

pub use events::events;
pub use plan::plan;
pub use status::status;
pub use sync::{sync, SyncOptions};
pub use validate::validate;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::registry::Registry;

/// The registry named by the configuration, or the embedded one.
pub fn load_registry(config: &Config) -> Result<Registry> {
    let registry = Registry::load_or_builtin(config.sync.registry.as_deref())
        .context("Failed to load descriptor registry")?;
    match &config.sync.registry {
        Some(path) => tracing::debug!("Loaded {} event types from {:?}", registry.len(), path),
        None => tracing::debug!("Using embedded registry with {} event types", registry.len()),
    }
    Ok(registry)
}
