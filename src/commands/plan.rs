// ABOUTME: Plan command - prints the GraphQL document a cycle would send
// ABOUTME: Useful to debug filters and nested selections without touching the source

use anyhow::{bail, Result};

use crate::config::Config;
use crate::cursor::Cursor;
use crate::source::QueryPlanner;

pub fn plan(config: &Config, event: &str, block: Option<i64>, log_index: Option<i64>) -> Result<()> {
    config.validate()?;
    let registry = super::load_registry(config)?;
    let descriptor = registry.select(&[event.to_string()], None)?.remove(0);

    let cursor = match (block, log_index) {
        (Some(b), Some(l)) => Some(Cursor::new(b, l)),
        (Some(b), None) => Some(Cursor::block_only(b)),
        (None, Some(_)) => bail!("--log-index requires --block"),
        (None, None) => None,
    };

    let request = QueryPlanner::new(config.sync.page_size).plan(&descriptor, cursor);
    println!("{}", request.document);
    Ok(())
}
