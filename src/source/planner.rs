// ABOUTME: Builds the GraphQL document for one page of an event type
// ABOUTME: Filters after the resume cursor with composite (block, log) ordering, or scans one block by id

use std::fmt::Write as _;

use super::{FetchRequest, FetchScope};
use crate::cursor::Cursor;
use crate::registry::{EventTypeDescriptor, BLOCK_FIELD, ID_FIELD, LOG_FIELD};

/// Largest `first:` the source accepts.
pub const MAX_PAGE_SIZE: usize = 1000;

/// Turns (descriptor, cursor, page size) into a fetch request.
#[derive(Debug, Clone, Copy)]
pub struct QueryPlanner {
    page_size: usize,
}

impl QueryPlanner {
    /// Page size is clamped to `1..=MAX_PAGE_SIZE`.
    pub fn new(page_size: usize) -> Self {
        let clamped = page_size.clamp(1, MAX_PAGE_SIZE);
        if clamped != page_size {
            tracing::warn!(
                "Page size {} is outside 1..={}, using {}",
                page_size,
                MAX_PAGE_SIZE,
                clamped
            );
        }
        Self { page_size: clamped }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn plan(&self, descriptor: &EventTypeDescriptor, cursor: Option<Cursor>) -> FetchRequest {
        let mut arguments = format!(
            "first: {}, orderBy: {}, orderDirection: asc",
            self.page_size, BLOCK_FIELD
        );
        if let Some(filter) = where_clause(cursor) {
            let _ = write!(arguments, ", where: {}", filter);
        }

        FetchRequest {
            list_field: descriptor.graphql_name.clone(),
            document: document(descriptor, &arguments),
            page_size: self.page_size,
            cursor,
            scope: FetchScope::Forward,
        }
    }

    /// Page through one block in `id` order.
    ///
    /// The source only orders by block number, so records inside a block come back
    /// in an order that says nothing about their log index. A block larger than one
    /// page can only be read completely by keying on `id`.
    pub fn plan_block(
        &self,
        descriptor: &EventTypeDescriptor,
        block_number: i64,
        after_id: Option<&str>,
    ) -> FetchRequest {
        let filter = match after_id {
            Some(id) => format!(
                "{{ {}: {}, {}_gt: {} }}",
                BLOCK_FIELD,
                block_number,
                ID_FIELD,
                string_literal(id)
            ),
            None => format!("{{ {}: {} }}", BLOCK_FIELD, block_number),
        };
        let arguments = format!(
            "first: {}, orderBy: {}, orderDirection: asc, where: {}",
            self.page_size, ID_FIELD, filter
        );

        FetchRequest {
            list_field: descriptor.graphql_name.clone(),
            document: document(descriptor, &arguments),
            page_size: self.page_size,
            cursor: Some(Cursor::block_only(block_number)),
            scope: FetchScope::Block {
                block_number,
                after_id: after_id.map(str::to_string),
            },
        }
    }
}

fn document(descriptor: &EventTypeDescriptor, arguments: &str) -> String {
    format!(
        "query {{\n  {}({}) {{\n{}  }}\n}}",
        descriptor.graphql_name,
        arguments,
        selection(descriptor)
    )
}

/// GraphQL string literal; JSON string escaping is a subset of GraphQL's.
fn string_literal(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

/// Filter selecting records strictly after `cursor`.
///
/// A block-only cursor uses `_gte`, so rows of the cursor block are fetched again;
/// the loader skips them as unchanged.
fn where_clause(cursor: Option<Cursor>) -> Option<String> {
    let cursor = cursor?;
    let block = cursor.block_number;
    Some(match cursor.log_index {
        Some(log) => format!(
            "{{ or: [{{ {b}_gt: {block} }}, {{ {b}: {block}, {l}_gt: {log} }}] }}",
            b = BLOCK_FIELD,
            l = LOG_FIELD,
            block = block,
            log = log
        ),
        None => format!("{{ {}_gte: {} }}", BLOCK_FIELD, block),
    })
}

fn selection(descriptor: &EventTypeDescriptor) -> String {
    let mut out = String::new();
    for field in &descriptor.fields {
        match descriptor.nested_fields.get(field) {
            Some(subs) if !subs.is_empty() => {
                let _ = writeln!(out, "    {} {{ {} }}", field, subs.join(" "));
            }
            _ => {
                let _ = writeln!(out, "    {}", field);
            }
        }
    }
    out
}
