//! Storage driver contracts consumed by the core.
//!
//! Concrete cloud drivers live outside this crate; the in-memory
//! implementations here back the test suite and local runs.

mod keys;
mod memory;

pub use keys::*;
pub use memory::MemMetadataStore;
pub use memory::MemObjectStore;

use std::ops::Range;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageErr {
    #[error("not found: {0}")]
    NotFound(String),

    /// Conditional write lost the race; the caller re-reads and decides.
    #[error("conditional write failed for {0}")]
    Conflict(String),

    #[error("read failed: {0}")]
    Read(String),

    #[error("write failed: {0}")]
    Write(String),
}

#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub keys: Vec<String>,
    pub next_cursor: Option<String>,
}

/// Blob store with range reads; keyspace partitioned by tenant.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), StorageErr>;

    /// `range` is a byte range; `None` reads the whole object.
    async fn get(&self, key: &str, range: Option<Range<u64>>) -> Result<Vec<u8>, StorageErr>;

    async fn list(&self, prefix: &str, cursor: Option<String>) -> Result<ListPage, StorageErr>;

    async fn delete(&self, key: &str) -> Result<(), StorageErr>;
}

/// Condition for [`MetadataStore::update_if`]: the item's field at a dotted
/// path must equal `value` (`None` matches an absent item or field).
#[derive(Debug, Clone)]
pub struct Expected {
    pub field: String,
    pub value: Option<Value>,
}

impl Expected {
    pub fn field_equals(field: impl Into<String>, value: Value) -> Self {
        Self {
            field: field.into(),
            value: Some(value),
        }
    }

    pub fn absent(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: None,
        }
    }
}

/// Key-value metadata store with conditional writes, modeled as a
/// partition-key / sort-key table.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn put_item(&self, pk: &str, sk: &str, item: Value) -> Result<(), StorageErr>;

    async fn get_item(&self, pk: &str, sk: &str) -> Result<Option<Value>, StorageErr>;

    /// Write `next` only if `expected` holds for the current item. Returns
    /// `false` (without writing) when the condition fails.
    async fn update_if(
        &self,
        pk: &str,
        sk: &str,
        expected: Expected,
        next: Value,
    ) -> Result<bool, StorageErr>;

    async fn query(&self, pk: &str, sk_prefix: &str) -> Result<Vec<Value>, StorageErr>;
}

/// Resolve a dotted path (`lease.version`) inside a JSON item.
pub(crate) fn lookup_path<'a>(item: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = item;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}
