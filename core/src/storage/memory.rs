//! In-memory drivers backing tests and local runs. Semantics mirror the
//! production contracts: range reads, lexicographic listing, conditional
//! writes.

use std::collections::BTreeMap;
use std::ops::Range;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::Expected;
use super::ListPage;
use super::MetadataStore;
use super::ObjectStore;
use super::StorageErr;
use super::lookup_path;

#[derive(Default)]
pub struct MemObjectStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: overwrite an object in place, bypassing the normal write
    /// path (used to simulate tampered canonical text).
    pub async fn corrupt(&self, key: &str, bytes: Vec<u8>) {
        self.objects.write().await.insert(key.to_string(), bytes);
    }
}

#[async_trait]
impl ObjectStore for MemObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<(), StorageErr> {
        self.objects.write().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str, range: Option<Range<u64>>) -> Result<Vec<u8>, StorageErr> {
        let objects = self.objects.read().await;
        let bytes = objects
            .get(key)
            .ok_or_else(|| StorageErr::NotFound(key.to_string()))?;
        match range {
            None => Ok(bytes.clone()),
            Some(range) => {
                let start = range.start.min(bytes.len() as u64) as usize;
                let end = range.end.min(bytes.len() as u64) as usize;
                Ok(bytes[start..end.max(start)].to_vec())
            }
        }
    }

    async fn list(&self, prefix: &str, cursor: Option<String>) -> Result<ListPage, StorageErr> {
        const PAGE_SIZE: usize = 1_000;
        let objects = self.objects.read().await;
        let keys: Vec<String> = objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .filter(|k| cursor.as_deref().is_none_or(|c| k.as_str() > c))
            .take(PAGE_SIZE + 1)
            .cloned()
            .collect();
        let (keys, next_cursor) = if keys.len() > PAGE_SIZE {
            let page: Vec<String> = keys[..PAGE_SIZE].to_vec();
            let cursor = page.last().cloned();
            (page, cursor)
        } else {
            (keys, None)
        };
        Ok(ListPage { keys, next_cursor })
    }

    async fn delete(&self, key: &str) -> Result<(), StorageErr> {
        self.objects.write().await.remove(key);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemMetadataStore {
    items: RwLock<BTreeMap<(String, String), Value>>,
}

impl MemMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemMetadataStore {
    async fn put_item(&self, pk: &str, sk: &str, item: Value) -> Result<(), StorageErr> {
        self.items
            .write()
            .await
            .insert((pk.to_string(), sk.to_string()), item);
        Ok(())
    }

    async fn get_item(&self, pk: &str, sk: &str) -> Result<Option<Value>, StorageErr> {
        Ok(self
            .items
            .read()
            .await
            .get(&(pk.to_string(), sk.to_string()))
            .cloned())
    }

    async fn update_if(
        &self,
        pk: &str,
        sk: &str,
        expected: Expected,
        next: Value,
    ) -> Result<bool, StorageErr> {
        let mut items = self.items.write().await;
        let key = (pk.to_string(), sk.to_string());
        let current = items.get(&key);
        let holds = match (&expected.value, current) {
            (None, None) => true,
            (None, Some(item)) => lookup_path(item, &expected.field).is_none(),
            (Some(_), None) => false,
            (Some(value), Some(item)) => {
                lookup_path(item, &expected.field).is_some_and(|v| v == value)
            }
        };
        if holds {
            items.insert(key, next);
        }
        Ok(holds)
    }

    async fn query(&self, pk: &str, sk_prefix: &str) -> Result<Vec<Value>, StorageErr> {
        Ok(self
            .items
            .read()
            .await
            .iter()
            .filter(|((p, s), _)| p == pk && s.starts_with(sk_prefix))
            .map(|(_, v)| v.clone())
            .collect())
    }
}
