use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use toolhub_catalog::ToolId;

use super::{SearchStore, SearchStoreError};
use crate::projector::ToolDocument;

/// In-memory search index for tests and the demo service.
#[derive(Debug, Default)]
pub struct InMemorySearchStore {
    docs: RwLock<BTreeMap<ToolId, ToolDocument>>,
    writes: AtomicU64,
}

impl InMemorySearchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every document currently indexed, ordered by id.
    pub fn documents(&self) -> Vec<ToolDocument> {
        match self.docs.read() {
            Ok(docs) => docs.values().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.docs.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of successful upserts and deletes applied so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

fn poisoned() -> SearchStoreError {
    SearchStoreError::Unavailable("index lock poisoned".to_string())
}

#[async_trait]
impl SearchStore for InMemorySearchStore {
    async fn upsert(&self, doc: ToolDocument) -> Result<(), SearchStoreError> {
        let mut docs = self.docs.write().map_err(|_| poisoned())?;
        docs.insert(doc.tool_id, doc);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, tool_id: ToolId) -> Result<(), SearchStoreError> {
        let mut docs = self.docs.write().map_err(|_| poisoned())?;
        docs.remove(&tool_id);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn get(&self, tool_id: ToolId) -> Result<Option<ToolDocument>, SearchStoreError> {
        let docs = self.docs.read().map_err(|_| poisoned())?;
        Ok(docs.get(&tool_id).cloned())
    }

    async fn list_ids(
        &self,
        after: Option<ToolId>,
        limit: usize,
    ) -> Result<Vec<ToolId>, SearchStoreError> {
        let docs = self.docs.read().map_err(|_| poisoned())?;
        Ok(docs
            .keys()
            .filter(|id| after.is_none_or(|a| **id > a))
            .take(limit)
            .copied()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use toolhub_core::{CategoryId, ManufacturerId};

    fn doc(id: i64, price: i64) -> ToolDocument {
        ToolDocument {
            tool_id: ToolId::new(id),
            manufacturer_id: ManufacturerId::new(1),
            category_id: CategoryId::new(1),
            type_name: "HAND".to_string(),
            condition_name: "NEW".to_string(),
            price: Decimal::from(price),
            description: String::new(),
            version: 1,
        }
    }

    #[tokio::test]
    async fn upsert_replaces_whole_document() {
        let store = InMemorySearchStore::new();
        store.upsert(doc(1, 10)).await.unwrap();
        store.upsert(doc(1, 20)).await.unwrap();

        let got = store.get(ToolId::new(1)).await.unwrap().unwrap();
        assert_eq!(got.price, Decimal::from(20));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn delete_of_absent_id_succeeds() {
        let store = InMemorySearchStore::new();
        store.delete(ToolId::new(42)).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn list_ids_pages_in_order() {
        let store = InMemorySearchStore::new();
        for id in [3, 1, 2, 5] {
            store.upsert(doc(id, 1)).await.unwrap();
        }

        let first = store.list_ids(None, 2).await.unwrap();
        assert_eq!(first, vec![ToolId::new(1), ToolId::new(2)]);
        let rest = store.list_ids(first.last().copied(), 10).await.unwrap();
        assert_eq!(rest, vec![ToolId::new(3), ToolId::new(5)]);
    }
}
