use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::catalog::ProductId;
use crate::id::ImportId;

/// SKU to catalog id of the variable products imported so far by one job.
#[derive(Default)]
pub struct ParentMap {
    entries: RwLock<HashMap<String, ProductId>>,
}

impl ParentMap {
    pub async fn get(&self, sku: &str) -> Option<ProductId> {
        self.entries.read().await.get(sku).copied()
    }

    pub async fn insert(&self, sku: &str, id: ProductId) {
        self.entries.write().await.insert(sku.to_string(), id);
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    #[cfg(test)]
    async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

/// One parent map per running job.
#[derive(Default)]
pub struct ParentMaps {
    jobs: RwLock<HashMap<ImportId, Arc<ParentMap>>>,
}

impl ParentMaps {
    pub fn new() -> Self {
        ParentMaps::default()
    }

    /// Starts the job with an empty map.
    pub async fn reset(&self, id: &ImportId) {
        self.jobs
            .write()
            .await
            .insert(id.clone(), Arc::new(ParentMap::default()));
    }

    pub async fn for_job(&self, id: &ImportId) -> Arc<ParentMap> {
        if let Some(map) = self.jobs.read().await.get(id) {
            return map.clone();
        }
        self.jobs.write().await.entry(id.clone()).or_default().clone()
    }

    pub async fn remove(&self, id: &ImportId) {
        self.jobs.write().await.remove(id);
    }
}
