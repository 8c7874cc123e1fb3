use std::sync::Arc;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

use crate::error::StorageError;
use crate::record::NormalizedRecord;

mod memory;
mod sqlite;

pub use memory::MemoryKv;
pub use sqlite::SqliteKv;

pub const DEFAULT_CHUNK_SIZE: usize = 200;
pub const DEFAULT_MAX_VALUE_BYTES: usize = 1024 * 1024;

/// A key/value backend that refuses values above a fixed size.
#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync {
    fn max_value_size(&self) -> usize;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

pub async fn put_json<T: Serialize + ?Sized>(
    kv: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec(value)?;
    if bytes.len() > kv.max_value_size() {
        return Err(StorageError::ValueTooLarge {
            key: key.to_string(),
            size: bytes.len(),
            limit: kv.max_value_size(),
        });
    }
    kv.put(key, bytes).await
}

pub async fn get_json<T: DeserializeOwned>(
    kv: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match kv.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMeta {
    pub total: usize,
    pub chunk_count: usize,
    pub chunk_size: usize,
}

/// Ordered record sequences stored as fixed-size chunks.
#[derive(Clone)]
pub struct RecordStore {
    kv: Arc<dyn KeyValueStore>,
    chunk_size: usize,
}

fn meta_key(group: &str) -> String {
    format!("records_meta:{group}")
}

fn chunk_key(group: &str, index: usize) -> String {
    format!("records:{group}:{index}")
}

impl RecordStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, chunk_size: usize) -> Self {
        RecordStore {
            kv,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn kv(&self) -> &dyn KeyValueStore {
        self.kv.as_ref()
    }

    pub async fn meta(&self, group: &str) -> Result<Option<GroupMeta>, StorageError> {
        get_json(self.kv(), &meta_key(group)).await
    }

    /// Replaces whatever `group` held with `records`.
    pub async fn store_chunked(
        &self,
        group: &str,
        records: &[NormalizedRecord],
    ) -> Result<GroupMeta, StorageError> {
        let previous = self.meta(group).await?;
        // without metadata the group reads as empty while chunks are rewritten
        self.kv.delete(&meta_key(group)).await?;

        let chunks = records.chunks(self.chunk_size);
        let meta = GroupMeta {
            total: records.len(),
            chunk_count: chunks.len(),
            chunk_size: self.chunk_size,
        };
        for (index, chunk) in chunks.enumerate() {
            put_json(self.kv(), &chunk_key(group, index), chunk).await?;
        }

        if let Some(previous) = previous {
            for index in meta.chunk_count..previous.chunk_count {
                self.kv.delete(&chunk_key(group, index)).await?;
            }
        }

        put_json(self.kv(), &meta_key(group), &meta).await?;
        debug!(group, total = meta.total, chunks = meta.chunk_count, "Stored records");
        Ok(meta)
    }

    /// Returns the records in `[offset, offset + count)`, loading only the chunks that cover it.
    pub async fn fetch_range(
        &self,
        group: &str,
        offset: usize,
        count: usize,
    ) -> Result<Vec<NormalizedRecord>, StorageError> {
        let Some(meta) = self.meta(group).await? else {
            return Ok(Vec::new());
        };
        if count == 0 || offset >= meta.total || meta.chunk_count == 0 {
            return Ok(Vec::new());
        }

        let end = (offset + count).min(meta.total);
        let first_chunk = offset / meta.chunk_size;
        let last_chunk = ((end - 1) / meta.chunk_size).min(meta.chunk_count - 1);

        let mut loaded = Vec::with_capacity((last_chunk - first_chunk + 1) * meta.chunk_size);
        for index in first_chunk..=last_chunk {
            let chunk: Vec<NormalizedRecord> = get_json(self.kv(), &chunk_key(group, index))
                .await?
                .ok_or_else(|| StorageError::MissingChunk {
                    group: group.to_string(),
                    index,
                })?;
            loaded.extend(chunk);
        }

        let local_offset = offset - first_chunk * meta.chunk_size;
        Ok(loaded
            .into_iter()
            .skip(local_offset)
            .take(end - offset)
            .collect())
    }

    /// Removes the group's metadata and every chunk. Unknown groups are a no-op.
    pub async fn delete_all(&self, group: &str) -> Result<(), StorageError> {
        let Some(meta) = self.meta(group).await? else {
            return Ok(());
        };
        for index in 0..meta.chunk_count {
            self.kv.delete(&chunk_key(group, index)).await?;
        }
        self.kv.delete(&meta_key(group)).await?;
        debug!(group, chunks = meta.chunk_count, "Deleted records");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::ProductKind;

    fn records(count: usize) -> Vec<NormalizedRecord> {
        (0..count)
            .map(|i| {
                let mut record =
                    NormalizedRecord::new(ProductKind::Simple, Some(&format!("SKU-{i}")), "item");
                record.description = format!("description {i}");
                record
            })
            .collect()
    }

    fn store(chunk_size: usize) -> (Arc<MemoryKv>, RecordStore) {
        let kv = Arc::new(MemoryKv::new(DEFAULT_MAX_VALUE_BYTES));
        (kv.clone(), RecordStore::new(kv, chunk_size))
    }

    #[tokio::test]
    async fn round_trips_for_any_chunk_size() {
        let input = records(53);
        for chunk_size in [1, 2, 7, 10, 53, 200] {
            let (_, store) = store(chunk_size);
            store.store_chunked("g", &input).await.unwrap();
            let output = store.fetch_range("g", 0, input.len()).await.unwrap();
            assert_eq!(output, input, "chunk size {chunk_size}");
        }
    }

    #[tokio::test]
    async fn fetches_exact_slices_across_chunk_boundaries() {
        let input = records(45);
        let (_, store) = store(10);
        let meta = store.store_chunked("g", &input).await.unwrap();
        assert_eq!(meta.chunk_count, 5);

        assert_eq!(store.fetch_range("g", 8, 5).await.unwrap(), input[8..13]);
        assert_eq!(store.fetch_range("g", 40, 25).await.unwrap(), input[40..45]);
        assert_eq!(store.fetch_range("g", 20, 10).await.unwrap(), input[20..30]);
        assert!(store.fetch_range("g", 45, 10).await.unwrap().is_empty());
        assert!(store.fetch_range("g", 0, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn loads_only_covering_chunks() {
        let input = records(30);
        let (kv, store) = store(10);
        store.store_chunked("g", &input).await.unwrap();

        // a fetch inside chunk 1 must not need chunks 0 or 2
        kv.delete(&chunk_key("g", 0)).await.unwrap();
        kv.delete(&chunk_key("g", 2)).await.unwrap();
        assert_eq!(store.fetch_range("g", 12, 5).await.unwrap(), input[12..17]);

        let err = store.fetch_range("g", 5, 10).await.unwrap_err();
        assert!(matches!(err, StorageError::MissingChunk { index: 0, .. }));
    }

    #[tokio::test]
    async fn missing_group_reads_empty_and_deletes_quietly() {
        let (_, store) = store(10);
        assert!(store.fetch_range("nope", 0, 10).await.unwrap().is_empty());
        store.delete_all("nope").await.unwrap();
    }

    #[tokio::test]
    async fn overwrite_drops_stale_chunks() {
        let (kv, store) = store(10);
        store.store_chunked("g", &records(35)).await.unwrap();
        assert_eq!(kv.len().await, 5);

        let replacement = records(12);
        store.store_chunked("g", &replacement).await.unwrap();
        assert_eq!(kv.len().await, 3);
        assert_eq!(store.fetch_range("g", 0, 100).await.unwrap(), replacement);

        store.delete_all("g").await.unwrap();
        assert_eq!(kv.len().await, 0);
    }

    #[tokio::test]
    async fn oversized_chunks_are_rejected() {
        let kv = Arc::new(MemoryKv::new(512));
        let store = RecordStore::new(kv, 50);
        let err = store.store_chunked("g", &records(50)).await.unwrap_err();
        assert!(matches!(err, StorageError::ValueTooLarge { limit: 512, .. }));
    }
}
