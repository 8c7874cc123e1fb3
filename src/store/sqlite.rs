use sqlx::SqlitePool;

use super::KeyValueStore;
use crate::error::StorageError;

/// Key/value entries in the `kv_entries` table.
pub struct SqliteKv {
    pool: SqlitePool,
    max_value_size: usize,
}

impl SqliteKv {
    pub fn new(pool: SqlitePool, max_value_size: usize) -> Self {
        SqliteKv {
            pool,
            max_value_size,
        }
    }
}

#[async_trait::async_trait]
impl KeyValueStore for SqliteKv {
    fn max_value_size(&self) -> usize {
        self.max_value_size
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let value: Option<Vec<u8>> = sqlx::query_scalar("SELECT value FROM kv_entries WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        if value.len() > self.max_value_size {
            return Err(StorageError::ValueTooLarge {
                key: key.to_string(),
                size: value.len(),
                limit: self.max_value_size,
            });
        }
        sqlx::query(
            "INSERT INTO kv_entries (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM kv_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
