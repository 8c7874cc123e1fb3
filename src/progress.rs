use std::collections::HashSet;
use std::ops::Range;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::StorageError;
use crate::id::ImportId;

/// Number of most recent errors carried in a snapshot.
pub const ERROR_TAIL: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Outcome {
    Created,
    Updated,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    Processing,
    Complete,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub import_id: ImportId,
    pub status: JobStatus,
    pub total: u64,
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub file_based: bool,
    pub total_files: u64,
    pub files_processed: u64,
    /// The most recent errors, oldest first.
    pub errors: Vec<String>,
    pub error_count: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Units still waiting in the task queue. Filled in by the service.
    pub pending_units: u64,
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    status: JobStatus,
    total: i64,
    processed: i64,
    created: i64,
    updated: i64,
    skipped: i64,
    file_based: bool,
    total_files: i64,
    files_processed: i64,
    started_at: i64,
    completed_at: Option<i64>,
}

const JOB_COLUMNS: &str = "id, status, total, processed, created, updated, skipped, file_based, \
    total_files, files_processed, started_at, completed_at";

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

/// Counters and terminal state of every import job.
///
/// Counter updates run in one transaction with a ledger insert, so a record
/// delivered twice is counted once. Nothing changes once a job has left
/// `processing`.
#[derive(Clone)]
pub struct ProgressTracker {
    pool: SqlitePool,
}

impl ProgressTracker {
    pub fn new(pool: SqlitePool) -> Self {
        ProgressTracker { pool }
    }

    pub async fn init(
        &self,
        id: &ImportId,
        total: usize,
        file_based: bool,
        total_files: usize,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        for table in ["import_records", "import_files", "import_errors"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE import_id = ?"))
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query(
            "INSERT OR REPLACE INTO import_jobs (id, status, total, file_based, total_files, started_at)
            VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(JobStatus::Processing)
        .bind(total as i64)
        .bind(file_based)
        .bind(total_files as i64)
        .bind(Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        debug!(import_id = %id, total, file_based, total_files, "Initialized job");
        Ok(())
    }

    /// Counts one record. Returns false if it was already counted or the job
    /// is no longer processing.
    pub async fn update(
        &self,
        id: &ImportId,
        group: &str,
        index: usize,
        outcome: Outcome,
        error: Option<&str>,
    ) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO import_records (import_id, group_id, record_index, outcome)
            VALUES (?, ?, ?, ?)",
        )
        .bind(id)
        .bind(group)
        .bind(index as i64)
        .bind(outcome)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            return Ok(false);
        }

        let updated = sqlx::query(
            "UPDATE import_jobs
            SET processed = processed + 1,
                created = created + ?,
                updated = updated + ?,
                skipped = skipped + ?
            WHERE id = ? AND status = 'processing'",
        )
        .bind((outcome == Outcome::Created) as i64)
        .bind((outcome == Outcome::Updated) as i64)
        .bind((outcome == Outcome::Skipped) as i64)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            // dropping the transaction rolls back the ledger row
            return Ok(false);
        }

        if let Some(message) = error {
            insert_error(&mut *tx, id, message).await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    /// Records a parsed source file. Only the first call for a file adds to
    /// `total` and `files_processed`.
    pub async fn record_file(
        &self,
        id: &ImportId,
        file_index: usize,
        record_count: usize,
    ) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO import_files (import_id, file_index, record_count) VALUES (?, ?, ?)",
        )
        .bind(id)
        .bind(file_index as i64)
        .bind(record_count as i64)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            return Ok(false);
        }

        let updated = sqlx::query(
            "UPDATE import_jobs SET total = total + ?, files_processed = files_processed + 1
            WHERE id = ? AND status = 'processing'",
        )
        .bind(record_count as i64)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Ok(false);
        }
        tx.commit().await?;
        Ok(true)
    }

    /// The record count stored for a parsed file, if it was recorded.
    pub async fn file_record_count(
        &self,
        id: &ImportId,
        file_index: usize,
    ) -> Result<Option<usize>, StorageError> {
        let count: Option<i64> = sqlx::query_scalar(
            "SELECT record_count FROM import_files WHERE import_id = ? AND file_index = ?",
        )
        .bind(id)
        .bind(file_index as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(count.map(|count| count as usize))
    }

    /// Indices within `range` of `group` that have already been counted.
    pub async fn recorded_indices(
        &self,
        id: &ImportId,
        group: &str,
        range: Range<usize>,
    ) -> Result<HashSet<usize>, StorageError> {
        let indices: Vec<i64> = sqlx::query_scalar(
            "SELECT record_index FROM import_records
            WHERE import_id = ? AND group_id = ? AND record_index >= ? AND record_index < ?",
        )
        .bind(id)
        .bind(group)
        .bind(range.start as i64)
        .bind(range.end as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(indices.into_iter().map(|index| index as usize).collect())
    }

    /// Counts every not yet counted record in `range` as skipped, adding one
    /// error entry if anything was counted. Returns the number counted.
    pub async fn reconcile(
        &self,
        id: &ImportId,
        group: &str,
        range: Range<usize>,
        message: &str,
    ) -> Result<u64, StorageError> {
        self.reconcile_except(id, group, range, &HashSet::new(), message)
            .await
    }

    /// Like [`reconcile`](Self::reconcile), leaving the indices in `owned` to
    /// the units that will still process them.
    pub async fn reconcile_except(
        &self,
        id: &ImportId,
        group: &str,
        range: Range<usize>,
        owned: &HashSet<usize>,
        message: &str,
    ) -> Result<u64, StorageError> {
        let recorded = self.recorded_indices(id, group, range.clone()).await?;
        let mut counted = 0;
        for index in range.filter(|index| !recorded.contains(index) && !owned.contains(index)) {
            if self.update(id, group, index, Outcome::Skipped, None).await? {
                counted += 1;
            }
        }
        if counted > 0 {
            self.append_error(id, message).await?;
        }
        Ok(counted)
    }

    pub async fn append_error(&self, id: &ImportId, message: &str) -> Result<(), StorageError> {
        let mut conn = self.pool.acquire().await?;
        insert_error(&mut *conn, id, message).await
    }

    pub async fn get(&self, id: &ImportId) -> Result<Option<ProgressSnapshot>, StorageError> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM import_jobs WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some(row) => Ok(Some(self.snapshot(row).await?)),
            None => Ok(None),
        }
    }

    async fn snapshot(&self, row: JobRow) -> Result<ProgressSnapshot, StorageError> {
        let mut errors: Vec<String> = sqlx::query_scalar(
            "SELECT message FROM import_errors WHERE import_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(&row.id)
        .bind(ERROR_TAIL)
        .fetch_all(&self.pool)
        .await?;
        errors.reverse();
        let error_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM import_errors WHERE import_id = ?")
                .bind(&row.id)
                .fetch_one(&self.pool)
                .await?;

        Ok(ProgressSnapshot {
            import_id: ImportId::from(row.id),
            status: row.status,
            total: row.total as u64,
            processed: row.processed as u64,
            created: row.created as u64,
            updated: row.updated as u64,
            skipped: row.skipped as u64,
            file_based: row.file_based,
            total_files: row.total_files as u64,
            files_processed: row.files_processed as u64,
            errors,
            error_count: error_count as u64,
            started_at: from_millis(row.started_at),
            completed_at: row.completed_at.map(from_millis),
            pending_units: 0,
        })
    }

    /// Moves a processing job to `status`. Only the first caller to leave
    /// `processing` gets true.
    pub async fn set_status(&self, id: &ImportId, status: JobStatus) -> Result<bool, StorageError> {
        let completed_at = (status != JobStatus::Processing).then(|| Utc::now().timestamp_millis());
        let result = sqlx::query(
            "UPDATE import_jobs SET status = ?, completed_at = ? WHERE id = ? AND status = 'processing'",
        )
        .bind(status)
        .bind(completed_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn is_processing(&self, id: &ImportId) -> Result<bool, StorageError> {
        let status: Option<JobStatus> =
            sqlx::query_scalar("SELECT status FROM import_jobs WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(status == Some(JobStatus::Processing))
    }

    /// The most recently started job that is still processing.
    pub async fn latest_active(&self) -> Result<Option<ImportId>, StorageError> {
        let id: Option<String> = sqlx::query_scalar(
            "SELECT id FROM import_jobs WHERE status = 'processing'
            ORDER BY started_at DESC, rowid DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(id.map(ImportId::from))
    }

    /// Every known job, newest first.
    pub async fn list(&self) -> Result<Vec<ProgressSnapshot>, StorageError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM import_jobs ORDER BY started_at DESC, rowid DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        let mut snapshots = Vec::with_capacity(rows.len());
        for row in rows {
            snapshots.push(self.snapshot(row).await?);
        }
        Ok(snapshots)
    }

    /// Removes the job and all of its ledgers.
    pub async fn delete(&self, id: &ImportId) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        for table in ["import_records", "import_files", "import_errors"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE import_id = ?"))
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM import_jobs WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

async fn insert_error(
    conn: &mut sqlx::SqliteConnection,
    id: &ImportId,
    message: &str,
) -> Result<(), StorageError> {
    sqlx::query("INSERT INTO import_errors (import_id, message, created_at) VALUES (?, ?, ?)")
        .bind(id)
        .bind(message)
        .bind(Utc::now().timestamp_millis())
        .execute(conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;

    async fn tracker() -> ProgressTracker {
        ProgressTracker::new(connect_in_memory().await.unwrap())
    }

    fn assert_balanced(snapshot: &ProgressSnapshot) {
        assert_eq!(
            snapshot.processed,
            snapshot.created + snapshot.updated + snapshot.skipped
        );
    }

    #[tokio::test]
    async fn counts_each_record_once() {
        let tracker = tracker().await;
        let id = ImportId::from("imp_1_1000");
        tracker.init(&id, 3, false, 0).await.unwrap();

        assert!(tracker.update(&id, "g", 0, Outcome::Created, None).await.unwrap());
        assert!(!tracker.update(&id, "g", 0, Outcome::Updated, None).await.unwrap());
        assert!(tracker
            .update(&id, "g", 1, Outcome::Skipped, Some("SKU X: bad"))
            .await
            .unwrap());
        assert!(tracker.update(&id, "g", 2, Outcome::Updated, None).await.unwrap());

        let snapshot = tracker.get(&id).await.unwrap().unwrap();
        assert_eq!(
            (snapshot.processed, snapshot.created, snapshot.updated, snapshot.skipped),
            (3, 1, 1, 1)
        );
        assert_eq!(snapshot.errors, vec!["SKU X: bad".to_string()]);
        assert_balanced(&snapshot);
    }

    #[tokio::test]
    async fn counters_freeze_once_terminal() {
        let tracker = tracker().await;
        let id = ImportId::from("imp_1_1000");
        tracker.init(&id, 5, false, 0).await.unwrap();
        tracker.update(&id, "g", 0, Outcome::Created, None).await.unwrap();

        assert!(tracker.set_status(&id, JobStatus::Cancelled).await.unwrap());
        assert!(!tracker.set_status(&id, JobStatus::Complete).await.unwrap());
        assert!(!tracker.update(&id, "g", 1, Outcome::Created, None).await.unwrap());
        assert!(!tracker.record_file(&id, 0, 10).await.unwrap());

        let snapshot = tracker.get(&id).await.unwrap().unwrap();
        assert_eq!(snapshot.status, JobStatus::Cancelled);
        assert_eq!(snapshot.processed, 1);
        assert_eq!(snapshot.total, 5);
        assert!(snapshot.completed_at.is_some());
        // the rolled back update left no ledger row
        assert!(tracker.recorded_indices(&id, "g", 0..5).await.unwrap().len() == 1);
    }

    #[tokio::test]
    async fn files_are_recorded_once() {
        let tracker = tracker().await;
        let id = ImportId::from("imp_1_1000");
        tracker.init(&id, 0, true, 2).await.unwrap();

        assert!(tracker.record_file(&id, 0, 40).await.unwrap());
        assert!(!tracker.record_file(&id, 0, 40).await.unwrap());
        assert!(tracker.record_file(&id, 1, 0).await.unwrap());
        assert_eq!(tracker.file_record_count(&id, 0).await.unwrap(), Some(40));
        assert_eq!(tracker.file_record_count(&id, 5).await.unwrap(), None);

        let snapshot = tracker.get(&id).await.unwrap().unwrap();
        assert_eq!((snapshot.total, snapshot.files_processed), (40, 2));
    }

    #[tokio::test]
    async fn reconcile_skips_only_uncounted_records() {
        let tracker = tracker().await;
        let id = ImportId::from("imp_1_1000");
        tracker.init(&id, 10, false, 0).await.unwrap();
        tracker.update(&id, "g", 2, Outcome::Created, None).await.unwrap();

        let counted = tracker.reconcile(&id, "g", 0..5, "batch lost").await.unwrap();
        assert_eq!(counted, 4);
        assert_eq!(tracker.reconcile(&id, "g", 0..5, "batch lost").await.unwrap(), 0);

        let snapshot = tracker.get(&id).await.unwrap().unwrap();
        assert_eq!((snapshot.processed, snapshot.skipped), (5, 4));
        assert_eq!(snapshot.error_count, 1);
        assert_balanced(&snapshot);
    }

    #[tokio::test]
    async fn reconcile_leaves_owned_records_alone() {
        let tracker = tracker().await;
        let id = ImportId::from("imp_1_1000");
        tracker.init(&id, 6, false, 0).await.unwrap();
        tracker.update(&id, "g", 0, Outcome::Created, None).await.unwrap();

        let owned: HashSet<usize> = (2..4).collect();
        let counted = tracker
            .reconcile_except(&id, "g", 0..6, &owned, "file lost")
            .await
            .unwrap();
        assert_eq!(counted, 3);
        assert_eq!(tracker.recorded_indices(&id, "g", 0..6).await.unwrap().len(), 4);

        let snapshot = tracker.get(&id).await.unwrap().unwrap();
        assert_eq!((snapshot.processed, snapshot.skipped), (4, 3));
        assert_balanced(&snapshot);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("progress.db").display());
        let tracker = ProgressTracker::new(crate::db::connect(&url).await.unwrap());
        let id = ImportId::from("imp_1_1000");
        let (groups, per_group) = (4, 50);
        tracker.init(&id, groups * per_group, false, 0).await.unwrap();

        // every record is delivered twice, from different tasks
        let deliveries = (0..2).flat_map(|_| {
            (0..groups).flat_map(move |group| (0..per_group).map(move |index| (group, index)))
        });
        let handles = deliveries
            .map(|(group, index)| {
                let tracker = tracker.clone();
                let id = id.clone();
                tokio::spawn(async move {
                    let outcome = match index % 3 {
                        0 => Outcome::Created,
                        1 => Outcome::Updated,
                        _ => Outcome::Skipped,
                    };
                    let error = (outcome == Outcome::Skipped).then(|| format!("record {index}"));
                    tracker
                        .update(&id, &format!("g{group}"), index, outcome, error.as_deref())
                        .await
                        .unwrap()
                })
            })
            .collect::<Vec<_>>();

        let counted = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|counted| *counted.as_ref().unwrap())
            .count();
        assert_eq!(counted, groups * per_group);

        let snapshot = tracker.get(&id).await.unwrap().unwrap();
        assert_eq!(snapshot.processed, (groups * per_group) as u64);
        assert_eq!(
            (snapshot.created, snapshot.updated, snapshot.skipped),
            (68, 68, 64)
        );
        assert_eq!(snapshot.error_count, 64);
        assert_balanced(&snapshot);
    }

    #[tokio::test]
    async fn snapshot_keeps_only_recent_errors() {
        let tracker = tracker().await;
        let id = ImportId::from("imp_1_1000");
        tracker.init(&id, 0, false, 0).await.unwrap();
        for i in 0..15 {
            tracker.append_error(&id, &format!("error {i}")).await.unwrap();
        }
        let snapshot = tracker.get(&id).await.unwrap().unwrap();
        assert_eq!(snapshot.error_count, 15);
        assert_eq!(snapshot.errors.len(), 10);
        assert_eq!(snapshot.errors.first().unwrap(), "error 5");
        assert_eq!(snapshot.errors.last().unwrap(), "error 14");
    }

    #[tokio::test]
    async fn latest_active_list_and_delete() {
        let tracker = tracker().await;
        let first = ImportId::from("imp_1_1000");
        let second = ImportId::from("imp_2_2000");
        tracker.init(&first, 1, false, 0).await.unwrap();
        tracker.init(&second, 1, false, 0).await.unwrap();

        assert_eq!(tracker.latest_active().await.unwrap(), Some(second.clone()));
        tracker.set_status(&second, JobStatus::Complete).await.unwrap();
        assert_eq!(tracker.latest_active().await.unwrap(), Some(first.clone()));

        let listed: Vec<ImportId> = tracker
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.import_id)
            .collect();
        assert_eq!(listed, vec![second.clone(), first.clone()]);

        tracker.delete(&first).await.unwrap();
        assert!(tracker.get(&first).await.unwrap().is_none());
        assert!(!tracker.is_processing(&first).await.unwrap());
        assert_eq!(tracker.latest_active().await.unwrap(), None);
    }
}
