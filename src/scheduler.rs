use std::collections::HashSet;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{SchedulingError, StorageError};
use crate::id::ImportId;
use crate::parent_map::ParentMaps;
use crate::progress::{JobStatus, ProgressSnapshot, ProgressTracker};
use crate::queue::{BatchUnit, FileParseUnit, TaskKind, TaskQueue, WorkUnit};
use crate::reader::TabularReader;
use crate::record::{sort_for_import, NormalizedRecord};
use crate::store::{get_json, put_json, RecordStore};
use crate::upload::{is_below, SourceFile};

pub const DEFAULT_BATCH_SIZE: usize = 25;

/// Records per batch unit. `All` puts a whole group in one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchSize {
    All,
    Fixed(usize),
}

impl Default for BatchSize {
    fn default() -> Self {
        BatchSize::Fixed(DEFAULT_BATCH_SIZE)
    }
}

impl BatchSize {
    /// Batch length for a group of `total` records.
    pub fn resolve(&self, total: usize) -> usize {
        match self {
            BatchSize::All => total.max(1),
            BatchSize::Fixed(size) => (*size).max(1),
        }
    }
}

impl Display for BatchSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchSize::All => f.write_str("all"),
            BatchSize::Fixed(size) => write!(f, "{size}"),
        }
    }
}

impl FromStr for BatchSize {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("all") {
            return Ok(BatchSize::All);
        }
        match value.parse::<usize>() {
            Ok(size) if size > 0 => Ok(BatchSize::Fixed(size)),
            _ => Err(format!("invalid batch size: {value}")),
        }
    }
}

impl Serialize for BatchSize {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            BatchSize::All => serializer.serialize_str("all"),
            BatchSize::Fixed(size) => serializer.serialize_u64(*size as u64),
        }
    }
}

impl<'de> Deserialize<'de> for BatchSize {
    fn deserialize<D>(deserializer: D) -> Result<BatchSize, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Size(usize),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Size(0) => Err(serde::de::Error::custom("batch size must be positive")),
            Raw::Size(size) => Ok(BatchSize::Fixed(size)),
            Raw::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Per-job settings kept next to the job's records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportConfig {
    pub batch_size: BatchSize,
    pub images_dir: Option<PathBuf>,
    pub files: Vec<SourceFile>,
    pub scratch_dir: Option<PathBuf>,
}

fn config_key(id: &ImportId) -> String {
    format!("import_config:{id}")
}

#[derive(Debug, Clone)]
pub struct ScheduleOptions {
    pub batch_stagger: Duration,
    pub file_stagger: Duration,
    /// Scratch directories are only removed below this root.
    pub scratch_root: Option<PathBuf>,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        ScheduleOptions {
            batch_stagger: Duration::from_secs(2),
            file_stagger: Duration::from_secs(5),
            scratch_root: None,
        }
    }
}

/// True once nothing is left to do for a processing job, in either mode.
pub fn completion_ready(progress: &ProgressSnapshot, pending_files: u64, pending_batches: u64) -> bool {
    progress.status == JobStatus::Processing
        && progress.files_processed >= progress.total_files
        && (progress.total > 0 || progress.file_based)
        && progress.processed >= progress.total
        && pending_files == 0
        && pending_batches == 0
}

/// Turns record sets and source files into queued work units, and owns the
/// terminal transitions of a job.
#[derive(Clone)]
pub struct Scheduler {
    store: RecordStore,
    queue: Arc<dyn TaskQueue>,
    progress: ProgressTracker,
    reader: TabularReader,
    parents: Arc<ParentMaps>,
    options: ScheduleOptions,
}

impl Scheduler {
    pub fn new(
        store: RecordStore,
        queue: Arc<dyn TaskQueue>,
        progress: ProgressTracker,
        reader: TabularReader,
        parents: Arc<ParentMaps>,
        options: ScheduleOptions,
    ) -> Self {
        Scheduler {
            store,
            queue,
            progress,
            reader,
            parents,
            options,
        }
    }

    pub async fn load_config(&self, id: &ImportId) -> Result<Option<ImportConfig>, StorageError> {
        get_json(self.store.kv(), &config_key(id)).await
    }

    /// Direct mode: stores `records` as one group and queues its batches.
    pub async fn schedule_records(
        &self,
        mut records: Vec<NormalizedRecord>,
        batch_size: BatchSize,
    ) -> Result<ImportId, SchedulingError> {
        let id = ImportId::generate();
        let total = records.len();
        sort_for_import(&mut records);

        self.parents.reset(&id).await;
        self.progress.init(&id, total, false, 0).await?;
        let config = ImportConfig {
            batch_size,
            images_dir: None,
            files: Vec::new(),
            scratch_dir: None,
        };

        let result = async {
            put_json(self.store.kv(), &config_key(&id), &config).await?;
            if total == 0 {
                return Ok(());
            }
            let group = id.direct_group();
            self.store.store_chunked(&group, &records).await?;
            drop(records);
            self.submit_batches(&id, &group, total, batch_size.resolve(total), 0)
                .await
        }
        .await;

        if let Err(e) = result {
            self.abort(&id).await;
            return Err(e);
        }

        info!(import_id = %id, total, %batch_size, "Scheduled import");
        if total == 0 {
            // nothing will ever run for an empty record set
            self.complete(&id).await?;
        }
        Ok(id)
    }

    /// File-streaming mode: one parse unit per file, each scheduling its own batches.
    pub async fn schedule_files(
        &self,
        files: Vec<SourceFile>,
        batch_size: BatchSize,
        images_dir: Option<PathBuf>,
        scratch_dir: Option<PathBuf>,
    ) -> Result<ImportId, SchedulingError> {
        if files.is_empty() {
            return Err(SchedulingError::NoFiles);
        }
        let id = ImportId::generate();
        let file_count = files.len();

        self.parents.reset(&id).await;
        self.progress.init(&id, 0, true, file_count).await?;

        let config = ImportConfig {
            batch_size,
            images_dir,
            files,
            scratch_dir,
        };
        let result = async {
            put_json(self.store.kv(), &config_key(&id), &config).await?;
            let now = Utc::now();
            for (index, file) in config.files.iter().enumerate() {
                let unit = WorkUnit::ParseFile(FileParseUnit {
                    import_id: id.clone(),
                    file_index: index,
                    file_path: file.path.to_string_lossy().into_owned(),
                    file_name: file.name.clone(),
                });
                let not_before = now + stagger(self.options.file_stagger, index)?;
                self.queue.submit(&unit, id.tag(), not_before).await?;
            }
            Ok::<_, SchedulingError>(())
        }
        .await;

        if let Err(e) = result {
            self.abort(&id).await;
            return Err(e);
        }

        info!(import_id = %id, files = file_count, %batch_size, "Scheduled file import");
        Ok(id)
    }

    /// Queues `ceil(total / batch_size)` batches of `group`, placed after
    /// `already_pending` batches of the same job.
    async fn submit_batches(
        &self,
        id: &ImportId,
        group: &str,
        total: usize,
        batch_size: usize,
        already_pending: usize,
    ) -> Result<(), SchedulingError> {
        let now = Utc::now();
        for batch_index in 0..total.div_ceil(batch_size) {
            let unit = WorkUnit::ImportBatch(BatchUnit {
                import_id: id.clone(),
                group_id: group.to_string(),
                batch_index,
                batch_size,
            });
            let not_before = now + stagger(self.options.batch_stagger, already_pending + batch_index)?;
            self.queue.submit(&unit, id.tag(), not_before).await?;
        }
        debug!(import_id = %id, group, total, batch_size, "Queued batches");
        Ok(())
    }

    /// Undoes a job whose scheduling failed part way.
    async fn abort(&self, id: &ImportId) {
        warn!(import_id = %id, "Scheduling failed, removing job");
        if let Err(e) = self.queue.cancel_all_tagged(id.tag()).await {
            error!(import_id = %id, error = %e, "Failed to cancel queued units");
        }
        if let Err(e) = self.purge(id).await {
            error!(import_id = %id, error = %e, "Failed to remove stored records");
        }
        if let Err(e) = self.progress.delete(id).await {
            error!(import_id = %id, error = %e, "Failed to remove job record");
        }
    }

    /// Parses one source file, stores its records and queues their batches.
    pub async fn run_file_unit(&self, unit: &FileParseUnit) -> Result<()> {
        let id = &unit.import_id;
        if !self.progress.is_processing(id).await? {
            debug!(import_id = %id, file = %unit.file_name, "Job not processing, skipping file");
            return Ok(());
        }
        let Some(config) = self.load_config(id).await? else {
            warn!(import_id = %id, "No config for job, skipping file");
            return Ok(());
        };

        let start = Instant::now();
        let mut records = match self.reader.read_all(Path::new(&unit.file_path)).await {
            Ok(records) => records,
            Err(e) => {
                warn!(import_id = %id, file = %unit.file_name, error = %e, "Failed to read file");
                self.progress
                    .append_error(id, &format!("File {}: {}", unit.file_name, e))
                    .await?;
                self.progress.record_file(id, unit.file_index, 0).await?;
                self.check_completion(id).await?;
                return Ok(());
            }
        };

        let total = records.len();
        if total == 0 {
            self.progress.record_file(id, unit.file_index, 0).await?;
            self.check_completion(id).await?;
            return Ok(());
        }

        sort_for_import(&mut records);
        let group = id.file_group(unit.file_index);
        self.store.store_chunked(&group, &records).await?;
        drop(records);

        // a cancel during parsing has already purged the job
        if !self.progress.is_processing(id).await? {
            self.store.delete_all(&group).await?;
            return Ok(());
        }

        self.progress.record_file(id, unit.file_index, total).await?;

        let pending = self.queue.list_pending(TaskKind::ImportBatch, id.tag()).await? as usize;
        let batch_size = config.batch_size.resolve(total);
        if let Err(e) = self.submit_batches(id, &group, total, batch_size, pending).await {
            self.progress
                .append_error(
                    id,
                    &format!("File {}: failed to schedule batches: {}", unit.file_name, e),
                )
                .await?;
            return Err(e.into());
        }

        info!(
            import_id = %id,
            file = %unit.file_name,
            records = total,
            "Parsed file in {:?}",
            start.elapsed()
        );
        self.check_completion(id).await?;
        Ok(())
    }

    /// Settles a parse unit the queue gave up on, so the job can still finish.
    pub async fn abandon_file_unit(&self, unit: &FileParseUnit, error: &str) -> Result<()> {
        let id = &unit.import_id;
        match self.progress.file_record_count(id, unit.file_index).await? {
            None => {
                self.progress
                    .append_error(id, &format!("File {}: {}", unit.file_name, error))
                    .await?;
                self.progress.record_file(id, unit.file_index, 0).await?;
            }
            Some(count) => {
                // batches already queued for this file still import their own slices
                let group = id.file_group(unit.file_index);
                let owned: HashSet<usize> = self
                    .queue
                    .queued_units(id.tag())
                    .await?
                    .into_iter()
                    .filter_map(|queued| match queued {
                        WorkUnit::ImportBatch(batch) if batch.group_id == group => {
                            Some(batch.offset()..batch.offset() + batch.batch_size)
                        }
                        _ => None,
                    })
                    .flatten()
                    .collect();
                let message = format!("File {}: records not imported: {}", unit.file_name, error);
                self.progress
                    .reconcile_except(id, &group, 0..count, &owned, &message)
                    .await?;
            }
        }
        self.check_completion(id).await?;
        Ok(())
    }

    pub async fn pending_units(&self, id: &ImportId) -> Result<(u64, u64), SchedulingError> {
        let files = self.queue.list_pending(TaskKind::ParseFile, id.tag()).await?;
        let batches = self.queue.list_pending(TaskKind::ImportBatch, id.tag()).await?;
        Ok((files, batches))
    }

    /// Completes the job if nothing is left to do. Returns true if this call completed it.
    pub async fn check_completion(&self, id: &ImportId) -> Result<bool, SchedulingError> {
        let Some(progress) = self.progress.get(id).await? else {
            return Ok(false);
        };
        if progress.status != JobStatus::Processing {
            return Ok(false);
        }
        let (pending_files, pending_batches) = self.pending_units(id).await?;
        if !completion_ready(&progress, pending_files, pending_batches) {
            return Ok(false);
        }
        self.complete(id).await
    }

    async fn complete(&self, id: &ImportId) -> Result<bool, SchedulingError> {
        if !self.progress.set_status(id, JobStatus::Complete).await? {
            return Ok(false);
        }
        self.purge(id).await?;
        info!(import_id = %id, "Import complete");
        Ok(true)
    }

    /// Stops a processing job. Returns false if it was not processing.
    pub async fn cancel(&self, id: &ImportId) -> Result<bool, SchedulingError> {
        let removed = self.queue.cancel_all_tagged(id.tag()).await?;
        let cancelled = self.progress.set_status(id, JobStatus::Cancelled).await?;
        self.purge(id).await?;
        if cancelled {
            info!(import_id = %id, removed, "Import cancelled");
        }
        Ok(cancelled)
    }

    /// Removes everything a job left behind, including its record.
    pub async fn cleanup(&self, id: &ImportId) -> Result<(), SchedulingError> {
        self.queue.cancel_all_tagged(id.tag()).await?;
        self.purge(id).await?;
        self.progress.delete(id).await?;
        info!(import_id = %id, "Import cleaned up");
        Ok(())
    }

    /// Deletes stored records, config and scratch files. The job record stays.
    async fn purge(&self, id: &ImportId) -> Result<(), StorageError> {
        let config = self.load_config(id).await?;

        self.store.delete_all(&id.direct_group()).await?;
        let file_count = config.as_ref().map_or(0, |config| config.files.len());
        for index in 0..file_count {
            self.store.delete_all(&id.file_group(index)).await?;
        }
        self.store.kv().delete(&config_key(id)).await?;
        self.parents.remove(id).await;

        if let Some(dir) = config.and_then(|config| config.scratch_dir) {
            self.remove_scratch_dir(&dir).await;
        }
        Ok(())
    }

    async fn remove_scratch_dir(&self, dir: &Path) {
        let Some(root) = &self.options.scratch_root else {
            return;
        };
        if !is_below(root, dir) {
            warn!(?dir, "Not removing directory outside the upload root");
            return;
        }
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => debug!(?dir, "Removed scratch directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(?dir, error = %e, "Failed to remove scratch directory"),
        }
    }
}

fn stagger(step: Duration, index: usize) -> Result<chrono::Duration, SchedulingError> {
    let offset = step
        .checked_mul(index as u32)
        .ok_or_else(|| SchedulingError::Rejected("schedule offset overflow".to_string()))?;
    chrono::Duration::from_std(offset).map_err(|e| SchedulingError::Rejected(e.to_string()))
}
