use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{ServiceError, UploadError};
use crate::id::ImportId;
use crate::pipeline::Pipeline;
use crate::progress::ProgressSnapshot;
use crate::record::NormalizedRecord;
use crate::scheduler::BatchSize;
use crate::upload::{SourceFile, Upload, UploadKind, Uploads};

/// Source files for a file-streaming import.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartImport {
    pub files: Vec<SourceFile>,
    pub batch_size: Option<BatchSize>,
    pub images_dir: Option<PathBuf>,
    /// Staging directory removed with the job.
    pub scratch_dir: Option<PathBuf>,
}

impl From<Upload> for StartImport {
    fn from(upload: Upload) -> Self {
        StartImport {
            files: upload.files,
            batch_size: None,
            images_dir: upload.images_dir,
            scratch_dir: Some(upload.scratch_dir),
        }
    }
}

/// The inbound interface: uploads, job control and progress.
#[derive(Clone)]
pub struct ImportService {
    pipeline: Pipeline,
    uploads: Uploads,
    default_batch_size: BatchSize,
}

impl ImportService {
    pub fn new(pipeline: Pipeline, uploads: Uploads, default_batch_size: BatchSize) -> Self {
        ImportService {
            pipeline,
            uploads,
            default_batch_size,
        }
    }

    pub async fn upload_file(
        &self,
        bytes: Vec<u8>,
        name: &str,
        kind: UploadKind,
    ) -> Result<Upload, ServiceError> {
        Ok(self.uploads.stage(bytes, name, kind).await?)
    }

    pub async fn start_import(&self, request: StartImport) -> Result<ImportId, ServiceError> {
        if let Some(dir) = &request.scratch_dir {
            if !self.uploads.owns(dir) {
                return Err(UploadError::OutsideRoot(dir.clone()).into());
            }
        }
        let batch_size = request.batch_size.unwrap_or(self.default_batch_size);
        let id = self
            .pipeline
            .scheduler
            .schedule_files(request.files, batch_size, request.images_dir, request.scratch_dir)
            .await?;
        Ok(id)
    }

    pub async fn start_direct(
        &self,
        records: Vec<NormalizedRecord>,
        batch_size: Option<BatchSize>,
    ) -> Result<ImportId, ServiceError> {
        let batch_size = batch_size.unwrap_or(self.default_batch_size);
        Ok(self
            .pipeline
            .scheduler
            .schedule_records(records, batch_size)
            .await?)
    }

    /// Resolves an explicit id, or the latest job still processing.
    async fn resolve(&self, id: Option<&ImportId>) -> Result<ImportId, ServiceError> {
        match id {
            Some(id) => Ok(id.clone()),
            None => self
                .pipeline
                .progress
                .latest_active()
                .await?
                .ok_or(ServiceError::NoActiveImport),
        }
    }

    pub async fn get_progress(&self, id: Option<&ImportId>) -> Result<ProgressSnapshot, ServiceError> {
        let id = self.resolve(id).await?;
        let mut snapshot = self
            .pipeline
            .progress
            .get(&id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(id.clone()))?;
        let (files, batches) = self.pipeline.scheduler.pending_units(&id).await?;
        snapshot.pending_units = files + batches;
        Ok(snapshot)
    }

    pub async fn cancel_import(&self, id: Option<&ImportId>) -> Result<ProgressSnapshot, ServiceError> {
        let id = self.resolve(id).await?;
        if self.pipeline.progress.get(&id).await?.is_none() {
            return Err(ServiceError::NotFound(id));
        }
        self.pipeline.scheduler.cancel(&id).await?;
        self.get_progress(Some(&id)).await
    }

    /// Removes a job and everything it stored. Without an id, the active job is
    /// cleaned up if there is one.
    pub async fn cleanup(&self, id: Option<&ImportId>) -> Result<(), ServiceError> {
        let id = match self.resolve(id).await {
            Ok(id) => id,
            Err(ServiceError::NoActiveImport) => return Ok(()),
            Err(e) => return Err(e),
        };
        self.pipeline.scheduler.cleanup(&id).await?;
        Ok(())
    }

    pub async fn list_imports(&self) -> Result<Vec<ProgressSnapshot>, ServiceError> {
        let mut jobs = self.pipeline.progress.list().await?;
        for job in &mut jobs {
            let (files, batches) = self.pipeline.scheduler.pending_units(&job.import_id).await?;
            job.pending_units = files + batches;
        }
        Ok(jobs)
    }
}
