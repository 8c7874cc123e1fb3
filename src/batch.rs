use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::importer::{ImportContext, Importer};
use crate::parent_map::ParentMaps;
use crate::progress::{Outcome, ProgressTracker};
use crate::queue::BatchUnit;
use crate::scheduler::Scheduler;
use crate::store::RecordStore;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
}

impl BatchSummary {
    fn count(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Created => self.created += 1,
            Outcome::Updated => self.updated += 1,
            Outcome::Skipped => self.skipped += 1,
        }
    }
}

/// Runs the records of one batch unit through the importer.
pub struct BatchProcessor {
    store: RecordStore,
    progress: ProgressTracker,
    importer: Importer,
    scheduler: Scheduler,
    parents: Arc<ParentMaps>,
}

impl BatchProcessor {
    pub fn new(
        store: RecordStore,
        progress: ProgressTracker,
        importer: Importer,
        scheduler: Scheduler,
        parents: Arc<ParentMaps>,
    ) -> Self {
        BatchProcessor {
            store,
            progress,
            importer,
            scheduler,
            parents,
        }
    }

    pub async fn run(&self, unit: &BatchUnit) -> Result<BatchSummary> {
        let id = &unit.import_id;
        let group = unit.group_id.as_str();
        let mut summary = BatchSummary::default();

        if !self.progress.is_processing(id).await? {
            debug!(import_id = %id, group, batch = unit.batch_index, "Job not processing, skipping batch");
            return Ok(summary);
        }

        let start = Instant::now();
        let offset = unit.offset();
        let records = self.store.fetch_range(group, offset, unit.batch_size).await?;
        if records.is_empty() {
            warn!(import_id = %id, group, batch = unit.batch_index, "No records for batch");
            self.scheduler.check_completion(id).await?;
            return Ok(summary);
        }

        let images_dir = self
            .scheduler
            .load_config(id)
            .await?
            .and_then(|config| config.images_dir);
        let parents = self.parents.for_job(id).await;
        let ctx = ImportContext {
            parents: &parents,
            images_dir: images_dir.as_deref(),
        };

        // a redelivered batch resumes after the records it already counted
        let done = self
            .progress
            .recorded_indices(id, group, offset..offset + records.len())
            .await?;

        for (index, record) in (offset..).zip(records.iter()) {
            if done.contains(&index) {
                continue;
            }
            if !self.progress.is_processing(id).await? {
                info!(import_id = %id, group, batch = unit.batch_index, "Job stopped, leaving batch");
                break;
            }

            let (outcome, error) = match self.importer.import_one(record, &ctx).await {
                Ok(imported) => (imported.outcome(), None),
                Err(e) => {
                    debug!(import_id = %id, sku = record.sku_label(), error = %e, "Record skipped");
                    (
                        Outcome::Skipped,
                        Some(format!("SKU {}: {}", record.sku_label(), e)),
                    )
                }
            };
            if self
                .progress
                .update(id, group, index, outcome, error.as_deref())
                .await?
            {
                summary.count(outcome);
            }
        }

        info!(
            import_id = %id,
            group,
            batch = unit.batch_index,
            created = summary.created,
            updated = summary.updated,
            skipped = summary.skipped,
            "Imported batch in {:?}",
            start.elapsed()
        );
        self.scheduler.check_completion(id).await?;
        Ok(summary)
    }

    /// Counts the never-processed records of a batch the queue gave up on as skipped.
    pub async fn abandon(&self, unit: &BatchUnit, error: &str) -> Result<()> {
        let id = &unit.import_id;
        let Some(meta) = self.store.meta(&unit.group_id).await? else {
            warn!(import_id = %id, group = %unit.group_id, "Abandoned batch has no stored records");
            return Ok(());
        };
        let start = unit.offset().min(meta.total);
        let end = (unit.offset() + unit.batch_size).min(meta.total);
        let message = format!("Batch {} of {}: {}", unit.batch_index, unit.group_id, error);
        let counted = self
            .progress
            .reconcile(id, &unit.group_id, start..end, &message)
            .await?;
        warn!(import_id = %id, group = %unit.group_id, batch = unit.batch_index, counted, "Reconciled abandoned batch");
        self.scheduler.check_completion(id).await?;
        Ok(())
    }
}
