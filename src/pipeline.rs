use std::sync::Arc;

use anyhow::Result;
use sqlx::SqlitePool;
use tokio::{sync::watch, task::JoinHandle};

use crate::batch::BatchProcessor;
use crate::catalog::Catalog;
use crate::importer::Importer;
use crate::parent_map::ParentMaps;
use crate::progress::ProgressTracker;
use crate::queue::{SqliteTaskQueue, TaskHandler, WorkUnit, Worker, WorkerOptions};
use crate::reader::{TabularReader, DEFAULT_WINDOW_ROWS};
use crate::scheduler::{ScheduleOptions, Scheduler};
use crate::store::{KeyValueStore, RecordStore, DEFAULT_CHUNK_SIZE};

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub chunk_size: usize,
    pub read_window_rows: usize,
    pub schedule: ScheduleOptions,
    pub worker: WorkerOptions,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        PipelineOptions {
            chunk_size: DEFAULT_CHUNK_SIZE,
            read_window_rows: DEFAULT_WINDOW_ROWS,
            schedule: ScheduleOptions::default(),
            worker: WorkerOptions::default(),
        }
    }
}

/// Routes claimed units to the scheduler or the batch processor.
struct Dispatcher {
    scheduler: Scheduler,
    processor: BatchProcessor,
}

#[async_trait::async_trait]
impl TaskHandler for Dispatcher {
    async fn handle(&self, unit: &WorkUnit) -> Result<()> {
        match unit {
            WorkUnit::ParseFile(unit) => self.scheduler.run_file_unit(unit).await,
            WorkUnit::ImportBatch(unit) => self.processor.run(unit).await.map(|_| ()),
        }
    }

    async fn abandon(&self, unit: &WorkUnit, error: &str) -> Result<()> {
        match unit {
            WorkUnit::ParseFile(unit) => self.scheduler.abandon_file_unit(unit, error).await,
            WorkUnit::ImportBatch(unit) => self.processor.abandon(unit, error).await,
        }
    }
}

/// The import core wired together: record store, queue, progress, scheduler and workers.
#[derive(Clone)]
pub struct Pipeline {
    pub progress: ProgressTracker,
    pub scheduler: Scheduler,
    pub queue: SqliteTaskQueue,
    worker: Arc<Worker>,
}

impl Pipeline {
    pub fn new(
        pool: SqlitePool,
        kv: Arc<dyn KeyValueStore>,
        catalog: Arc<dyn Catalog>,
        options: PipelineOptions,
    ) -> Self {
        let store = RecordStore::new(kv, options.chunk_size);
        let queue = SqliteTaskQueue::new(pool.clone());
        let progress = ProgressTracker::new(pool);
        let parents = Arc::new(ParentMaps::new());

        let scheduler = Scheduler::new(
            store.clone(),
            Arc::new(queue.clone()),
            progress.clone(),
            TabularReader::new(options.read_window_rows),
            parents.clone(),
            options.schedule,
        );
        let processor = BatchProcessor::new(
            store,
            progress.clone(),
            Importer::new(catalog),
            scheduler.clone(),
            parents,
        );
        let dispatcher = Arc::new(Dispatcher {
            scheduler: scheduler.clone(),
            processor,
        });
        let worker = Arc::new(Worker::new(queue.clone(), dispatcher, options.worker));

        Pipeline {
            progress,
            scheduler,
            queue,
            worker,
        }
    }

    /// Requeues tasks interrupted by a previous run and starts the worker loops.
    pub async fn start_workers(&self, shutdown: watch::Receiver<bool>) -> Result<Vec<JoinHandle<()>>> {
        self.queue.requeue_running().await?;
        Ok(self.worker.clone().spawn(shutdown))
    }

    /// Runs every due unit in the current task, including the units they queue.
    pub async fn drain(&self) -> Result<usize> {
        self.worker.drain().await
    }
}
