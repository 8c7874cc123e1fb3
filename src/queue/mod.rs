use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SchedulingError;
use crate::id::ImportId;

mod sqlite;
mod worker;

pub use sqlite::{ClaimedTask, SqliteTaskQueue};
pub use worker::{TaskHandler, Worker, WorkerOptions};

pub type TaskId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    ParseFile,
    ImportBatch,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::ParseFile => "parse_file",
            TaskKind::ImportBatch => "import_batch",
        }
    }
}

/// Parses one source file of a job and schedules its batches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileParseUnit {
    pub import_id: ImportId,
    pub file_index: usize,
    pub file_path: String,
    pub file_name: String,
}

/// Imports one slice of a stored record group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchUnit {
    pub import_id: ImportId,
    pub group_id: String,
    pub batch_index: usize,
    pub batch_size: usize,
}

impl BatchUnit {
    pub fn offset(&self) -> usize {
        self.batch_index * self.batch_size
    }
}

/// A queued description of deferred work. Never carries record payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "unit", rename_all = "snake_case")]
pub enum WorkUnit {
    ParseFile(FileParseUnit),
    ImportBatch(BatchUnit),
}

impl WorkUnit {
    pub fn kind(&self) -> TaskKind {
        match self {
            WorkUnit::ParseFile(_) => TaskKind::ParseFile,
            WorkUnit::ImportBatch(_) => TaskKind::ImportBatch,
        }
    }

    pub fn import_id(&self) -> &ImportId {
        match self {
            WorkUnit::ParseFile(unit) => &unit.import_id,
            WorkUnit::ImportBatch(unit) => &unit.import_id,
        }
    }
}

/// A durable queue of work units, grouped by tag.
#[async_trait::async_trait]
pub trait TaskQueue: Send + Sync {
    async fn submit(
        &self,
        unit: &WorkUnit,
        tag: &str,
        not_before: DateTime<Utc>,
    ) -> Result<TaskId, SchedulingError>;

    /// Drops every not-yet-started task carrying `tag`. Returns how many were removed.
    async fn cancel_all_tagged(&self, tag: &str) -> Result<u64, SchedulingError>;

    /// Counts tasks of `kind` under `tag` that have not started yet.
    async fn list_pending(&self, kind: TaskKind, tag: &str) -> Result<u64, SchedulingError>;

    /// Units under `tag` that are waiting or running.
    async fn queued_units(&self, tag: &str) -> Result<Vec<WorkUnit>, SchedulingError>;
}
