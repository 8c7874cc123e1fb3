use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::pipeline::PipelineOptions;
use crate::queue::WorkerOptions;
use crate::scheduler::{BatchSize, ScheduleOptions};

/// Process configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub chunk_size: usize,
    pub max_value_bytes: usize,
    pub read_window_rows: usize,
    pub default_batch_size: BatchSize,
    pub batch_stagger: Duration,
    pub file_stagger: Duration,
    pub worker_concurrency: usize,
    pub worker_poll: Duration,
    pub task_max_attempts: u32,
}

fn var_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map_err(|e| anyhow!("invalid {name}={value}: {e}")),
        _ => Ok(default),
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Ok(Settings {
            data_dir: PathBuf::from(env::var("DATA_DIR").context("DATA_DIR must be set")?),
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            host: env::var("IMPORT_HOST").unwrap_or("0.0.0.0".to_string()),
            port: var_or("IMPORT_PORT", 8000)?,
            chunk_size: var_or("CHUNK_SIZE", crate::store::DEFAULT_CHUNK_SIZE)?,
            max_value_bytes: var_or("MAX_VALUE_BYTES", crate::store::DEFAULT_MAX_VALUE_BYTES)?,
            read_window_rows: var_or("READ_WINDOW_ROWS", crate::reader::DEFAULT_WINDOW_ROWS)?,
            default_batch_size: var_or("DEFAULT_BATCH_SIZE", BatchSize::default())?,
            batch_stagger: Duration::from_secs(var_or("BATCH_STAGGER_SECS", 2)?),
            file_stagger: Duration::from_secs(var_or("FILE_STAGGER_SECS", 5)?),
            worker_concurrency: var_or("WORKER_CONCURRENCY", 2)?,
            worker_poll: Duration::from_millis(var_or("WORKER_POLL_MS", 500)?),
            task_max_attempts: var_or("TASK_MAX_ATTEMPTS", 3)?,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            chunk_size: self.chunk_size,
            read_window_rows: self.read_window_rows,
            schedule: ScheduleOptions {
                batch_stagger: self.batch_stagger,
                file_stagger: self.file_stagger,
                scratch_root: Some(self.uploads_dir()),
            },
            worker: WorkerOptions {
                concurrency: self.worker_concurrency,
                poll_interval: self.worker_poll,
                max_attempts: self.task_max_attempts.max(1),
                ..WorkerOptions::default()
            },
        }
    }
}
