//! Environment-supplied job configuration.

use std::env;

use anyhow::{Context, Result};

pub const DEFAULT_MAX_DECISION_RECORDS_PER_PARQUET: usize = 100_000;

#[derive(Debug, Clone)]
pub struct Config {
    /// Bucket holding the partition store.
    pub train_bucket: String,
    /// Bucket the incoming firehose files arrive in.
    pub firehose_bucket: String,
    /// Key of the firehose file this invocation processes.
    pub incoming_firehose_key: String,
    /// RDPs processed concurrently within this process.
    pub thread_worker_count: usize,
    /// Size of the array job this process is one node of.
    pub reward_assignment_worker_count: usize,
    /// This node's index within the array job.
    pub batch_job_array_index: usize,
    /// 1-based attempt counter from the batch runtime; drives backoff.
    pub batch_job_attempt: u32,
    /// Row cap per partition object; larger merges split into chunks.
    pub parquet_file_max_decision_records: usize,
    pub debug: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            train_bucket: required("TRAIN_BUCKET")?,
            firehose_bucket: required("FIREHOSE_BUCKET")?,
            incoming_firehose_key: required("INCOMING_FIREHOSE_S3_KEY")?,
            thread_worker_count: parsed("THREAD_WORKER_COUNT", default_worker_count())?,
            reward_assignment_worker_count: parsed("REWARD_ASSIGNMENT_WORKER_COUNT", 1)?,
            batch_job_array_index: parsed("AWS_BATCH_JOB_ARRAY_INDEX", 0)?,
            batch_job_attempt: parsed("BATCH_JOB_ATTEMPT", 1)?,
            parquet_file_max_decision_records: parsed(
                "PARQUET_FILE_MAX_DECISION_RECORDS",
                DEFAULT_MAX_DECISION_RECORDS_PER_PARQUET,
            )?,
            debug: flag("DEBUG"),
        })
    }
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

fn required(name: &str) -> Result<String> {
    env::var(name).with_context(|| format!("{name} must be set"))
}

fn parsed<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("{name} has invalid value {value:?}")),
        Err(_) => Ok(default),
    }
}

fn flag(name: &str) -> bool {
    env::var(name).map_or(false, |value| is_truthy(&value))
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthy_values() {
        for value in ["1", "true", "TRUE", " yes ", "on"] {
            assert!(is_truthy(value), "value {value:?}");
        }
        for value in ["", "0", "false", "off", "no"] {
            assert!(!is_truthy(value), "value {value:?}");
        }
    }
}
