//! Job orchestration.
//!
//! One invocation processes one firehose file: load and group records,
//! plan the partitions, process them on a bounded thread pool, then run
//! the per-model repair pass serially. A termination signal flips a
//! process-wide flag; partitions check it on entry, in-flight work
//! finishes, and the remainder is left for the next attempt.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use log::{error, info};
use rand::Rng;

use crate::config::Config;
use crate::firehose::load_groups;
use crate::partition::RewardedDecisionPartition;
use crate::repair::repair_overlapping_keys;
use crate::stats::IngestStats;
use crate::store::ObjectStore;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

pub fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGTERM, handle_shutdown_signal as libc::sighandler_t);
        libc::signal(libc::SIGINT, handle_shutdown_signal as libc::sighandler_t);
    }
}

extern "C" fn handle_shutdown_signal(_signal: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

/// Process the configured firehose file end to end.
pub fn run(
    config: &Config,
    firehose: &dyn ObjectStore,
    train: &dyn ObjectStore,
    stats: &IngestStats,
) -> Result<()> {
    backoff_before_retry(config.batch_job_attempt);
    process_file(config, firehose, train, stats, &config.incoming_firehose_key)
}

/// Array-node entry point: list the incoming prefix, keep the files the
/// hash rule assigns to this node, and process them in sequence. Nodes
/// share no state; the key scheme plus repair absorb any overlap two
/// nodes create.
pub fn run_node(
    config: &Config,
    firehose: &dyn ObjectStore,
    train: &dyn ObjectStore,
    stats: &IngestStats,
    incoming_prefix: &str,
) -> Result<()> {
    backoff_before_retry(config.batch_job_attempt);

    let files = firehose.list_after(incoming_prefix, "")?;
    stats.record_list();
    let mine = select_incoming_files(
        &files,
        config.batch_job_array_index as u64,
        config.reward_assignment_worker_count as u64,
    );
    info!(
        "node {}/{} owns {} of {} incoming files",
        config.batch_job_array_index,
        config.reward_assignment_worker_count,
        mine.len(),
        files.len(),
    );
    for file in &mine {
        if shutdown_requested() {
            info!("terminated by signal; remaining files await the next attempt");
            break;
        }
        process_file(config, firehose, train, stats, file)?;
    }
    Ok(())
}

fn process_file(
    config: &Config,
    firehose: &dyn ObjectStore,
    train: &dyn ObjectStore,
    stats: &IngestStats,
    incoming_key: &str,
) -> Result<()> {
    if shutdown_requested() {
        info!("termination requested before start; nothing processed");
        return Ok(());
    }

    let groups = load_groups(firehose, train, incoming_key, stats)?;

    let mut partitions = Vec::new();
    for group in &groups {
        partitions.extend(RewardedDecisionPartition::partitions_from_record_group(
            train, group, stats,
        )?);
    }
    let models: BTreeSet<String> = partitions
        .iter()
        .map(|partition| partition.model_name().to_string())
        .collect();
    info!(
        "processing {} partitions across {} models with {} workers",
        partitions.len(),
        models.len(),
        config.thread_worker_count,
    );

    let worker_count = config.thread_worker_count.clamp(1, partitions.len().max(1));
    let queue = Mutex::new(partitions.into_iter());
    let failures = AtomicUsize::new(0);
    std::thread::scope(|scope| {
        for _ in 0..worker_count {
            scope.spawn(|| loop {
                if shutdown_requested() {
                    break;
                }
                let next = queue.lock().expect("partition queue poisoned").next();
                let Some(mut partition) = next else { break };
                if let Err(err) =
                    partition.process(train, config.parquet_file_max_decision_records, stats)
                {
                    // One bad partition must not sink the batch; the
                    // failure is surfaced in the exit status below.
                    error!(
                        "partition for model {} failed: {err:#}",
                        partition.model_name()
                    );
                    stats.record_failed_partition();
                    failures.fetch_add(1, Ordering::Relaxed);
                }
            });
        }
    });

    if shutdown_requested() {
        info!("terminated by signal; completed partitions are durable, the rest await the next attempt");
        return Ok(());
    }

    // Concurrent writers may have produced overlapping partitions; one
    // model at a time keeps the largest overlap set within memory.
    for model in &models {
        repair_overlapping_keys(train, model, config.parquet_file_max_decision_records, stats)?;
    }

    let failures = failures.load(Ordering::Relaxed);
    if failures > 0 {
        bail!("{failures} partitions failed; a retry will reconcile them");
    }
    Ok(())
}

/// Uniform random wait in `[0, 60 * 2^(attempt - 2))` seconds.
///
/// Backoff runs across process attempts rather than as in-process retry
/// loops, so a failed attempt releases its resources first.
pub fn backoff_window_secs(attempt: u32) -> f64 {
    if attempt <= 1 {
        0.0
    } else {
        60.0 * f64::powi(2.0, attempt as i32 - 2)
    }
}

fn backoff_before_retry(attempt: u32) {
    let window = backoff_window_secs(attempt);
    if window <= 0.0 {
        return;
    }
    let wait = rand::thread_rng().gen::<f64>() * window;
    info!("job attempt {attempt}, waiting {wait:.1}s before resuming");
    std::thread::sleep(Duration::from_secs_f64(wait));
}

/// The subset of `files` this array-job node owns: the file's leading
/// hex digits, taken modulo the node count, select exactly one node.
pub fn select_incoming_files(
    files: &[String],
    worker_index: u64,
    worker_count: u64,
) -> Vec<String> {
    files
        .iter()
        .filter(|file| assigned_worker(file, worker_count) == worker_index)
        .cloned()
        .collect()
}

fn assigned_worker(file: &str, worker_count: u64) -> u64 {
    if worker_count <= 1 {
        return 0;
    }
    let name = file.rsplit('/').next().unwrap_or(file);
    let hex_len = name
        .bytes()
        .take_while(u8::is_ascii_hexdigit)
        .count()
        .min(16);
    if hex_len == 0 {
        return 0;
    }
    u64::from_str_radix(&name[..hex_len], 16).map_or(0, |value| value % worker_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_window_doubles() {
        assert_eq!(backoff_window_secs(1), 0.0);
        assert_eq!(backoff_window_secs(2), 60.0);
        assert_eq!(backoff_window_secs(3), 120.0);
        assert_eq!(backoff_window_secs(4), 240.0);
    }

    #[test]
    fn test_file_selection_covers_each_file_once() {
        let files: Vec<String> = vec![
            "incoming/0a1b2c3d-rest.jsonl.gz".into(),
            "incoming/ffee0011-rest.jsonl.gz".into(),
            "incoming/12345678-rest.jsonl.gz".into(),
            "incoming/00000000-rest.jsonl.gz".into(),
            "incoming/no-hex-prefix!.jsonl.gz".into(),
            "deadbeefcafef00ddeadbeefcafef00d.jsonl.gz".into(),
        ];

        let worker_count = 4;
        let mut seen = Vec::new();
        for worker_index in 0..worker_count {
            let mine = select_incoming_files(&files, worker_index, worker_count);
            for file in mine {
                assert!(!seen.contains(&file), "file {file} selected twice");
                seen.push(file);
            }
        }
        assert_eq!(seen.len(), files.len());
    }

    #[test]
    fn test_single_worker_takes_everything() {
        let files: Vec<String> = vec!["a.gz".into(), "b.gz".into()];
        assert_eq!(select_incoming_files(&files, 0, 1), files);
    }
}
