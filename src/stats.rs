//! Job statistics.
//!
//! Shared across the RDP worker threads, so counters are atomic;
//! variable-length records sit behind a mutex.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct IngestStats {
    parse_errors: AtomicU64,
    records_loaded: AtomicU64,
    batch_rows: AtomicU64,
    store_rows: AtomicU64,
    merged_rows: AtomicU64,
    gets: AtomicU64,
    puts: AtomicU64,
    deletes: AtomicU64,
    lists: AtomicU64,
    failed_partitions: AtomicU64,
    overlap_component_sizes: Mutex<Vec<usize>>,
    unrecoverable_keys: Mutex<Vec<String>>,
}

impl IngestStats {
    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_records_loaded(&self, count: usize) {
        self.records_loaded.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Rows entering an RDP from the incoming batch.
    pub fn add_batch_rows(&self, count: usize) {
        self.batch_rows.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Rows entering an RDP from an existing partition object.
    pub fn add_store_rows(&self, count: usize) {
        self.store_rows.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn add_merged_rows(&self, count: usize) {
        self.merged_rows.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_get(&self) {
        self.gets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self, count: usize) {
        self.deletes.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_list(&self) {
        self.lists.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_partition(&self) {
        self.failed_partitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overlap_component(&self, size: usize) {
        self.overlap_component_sizes
            .lock()
            .expect("stats lock poisoned")
            .push(size);
    }

    pub fn record_unrecoverable(&self, key: &str) {
        self.unrecoverable_keys
            .lock()
            .expect("stats lock poisoned")
            .push(key.to_string());
    }

    pub fn parse_errors(&self) -> u64 {
        self.parse_errors.load(Ordering::Relaxed)
    }

    pub fn records_loaded(&self) -> u64 {
        self.records_loaded.load(Ordering::Relaxed)
    }

    pub fn merged_rows(&self) -> u64 {
        self.merged_rows.load(Ordering::Relaxed)
    }

    pub fn failed_partitions(&self) -> u64 {
        self.failed_partitions.load(Ordering::Relaxed)
    }

    pub fn overlap_components(&self) -> Vec<usize> {
        self.overlap_component_sizes
            .lock()
            .expect("stats lock poisoned")
            .clone()
    }

    pub fn unrecoverable_keys(&self) -> Vec<String> {
        self.unrecoverable_keys
            .lock()
            .expect("stats lock poisoned")
            .clone()
    }
}

impl fmt::Display for IngestStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let overlaps = self.overlap_components();
        let unrecoverable = self.unrecoverable_keys();
        write!(
            f,
            "records: {} loaded, {} parse errors; rows: {} from batch, {} from store, {} after merge; \
             store ops: {} get, {} put, {} delete, {} list; \
             repair: {} overlapping keys in {} components; {} unrecoverable, {} failed partitions",
            self.records_loaded.load(Ordering::Relaxed),
            self.parse_errors.load(Ordering::Relaxed),
            self.batch_rows.load(Ordering::Relaxed),
            self.store_rows.load(Ordering::Relaxed),
            self.merged_rows.load(Ordering::Relaxed),
            self.gets.load(Ordering::Relaxed),
            self.puts.load(Ordering::Relaxed),
            self.deletes.load(Ordering::Relaxed),
            self.lists.load(Ordering::Relaxed),
            overlaps.iter().sum::<usize>(),
            overlaps.len(),
            unrecoverable.len(),
            self.failed_partitions.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = IngestStats::default();
        stats.record_parse_error();
        stats.add_records_loaded(10);
        stats.add_batch_rows(7);
        stats.add_store_rows(3);
        stats.add_merged_rows(8);
        stats.record_overlap_component(2);
        stats.record_overlap_component(3);

        assert_eq!(stats.parse_errors(), 1);
        assert_eq!(stats.records_loaded(), 10);
        assert_eq!(stats.merged_rows(), 8);
        assert_eq!(stats.overlap_components(), vec![2, 3]);
    }

    #[test]
    fn test_concurrent_increments() {
        let stats = IngestStats::default();
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..1000 {
                        stats.add_merged_rows(1);
                    }
                });
            }
        });
        assert_eq!(stats.merged_rows(), 4000);
    }

    #[test]
    fn test_summary_mentions_totals() {
        let stats = IngestStats::default();
        stats.add_records_loaded(5);
        stats.record_unrecoverable("unrecoverable/some/key.parquet");
        let text = stats.to_string();
        assert!(text.contains("5 loaded"));
        assert!(text.contains("1 unrecoverable"));
    }
}
