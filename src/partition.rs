//! Partition engine.
//!
//! The unit of work is a [`RewardedDecisionPartition`]: one model, a
//! batch of in-memory rows, and at most one existing store key the rows
//! merge into. Planning assigns each incoming row to the single existing
//! partition that may already contain its decision id, using one range
//! listing per record group; processing then runs load, filter, sort,
//! merge, save, cleanup. New keys are always written before the
//! superseded key is deleted, so a reader never observes a row missing
//! from the store.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use log::{debug, warn};

use crate::error::Error;
use crate::firehose::FirehoseRecordGroup;
use crate::key;
use crate::ksuid::Ksuid;
use crate::parquet_file::{decode_partition, encode_partition};
use crate::record::RewardedDecisionRecord;
use crate::stats::IngestStats;
use crate::store::ObjectStore;

pub struct RewardedDecisionPartition {
    model_name: String,
    rows: Vec<RewardedDecisionRecord>,
    store_key: Option<String>,
    sorted: bool,
    min_decision_id: Option<Ksuid>,
    max_decision_id: Option<Ksuid>,
}

impl RewardedDecisionPartition {
    pub fn new(model_name: String, rows: Vec<RewardedDecisionRecord>) -> Self {
        Self {
            model_name,
            rows,
            store_key: None,
            sorted: false,
            min_decision_id: None,
            max_decision_id: None,
        }
    }

    pub fn with_key(
        model_name: String,
        rows: Vec<RewardedDecisionRecord>,
        store_key: String,
    ) -> Self {
        Self {
            store_key: Some(store_key),
            ..Self::new(model_name, rows)
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn store_key(&self) -> Option<&str> {
        self.store_key.as_deref()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn min_decision_id(&self) -> Option<Ksuid> {
        self.min_decision_id
    }

    pub fn max_decision_id(&self) -> Option<Ksuid> {
        self.max_decision_id
    }

    /// Plan the RDPs for one record group.
    ///
    /// Every partition key begins with the partition's max timestamp, so
    /// after one listing starting at the prefix of the smallest incoming
    /// decision id, a merge-walk over (sorted rows, sorted keys) assigns
    /// each row to the first key sorting after its own prefix — the only
    /// partition that may contain it while the store is overlap-free.
    /// Rows past the final key become a trailing keyless RDP. Rare
    /// double-coverage from a previous failure is left to repair.
    pub fn partitions_from_record_group(
        store: &dyn ObjectStore,
        group: &FirehoseRecordGroup,
        stats: &IngestStats,
    ) -> Result<Vec<RewardedDecisionPartition>> {
        let model = &group.model_name;
        let mut rows = group.to_rewarded_decisions();
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        rows.sort_by(|a, b| a.decision_id.cmp(&b.decision_id));
        let mut prefixes: Vec<String> = rows
            .iter()
            .map(|row| key::partition_prefix(model, row.decision_id))
            .collect();

        let existing_keys = store
            .list_after(&key::model_prefix(model), &prefixes[0])
            .with_context(|| format!("list partitions for model {model}"))?;
        stats.record_list();
        let existing_keys: Vec<String> = existing_keys
            .into_iter()
            .filter(|key| key::is_valid_partition_key(key))
            .collect();
        debug!(
            "{model}: {} incoming rows span {} existing partitions from {}",
            rows.len(),
            existing_keys.len(),
            prefixes[0],
        );

        let mut partitions = Vec::new();
        for store_key in existing_keys {
            if rows.is_empty() {
                break;
            }
            let take = prefixes.partition_point(|prefix| prefix.as_str() < store_key.as_str());
            if take == 0 {
                continue;
            }
            let chunk: Vec<_> = rows.drain(..take).collect();
            prefixes.drain(..take);
            partitions.push(RewardedDecisionPartition::with_key(
                model.clone(),
                chunk,
                store_key,
            ));
        }
        if !rows.is_empty() {
            partitions.push(RewardedDecisionPartition::new(model.clone(), rows));
        }
        debug!("{model}: planned {} partitions", partitions.len());
        Ok(partitions)
    }

    /// Consolidate this partition: load the existing object (if any),
    /// merge, rewrite, then delete the superseded object.
    pub fn process(
        &mut self,
        store: &dyn ObjectStore,
        max_rows_per_object: usize,
        stats: &IngestStats,
    ) -> Result<()> {
        self.load(store, stats)?;
        self.filter_valid();
        self.sort();
        self.merge()?;
        stats.add_merged_rows(self.rows.len());
        self.save(store, max_rows_per_object, stats)?;
        self.cleanup(store, stats)?;
        Ok(())
    }

    fn load(&mut self, store: &dyn ObjectStore, stats: &IngestStats) -> Result<()> {
        stats.add_batch_rows(self.rows.len());
        let Some(store_key) = self.store_key.clone() else {
            return Ok(());
        };

        let data = match store.get(&store_key) {
            Ok(data) => {
                stats.record_get();
                Bytes::from(data)
            }
            Err(err) => {
                // The rows in the object were not merged, so the object
                // must survive; the sibling partition written below will
                // overlap it until repair reconciles the two.
                warn!("ignoring unreadable partition {store_key}, repair will reconcile: {err:#}");
                self.store_key = None;
                return Ok(());
            }
        };

        match decode_partition(data.clone()) {
            Ok(existing) => {
                stats.add_store_rows(existing.len());
                self.rows.extend(existing);
                Ok(())
            }
            Err(Error::InvalidRecord(msg)) => {
                let quarantine_key = format!("{}/{store_key}", key::UNRECOVERABLE_PREFIX);
                store
                    .put(&quarantine_key, &data)
                    .with_context(|| format!("quarantine {store_key}"))?;
                stats.record_put();
                store.delete(&store_key)?;
                stats.record_delete(1);
                stats.record_unrecoverable(&quarantine_key);
                self.store_key = None;
                bail!("invalid rows in partition {store_key} ({msg}); moved to {quarantine_key}");
            }
            Err(err) => {
                warn!("ignoring undecodable partition {store_key}, repair will reconcile: {err}");
                self.store_key = None;
                Ok(())
            }
        }
    }

    /// Row-level screening of the combined table. Incoming rows are
    /// validated at parse time and loaded rows when decoding, so there
    /// is nothing to drop here yet.
    fn filter_valid(&mut self) {}

    fn sort(&mut self) {
        self.rows
            .sort_by(|a, b| a.decision_id.cmp(&b.decision_id));
        self.min_decision_id = self.rows.first().map(|row| row.decision_id);
        self.max_decision_id = self.rows.last().map(|row| row.decision_id);
        self.sorted = true;
    }

    fn merge(&mut self) -> Result<()> {
        debug_assert!(self.sorted);
        let rows = std::mem::take(&mut self.rows);
        self.rows = merge_rewarded_decisions(rows)?;
        Ok(())
    }

    fn save(
        &self,
        store: &dyn ObjectStore,
        max_rows_per_object: usize,
        stats: &IngestStats,
    ) -> Result<()> {
        debug_assert!(self.sorted);
        if self.rows.is_empty() {
            bail!("partition for model {} has no rows", self.model_name);
        }
        for chunk in split_chunks(&self.rows, max_rows_per_object) {
            let object_key = key::partition_key(
                &self.model_name,
                chunk[0].decision_id,
                chunk[chunk.len() - 1].decision_id,
                chunk.len(),
            );
            let data = encode_partition(chunk)?;
            store
                .put(&object_key, &data)
                .with_context(|| format!("write partition {object_key}"))?;
            stats.record_put();
            debug!("wrote partition {object_key} ({} rows)", chunk.len());
        }
        Ok(())
    }

    fn cleanup(&mut self, store: &dyn ObjectStore, stats: &IngestStats) -> Result<()> {
        // Delete last: a failure anywhere earlier leaves the old object
        // intact and the whole pass re-runnable.
        if let Some(store_key) = self.store_key.take() {
            store
                .delete(&store_key)
                .with_context(|| format!("delete superseded partition {store_key}"))?;
            stats.record_delete(1);
            debug!("deleted superseded partition {store_key}");
        }
        self.rows = Vec::new();
        Ok(())
    }
}

/// Merge rows sharing a decision id. Idempotent and commutative at the
/// multiset level: non-reward fields take the first value present,
/// rewards maps shallow-merge (duplicate reward message ids carry equal
/// values, so which one wins is immaterial), and the reward scalar is
/// recomputed as the sum of the merged map.
///
/// Expects rows sorted by decision id.
pub fn merge_rewarded_decisions(
    rows: Vec<RewardedDecisionRecord>,
) -> Result<Vec<RewardedDecisionRecord>> {
    let mut merged = Vec::new();
    let mut start = 0;
    while start < rows.len() {
        let mut end = start + 1;
        while end < rows.len() && rows[end].decision_id == rows[start].decision_id {
            end += 1;
        }
        merged.push(merge_group(&rows[start..end])?);
        start = end;
    }
    Ok(merged)
}

fn merge_group(group: &[RewardedDecisionRecord]) -> Result<RewardedDecisionRecord> {
    let mut rewards: BTreeMap<String, f64> = BTreeMap::new();
    for row in group {
        if let Some(raw) = &row.rewards {
            let map: BTreeMap<String, f64> = serde_json::from_str(raw).with_context(|| {
                format!("malformed rewards map for decision {}", row.decision_id)
            })?;
            for (message_id, value) in map {
                rewards.entry(message_id).or_insert(value);
            }
        }
    }
    let reward = rewards.values().sum();

    Ok(RewardedDecisionRecord {
        decision_id: group[0].decision_id,
        timestamp: group.iter().find_map(|row| row.timestamp),
        variant: group.iter().find_map(|row| row.variant.clone()),
        givens: group.iter().find_map(|row| row.givens.clone()),
        count: group.iter().find_map(|row| row.count),
        runners_up: group.iter().find_map(|row| row.runners_up.clone()),
        sample: group.iter().find_map(|row| row.sample.clone()),
        rewards: if rewards.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&rewards)?)
        },
        reward: Some(reward),
    })
}

/// Split into ceil(len / max) runs of near-equal size, order preserved.
fn split_chunks(
    rows: &[RewardedDecisionRecord],
    max_rows: usize,
) -> Vec<&[RewardedDecisionRecord]> {
    if rows.is_empty() {
        return Vec::new();
    }
    let chunk_count = rows.len().div_ceil(max_rows.max(1));
    let base = rows.len() / chunk_count;
    let remainder = rows.len() % chunk_count;

    let mut chunks = Vec::with_capacity(chunk_count);
    let mut start = 0;
    for index in 0..chunk_count {
        let len = base + usize::from(index < remainder);
        chunks.push(&rows[start..start + len]);
        start += len;
    }
    chunks
}
