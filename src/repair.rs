//! Overlap repair.
//!
//! Concurrent ingests, or an ingest that fell back after an unreadable
//! partition, can leave two live partitions whose decision-id ranges
//! overlap. Both range endpoints are encoded in every key name, so one
//! listing is enough to find the overlapping sets; each set is loaded,
//! reconsolidated through a keyless partition, and only then batch
//! deleted. Re-running after a successful pass finds nothing to do.

use anyhow::{Context, Result};
use bytes::Bytes;
use log::{debug, info};

use crate::key;
use crate::parquet_file::decode_partition;
use crate::partition::RewardedDecisionPartition;
use crate::stats::IngestStats;
use crate::store::ObjectStore;

/// Restore the no-overlap invariant for one model.
///
/// Runs serially per model so the largest overlap set bounds memory on
/// its own. Read failures here are fatal for the pass: deleting the
/// originals after a partial read would drop rows, so the job leaves
/// everything in place and relies on the outer retry.
pub fn repair_overlapping_keys(
    store: &dyn ObjectStore,
    model_name: &str,
    max_rows_per_object: usize,
    stats: &IngestStats,
) -> Result<()> {
    let keys = store
        .list_after(&key::model_prefix(model_name), "")
        .with_context(|| format!("list partitions for model {model_name}"))?;
    stats.record_list();
    let keys: Vec<String> = keys
        .into_iter()
        .filter(|key| key::is_valid_partition_key(key))
        .collect();
    if keys.len() <= 1 {
        return Ok(());
    }

    let components = overlap_components(keys)?;
    for component in components {
        if component.len() < 2 {
            continue;
        }
        info!(
            "repairing {} overlapping partitions for model {model_name}",
            component.len()
        );
        stats.record_overlap_component(component.len());

        let mut rows = Vec::new();
        for object_key in &component {
            let data = store
                .get(object_key)
                .with_context(|| format!("load overlapping partition {object_key}"))?;
            stats.record_get();
            rows.extend(
                decode_partition(Bytes::from(data))
                    .with_context(|| format!("decode overlapping partition {object_key}"))?,
            );
        }

        let mut partition = RewardedDecisionPartition::new(model_name.to_string(), rows);
        partition.process(store, max_rows_per_object, stats)?;

        store.delete_batch(&component)?;
        stats.record_delete(component.len());
        debug!("replaced {} superseded partitions", component.len());
    }
    Ok(())
}

/// Group keys into connected components under closed-interval overlap of
/// their encoded (min_ts, max_ts) ranges. The fixed-width timestamp
/// encoding compares lexicographically in chronological order, so string
/// comparison suffices.
fn overlap_components(keys: Vec<String>) -> Result<Vec<Vec<String>>> {
    let mut intervals = Vec::with_capacity(keys.len());
    for object_key in keys {
        let range = key::parse_key(&object_key)?;
        intervals.push((range.min_ts, range.max_ts, object_key));
    }
    intervals.sort();

    let mut components: Vec<(String, Vec<String>)> = Vec::new();
    for (min_ts, max_ts, object_key) in intervals {
        match components.last_mut() {
            // Sorted by min_ts, so two intervals overlap iff the next
            // one starts at or before the open component's max.
            Some((open_max, members)) if min_ts.as_str() <= open_max.as_str() => {
                if max_ts > *open_max {
                    *open_max = max_ts;
                }
                members.push(object_key);
            }
            _ => components.push((max_ts, vec![object_key])),
        }
    }
    Ok(components.into_iter().map(|(_, members)| members).collect())
}
