//! Object-store key scheme for partitions.
//!
//! A partition key is
//! `rewarded_decisions/<model>/parquet/YYYY/MM/DD/<max_ts>-<min_ts>-<count>-<uuid>.parquet`
//! where both timestamps are ISO 8601 basic (seconds, UTC) and derived
//! from the ksuids of the partition's max/min rows. Leading with the max
//! timestamp makes one lexicographic range listing a point lookup: the
//! first key at or after `partition_prefix(model, d)` is the only
//! partition that may contain decision id `d`.

use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::ksuid::Ksuid;
use crate::record::is_valid_model_name;

pub const REWARDED_DECISIONS_PREFIX: &str = "rewarded_decisions";
pub const UNRECOVERABLE_PREFIX: &str = "unrecoverable";
pub const PARTITION_EXTENSION: &str = ".parquet";

const ISO_8601_BASIC: &[BorrowedFormatItem<'static>] =
    format_description!("[year][month][day]T[hour][minute][second]Z");

/// `rewarded_decisions/<model>/` — the listing prefix for one model.
pub fn model_prefix(model: &str) -> String {
    format!("{REWARDED_DECISIONS_PREFIX}/{model}/")
}

/// Key prefix of the unique partition that may hold `decision_id`.
pub fn partition_prefix(model: &str, decision_id: Ksuid) -> String {
    let ts = timestamp_basic(decision_id.datetime());
    format!(
        "{REWARDED_DECISIONS_PREFIX}/{model}/parquet/{}/{}/{}/{ts}",
        &ts[0..4],
        &ts[4..6],
        &ts[6..8],
    )
}

/// Full key for a new partition object. The trailing uuid only keeps
/// concurrent writers from colliding on a name; treat it as opaque.
pub fn partition_key(model: &str, min_id: Ksuid, max_id: Ksuid, count: usize) -> String {
    format!(
        "{}-{}-{}-{}{PARTITION_EXTENSION}",
        partition_prefix(model, max_id),
        timestamp_basic(min_id.datetime()),
        count,
        Uuid::new_v4(),
    )
}

/// The range fields parsed back out of a partition key's file name.
///
/// Timestamps stay in their encoded basic form: fixed-width digits
/// compare lexicographically in chronological order, which is all the
/// overlap scan needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub max_ts: String,
    pub min_ts: String,
    pub count: u64,
}

pub fn parse_key(key: &str) -> Result<KeyRange> {
    let invalid = || Error::InvalidKey(key.to_string());
    let file = key.rsplit('/').next().ok_or_else(invalid)?;
    let stem = file.strip_suffix(PARTITION_EXTENSION).ok_or_else(invalid)?;

    let mut parts = stem.splitn(4, '-');
    let max_ts = parts.next().ok_or_else(invalid)?;
    let min_ts = parts.next().ok_or_else(invalid)?;
    let count = parts.next().ok_or_else(invalid)?;
    let suffix = parts.next().ok_or_else(invalid)?;

    if !is_basic_timestamp(max_ts) || !is_basic_timestamp(min_ts) || suffix.is_empty() {
        return Err(invalid());
    }
    if min_ts > max_ts {
        return Err(invalid());
    }
    let count: u64 = count.parse().map_err(|_| invalid())?;

    Ok(KeyRange {
        max_ts: max_ts.to_string(),
        min_ts: min_ts.to_string(),
        count,
    })
}

/// Full structural check, used to filter listings before planning or
/// repair so stray objects under the model prefix are ignored.
pub fn is_valid_partition_key(key: &str) -> bool {
    let Ok(range) = parse_key(key) else {
        return false;
    };
    let segments: Vec<&str> = key.split('/').collect();
    if segments.len() != 7 {
        return false;
    }
    segments[0] == REWARDED_DECISIONS_PREFIX
        && is_valid_model_name(segments[1])
        && segments[2] == "parquet"
        && segments[3] == &range.max_ts[0..4]
        && segments[4] == &range.max_ts[4..6]
        && segments[5] == &range.max_ts[6..8]
}

pub fn timestamp_basic(datetime: OffsetDateTime) -> String {
    datetime
        .format(ISO_8601_BASIC)
        .expect("const format description")
}

fn is_basic_timestamp(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() == 16
        && bytes[0..8].iter().all(u8::is_ascii_digit)
        && bytes[8] == b'T'
        && bytes[9..15].iter().all(u8::is_ascii_digit)
        && bytes[15] == b'Z'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ksuid_at(unix_seconds: i64, tail: u8) -> Ksuid {
        Ksuid::from_parts(unix_seconds, [tail; 16]).unwrap()
    }

    #[test]
    fn test_prefix_layout() {
        // 2021-01-02T03:04:05Z
        let id = ksuid_at(1_609_556_645, 0);
        assert_eq!(
            partition_prefix("songs-1.0", id),
            "rewarded_decisions/songs-1.0/parquet/2021/01/02/20210102T030405Z"
        );
    }

    #[test]
    fn test_full_key_parses_back() {
        let min_id = ksuid_at(1_609_556_645, 0);
        let max_id = ksuid_at(1_609_643_045, 0);
        let key = partition_key("songs-1.0", min_id, max_id, 42);

        assert!(key.starts_with(&partition_prefix("songs-1.0", max_id)));
        assert!(key.ends_with(PARTITION_EXTENSION));
        assert!(is_valid_partition_key(&key));

        let range = parse_key(&key).unwrap();
        assert_eq!(range.max_ts, "20210103T030405Z");
        assert_eq!(range.min_ts, "20210102T030405Z");
        assert_eq!(range.count, 42);
    }

    #[test]
    fn test_prefix_orders_with_keys() {
        let model = "m";
        let early = ksuid_at(1_609_556_645, 0);
        let late = ksuid_at(1_609_643_045, 0);
        let key = partition_key(model, early, late, 2);

        // A decision inside the partition's range targets a prefix sorting
        // at or before the partition key; one past the max sorts after.
        assert!(partition_prefix(model, early) < key);
        assert!(partition_prefix(model, late) < key);
        let past = ksuid_at(1_609_643_046, 0);
        assert!(partition_prefix(model, past) > key);
    }

    #[test]
    fn test_invalid_keys_rejected() {
        for key in [
            "",
            "rewarded_decisions/m/parquet/2021/01/02/garbage.parquet",
            "rewarded_decisions/m/parquet/2021/01/02/20210102T030405Z-20210102T030405Z-3-x.json",
            // min after max
            "rewarded_decisions/m/parquet/2021/01/02/20210102T030405Z-20210103T030405Z-3-x.parquet",
            // date segments disagree with the max timestamp
            "rewarded_decisions/m/parquet/2021/01/09/20210102T030405Z-20210101T030405Z-3-x.parquet",
            "unrecoverable/rewarded_decisions/m/parquet/2021/01/02/20210102T030405Z-20210101T030405Z-3-x.parquet",
        ] {
            assert!(!is_valid_partition_key(key), "key {key:?}");
        }
    }

    #[test]
    fn test_uuid_suffix_with_dashes_parses() {
        let key = "rewarded_decisions/m/parquet/2021/01/02/20210102T030405Z-20210101T030405Z-7-1f2e3d4c-aaaa-bbbb-cccc-0123456789ab.parquet";
        let range = parse_key(key).unwrap();
        assert_eq!(range.count, 7);
        assert!(is_valid_partition_key(key));
    }
}
