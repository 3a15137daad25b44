//! Partitioned rewarded-decision store.
//!
//! Ingests firehose files of decision and reward events, joins each
//! reward to its originating decision, and maintains a per-model,
//! time-ordered parquet partition store over an object store. Merging is
//! idempotent and commutative; overlapping partitions left behind by
//! concurrent writers or failures are reconciled by the repair pass.

pub mod config;
pub mod error;
pub mod firehose;
pub mod key;
pub mod ksuid;
pub mod parquet_file;
pub mod partition;
pub mod record;
pub mod repair;
pub mod stats;
pub mod store;
pub mod worker;

pub use config::Config;
pub use error::{Error, Result};
pub use firehose::{load_groups, FirehoseRecordGroup};
pub use ksuid::Ksuid;
pub use partition::{merge_rewarded_decisions, RewardedDecisionPartition};
pub use record::{FirehoseRecord, RewardedDecisionRecord};
pub use repair::repair_overlapping_keys;
pub use stats::IngestStats;
pub use store::{FsStore, ObjectStore};
