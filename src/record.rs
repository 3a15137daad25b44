//! Firehose record model.
//!
//! A firehose line is either a decision (the chosen variant plus its
//! context) or a reward (a value attributed to an earlier decision).
//! Both project to a [`RewardedDecisionRecord`], the row type of the
//! partition store; a reward projects to a partial row carrying only the
//! target decision id and a one-entry rewards map.

use std::str::FromStr;

use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::{Error, Result};
use crate::ksuid::Ksuid;

pub const DECISION_TYPE: &str = "decision";
pub const REWARD_TYPE: &str = "reward";

#[derive(Debug, Clone)]
pub struct DecisionRecord {
    pub message_id: Ksuid,
    pub timestamp: OffsetDateTime,
    pub model: String,
    pub variant: Value,
    pub givens: Option<Value>,
    pub count: i64,
    pub runners_up: Option<Vec<Value>>,
    /// `None` when absent; `Some(Value::Null)` when present but null.
    pub sample: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct RewardRecord {
    pub message_id: Ksuid,
    pub timestamp: OffsetDateTime,
    pub model: String,
    pub decision_id: Ksuid,
    pub reward: f64,
}

#[derive(Debug, Clone)]
pub enum FirehoseRecord {
    Decision(DecisionRecord),
    Reward(RewardRecord),
}

impl DecisionRecord {
    /// Variants available to sampling beyond the chosen one and runners-up.
    pub fn sample_pool_size(&self) -> i64 {
        let runners_up = self.runners_up.as_ref().map_or(0, |r| r.len() as i64);
        self.count - 1 - runners_up
    }
}

impl FirehoseRecord {
    /// Parse and validate one firehose record.
    pub fn parse(value: &Value) -> Result<Self> {
        let obj = match value.as_object() {
            Some(obj) => obj,
            None => return Err(Error::InvalidRecord("record is not a json object")),
        };

        let message_id = require_ksuid(obj, "message_id")?;
        let timestamp_raw = require_str(obj, "timestamp")?;
        let timestamp = OffsetDateTime::parse(timestamp_raw, &Rfc3339)
            .map_err(|_| Error::InvalidRecord("invalid timestamp"))?;

        let model = require_str(obj, "model")?;
        if !is_valid_model_name(model) {
            return Err(Error::InvalidRecord("invalid model"));
        }
        let model = model.to_string();

        match require_str(obj, "type")? {
            REWARD_TYPE => {
                let decision_id = require_ksuid(obj, "decision_id")?;
                let reward = obj
                    .get("reward")
                    .ok_or(Error::InvalidRecord("missing reward"))?
                    .as_f64()
                    .ok_or(Error::InvalidRecord("invalid reward"))?;
                Ok(FirehoseRecord::Reward(RewardRecord {
                    message_id,
                    timestamp,
                    model,
                    decision_id,
                    reward,
                }))
            }
            DECISION_TYPE => {
                // Any json value is a valid variant; absent reads as null.
                let variant = obj.get("variant").cloned().unwrap_or(Value::Null);

                let givens = match obj.get("givens") {
                    None | Some(Value::Null) => None,
                    Some(value @ Value::Object(_)) => Some(value.clone()),
                    Some(_) => return Err(Error::InvalidRecord("invalid givens")),
                };

                let count = obj
                    .get("count")
                    .ok_or(Error::InvalidRecord("missing count"))?
                    .as_i64()
                    .ok_or(Error::InvalidRecord("invalid count"))?;
                if count < 1 {
                    return Err(Error::InvalidRecord("invalid count"));
                }

                let runners_up = match obj.get("runners_up") {
                    None | Some(Value::Null) => None,
                    Some(Value::Array(items)) if !items.is_empty() => Some(items.clone()),
                    Some(_) => return Err(Error::InvalidRecord("invalid runners_up")),
                };

                // Null is a valid sample, so presence must be tracked separately.
                let sample = obj.get("sample").cloned();

                let record = DecisionRecord {
                    message_id,
                    timestamp,
                    model,
                    variant,
                    givens,
                    count,
                    runners_up,
                    sample,
                };

                let pool_size = record.sample_pool_size();
                if pool_size < 0 {
                    return Err(Error::InvalidRecord("invalid count or runners_up"));
                }
                if record.sample.is_some() {
                    if pool_size == 0 {
                        return Err(Error::InvalidRecord("invalid count or runners_up"));
                    }
                } else if pool_size > 0 {
                    return Err(Error::InvalidRecord("missing sample"));
                }

                Ok(FirehoseRecord::Decision(record))
            }
            _ => Err(Error::InvalidRecord("invalid type")),
        }
    }

    pub fn model(&self) -> &str {
        match self {
            FirehoseRecord::Decision(record) => &record.model,
            FirehoseRecord::Reward(record) => &record.model,
        }
    }

    /// Project to the stored row form.
    ///
    /// Json-valued fields are serialized with sorted keys so equal values
    /// are byte-equal, which keeps the projection deterministic and helps
    /// columnar compression. A reward yields a partial row: the target
    /// decision's own fields, its timestamp included, stay unset because
    /// they are unknown here.
    pub fn to_rewarded_decision(&self) -> RewardedDecisionRecord {
        match self {
            FirehoseRecord::Decision(record) => RewardedDecisionRecord {
                decision_id: record.message_id,
                timestamp: Some(timestamp_micros(record.timestamp)),
                variant: Some(canonical_json(&record.variant)),
                givens: record.givens.as_ref().map(canonical_json),
                count: Some(record.count),
                runners_up: record
                    .runners_up
                    .as_ref()
                    .map(|items| items.iter().map(canonical_json).collect()),
                sample: match &record.sample {
                    Some(value) if !value.is_null() => Some(canonical_json(value)),
                    _ => None,
                },
                rewards: None,
                reward: None,
            },
            FirehoseRecord::Reward(record) => {
                let mut rewards = serde_json::Map::new();
                rewards.insert(record.message_id.to_string(), json_number(record.reward));
                RewardedDecisionRecord {
                    decision_id: record.decision_id,
                    timestamp: None,
                    variant: None,
                    givens: None,
                    count: None,
                    runners_up: None,
                    sample: None,
                    rewards: Some(canonical_json(&Value::Object(rewards))),
                    reward: None,
                }
            }
        }
    }
}

/// One row of a partition. Partial rows (from rewards) leave every
/// decision-side field unset.
#[derive(Debug, Clone, PartialEq)]
pub struct RewardedDecisionRecord {
    pub decision_id: Ksuid,
    /// Decision timestamp, microseconds since the unix epoch, UTC.
    pub timestamp: Option<i64>,
    pub variant: Option<String>,
    pub givens: Option<String>,
    pub count: Option<i64>,
    pub runners_up: Option<Vec<String>>,
    pub sample: Option<String>,
    /// Canonical json map of reward message_id to value.
    pub rewards: Option<String>,
    /// Sum of the values in `rewards`, maintained by the merge.
    pub reward: Option<f64>,
}

/// Serialize with object keys sorted.
///
/// serde_json's default map representation is ordered by key, so plain
/// serialization is already canonical; this helper pins that contract.
pub fn canonical_json(value: &Value) -> String {
    serde_json::to_string(value).expect("json value serializes")
}

pub fn is_valid_model_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_alphanumeric() {
        return false;
    }
    if name.len() > 64 {
        return false;
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-'))
}

fn require_str<'a>(obj: &'a serde_json::Map<String, Value>, key: &'static str) -> Result<&'a str> {
    match obj.get(key) {
        None => Err(missing_field(key)),
        Some(value) => value.as_str().ok_or(invalid_field(key)),
    }
}

fn require_ksuid(obj: &serde_json::Map<String, Value>, key: &'static str) -> Result<Ksuid> {
    Ksuid::from_str(require_str(obj, key)?).map_err(|_| invalid_field(key))
}

fn missing_field(key: &'static str) -> Error {
    match key {
        "message_id" => Error::InvalidRecord("missing message_id"),
        "timestamp" => Error::InvalidRecord("missing timestamp"),
        "type" => Error::InvalidRecord("missing type"),
        "model" => Error::InvalidRecord("missing model"),
        "decision_id" => Error::InvalidRecord("missing decision_id"),
        _ => Error::InvalidRecord("missing required field"),
    }
}

fn invalid_field(key: &'static str) -> Error {
    match key {
        "message_id" => Error::InvalidRecord("invalid message_id"),
        "timestamp" => Error::InvalidRecord("invalid timestamp"),
        "type" => Error::InvalidRecord("invalid type"),
        "model" => Error::InvalidRecord("invalid model"),
        "decision_id" => Error::InvalidRecord("invalid decision_id"),
        _ => Error::InvalidRecord("invalid field"),
    }
}

fn timestamp_micros(timestamp: OffsetDateTime) -> i64 {
    (timestamp.unix_timestamp_nanos() / 1_000) as i64
}

fn json_number(value: f64) -> Value {
    serde_json::Number::from_f64(value).map_or(Value::Null, Value::Number)
}
