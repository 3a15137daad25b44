//! Firehose file loading.
//!
//! An incoming firehose file is gzip-compressed, newline-delimited json.
//! Lines that fail to parse or validate are counted and archived, never
//! fatal; valid records are grouped by model name for the partition
//! engine.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use log::{debug, info, warn};

use crate::key::UNRECOVERABLE_PREFIX;
use crate::record::{FirehoseRecord, RewardedDecisionRecord};
use crate::stats::IngestStats;
use crate::store::ObjectStore;

/// All records of one firehose file that share a model name.
#[derive(Debug)]
pub struct FirehoseRecordGroup {
    pub model_name: String,
    pub records: Vec<FirehoseRecord>,
}

impl FirehoseRecordGroup {
    pub fn to_rewarded_decisions(&self) -> Vec<RewardedDecisionRecord> {
        self.records
            .iter()
            .map(FirehoseRecord::to_rewarded_decision)
            .collect()
    }
}

/// Load a firehose file and bucket its records by model.
///
/// Invalid lines are skipped after counting; if any exist they are
/// archived as plain jsonl under the train store's unrecoverable prefix
/// so nothing is silently dropped.
pub fn load_groups(
    firehose: &dyn ObjectStore,
    train: &dyn ObjectStore,
    incoming_key: &str,
    stats: &IngestStats,
) -> Result<Vec<FirehoseRecordGroup>> {
    info!("loading firehose file {incoming_key}");
    let compressed = firehose
        .get(incoming_key)
        .with_context(|| format!("fetch firehose file {incoming_key}"))?;
    stats.record_get();

    let reader = BufReader::new(GzDecoder::new(compressed.as_slice()));
    let mut by_model: BTreeMap<String, Vec<FirehoseRecord>> = BTreeMap::new();
    let mut invalid_lines: Vec<String> = Vec::new();

    for line in reader.lines() {
        let line = line.with_context(|| format!("decompress {incoming_key}"))?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line)
            .map_err(anyhow::Error::from)
            .and_then(|value| FirehoseRecord::parse(&value).map_err(anyhow::Error::from));
        match record {
            Ok(record) => by_model
                .entry(record.model().to_string())
                .or_default()
                .push(record),
            Err(err) => {
                debug!("skipping invalid line: {err}");
                stats.record_parse_error();
                invalid_lines.push(line);
            }
        }
    }

    if !invalid_lines.is_empty() {
        let archive_key = format!("{UNRECOVERABLE_PREFIX}/{incoming_key}.jsonl");
        warn!(
            "skipped {} invalid lines, archiving to {archive_key}",
            invalid_lines.len()
        );
        let mut body = invalid_lines.join("\n");
        body.push('\n');
        train
            .put(&archive_key, body.as_bytes())
            .with_context(|| format!("archive invalid lines to {archive_key}"))?;
        stats.record_put();
    }

    let total: usize = by_model.values().map(Vec::len).sum();
    stats.add_records_loaded(total);
    info!(
        "loaded {total} records across {} models from {incoming_key}",
        by_model.len()
    );

    Ok(by_model
        .into_iter()
        .map(|(model_name, records)| FirehoseRecordGroup {
            model_name,
            records,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ksuid::Ksuid;
    use crate::store::FsStore;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use tempfile::tempdir;

    fn gzip_lines(lines: &[String]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        for line in lines {
            encoder.write_all(line.as_bytes()).unwrap();
            encoder.write_all(b"\n").unwrap();
        }
        encoder.finish().unwrap()
    }

    fn decision_line(model: &str, tail: u8) -> String {
        let id = Ksuid::from_parts(1_631_000_000, [tail; 16]).unwrap();
        format!(
            r#"{{"message_id":"{id}","timestamp":"2021-09-07T08:53:20Z","type":"decision","model":"{model}","variant":1,"count":1}}"#
        )
    }

    #[test]
    fn test_groups_by_model_and_archives_invalid() -> Result<()> {
        let temp = tempdir()?;
        let firehose = FsStore::open(temp.path().join("firehose"))?;
        let train = FsStore::open(temp.path().join("train"))?;
        let stats = IngestStats::default();

        let lines = vec![
            decision_line("model-a", 1),
            decision_line("model-b", 2),
            decision_line("model-a", 3),
            "not json at all".to_string(),
            r#"{"message_id":"bad","type":"decision"}"#.to_string(),
        ];
        firehose.put("2021/09/07/records.jsonl.gz", &gzip_lines(&lines))?;

        let groups = load_groups(&firehose, &train, "2021/09/07/records.jsonl.gz", &stats)?;
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].model_name, "model-a");
        assert_eq!(groups[0].records.len(), 2);
        assert_eq!(groups[1].model_name, "model-b");
        assert_eq!(groups[1].records.len(), 1);

        assert_eq!(stats.parse_errors(), 2);
        assert_eq!(stats.records_loaded(), 3);

        let archived = train.get("unrecoverable/2021/09/07/records.jsonl.gz.jsonl")?;
        let archived = String::from_utf8(archived)?;
        assert!(archived.contains("not json at all"));
        assert_eq!(archived.lines().count(), 2);
        Ok(())
    }

    #[test]
    fn test_missing_file_is_fatal() -> Result<()> {
        let temp = tempdir()?;
        let firehose = FsStore::open(temp.path().join("firehose"))?;
        let train = FsStore::open(temp.path().join("train"))?;
        let stats = IngestStats::default();
        assert!(load_groups(&firehose, &train, "absent.jsonl.gz", &stats).is_err());
        Ok(())
    }
}
