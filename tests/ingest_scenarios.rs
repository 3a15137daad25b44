use std::io::Write;

use anyhow::Result;
use bytes::Bytes;
use flate2::write::GzEncoder;
use tempfile::tempdir;

use trainstore::key::{model_prefix, parse_key};
use trainstore::parquet_file::decode_partition;
use trainstore::store::ObjectStore;
use trainstore::{worker, Config, FsStore, IngestStats, Ksuid, RewardedDecisionRecord};

const INCOMING_KEY: &str = "2021/09/07/08/firehose-batch.jsonl.gz";

fn test_config(thread_worker_count: usize) -> Config {
    Config {
        train_bucket: "train".to_string(),
        firehose_bucket: "firehose".to_string(),
        incoming_firehose_key: INCOMING_KEY.to_string(),
        thread_worker_count,
        reward_assignment_worker_count: 1,
        batch_job_array_index: 0,
        batch_job_attempt: 1,
        parquet_file_max_decision_records: 1000,
        debug: false,
    }
}

fn ksuid_at(unix_seconds: i64, tail: u8) -> Ksuid {
    Ksuid::from_parts(unix_seconds, [tail; 16]).unwrap()
}

fn decision_line(model: &str, id: Ksuid) -> String {
    format!(
        r#"{{"message_id":"{id}","timestamp":"2021-09-07T08:53:20Z","type":"decision","model":"{model}","variant":{{"x":1}},"count":1}}"#
    )
}

fn reward_line(model: &str, message_id: Ksuid, decision_id: Ksuid, value: f64) -> String {
    format!(
        r#"{{"message_id":"{message_id}","timestamp":"2021-09-07T09:00:00Z","type":"reward","model":"{model}","decision_id":"{decision_id}","reward":{value}}}"#
    )
}

fn gzip_lines(lines: &[String]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    for line in lines {
        encoder.write_all(line.as_bytes()).unwrap();
        encoder.write_all(b"\n").unwrap();
    }
    encoder.finish().unwrap()
}

fn ingest(lines: &[String]) -> Result<(tempfile::TempDir, FsStore, IngestStats)> {
    let temp = tempdir()?;
    let firehose = FsStore::open(temp.path().join("firehose"))?;
    let train = FsStore::open(temp.path().join("train"))?;
    firehose.put(INCOMING_KEY, &gzip_lines(lines))?;

    let stats = IngestStats::default();
    worker::run(&test_config(2), &firehose, &train, &stats)?;
    Ok((temp, train, stats))
}

fn read_rows(store: &FsStore, key: &str) -> Result<Vec<RewardedDecisionRecord>> {
    Ok(decode_partition(Bytes::from(store.get(key)?))?)
}

#[test]
fn new_partition_from_single_decision() -> Result<()> {
    let model = "messages-1.0";
    let decision_id = ksuid_at(1_631_000_000, 1);
    let (_temp, train, stats) = ingest(&[decision_line(model, decision_id)])?;

    let keys = train.list_after(&model_prefix(model), "")?;
    assert_eq!(keys.len(), 1, "expected exactly one partition: {keys:?}");

    // Both encoded timestamps come from the same single row.
    let range = parse_key(&keys[0])?;
    assert_eq!(range.min_ts, range.max_ts);
    assert_eq!(range.count, 1);
    assert!(keys[0].starts_with("rewarded_decisions/messages-1.0/parquet/2021/09/07/"));

    let rows = read_rows(&train, &keys[0])?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].decision_id, decision_id);
    assert_eq!(rows[0].variant.as_deref(), Some(r#"{"x":1}"#));
    assert!(rows[0].rewards.is_none());
    assert_eq!(rows[0].reward, Some(0.0));

    assert_eq!(stats.merged_rows(), 1);
    Ok(())
}

#[test]
fn reward_joins_decision_in_same_batch() -> Result<()> {
    let model = "messages-1.0";
    let decision_id = ksuid_at(1_631_000_000, 1);
    let reward_id = ksuid_at(1_631_000_400, 2);
    let (_temp, train, _stats) = ingest(&[
        decision_line(model, decision_id),
        reward_line(model, reward_id, decision_id, 1.5),
    ])?;

    let keys = train.list_after(&model_prefix(model), "")?;
    assert_eq!(keys.len(), 1);

    let rows = read_rows(&train, &keys[0])?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].decision_id, decision_id);
    assert_eq!(
        rows[0].rewards.as_deref(),
        Some(format!(r#"{{"{reward_id}":1.5}}"#).as_str())
    );
    assert_eq!(rows[0].reward, Some(1.5));
    Ok(())
}

#[test]
fn duplicate_reward_counted_once() -> Result<()> {
    let model = "messages-1.0";
    let decision_id = ksuid_at(1_631_000_000, 1);
    let reward_id = ksuid_at(1_631_000_400, 2);
    let (_temp, train, _stats) = ingest(&[
        decision_line(model, decision_id),
        reward_line(model, reward_id, decision_id, 1.5),
        reward_line(model, reward_id, decision_id, 1.5),
    ])?;

    let keys = train.list_after(&model_prefix(model), "")?;
    let rows = read_rows(&train, &keys[0])?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].reward, Some(1.5), "duplicate must not double-count");
    Ok(())
}

#[test]
fn models_are_partitioned_independently() -> Result<()> {
    let a = ksuid_at(1_631_000_000, 1);
    let b = ksuid_at(1_631_000_100, 2);
    let (_temp, train, _stats) =
        ingest(&[decision_line("model-a", a), decision_line("model-b", b)])?;

    let keys_a = train.list_after(&model_prefix("model-a"), "")?;
    let keys_b = train.list_after(&model_prefix("model-b"), "")?;
    assert_eq!(keys_a.len(), 1);
    assert_eq!(keys_b.len(), 1);

    assert_eq!(read_rows(&train, &keys_a[0])?[0].decision_id, a);
    assert_eq!(read_rows(&train, &keys_b[0])?[0].decision_id, b);
    Ok(())
}

#[test]
fn invalid_lines_are_archived_not_fatal() -> Result<()> {
    let model = "messages-1.0";
    let decision_id = ksuid_at(1_631_000_000, 1);
    let (_temp, train, stats) = ingest(&[
        decision_line(model, decision_id),
        "{ truncated".to_string(),
        r#"{"message_id":"nope","type":"decision"}"#.to_string(),
    ])?;

    assert_eq!(stats.parse_errors(), 2);
    assert_eq!(train.list_after(&model_prefix(model), "")?.len(), 1);

    let archived = train.get(&format!("unrecoverable/{INCOMING_KEY}.jsonl"))?;
    assert_eq!(String::from_utf8(archived)?.lines().count(), 2);
    Ok(())
}

#[test]
fn array_node_processes_its_share_of_a_prefix() -> Result<()> {
    let model = "messages-1.0";
    let temp = tempdir()?;
    let firehose = FsStore::open(temp.path().join("firehose"))?;
    let train = FsStore::open(temp.path().join("train"))?;

    let a = ksuid_at(1_631_000_000, 1);
    let b = ksuid_at(1_631_086_400, 2);
    firehose.put(
        "incoming/0a-first.jsonl.gz",
        &gzip_lines(&[decision_line(model, a)]),
    )?;
    firehose.put(
        "incoming/0b-second.jsonl.gz",
        &gzip_lines(&[decision_line(model, b)]),
    )?;

    // A single-node array owns every file under the prefix.
    let stats = IngestStats::default();
    worker::run_node(&test_config(1), &firehose, &train, &stats, "incoming/")?;

    let keys = train.list_after(&model_prefix(model), "")?;
    assert_eq!(keys.len(), 2, "one partition per day: {keys:?}");
    assert_eq!(stats.merged_rows(), 2);
    Ok(())
}

#[test]
fn large_batch_splits_into_bounded_chunks() -> Result<()> {
    let model = "messages-1.0";
    let lines: Vec<String> = (0..10)
        .map(|i| decision_line(model, ksuid_at(1_631_000_000 + i, i as u8)))
        .collect();

    let temp = tempdir()?;
    let firehose = FsStore::open(temp.path().join("firehose"))?;
    let train = FsStore::open(temp.path().join("train"))?;
    firehose.put(INCOMING_KEY, &gzip_lines(&lines))?;

    let mut config = test_config(1);
    config.parquet_file_max_decision_records = 4;
    let stats = IngestStats::default();
    worker::run(&config, &firehose, &train, &stats)?;

    let keys = train.list_after(&model_prefix(model), "")?;
    assert_eq!(keys.len(), 3, "10 rows at 4 per object: {keys:?}");

    let mut total = 0;
    for key in &keys {
        let rows = read_rows(&train, key)?;
        let range = parse_key(key)?;
        assert_eq!(range.count as usize, rows.len());
        assert!(rows.len() <= 4);
        total += rows.len();
    }
    assert_eq!(total, 10);
    Ok(())
}
