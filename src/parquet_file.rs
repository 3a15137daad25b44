//! Rewarded-decision rows to and from parquet bytes.
//!
//! One partition object is one parquet file holding the fixed row schema.
//! Json-valued columns are utf8 strings of canonical (key-sorted) json.

use std::str::FromStr;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, Float64Array, Int64Array, ListArray, ListBuilder, StringArray, StringBuilder,
    TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;

use crate::error::{Error, Result};
use crate::ksuid::Ksuid;
use crate::record::RewardedDecisionRecord;

const READ_BATCH_SIZE: usize = 2048;

pub fn rewarded_decision_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("decision_id", DataType::Utf8, false),
        Field::new(
            "timestamp",
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            true,
        ),
        Field::new("variant", DataType::Utf8, true),
        Field::new("givens", DataType::Utf8, true),
        Field::new("count", DataType::Int64, true),
        Field::new(
            "runners_up",
            DataType::List(Arc::new(Field::new("item", DataType::Utf8, true))),
            true,
        ),
        Field::new("sample", DataType::Utf8, true),
        Field::new("rewards", DataType::Utf8, true),
        Field::new("reward", DataType::Float64, true),
    ]))
}

/// Encode rows into a compressed parquet object.
pub fn encode_partition(rows: &[RewardedDecisionRecord]) -> Result<Vec<u8>> {
    let schema = rewarded_decision_schema();
    let batch = to_record_batch(&schema, rows)?;

    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::default()))
        .build();

    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, schema, Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(buffer)
}

/// Decode a partition object back into rows.
///
/// Structural problems (truncated file, wrong column types) surface as
/// `Parquet`/`Arrow` errors; rows whose decision_id is not a valid ksuid
/// surface as `InvalidRecord`, which callers treat as a quarantine case
/// rather than a read failure.
pub fn decode_partition(data: Bytes) -> Result<Vec<RewardedDecisionRecord>> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(data)?
        .with_batch_size(READ_BATCH_SIZE)
        .build()?;

    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch?;
        let decision_id = get_array::<StringArray>(&batch, "decision_id")?;
        let timestamp = get_array::<TimestampMicrosecondArray>(&batch, "timestamp")?;
        let variant = get_array::<StringArray>(&batch, "variant")?;
        let givens = get_array::<StringArray>(&batch, "givens")?;
        let count = get_array::<Int64Array>(&batch, "count")?;
        let runners_up = get_array::<ListArray>(&batch, "runners_up")?;
        let sample = get_array::<StringArray>(&batch, "sample")?;
        let rewards = get_array::<StringArray>(&batch, "rewards")?;
        let reward = get_array::<Float64Array>(&batch, "reward")?;

        for i in 0..batch.num_rows() {
            if decision_id.is_null(i) {
                return Err(Error::InvalidRecord("null decision_id"));
            }
            let decision_id = Ksuid::from_str(decision_id.value(i))
                .map_err(|_| Error::InvalidRecord("invalid decision_id"))?;

            let runners_up = if runners_up.is_null(i) {
                None
            } else {
                let values = runners_up.value(i);
                let values = values
                    .as_any()
                    .downcast_ref::<StringArray>()
                    .ok_or(Error::InvalidRecord("runners_up is not a string list"))?;
                Some(
                    (0..values.len())
                        .map(|j| values.value(j).to_string())
                        .collect(),
                )
            };

            rows.push(RewardedDecisionRecord {
                decision_id,
                timestamp: value_at(timestamp, i, |a, i| a.value(i)),
                variant: value_at(variant, i, |a, i| a.value(i).to_string()),
                givens: value_at(givens, i, |a, i| a.value(i).to_string()),
                count: value_at(count, i, |a, i| a.value(i)),
                runners_up,
                sample: value_at(sample, i, |a, i| a.value(i).to_string()),
                rewards: value_at(rewards, i, |a, i| a.value(i).to_string()),
                reward: value_at(reward, i, |a, i| a.value(i)),
            });
        }
    }
    Ok(rows)
}

fn to_record_batch(schema: &SchemaRef, rows: &[RewardedDecisionRecord]) -> Result<RecordBatch> {
    let decision_id: StringArray = rows.iter().map(|r| Some(r.decision_id.to_string())).collect();
    let timestamp = TimestampMicrosecondArray::from(
        rows.iter().map(|r| r.timestamp).collect::<Vec<_>>(),
    )
    .with_timezone("UTC");
    let variant: StringArray = rows.iter().map(|r| r.variant.as_deref()).collect();
    let givens: StringArray = rows.iter().map(|r| r.givens.as_deref()).collect();
    let count = Int64Array::from(rows.iter().map(|r| r.count).collect::<Vec<_>>());
    let sample: StringArray = rows.iter().map(|r| r.sample.as_deref()).collect();
    let rewards: StringArray = rows.iter().map(|r| r.rewards.as_deref()).collect();
    let reward = Float64Array::from(rows.iter().map(|r| r.reward).collect::<Vec<_>>());

    let mut runners_up = ListBuilder::new(StringBuilder::new());
    for row in rows {
        match &row.runners_up {
            Some(items) => {
                for item in items {
                    runners_up.values().append_value(item);
                }
                runners_up.append(true);
            }
            None => runners_up.append(false),
        }
    }

    let columns: Vec<ArrayRef> = vec![
        Arc::new(decision_id),
        Arc::new(timestamp),
        Arc::new(variant),
        Arc::new(givens),
        Arc::new(count),
        Arc::new(runners_up.finish()),
        Arc::new(sample),
        Arc::new(rewards),
        Arc::new(reward),
    ];
    Ok(RecordBatch::try_new(Arc::clone(schema), columns)?)
}

fn value_at<A: Array, T>(array: &A, index: usize, get: impl Fn(&A, usize) -> T) -> Option<T> {
    if array.is_null(index) {
        None
    } else {
        Some(get(array, index))
    }
}

fn get_array<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    let column = batch
        .schema()
        .column_with_name(name)
        .ok_or(Error::InvalidRecord("missing column"))?
        .0;
    batch
        .column(column)
        .as_any()
        .downcast_ref::<T>()
        .ok_or(Error::InvalidRecord("column has unexpected type"))
}
