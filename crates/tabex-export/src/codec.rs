//! Columnar encoding of conformed batches
//!
//! The pipeline only needs "batch + schema in, bytes out"; the Parquet codec
//! is the one implementation shipped. Each encoded buffer is a complete,
//! independently readable file.

use arrow::array::{
    ArrayRef, BooleanBuilder, Date32Builder, Decimal128Builder, Float64Builder, Int64Builder,
    StringBuilder, TimestampMicrosecondBuilder,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::Datelike;
use clap::ValueEnum;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression as ParquetCompression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use std::sync::Arc;

use crate::error::{ExportError, Result};
use crate::model::{RowBatch, Value};
use crate::schema::{ColumnSchema, ColumnType};

/// Days between 0001-01-01 and 1970-01-01
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

const ZSTD_LEVEL: i32 = 3;

/// Compression preset applied to every part
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Compression {
    /// Snappy: cheap to encode and decode
    #[default]
    Fast,
    /// ZSTD level 3
    HighRatio,
    None,
}

impl Compression {
    fn to_parquet(self) -> Result<ParquetCompression> {
        Ok(match self {
            Compression::Fast => ParquetCompression::SNAPPY,
            Compression::HighRatio => ParquetCompression::ZSTD(ZstdLevel::try_new(ZSTD_LEVEL)?),
            Compression::None => ParquetCompression::UNCOMPRESSED,
        })
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Compression::Fast => f.write_str("fast"),
            Compression::HighRatio => f.write_str("high-ratio"),
            Compression::None => f.write_str("none"),
        }
    }
}

/// Encodes one conformed batch into a self-contained columnar file
pub trait ColumnarCodec: Send + Sync {
    /// File extension without the dot
    fn extension(&self) -> &'static str;

    fn encode(
        &self,
        schema: &ColumnSchema,
        batch: &RowBatch,
        compression: Compression,
    ) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ParquetCodec;

impl ColumnarCodec for ParquetCodec {
    fn extension(&self) -> &'static str {
        "parquet"
    }

    fn encode(
        &self,
        schema: &ColumnSchema,
        batch: &RowBatch,
        compression: Compression,
    ) -> Result<Vec<u8>> {
        let arrow_schema = arrow_schema(schema);
        let columns = schema
            .columns()
            .iter()
            .enumerate()
            .map(|(index, column)| build_array(column.data_type, batch, index, &column.name))
            .collect::<Result<Vec<_>>>()?;

        let record_batch = RecordBatch::try_new(arrow_schema.clone(), columns)?;

        let props = WriterProperties::builder()
            .set_compression(compression.to_parquet()?)
            .set_max_row_group_size(batch.len().max(1))
            .build();

        let mut buffer = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buffer, arrow_schema, Some(props))?;
        writer.write(&record_batch)?;
        writer.close()?;

        Ok(buffer)
    }
}

pub fn arrow_type(data_type: ColumnType) -> DataType {
    match data_type {
        ColumnType::Boolean => DataType::Boolean,
        ColumnType::Integer => DataType::Int64,
        ColumnType::Float => DataType::Float64,
        ColumnType::Decimal { precision, scale } => DataType::Decimal128(precision, scale as i8),
        ColumnType::Date => DataType::Date32,
        ColumnType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, None),
        ColumnType::String => DataType::Utf8,
    }
}

/// Arrow schema for a frozen column schema; every column is nullable
pub fn arrow_schema(schema: &ColumnSchema) -> SchemaRef {
    let fields: Vec<Field> = schema
        .columns()
        .iter()
        .map(|c| Field::new(&c.name, arrow_type(c.data_type), true))
        .collect();
    Arc::new(Schema::new(fields))
}

fn mismatch(column: &str, value: &Value, data_type: ColumnType) -> ExportError {
    ExportError::Encode(format!(
        "column '{}' holds '{}' which is not a conformed {} value",
        column, value, data_type
    ))
}

fn build_array(
    data_type: ColumnType,
    batch: &RowBatch,
    index: usize,
    name: &str,
) -> Result<ArrayRef> {
    let len = batch.len();
    let values = batch.column(index);

    let array: ArrayRef = match data_type {
        ColumnType::Boolean => {
            let mut builder = BooleanBuilder::with_capacity(len);
            for value in values {
                match value {
                    Value::Null => builder.append_null(),
                    Value::Bool(b) => builder.append_value(*b),
                    other => return Err(mismatch(name, other, data_type)),
                }
            }
            Arc::new(builder.finish())
        },
        ColumnType::Integer => {
            let mut builder = Int64Builder::with_capacity(len);
            for value in values {
                match value {
                    Value::Null => builder.append_null(),
                    Value::Int(i) => builder.append_value(*i),
                    other => return Err(mismatch(name, other, data_type)),
                }
            }
            Arc::new(builder.finish())
        },
        ColumnType::Float => {
            let mut builder = Float64Builder::with_capacity(len);
            for value in values {
                match value {
                    Value::Null => builder.append_null(),
                    Value::Float(x) => builder.append_value(*x),
                    other => return Err(mismatch(name, other, data_type)),
                }
            }
            Arc::new(builder.finish())
        },
        ColumnType::Decimal { precision, scale } => {
            let mut builder = Decimal128Builder::with_capacity(len)
                .with_precision_and_scale(precision, scale as i8)?;
            for value in values {
                match value {
                    Value::Null => builder.append_null(),
                    Value::Decimal(d) => builder.append_value(*d),
                    other => return Err(mismatch(name, other, data_type)),
                }
            }
            Arc::new(builder.finish())
        },
        ColumnType::Date => {
            let mut builder = Date32Builder::with_capacity(len);
            for value in values {
                match value {
                    Value::Null => builder.append_null(),
                    Value::Date(d) => {
                        builder.append_value(d.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE)
                    },
                    other => return Err(mismatch(name, other, data_type)),
                }
            }
            Arc::new(builder.finish())
        },
        ColumnType::Timestamp => {
            let mut builder = TimestampMicrosecondBuilder::with_capacity(len);
            for value in values {
                match value {
                    Value::Null => builder.append_null(),
                    Value::Timestamp(ts) => builder.append_value(ts.and_utc().timestamp_micros()),
                    other => return Err(mismatch(name, other, data_type)),
                }
            }
            Arc::new(builder.finish())
        },
        ColumnType::String => {
            let mut builder = StringBuilder::with_capacity(len, len * 16);
            for value in values {
                match value {
                    Value::Null => builder.append_null(),
                    Value::Text(s) => builder.append_value(s),
                    other => builder.append_value(other.to_string()),
                }
            }
            Arc::new(builder.finish())
        },
    };

    Ok(array)
}
