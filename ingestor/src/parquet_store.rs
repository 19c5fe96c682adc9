//! Parquet-backed dataset store.
//!
//! The whole dataset lives in one Parquet file with the columns
//! `device, timestamp, version` followed by one nullable column per metric
//! in the schema registry. Every append writes the next state to a temporary
//! file in the same directory, fsyncs it and renames it over the visible
//! path, so a reader opening the file sees either the previous or the next
//! dataset and never a partial write.

use crate::errors::{Error, Result};
use crate::model::{MetricValue, Reading, DEVICE_COLUMN, RESERVED_COLUMNS, TIMESTAMP_COLUMN, VERSION_COLUMN};
use crate::schema::SchemaRegistry;
use crate::store::{poisoned, Committed, DatasetStore};
use arrow::array::{Array, ArrayRef, AsArray, Float64Array, StringArray, TimestampMicrosecondArray};
use arrow::datatypes::{
    DataType, Field, Float32Type, Float64Type, Int32Type, Int64Type, Schema, TimeUnit,
    TimestampMicrosecondType, TimestampMillisecondType, TimestampNanosecondType,
    TimestampSecondType,
};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

const UTC_TZ: &str = "UTC";
const TEMP_SUFFIX: &str = ".tmp";

pub struct ParquetStore {
    path: PathBuf,
    writer: Mutex<()>,
    committed: RwLock<Committed>,
}

impl std::fmt::Debug for ParquetStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParquetStore")
            .field("path", &self.path)
            .finish()
    }
}

impl ParquetStore {
    /// Opens the dataset at `path`, loading it if present and otherwise
    /// initializing an empty file with the canonical columns.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let dir = parent_dir(&path);
        fs::create_dir_all(&dir)?;
        remove_stale_temp_files(&path)?;

        let readings = if path.exists() {
            let readings = read_dataset(&path)?;
            info!(
                "Loaded existing dataset {} with {} readings",
                path.display(),
                readings.len()
            );
            readings
        } else {
            write_atomic(&path, &[], &SchemaRegistry::new())?;
            info!("Initialized new dataset at {}", path.display());
            Vec::new()
        };

        Ok(Self {
            writer: Mutex::new(()),
            committed: RwLock::new(Committed::new(readings)),
            path,
        })
    }
}

impl DatasetStore for ParquetStore {
    fn append(&self, reading: Reading) -> Result<()> {
        // Serializes appenders. Readers only take the committed lock, and
        // only for the swap below.
        let _writer = self.writer.lock().map_err(|_| poisoned())?;

        let firmware = reading.firmware_version.clone();
        let (next, widened) = self.committed()?.with_reading(reading);
        if widened {
            debug!(
                "Schema widened to {} metric columns by firmware '{}'",
                next.schema.columns().len(),
                firmware
            );
        }

        write_atomic(&self.path, &next.readings, &next.schema)?;

        *self.committed.write().map_err(|_| poisoned())? = next;
        Ok(())
    }

    fn committed(&self) -> Result<Committed> {
        Ok(self.committed.read().map_err(|_| poisoned())?.clone())
    }
}

/// Reads every reading from a dataset file. Usable by readers that do not
/// own the store, e.g. a dashboard process.
pub fn read_dataset(path: &Path) -> Result<Vec<Reading>> {
    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

    let mut readings = Vec::new();
    for batch in reader {
        readings.extend(from_record_batch(&batch?)?);
    }
    Ok(readings)
}

fn write_atomic(path: &Path, readings: &[Reading], registry: &SchemaRegistry) -> Result<()> {
    let batch = to_record_batch(readings, registry)?;
    let dir = parent_dir(path);
    let temp = dir.join(format!(
        ".{}.{}{}",
        file_name(path)?,
        uuid::Uuid::new_v4(),
        TEMP_SUFFIX
    ));

    let written = (|| -> Result<()> {
        let file = File::create(&temp)?;
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
        writer.write(&batch)?;
        let file = writer.into_inner()?;
        file.sync_all()?;
        fs::rename(&temp, path)?;
        Ok(())
    })();

    if let Err(e) = written {
        if let Err(cleanup) = fs::remove_file(&temp) {
            debug!("Could not remove temp file {}: {}", temp.display(), cleanup);
        }
        return Err(e);
    }

    // Persist the rename itself.
    if let Err(e) = File::open(&dir).and_then(|d| d.sync_all()) {
        debug!("Directory fsync of {} failed: {}", dir.display(), e);
    }
    Ok(())
}

fn to_record_batch(readings: &[Reading], registry: &SchemaRegistry) -> Result<RecordBatch> {
    let mut fields = vec![
        Field::new(DEVICE_COLUMN, DataType::Utf8, false),
        Field::new(
            TIMESTAMP_COLUMN,
            DataType::Timestamp(TimeUnit::Microsecond, Some(UTC_TZ.into())),
            false,
        ),
        Field::new(VERSION_COLUMN, DataType::Utf8, false),
    ];
    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from_iter_values(
            readings.iter().map(|r| r.device_id.as_str()),
        )),
        Arc::new(
            TimestampMicrosecondArray::from_iter_values(
                readings.iter().map(|r| r.timestamp.timestamp_micros()),
            )
            .with_timezone(UTC_TZ),
        ),
        Arc::new(StringArray::from_iter_values(
            readings.iter().map(|r| r.firmware_version.as_str()),
        )),
    ];

    for column in registry.columns() {
        let numeric = readings
            .iter()
            .filter_map(|r| r.metrics.get(column))
            .all(|v| !matches!(v, MetricValue::Text(_)));

        if numeric {
            let array: Float64Array = readings
                .iter()
                .map(|r| r.metrics.get(column).and_then(MetricValue::as_f64))
                .collect();
            fields.push(Field::new(column, DataType::Float64, true));
            columns.push(Arc::new(array));
        } else {
            let array: StringArray = readings
                .iter()
                .map(|r| r.metrics.get(column).and_then(MetricValue::render))
                .collect();
            fields.push(Field::new(column, DataType::Utf8, true));
            columns.push(Arc::new(array));
        }
    }

    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?)
}

fn from_record_batch(batch: &RecordBatch) -> Result<Vec<Reading>> {
    let devices = batch
        .column_by_name(DEVICE_COLUMN)
        .ok_or_else(|| Error::Store("dataset has no device column".to_string()))
        .and_then(text_column)?;
    let timestamps = batch
        .column_by_name(TIMESTAMP_COLUMN)
        .ok_or_else(|| Error::Store("dataset has no timestamp column".to_string()))
        .and_then(timestamp_column)?;
    let versions = match batch.column_by_name(VERSION_COLUMN) {
        Some(column) => text_column(column)?,
        None => vec![None; batch.num_rows()],
    };

    let schema = batch.schema();
    let mut metric_columns = Vec::new();
    for (field, array) in schema.fields().iter().zip(batch.columns()) {
        if RESERVED_COLUMNS.contains(&field.name().as_str()) {
            continue;
        }
        match metric_column(array) {
            Some(values) => metric_columns.push((field.name().clone(), values)),
            None => warn!(
                "Skipping column '{}' with unsupported type {}",
                field.name(),
                field.data_type()
            ),
        }
    }

    let mut readings = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let (Some(device_id), Some(timestamp)) = (devices[row].clone(), timestamps[row]) else {
            warn!("Skipping dataset row {} without device or timestamp", row);
            continue;
        };

        let mut metrics = BTreeMap::new();
        for (name, values) in &metric_columns {
            if let Some(value) = &values[row] {
                metrics.insert(name.clone(), value.clone());
            }
        }

        readings.push(Reading {
            device_id,
            timestamp,
            firmware_version: versions[row].clone().unwrap_or_default(),
            metrics,
        });
    }
    Ok(readings)
}

fn text_column(array: &ArrayRef) -> Result<Vec<Option<String>>> {
    match array.data_type() {
        DataType::Utf8 => Ok(array
            .as_string::<i32>()
            .iter()
            .map(|v| v.map(str::to_string))
            .collect()),
        DataType::LargeUtf8 => Ok(array
            .as_string::<i64>()
            .iter()
            .map(|v| v.map(str::to_string))
            .collect()),
        other => Err(Error::Store(format!(
            "expected a string column, found {}",
            other
        ))),
    }
}

fn timestamp_column(array: &ArrayRef) -> Result<Vec<Option<DateTime<Utc>>>> {
    let values = match array.data_type() {
        DataType::Timestamp(TimeUnit::Second, _) => array
            .as_primitive::<TimestampSecondType>()
            .iter()
            .map(|v| v.and_then(|s| Utc.timestamp_opt(s, 0).single()))
            .collect(),
        DataType::Timestamp(TimeUnit::Millisecond, _) => array
            .as_primitive::<TimestampMillisecondType>()
            .iter()
            .map(|v| v.and_then(|ms| Utc.timestamp_millis_opt(ms).single()))
            .collect(),
        DataType::Timestamp(TimeUnit::Microsecond, _) => array
            .as_primitive::<TimestampMicrosecondType>()
            .iter()
            .map(|v| v.and_then(|us| Utc.timestamp_micros(us).single()))
            .collect(),
        DataType::Timestamp(TimeUnit::Nanosecond, _) => array
            .as_primitive::<TimestampNanosecondType>()
            .iter()
            .map(|v| v.map(|ns| Utc.timestamp_nanos(ns)))
            .collect(),
        // Older datasets stored ISO-8601 strings without an offset.
        DataType::Utf8 | DataType::LargeUtf8 => text_column(array)?
            .into_iter()
            .map(|v| v.as_deref().and_then(parse_text_timestamp))
            .collect(),
        other => {
            return Err(Error::Store(format!(
                "unsupported timestamp column type {}",
                other
            )))
        }
    };
    Ok(values)
}

fn parse_text_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|t| Utc.from_utc_datetime(&t))
        })
}

fn metric_column(array: &ArrayRef) -> Option<Vec<Option<MetricValue>>> {
    let values = match array.data_type() {
        DataType::Float64 => array
            .as_primitive::<Float64Type>()
            .iter()
            .map(|v| v.map(number))
            .collect(),
        DataType::Float32 => array
            .as_primitive::<Float32Type>()
            .iter()
            .map(|v| v.map(|n| number(n as f64)))
            .collect(),
        DataType::Int64 => array
            .as_primitive::<Int64Type>()
            .iter()
            .map(|v| v.map(|n| number(n as f64)))
            .collect(),
        DataType::Int32 => array
            .as_primitive::<Int32Type>()
            .iter()
            .map(|v| v.map(|n| number(n as f64)))
            .collect(),
        DataType::Boolean => array
            .as_boolean()
            .iter()
            .map(|v| v.map(|b| MetricValue::Number(if b { 1.0 } else { 0.0 })))
            .collect(),
        DataType::Utf8 | DataType::LargeUtf8 => text_column(array)
            .ok()?
            .into_iter()
            .map(|v| v.map(|s| MetricValue::from_text(&s)))
            .collect(),
        _ => return None,
    };
    Some(values)
}

fn number(n: f64) -> MetricValue {
    if n.is_finite() {
        MetricValue::Number(n)
    } else {
        MetricValue::Text(n.to_string())
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::Config(format!("dataset path {} has no file name", path.display())))
}

/// Temp files left behind by a writer that crashed between create and rename.
fn remove_stale_temp_files(path: &Path) -> Result<()> {
    let prefix = format!(".{}.", file_name(path)?);
    for entry in fs::read_dir(parent_dir(path))? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(&prefix) && name.ends_with(TEMP_SUFFIX) {
            warn!("Removing stale dataset temp file {}", name);
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}
