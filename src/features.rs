//! Wide sensor frame to model feature frame: column selection, fixed-cadence
//! resampling in the operating time zone, and cyclical time encodings.

use std::f64::consts::PI;

use chrono::{DateTime, Datelike, Offset, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::config::PipelineConfig;
use crate::merge::{fill_series, WideFrame};

pub const FEATURE_SCHEMA_VERSION: u32 = 1;
pub const CYCLICAL_COLUMNS: [&str; 4] = ["hour_sin", "hour_cos", "day_sin", "day_cos"];

const TEMPERATURE_KEYWORD: &str = "temperature";
const SETPOINT_KEYWORD: &str = "set";
const PRESENCE_KEYWORD: &str = "pir";
const MAX_BUCKETS: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureKind {
    Temperature,
    Setpoint,
    Presence,
    Cyclical,
}

impl FeatureKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Setpoint => "setpoint",
            Self::Presence => "presence",
            Self::Cyclical => "cyclical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub kind: FeatureKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub bucket_minutes: u32,
    pub columns: Vec<FeatureColumn>,
    pub target_rooms: Vec<String>,
}

impl FeatureSchema {
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Resampled, gap-free feature table. `values` is column-major and lines up with
/// `schema.columns`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureFrame {
    pub timestamps: Vec<DateTime<Tz>>,
    pub schema: FeatureSchema,
    pub values: Vec<Vec<f64>>,
}

impl FeatureFrame {
    pub fn row_count(&self) -> usize {
        self.timestamps.len()
    }

    pub fn column_count(&self) -> usize {
        self.schema.columns.len()
    }

    pub fn target_rooms(&self) -> &[String] {
        &self.schema.target_rooms
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.schema
            .columns
            .iter()
            .position(|c| c.name == name)
            .map(|idx| self.values[idx].as_slice())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FeatureError {
    #[error("wide frame is empty")]
    EmptyFrame,
    #[error("no temperature, setpoint or presence columns left after filtering")]
    NoFeatureColumns,
    #[error("no target room columns ending in '{TEMPERATURE_KEYWORD}'")]
    NoTargetRooms,
    #[error("column '{0}' has no values to fill from")]
    UnfillableColumn(String),
    #[error("resampling would produce {buckets} buckets (max {max})")]
    TooManyBuckets { buckets: usize, max: usize },
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
}

/// Feature role of a wide-frame column, or `None` if the column is not a model input.
pub fn classify_column(name: &str) -> Option<FeatureKind> {
    let lower = name.to_lowercase();
    if lower.contains(TEMPERATURE_KEYWORD) {
        Some(FeatureKind::Temperature)
    } else if lower.contains(PRESENCE_KEYWORD) {
        Some(FeatureKind::Presence)
    } else if lower.contains(SETPOINT_KEYWORD) {
        Some(FeatureKind::Setpoint)
    } else {
        None
    }
}

/// Presence wins for resampling: any `pir` column takes the bucket max, even one
/// that normalizes as a temperature.
fn aggregates_by_max(name: &str) -> bool {
    name.to_lowercase().contains(PRESENCE_KEYWORD)
}

pub fn is_target_room(name: &str) -> bool {
    name.to_lowercase().ends_with(TEMPERATURE_KEYWORD)
}

pub fn build_feature_frame(
    frame: &WideFrame,
    cfg: &PipelineConfig,
) -> Result<FeatureFrame, FeatureError> {
    if frame.is_empty() {
        return Err(FeatureError::EmptyFrame);
    }

    let kept: Vec<_> = frame
        .columns
        .iter()
        .filter(|c| !cfg.exclude_pattern.is_match(&c.name))
        .collect();
    let target_rooms: Vec<String> = kept
        .iter()
        .filter(|c| is_target_room(&c.name))
        .map(|c| c.name.clone())
        .collect();
    let selected: Vec<_> = kept
        .into_iter()
        .filter_map(|c| classify_column(&c.name).map(|kind| (c, kind)))
        .collect();

    if selected.is_empty() {
        return Err(FeatureError::NoFeatureColumns);
    }
    if target_rooms.is_empty() {
        return Err(FeatureError::NoTargetRooms);
    }

    let tz = cfg.timezone;
    let width_ms = cfg.bucket_seconds() * 1_000;
    let bucket_of: Vec<i64> = frame
        .timestamps
        .iter()
        .map(|ts| bucket_start_ms(ts, &tz, width_ms))
        .collect();
    let first_bucket = bucket_of.iter().copied().min().unwrap_or_default();
    let last_bucket = bucket_of.iter().copied().max().unwrap_or_default();
    let bucket_count = ((last_bucket - first_bucket) / width_ms) as usize + 1;
    if bucket_count > MAX_BUCKETS {
        return Err(FeatureError::TooManyBuckets {
            buckets: bucket_count,
            max: MAX_BUCKETS,
        });
    }
    let bucket_times: Vec<i64> = (0..bucket_count as i64)
        .map(|idx| first_bucket + idx * width_ms)
        .collect();

    let mut columns = Vec::with_capacity(selected.len() + CYCLICAL_COLUMNS.len());
    let mut values = Vec::with_capacity(selected.len() + CYCLICAL_COLUMNS.len());
    for (column, kind) in selected {
        let mut resampled = resample_column(
            &column.values,
            &bucket_of,
            first_bucket,
            width_ms,
            bucket_count,
            aggregates_by_max(&column.name),
        );
        fill_series(&bucket_times, &mut resampled);
        let dense: Option<Vec<f64>> = resampled.into_iter().collect();
        let dense = dense.ok_or_else(|| FeatureError::UnfillableColumn(column.name.clone()))?;
        columns.push(FeatureColumn {
            name: column.name.clone(),
            kind,
        });
        values.push(dense);
    }

    let timestamps: Vec<DateTime<Tz>> = bucket_times
        .iter()
        .filter_map(|ms| Utc.timestamp_millis_opt(*ms).single())
        .map(|utc| utc.with_timezone(&tz))
        .collect();
    for (name, series) in CYCLICAL_COLUMNS.iter().zip(cyclical_columns(&timestamps)) {
        columns.push(FeatureColumn {
            name: (*name).to_string(),
            kind: FeatureKind::Cyclical,
        });
        values.push(series);
    }

    let schema = build_feature_schema(cfg.bucket_minutes, columns, target_rooms);
    info!(
        component = "features",
        event = "features.frame.built",
        input_rows = frame.row_count(),
        buckets = timestamps.len(),
        columns = schema.columns.len(),
        target_rooms = schema.target_rooms.len(),
        fingerprint = %schema.fingerprint
    );

    Ok(FeatureFrame {
        timestamps,
        schema,
        values,
    })
}

pub fn build_feature_schema(
    bucket_minutes: u32,
    columns: Vec<FeatureColumn>,
    target_rooms: Vec<String>,
) -> FeatureSchema {
    let fingerprint = schema_fingerprint(bucket_minutes, &columns, &target_rooms);
    FeatureSchema {
        version: FEATURE_SCHEMA_VERSION,
        fingerprint,
        bucket_minutes,
        columns,
        target_rooms,
    }
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), FeatureError> {
    if expected_version != actual.version {
        return Err(FeatureError::SchemaVersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(FeatureError::SchemaFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

/// Start of the bucket holding `ts`, aligned to local wall-clock multiples of the width.
fn bucket_start_ms(ts: &DateTime<Utc>, tz: &Tz, width_ms: i64) -> i64 {
    let offset_ms = i64::from(ts.with_timezone(tz).offset().fix().local_minus_utc()) * 1_000;
    let local_ms = ts.timestamp_millis() + offset_ms;
    local_ms.div_euclid(width_ms) * width_ms - offset_ms
}

fn resample_column(
    values: &[Option<f64>],
    bucket_of: &[i64],
    first_bucket: i64,
    width_ms: i64,
    bucket_count: usize,
    by_max: bool,
) -> Vec<Option<f64>> {
    let mut sums = vec![0.0; bucket_count];
    let mut counts = vec![0usize; bucket_count];
    let mut maxima: Vec<Option<f64>> = vec![None; bucket_count];

    for (value, bucket) in values.iter().zip(bucket_of) {
        let Some(value) = value else {
            continue;
        };
        let idx = ((bucket - first_bucket) / width_ms) as usize;
        sums[idx] += value;
        counts[idx] += 1;
        maxima[idx] = Some(maxima[idx].map_or(*value, |m| m.max(*value)));
    }

    if by_max {
        return maxima;
    }
    sums.into_iter()
        .zip(counts)
        .map(|(sum, count)| (count > 0).then(|| sum / count as f64))
        .collect()
}

fn cyclical_columns(timestamps: &[DateTime<Tz>]) -> [Vec<f64>; 4] {
    let mut out: [Vec<f64>; 4] = Default::default();
    for ts in timestamps {
        let hour_angle = 2.0 * PI * f64::from(ts.hour()) / 24.0;
        let day_angle = 2.0 * PI * f64::from(ts.weekday().num_days_from_monday()) / 7.0;
        out[0].push(hour_angle.sin());
        out[1].push(hour_angle.cos());
        out[2].push(day_angle.sin());
        out[3].push(day_angle.cos());
    }
    out
}

fn schema_fingerprint(
    bucket_minutes: u32,
    columns: &[FeatureColumn],
    target_rooms: &[String],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{FEATURE_SCHEMA_VERSION};"));
    hasher.update(format!("bucket_minutes:{bucket_minutes};"));
    hasher.update("columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(format!(":{};", column.kind.as_str()));
    }
    hasher.update("targets:");
    for room in target_rooms {
        hasher.update(room.as_bytes());
        hasher.update(";");
    }
    hex::encode(hasher.finalize())
}
