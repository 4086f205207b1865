//! Feature frame to fixed-shape, `[0,1]`-bounded model input.

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{PipelineConfig, ShortWindowPolicy, TemperatureScale};
use crate::features::{FeatureFrame, FeatureKind};

/// Row-major `(rows, cols)` matrix of model inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct InputTensor {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
    padded_rows: usize,
}

impl InputTensor {
    pub fn from_rows(rows: Vec<Vec<f32>>) -> Result<Self, TensorError> {
        let row_count = rows.len();
        let cols = rows.first().map(Vec::len).unwrap_or_default();
        if row_count == 0 || cols == 0 {
            return Err(TensorError::Empty);
        }
        if let Some(bad) = rows.iter().find(|r| r.len() != cols) {
            return Err(TensorError::RaggedRows {
                expected: cols,
                found: bad.len(),
            });
        }
        Ok(Self {
            rows: row_count,
            cols,
            data: rows.into_iter().flatten().collect(),
            padded_rows: 0,
        })
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn row(&self, idx: usize) -> &[f32] {
        &self.data[idx * self.cols..(idx + 1) * self.cols]
    }

    /// Rows synthesized by the short-window policy rather than taken from data.
    pub fn padded_rows(&self) -> usize {
        self.padded_rows
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TensorError {
    #[error("feature frame has no rows")]
    Empty,
    #[error("rows must all have {expected} columns, found one with {found}")]
    RaggedRows { expected: usize, found: usize },
    #[error("only {available} buckets available, lookback window needs {required}")]
    WindowTooShort { available: usize, required: usize },
    #[error("target room '{0}' is not a temperature column of the feature frame")]
    MissingTargetColumn(String),
}

/// Applies the per-kind scaling and the global `[0,1]` clip. Output is column-major.
pub fn normalize_columns(frame: &FeatureFrame, scale: &TemperatureScale) -> Vec<Vec<f64>> {
    frame
        .schema
        .columns
        .iter()
        .zip(&frame.values)
        .map(|(column, values)| {
            values
                .iter()
                .map(|v| {
                    let scaled = match column.kind {
                        FeatureKind::Temperature => scale.normalize(*v),
                        FeatureKind::Presence => v.clamp(0.0, 1.0),
                        FeatureKind::Cyclical => (v + 1.0) / 2.0,
                        FeatureKind::Setpoint => *v,
                    };
                    scaled.clamp(0.0, 1.0)
                })
                .collect()
        })
        .collect()
}

pub fn build_input_tensor(
    frame: &FeatureFrame,
    cfg: &PipelineConfig,
) -> Result<InputTensor, TensorError> {
    validate_targets(frame)?;

    let available = frame.row_count();
    let required = cfg.lookback_steps;
    if available == 0 {
        return Err(TensorError::Empty);
    }

    let normalized = normalize_columns(frame, &cfg.temperature_scale);
    let start = available.saturating_sub(required);
    let mut rows: Vec<Vec<f32>> = (start..available)
        .map(|r| normalized.iter().map(|col| col[r] as f32).collect())
        .collect();

    let missing = required.saturating_sub(rows.len());
    if missing > 0 {
        let filler = match cfg.short_window_policy {
            ShortWindowPolicy::Reject => {
                return Err(TensorError::WindowTooShort {
                    available,
                    required,
                })
            }
            ShortWindowPolicy::PadEarliest => rows[0].clone(),
            ShortWindowPolicy::PadZeros => vec![0.0; frame.column_count()],
        };
        warn!(
            component = "tensor",
            event = "tensor.window.padded",
            available,
            required,
            policy = ?cfg.short_window_policy
        );
        let mut padded = vec![filler; missing];
        padded.append(&mut rows);
        rows = padded;
    }

    let mut tensor = InputTensor::from_rows(rows)?;
    tensor.padded_rows = missing;
    debug!(
        component = "tensor",
        event = "tensor.built",
        rows = tensor.rows,
        cols = tensor.cols,
        padded_rows = missing
    );
    Ok(tensor)
}

fn validate_targets(frame: &FeatureFrame) -> Result<(), TensorError> {
    for room in frame.target_rooms() {
        let is_temperature = frame
            .schema
            .columns
            .iter()
            .any(|c| &c.name == room && c.kind == FeatureKind::Temperature);
        if !is_temperature {
            return Err(TensorError::MissingTargetColumn(room.clone()));
        }
    }
    Ok(())
}
