//! Per-asset grouping, timestamp outer-join and gap filling into one wide frame.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info};

use crate::series::RawSeriesPoint;

#[derive(Debug, Clone, PartialEq)]
pub struct FrameColumn {
    pub name: String,
    pub values: Vec<Option<f64>>,
}

/// Time-indexed table. Timestamps are ascending and unique; each column holds
/// exactly one cell per timestamp.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WideFrame {
    pub timestamps: Vec<DateTime<Utc>>,
    pub columns: Vec<FrameColumn>,
}

impl WideFrame {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty() || self.columns.is_empty()
    }

    pub fn row_count(&self) -> usize {
        self.timestamps.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&FrameColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn null_count(&self) -> usize {
        self.columns
            .iter()
            .map(|c| c.values.iter().filter(|v| v.is_none()).count())
            .sum()
    }
}

/// One asset's flattened points together with the prefix its columns get.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetSeries {
    pub prefix: String,
    pub points: Vec<RawSeriesPoint>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MergeError {
    #[error("column '{0}' is produced by more than one asset")]
    DuplicateColumn(String),
}

/// Groups one asset's points by timestamp. For each metric the first non-null
/// value seen at a timestamp wins; metric columns keep their first-appearance order.
pub fn group_asset_points(points: &[RawSeriesPoint], prefix: &str) -> WideFrame {
    let timestamps: Vec<DateTime<Utc>> = points
        .iter()
        .map(|p| p.timestamp)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut metric_index: HashMap<&str, usize> = HashMap::new();
    let mut columns: Vec<FrameColumn> = Vec::new();

    for point in points {
        let col_idx = *metric_index.entry(point.metric.as_str()).or_insert_with(|| {
            columns.push(FrameColumn {
                name: format!("{prefix}_{}", point.metric),
                values: vec![None; timestamps.len()],
            });
            columns.len() - 1
        });
        let Ok(row_idx) = timestamps.binary_search(&point.timestamp) else {
            continue;
        };
        let cell = &mut columns[col_idx].values[row_idx];
        if cell.is_none() {
            *cell = point.value;
        }
    }

    WideFrame {
        timestamps,
        columns,
    }
}

/// Full outer join on timestamp. Column order follows the order of `frames`.
pub fn outer_join(frames: Vec<WideFrame>) -> Result<WideFrame, MergeError> {
    let timestamps: Vec<DateTime<Utc>> = frames
        .iter()
        .flat_map(|f| f.timestamps.iter().copied())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut seen = HashSet::new();
    let mut columns = Vec::new();
    for frame in frames {
        let positions: Vec<usize> = frame
            .timestamps
            .iter()
            .map(|ts| timestamps.binary_search(ts).unwrap_or_default())
            .collect();
        for column in frame.columns {
            if !seen.insert(column.name.clone()) {
                return Err(MergeError::DuplicateColumn(column.name));
            }
            let mut values = vec![None; timestamps.len()];
            for (src_idx, value) in column.values.into_iter().enumerate() {
                values[positions[src_idx]] = value;
            }
            columns.push(FrameColumn {
                name: column.name,
                values,
            });
        }
    }

    Ok(WideFrame {
        timestamps,
        columns,
    })
}

/// Fills every column in place: time-weighted linear interpolation between known
/// cells, then forward fill, then backward fill. All-null columns stay null.
pub fn fill_gaps(frame: &mut WideFrame) {
    let times: Vec<i64> = frame.timestamps.iter().map(|t| t.timestamp_millis()).collect();
    for column in &mut frame.columns {
        fill_series(&times, &mut column.values);
    }
}

pub(crate) fn fill_series(times: &[i64], values: &mut [Option<f64>]) {
    let known: Vec<usize> = values
        .iter()
        .enumerate()
        .filter_map(|(idx, v)| v.map(|_| idx))
        .collect();
    let (Some(&first), Some(&last)) = (known.first(), known.last()) else {
        return;
    };

    for pair in known.windows(2) {
        let (left, right) = (pair[0], pair[1]);
        if right - left < 2 {
            continue;
        }
        let (Some(left_value), Some(right_value)) = (values[left], values[right]) else {
            continue;
        };
        let span = (times[right] - times[left]) as f64;
        for idx in left + 1..right {
            let weight = if span > 0.0 {
                (times[idx] - times[left]) as f64 / span
            } else {
                (idx - left) as f64 / (right - left) as f64
            };
            values[idx] = Some(left_value + (right_value - left_value) * weight);
        }
    }

    let tail = values[last];
    for cell in values.iter_mut().skip(last + 1) {
        *cell = tail;
    }
    let head = values[first];
    for cell in values.iter_mut().take(first) {
        *cell = head;
    }
}

/// Groups, prefixes, joins and fills every asset's series. Assets with no points
/// contribute nothing; if none have points the result is [`WideFrame::empty`].
pub fn merge_asset_series(assets: &[AssetSeries]) -> Result<WideFrame, MergeError> {
    let frames: Vec<WideFrame> = assets
        .iter()
        .filter(|asset| !asset.points.is_empty())
        .map(|asset| {
            let frame = group_asset_points(&asset.points, &asset.prefix);
            debug!(
                component = "merge",
                event = "merge.asset.grouped",
                prefix = %asset.prefix,
                points = asset.points.len(),
                rows = frame.row_count(),
                columns = frame.column_count()
            );
            frame
        })
        .collect();

    if frames.is_empty() {
        return Ok(WideFrame::empty());
    }

    let mut merged = outer_join(frames)?;
    let nulls_before = merged.null_count();
    fill_gaps(&mut merged);

    info!(
        component = "merge",
        event = "merge.complete",
        rows = merged.row_count(),
        columns = merged.column_count(),
        filled_cells = nulls_before - merged.null_count()
    );

    Ok(merged)
}
