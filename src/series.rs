//! Flattening of the sensor API's nested per-asset payload into observation rows.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Epoch values above this are treated as milliseconds rather than seconds.
const EPOCH_MILLIS_THRESHOLD: f64 = 1e11;

/// Raw `aggregateseries` response for one asset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetPayload {
    #[serde(default)]
    pub data_sources: Vec<DataSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSource {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub data_series: Vec<DataSeries>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSeries {
    pub key: String,
    #[serde(default)]
    pub value: Vec<ValuePoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValuePoint {
    pub key: Value,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawSeriesPoint {
    pub sensor_id: i64,
    pub sensor_type: String,
    pub timestamp: DateTime<Utc>,
    pub metric: String,
    pub value: Option<f64>,
}

#[derive(Debug, Error, PartialEq)]
pub enum SeriesError {
    #[error("unparseable timestamp {raw} in series '{series_key}'")]
    InvalidTimestamp { series_key: String, raw: String },
}

/// Metric name of a composite series key: second `|` segment, cut at the first `#`.
pub fn metric_from_series_key(key: &str) -> &str {
    let segment = key.split('|').nth(1).unwrap_or(key);
    segment.split('#').next().unwrap_or(segment)
}

pub fn extract_series_points(
    payload: &AssetPayload,
    asset_id: i64,
) -> Result<Vec<RawSeriesPoint>, SeriesError> {
    let mut points = Vec::new();

    for source in &payload.data_sources {
        for series in &source.data_series {
            let metric = metric_from_series_key(&series.key);
            for entry in &series.value {
                let timestamp =
                    parse_timestamp(&entry.key).ok_or_else(|| SeriesError::InvalidTimestamp {
                        series_key: series.key.clone(),
                        raw: entry.key.to_string(),
                    })?;
                points.push(RawSeriesPoint {
                    sensor_id: asset_id,
                    sensor_type: source.name.clone(),
                    timestamp,
                    metric: metric.to_string(),
                    value: parse_value(&entry.value),
                });
            }
        }
    }

    Ok(points)
}

pub fn parse_timestamp(raw: &Value) -> Option<DateTime<Utc>> {
    match raw {
        Value::String(text) => parse_timestamp_str(text),
        Value::Number(number) => {
            let epoch = number.as_f64()?;
            let millis = if epoch.abs() >= EPOCH_MILLIS_THRESHOLD {
                epoch
            } else {
                epoch * 1_000.0
            };
            Utc.timestamp_millis_opt(millis.round() as i64).single()
        }
        _ => None,
    }
}

fn parse_timestamp_str(text: &str) -> Option<DateTime<Utc>> {
    let trimmed = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(epoch) = trimmed.parse::<f64>() {
        return parse_timestamp(&Value::from(epoch));
    }
    None
}

fn parse_value(raw: &Value) -> Option<f64> {
    let value = match raw {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        Value::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
        _ => None,
    }?;
    value.is_finite().then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> AssetPayload {
        serde_json::from_value(value).expect("payload should deserialize")
    }

    #[test]
    fn metric_is_second_segment_before_hash() {
        assert_eq!(metric_from_series_key("9825|temperature#avg|x"), "temperature");
        assert_eq!(metric_from_series_key("9825|pir"), "pir");
        assert_eq!(metric_from_series_key("standalone"), "standalone");
    }

    #[test]
    fn flattens_every_point_with_asset_tags() {
        let raw = payload(json!({
            "dataSources": [{
                "name": "Thermostat",
                "dataSeries": [
                    {"key": "a|temperature#1", "value": [
                        {"key": "2025-01-06T10:00:00Z", "value": 20.5},
                        {"key": "2025-01-06T10:05:00Z", "value": "21.0"}
                    ]},
                    {"key": "a|setpoint", "value": [
                        {"key": "2025-01-06T10:00:00Z", "value": null}
                    ]}
                ]
            }]
        }));

        let points = extract_series_points(&raw, 9825).unwrap();
        assert_eq!(points.len(), 3);
        assert!(points.iter().all(|p| p.sensor_id == 9825));
        assert!(points.iter().all(|p| p.sensor_type == "Thermostat"));
        assert_eq!(points[0].metric, "temperature");
        assert_eq!(points[1].value, Some(21.0));
        assert_eq!(points[2].metric, "setpoint");
        assert_eq!(points[2].value, None);
    }

    #[test]
    fn empty_payload_yields_no_points() {
        let points = extract_series_points(&payload(json!({})), 1).unwrap();
        assert!(points.is_empty());

        let points =
            extract_series_points(&payload(json!({"dataSources": [{"name": "x"}]})), 1).unwrap();
        assert!(points.is_empty());
    }

    #[test]
    fn timestamp_formats_are_accepted() {
        let expected = Utc.with_ymd_and_hms(2025, 1, 6, 10, 0, 0).unwrap();
        assert_eq!(parse_timestamp(&json!("2025-01-06T10:00:00Z")), Some(expected));
        assert_eq!(parse_timestamp(&json!("2025-01-06T11:00:00+01:00")), Some(expected));
        assert_eq!(parse_timestamp(&json!("2025-01-06 10:00:00")), Some(expected));
        assert_eq!(parse_timestamp(&json!(1_736_157_600)), Some(expected));
        assert_eq!(parse_timestamp(&json!(1_736_157_600_000_i64)), Some(expected));
        assert_eq!(parse_timestamp(&json!("yesterday")), None);
    }

    #[test]
    fn bad_timestamp_is_reported_with_series_key() {
        let raw = payload(json!({
            "dataSources": [{"name": "x", "dataSeries": [
                {"key": "a|temperature", "value": [{"key": "not-a-time", "value": 1.0}]}
            ]}]
        }));
        let err = extract_series_points(&raw, 1).unwrap_err();
        assert!(matches!(err, SeriesError::InvalidTimestamp { ref series_key, .. } if series_key == "a|temperature"));
    }
}
