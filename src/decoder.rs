//! Model output vector to per-room forecast series in degrees Celsius.

use std::fmt;

use chrono::{DateTime, FixedOffset};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::config::PipelineConfig;

pub const FORECAST_TYPE: &str = "Multi-Room Temperature Prediction";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoomForecastPoint {
    pub offset_min: u32,
    pub temp: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForecastMeta {
    #[serde(rename = "type")]
    pub kind: String,
    pub horizon: String,
    pub resolution: String,
    pub model_version: String,
}

/// Room name to forecast series. Serializes as a JSON object whose keys keep
/// insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomForecasts(Vec<(String, Vec<RoomForecastPoint>)>);

impl RoomForecasts {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn room_names(&self) -> Vec<&str> {
        self.0.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn get(&self, room: &str) -> Option<&[RoomForecastPoint]> {
        self.0
            .iter()
            .find(|(name, _)| name == room)
            .map(|(_, points)| points.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[RoomForecastPoint])> {
        self.0
            .iter()
            .map(|(name, points)| (name.as_str(), points.as_slice()))
    }
}

impl Serialize for RoomForecasts {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (room, points) in &self.0 {
            map.serialize_entry(room, points)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for RoomForecasts {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RoomsVisitor;

        impl<'de> Visitor<'de> for RoomsVisitor {
            type Value = RoomForecasts;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of room name to forecast points")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut rooms = Vec::with_capacity(access.size_hint().unwrap_or_default());
                while let Some((room, points)) = access.next_entry()? {
                    rooms.push((room, points));
                }
                Ok(RoomForecasts(rooms))
            }
        }

        deserializer.deserialize_map(RoomsVisitor)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastResult {
    pub timestamp: DateTime<FixedOffset>,
    pub meta: ForecastMeta,
    pub rooms: RoomForecasts,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("no target rooms to decode into")]
    NoRooms,
    #[error("forecast_steps must be > 0")]
    NoSteps,
    #[error("model output has {actual} values, expected {expected} ({rooms} rooms x {steps} steps)")]
    LengthMismatch {
        expected: usize,
        actual: usize,
        rooms: usize,
        steps: usize,
    },
}

/// Reshapes `output` row-major into `(rooms, forecast_steps)` and converts each
/// value back to degrees. Room order follows `rooms`.
pub fn decode_forecast(
    output: &[f32],
    rooms: &[String],
    cfg: &PipelineConfig,
    model_version: &str,
    generated_at: DateTime<FixedOffset>,
) -> Result<ForecastResult, DecodeError> {
    if rooms.is_empty() {
        return Err(DecodeError::NoRooms);
    }
    let steps = cfg.forecast_steps;
    if steps == 0 {
        return Err(DecodeError::NoSteps);
    }
    let expected = rooms.len() * steps;
    if output.len() != expected {
        return Err(DecodeError::LengthMismatch {
            expected,
            actual: output.len(),
            rooms: rooms.len(),
            steps,
        });
    }

    let decoded = rooms
        .iter()
        .zip(output.chunks_exact(steps))
        .map(|(room, row)| {
            let points = row
                .iter()
                .enumerate()
                .map(|(j, value)| RoomForecastPoint {
                    offset_min: (j as u32 + 1) * cfg.bucket_minutes,
                    temp: round2(cfg.temperature_scale.denormalize(f64::from(*value))),
                })
                .collect();
            (room.clone(), points)
        })
        .collect();

    Ok(ForecastResult {
        timestamp: generated_at,
        meta: ForecastMeta {
            kind: FORECAST_TYPE.to_string(),
            horizon: horizon_label(steps, cfg.bucket_minutes),
            resolution: format!("{} min", cfg.bucket_minutes),
            model_version: model_version.to_string(),
        },
        rooms: RoomForecasts(decoded),
    })
}

/// `"3 Hours"` for whole-hour horizons, otherwise `"45 min"`.
pub fn horizon_label(steps: usize, bucket_minutes: u32) -> String {
    let total = steps as u64 * u64::from(bucket_minutes);
    match (total % 60, total / 60) {
        (0, 1) => "1 Hour".to_string(),
        (0, hours) if hours > 0 => format!("{hours} Hours"),
        _ => format!("{total} min"),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
