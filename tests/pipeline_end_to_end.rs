use std::io::Write;

use chrono::{TimeZone, Utc};
use serde_json::json;
use thermocast::{
    build_feature_frame, build_input_tensor, extract_series_points, merge_asset_series,
    Activation, AssetConfig, AssetPayload, AssetSeries, DenseLayerSpec, ModelSlot,
    PipelineConfig, Predictor, TemperatureScale, WeightsDocument, WeightsFileLoader, WideFrame,
};

const STAMPS: [&str; 3] = [
    "2025-01-06T10:00:00Z",
    "2025-01-06T10:10:00Z",
    "2025-01-06T10:20:00Z",
];

fn payload(readings: [f64; 3]) -> AssetPayload {
    let values: Vec<_> = STAMPS
        .iter()
        .zip(readings)
        .map(|(ts, v)| json!({"key": ts, "value": v}))
        .collect();
    serde_json::from_value(json!({
        "dataSources": [{
            "name": "Thermostat",
            "dataSeries": [{"key": "room|temperature#avg", "value": values}]
        }]
    }))
    .expect("payload should deserialize")
}

fn two_room_frame() -> WideFrame {
    let assets = [
        (AssetConfig::new(9272, "WONING 16 - Living"), [18.0, 19.0, 20.0]),
        (AssetConfig::new(9832, "WONING 16 - Hal beneden"), [21.0, 22.0, 23.0]),
    ];
    let series: Vec<AssetSeries> = assets
        .iter()
        .map(|(asset, readings)| AssetSeries {
            prefix: asset.column_prefix(),
            points: extract_series_points(&payload(*readings), asset.id)
                .expect("points should extract"),
        })
        .collect();
    merge_asset_series(&series).expect("assets should merge")
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[test]
fn two_assets_merge_into_three_by_two_frame() {
    let frame = two_room_frame();

    assert_eq!(frame.row_count(), 3);
    assert_eq!(
        frame.column_names(),
        vec![
            "WONING_16__Living_temperature",
            "WONING_16__Hal_beneden_temperature"
        ]
    );
    assert_eq!(frame.null_count(), 0);
    assert_eq!(
        frame.timestamps[0],
        Utc.with_ymd_and_hms(2025, 1, 6, 10, 0, 0).unwrap()
    );

    let scale = TemperatureScale::default();
    for column in &frame.columns {
        for value in column.values.iter().flatten() {
            let back = scale.denormalize(scale.normalize(*value) as f32 as f64);
            assert_eq!(round2(back), *value);
        }
    }
}

#[test]
fn normalization_round_trips_to_two_decimals_across_operating_range() {
    let scale = TemperatureScale::default();
    for centi in 1_000..=4_500 {
        let celsius = centi as f64 / 100.0;
        let normalized = scale.normalize(celsius) as f32;
        assert!((0.0..=1.0).contains(&normalized));
        assert_eq!(round2(scale.denormalize(f64::from(normalized))), celsius);
    }
}

#[test]
fn frame_becomes_bounded_tensor_with_cyclical_columns() {
    let cfg = PipelineConfig {
        lookback_steps: 3,
        ..PipelineConfig::default()
    };
    let features = build_feature_frame(&two_room_frame(), &cfg).unwrap();
    assert_eq!(features.column_count(), 6);
    assert_eq!(features.target_rooms().len(), 2);

    let tensor = build_input_tensor(&features, &cfg).unwrap();
    assert_eq!(tensor.shape(), (3, 6));
    assert!(tensor.as_slice().iter().all(|v| (0.0..=1.0).contains(v)));
    assert_eq!(tensor.padded_rows(), 0);
}

/// Identity network that repeats each room's latest normalized reading across
/// every horizon step.
fn persistence_weights(lookback: usize, width: usize, rooms: usize, steps: usize) -> WeightsDocument {
    let inputs = lookback * width;
    let weights = (0..rooms * steps)
        .map(|out| {
            let room = out / steps;
            let mut row = vec![0.0; inputs];
            row[(lookback - 1) * width + room] = 1.0;
            row
        })
        .collect();
    WeightsDocument {
        model_version: Some("persistence-test".to_string()),
        feature_fingerprint: None,
        lookback_steps: lookback,
        input_width: width,
        layers: vec![DenseLayerSpec {
            weights,
            bias: vec![0.0; rooms * steps],
            activation: Activation::Identity,
        }],
    }
}

#[test]
fn weights_file_drives_a_full_forecast() {
    let cfg = PipelineConfig {
        lookback_steps: 3,
        ..PipelineConfig::default()
    };
    let mut weights = tempfile::NamedTempFile::new().unwrap();
    weights
        .write_all(&serde_json::to_vec(&persistence_weights(3, 6, 2, cfg.forecast_steps)).unwrap())
        .unwrap();

    let predictor = Predictor::new(
        cfg,
        ModelSlot::new(WeightsFileLoader::new(Some(weights.path().to_path_buf()))),
    );
    let generated_at = Utc.with_ymd_and_hms(2025, 1, 6, 10, 30, 0).unwrap();
    let result = predictor.predict_at(&two_room_frame(), generated_at).unwrap();

    assert_eq!(
        result.rooms.room_names(),
        vec![
            "WONING_16__Living_temperature",
            "WONING_16__Hal_beneden_temperature"
        ]
    );
    let living = result.rooms.get("WONING_16__Living_temperature").unwrap();
    assert_eq!(living.len(), 18);
    assert!(living.iter().all(|p| p.temp == 20.0));
    assert_eq!(living[17].offset_min, 180);
    let hal = result.rooms.get("WONING_16__Hal_beneden_temperature").unwrap();
    assert!(hal.iter().all(|p| p.temp == 23.0));

    assert_eq!(result.meta.horizon, "3 Hours");
    assert_eq!(result.meta.resolution, "10 min");
    assert_eq!(result.meta.model_version, "persistence-test");
    assert_eq!(result.timestamp.to_rfc3339(), "2025-01-06T11:30:00+01:00");
}
