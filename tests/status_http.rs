use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
};
use chrono::{FixedOffset, TimeZone, Utc};
use thermocast::{
    decode_forecast, status_router, CyclePhase, PipelineConfig, StatusBoard, StatusSnapshot,
};
use tower::util::ServiceExt;

async fn get_json(board: StatusBoard, uri: &str) -> (StatusCode, serde_json::Value) {
    let app = status_router(Arc::new(board));
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn health_reports_ok_and_scheduler_flag() {
    let board = StatusBoard::new(StatusSnapshot {
        scheduler_running: true,
        prediction_interval_minutes: 15,
        ..StatusSnapshot::default()
    });

    let (status, json) = get_json(board, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["scheduler_running"], true);
    let stamp = json["timestamp"].as_str().unwrap();
    assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());
}

#[tokio::test]
async fn status_before_any_cycle_has_null_last_fields() {
    let board = StatusBoard::new(StatusSnapshot {
        scheduler_running: true,
        prediction_interval_minutes: 15,
        ..StatusSnapshot::default()
    });

    let (status, json) = get_json(board, "/api/ml/status").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["scheduler_running"], true);
    assert_eq!(json["prediction_interval_minutes"], 15);
    assert!(json["last_prediction_time"].is_null());
    assert!(json["last_prediction_result"].is_null());
    assert!(json["last_outcome"].is_null());
    assert_eq!(json["phase"], "idle");
}

#[tokio::test]
async fn status_reflects_board_updates_after_router_is_built() {
    let board = StatusBoard::default();
    let app = status_router(Arc::new(board.clone()));

    let at = FixedOffset::east_opt(3600)
        .unwrap()
        .with_ymd_and_hms(2025, 1, 6, 11, 0, 0)
        .unwrap();
    let cfg = PipelineConfig {
        forecast_steps: 2,
        ..PipelineConfig::default()
    };
    let forecast = decode_forecast(
        &[0.4, 0.5],
        &["WONING_16__Living_temperature".to_string()],
        &cfg,
        "woning16-v1",
        at,
    )
    .unwrap();
    let published = Utc.with_ymd_and_hms(2025, 1, 6, 10, 0, 5).unwrap();
    board.update(|s| {
        s.last_prediction_time = Some(published);
        s.last_prediction_result = Some(forecast);
        s.last_outcome = Some("completed");
        s.phase = CyclePhase::Idle;
    });

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/ml/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();

    assert_eq!(json["last_prediction_time"], "2025-01-06T10:00:05Z");
    assert_eq!(json["last_outcome"], "completed");
    let result = &json["last_prediction_result"];
    assert_eq!(result["meta"]["horizon"], "20 min");
    assert_eq!(result["meta"]["model_version"], "woning16-v1");
    let living = result["rooms"]["WONING_16__Living_temperature"]
        .as_array()
        .unwrap();
    assert_eq!(living.len(), 2);
    assert_eq!(living[0]["offset_min"], 10);
    assert_eq!(living[0]["temp"], 24.0);
    assert_eq!(living[1]["offset_min"], 20);
    assert_eq!(living[1]["temp"], 27.5);
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let app = status_router(Arc::new(StatusBoard::default()));
    let response = app
        .oneshot(Request::builder().uri("/api/ml/predict").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
