//! Sensor API access: one `aggregateseries` request per asset, fanned out in
//! parallel and merged into a single wide frame.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::{AssetConfig, ServiceConfig};
use crate::merge::{merge_asset_series, AssetSeries, MergeError, WideFrame};
use crate::series::{extract_series_points, AssetPayload, SeriesError};

const API_KEY_HEADER: &str = "CalculusApiKey";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to build http client: {0}")]
    HttpClientBuild(String),
    #[error("request to {url} failed: {message}")]
    HttpRequest { url: String, message: String },
    #[error("asset {asset_id} returned an unreadable payload: {source}")]
    Decode {
        asset_id: i64,
        #[source]
        source: serde_json::Error,
    },
    #[error("asset {asset_id}: {source}")]
    Extract {
        asset_id: i64,
        #[source]
        source: SeriesError,
    },
    #[error(transparent)]
    Merge(#[from] MergeError),
}

/// Result of one fetch round. `Empty` means no asset produced any observation,
/// either because every request failed or because the window held no data.
#[derive(Debug, Clone, PartialEq)]
pub enum SensorData {
    Data(WideFrame),
    Empty { failed_assets: Vec<i64> },
}

pub trait SensorSource: Send + Sync + 'static {
    fn fetch_asset(
        &self,
        asset: &AssetConfig,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl Future<Output = Result<AssetPayload, SourceError>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl SensorClientConfig {
    pub fn from_service(cfg: &ServiceConfig) -> Self {
        Self {
            base_url: cfg.sensor_api_url.clone(),
            api_key: cfg.sensor_api_key.clone(),
            timeout_ms: cfg.sensor_timeout_ms,
            max_retries: 1,
            retry_backoff_ms: 500,
        }
    }
}

pub struct CalculusSensorClient {
    client: reqwest::Client,
    cfg: SensorClientConfig,
}

impl CalculusSensorClient {
    pub fn new(cfg: SensorClientConfig) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|err| SourceError::HttpClientBuild(err.to_string()))?;
        Ok(Self { client, cfg })
    }

    pub fn asset_url(&self, asset_id: i64, start: DateTime<Utc>, end: DateTime<Utc>) -> String {
        aggregate_series_url(&self.cfg.base_url, asset_id, start, end)
    }

    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, SourceError> {
        let response = self
            .client
            .get(url)
            .header(API_KEY_HEADER, &self.cfg.api_key)
            .send()
            .await
            .map_err(|err| SourceError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::HttpRequest {
                url: url.to_string(),
                message: format!("unexpected HTTP status {status}"),
            });
        }

        response
            .bytes()
            .await
            .map(|bytes| bytes.to_vec())
            .map_err(|err| SourceError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })
    }
}

impl SensorSource for CalculusSensorClient {
    async fn fetch_asset(
        &self,
        asset: &AssetConfig,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<AssetPayload, SourceError> {
        let url = self.asset_url(asset.id, start, end);
        let mut attempt: u32 = 0;
        let bytes = loop {
            match self.get_bytes(&url).await {
                Ok(bytes) => break bytes,
                Err(err) if attempt >= self.cfg.max_retries => return Err(err),
                Err(_) => {
                    attempt = attempt.saturating_add(1);
                    sleep(backoff_duration(self.cfg.retry_backoff_ms, attempt)).await;
                }
            }
        };
        serde_json::from_slice(&bytes).map_err(|source| SourceError::Decode {
            asset_id: asset.id,
            source,
        })
    }
}

pub fn aggregate_series_url(
    base_url: &str,
    asset_id: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> String {
    format!(
        "{}/assets/{asset_id}/aggregateseries?unixTimestampStart={}&unixTimestampEnd={}",
        base_url.trim_end_matches('/'),
        start.timestamp(),
        end.timestamp()
    )
}

fn backoff_duration(base_ms: u64, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(10);
    let factor = 1u64 << shift;
    Duration::from_millis(base_ms.saturating_mul(factor))
}

/// Fetches every asset concurrently and merges the survivors in configured asset
/// order. A failing asset is logged and left out; only a structural merge error
/// fails the whole round.
pub async fn fetch_sensor_data<S: SensorSource>(
    source: Arc<S>,
    assets: &[AssetConfig],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<SensorData, SourceError> {
    info!(
        component = "sensor_client",
        event = "sensor.fetch.start",
        assets = assets.len(),
        start = %start,
        end = %end
    );

    let mut tasks = JoinSet::new();
    let mut task_assets = HashMap::with_capacity(assets.len());
    for (idx, asset) in assets.iter().cloned().enumerate() {
        let source = Arc::clone(&source);
        let handle = tasks.spawn(async move {
            let result = source
                .fetch_asset(&asset, start, end)
                .await
                .and_then(|payload| {
                    extract_series_points(&payload, asset.id).map_err(|err| {
                        SourceError::Extract {
                            asset_id: asset.id,
                            source: err,
                        }
                    })
                });
            (idx, result)
        });
        task_assets.insert(handle.id(), idx);
    }

    let mut slots: Vec<Option<AssetSeries>> = vec![None; assets.len()];
    let mut failed_assets = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let (idx, result) = match joined {
            Ok(done) => done,
            Err(err) => {
                let asset_id = task_assets.get(&err.id()).map(|idx| assets[*idx].id);
                warn!(
                    component = "sensor_client",
                    event = "sensor.asset.task_failed",
                    asset_id = ?asset_id,
                    error = %err
                );
                failed_assets.extend(asset_id);
                continue;
            }
        };
        let asset = &assets[idx];
        match result {
            Ok(points) => {
                slots[idx] = Some(AssetSeries {
                    prefix: asset.column_prefix(),
                    points,
                });
            }
            Err(err) => {
                warn!(
                    component = "sensor_client",
                    event = "sensor.asset.failed",
                    asset_id = asset.id,
                    asset = %asset.name,
                    error = %err
                );
                failed_assets.push(asset.id);
            }
        }
    }
    failed_assets.sort_unstable();

    let series: Vec<AssetSeries> = slots.into_iter().flatten().collect();
    let merged = merge_asset_series(&series)?;
    if merged.is_empty() {
        warn!(
            component = "sensor_client",
            event = "sensor.fetch.empty",
            failed_assets = failed_assets.len()
        );
        return Ok(SensorData::Empty { failed_assets });
    }

    info!(
        component = "sensor_client",
        event = "sensor.fetch.complete",
        assets_ok = series.len(),
        assets_failed = failed_assets.len(),
        rows = merged.row_count(),
        columns = merged.column_count()
    );
    Ok(SensorData::Data(merged))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::time::Duration as StdDuration;

    struct FakeSource {
        payloads: HashMap<i64, serde_json::Value>,
        delays_ms: HashMap<i64, u64>,
    }

    impl SensorSource for FakeSource {
        async fn fetch_asset(
            &self,
            asset: &AssetConfig,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> Result<AssetPayload, SourceError> {
            if let Some(ms) = self.delays_ms.get(&asset.id) {
                tokio::time::sleep(StdDuration::from_millis(*ms)).await;
            }
            match self.payloads.get(&asset.id) {
                Some(value) => Ok(serde_json::from_value(value.clone()).unwrap()),
                None => Err(SourceError::HttpRequest {
                    url: format!("fake://{}", asset.id),
                    message: "unexpected HTTP status 503 Service Unavailable".to_string(),
                }),
            }
        }
    }

    fn payload(metric: &str, values: &[(&str, f64)]) -> serde_json::Value {
        let points: Vec<_> = values
            .iter()
            .map(|(ts, v)| json!({"key": ts, "value": v}))
            .collect();
        json!({"dataSources": [{"name": "Sensor", "dataSeries": [
            {"key": format!("x|{metric}#avg"), "value": points}
        ]}]})
    }

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.with_ymd_and_hms(2025, 1, 6, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 1, 7, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn url_carries_asset_and_window() {
        let (start, end) = window();
        assert_eq!(
            aggregate_series_url("https://api.example/v3/", 9825, start, end),
            "https://api.example/v3/assets/9825/aggregateseries?unixTimestampStart=1736121600&unixTimestampEnd=1736208000"
        );
    }

    #[tokio::test]
    async fn columns_follow_asset_order_not_completion_order() {
        let assets = vec![AssetConfig::new(1, "Zolder"), AssetConfig::new(2, "Attic")];
        let source = FakeSource {
            payloads: HashMap::from([
                (1, payload("temperature", &[("2025-01-06T10:00:00Z", 18.0)])),
                (2, payload("temperature", &[("2025-01-06T10:00:00Z", 21.0)])),
            ]),
            delays_ms: HashMap::from([(1, 30)]),
        };
        let (start, end) = window();

        let data = fetch_sensor_data(Arc::new(source), &assets, start, end)
            .await
            .unwrap();
        let SensorData::Data(frame) = data else {
            panic!("expected data");
        };
        assert_eq!(
            frame.column_names(),
            vec!["Zolder_temperature", "Attic_temperature"]
        );
    }

    #[tokio::test]
    async fn failing_asset_is_dropped() {
        let assets = vec![AssetConfig::new(1, "Living"), AssetConfig::new(2, "Hal")];
        let source = FakeSource {
            payloads: HashMap::from([(
                2,
                payload("temperature", &[("2025-01-06T10:00:00Z", 19.0)]),
            )]),
            delays_ms: HashMap::new(),
        };
        let (start, end) = window();

        let data = fetch_sensor_data(Arc::new(source), &assets, start, end)
            .await
            .unwrap();
        let SensorData::Data(frame) = data else {
            panic!("expected data");
        };
        assert_eq!(frame.column_names(), vec!["Hal_temperature"]);
    }

    struct PanickingSource;

    impl SensorSource for PanickingSource {
        async fn fetch_asset(
            &self,
            asset: &AssetConfig,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> Result<AssetPayload, SourceError> {
            if asset.id == 2 {
                panic!("decoder blew up for asset {}", asset.id);
            }
            Err(SourceError::HttpRequest {
                url: format!("fake://{}", asset.id),
                message: "connection reset".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn panicking_fetch_is_reported_as_failed_asset() {
        let assets = vec![AssetConfig::new(1, "Living"), AssetConfig::new(2, "Hal")];
        let (start, end) = window();

        let data = fetch_sensor_data(Arc::new(PanickingSource), &assets, start, end)
            .await
            .unwrap();
        assert_eq!(
            data,
            SensorData::Empty {
                failed_assets: vec![1, 2]
            }
        );
    }

    #[tokio::test]
    async fn all_failures_yield_empty() {
        let assets = vec![AssetConfig::new(1, "Living"), AssetConfig::new(2, "Hal")];
        let source = FakeSource {
            payloads: HashMap::new(),
            delays_ms: HashMap::new(),
        };
        let (start, end) = window();

        let data = fetch_sensor_data(Arc::new(source), &assets, start, end)
            .await
            .unwrap();
        assert_eq!(
            data,
            SensorData::Empty {
                failed_assets: vec![1, 2]
            }
        );
    }
}
