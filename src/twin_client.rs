//! Digital-twin server adapter: forecast publishing and current state reads.

use std::future::Future;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::decoder::ForecastResult;

#[derive(Debug, Error)]
pub enum TwinError {
    #[error("failed to build http client: {0}")]
    HttpClientBuild(String),
    #[error("request to {url} failed: {message}")]
    HttpRequest { url: String, message: String },
    #[error("failed to encode forecast: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("unreadable response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

pub trait TwinSink: Send + Sync + 'static {
    fn push_forecast(
        &self,
        forecast: &ForecastResult,
    ) -> impl Future<Output = Result<Value, TwinError>> + Send;

    fn get_current_state(&self) -> impl Future<Output = Result<Value, TwinError>> + Send;
}

/// Body of `POST /api/twin/predictions`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionEnvelope<'a> {
    pub house_id: &'a str,
    pub prediction: &'a ForecastResult,
}

pub struct TwinClient {
    client: reqwest::Client,
    base_url: String,
    house_id: String,
}

impl TwinClient {
    pub fn new(
        base_url: impl Into<String>,
        house_id: impl Into<String>,
        timeout_ms: u64,
    ) -> Result<Self, TwinError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|err| TwinError::HttpClientBuild(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            house_id: house_id.into(),
        })
    }

    pub fn predictions_url(&self) -> String {
        format!("{}/api/twin/predictions", self.base_url)
    }

    pub fn state_url(&self) -> String {
        format!("{}/api/twin/state/{}", self.base_url, self.house_id)
    }

    async fn send(&self, request: reqwest::RequestBuilder, url: &str) -> Result<Value, TwinError> {
        let response = request.send().await.map_err(|err| TwinError::HttpRequest {
            url: url.to_string(),
            message: err.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TwinError::HttpRequest {
                url: url.to_string(),
                message: format!("unexpected HTTP status {status}: {body}"),
            });
        }

        let bytes = response.bytes().await.map_err(|err| TwinError::HttpRequest {
            url: url.to_string(),
            message: err.to_string(),
        })?;
        parse_response_body(url, &bytes)
    }
}

impl TwinSink for TwinClient {
    async fn push_forecast(&self, forecast: &ForecastResult) -> Result<Value, TwinError> {
        let url = self.predictions_url();
        let body = serde_json::to_vec(&PredictionEnvelope {
            house_id: &self.house_id,
            prediction: forecast,
        })
        .map_err(TwinError::Encode)?;

        let request = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        let ack = self.send(request, &url).await?;
        info!(
            component = "twin_client",
            event = "twin.forecast.pushed",
            house_id = %self.house_id,
            rooms = forecast.rooms.len()
        );
        Ok(ack)
    }

    async fn get_current_state(&self) -> Result<Value, TwinError> {
        let url = self.state_url();
        let request = self.client.get(&url);
        let state = self.send(request, &url).await?;
        info!(
            component = "twin_client",
            event = "twin.state.fetched",
            house_id = %self.house_id
        );
        Ok(state)
    }
}

/// An empty acknowledgement body reads as `null`.
fn parse_response_body(url: &str, bytes: &[u8]) -> Result<Value, TwinError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(bytes).map_err(|source| TwinError::Decode {
        url: url.to_string(),
        source,
    })
}
