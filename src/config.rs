//! Service and pipeline configuration, read from `THERMOCAST_*` environment variables.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use chrono_tz::Tz;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::observability::parse_bool;

pub const DEFAULT_BUCKET_MINUTES: u32 = 10;
pub const DEFAULT_LOOKBACK_STEPS: usize = 144;
pub const DEFAULT_FORECAST_STEPS: usize = 18;
pub const DEFAULT_EXCLUDE_PATTERN: &str = "(?i)watermeter";

const DEFAULT_ASSETS: [(i64, &str); 14] = [
    (9274, "WONING 16 - digitale meter"),
    (9825, "WONING 16 - Badkamer"),
    (9834, "WONING 16 - Eetkamer"),
    (9832, "WONING 16 - Hal beneden"),
    (15481, "WONING 16 - Hal boven"),
    (9826, "WONING 16 - Keuken"),
    (9267, "WONING 16 - Koelkast"),
    (9272, "WONING 16 - Living"),
    (9269, "WONING 16 - slaapkamer 1"),
    (9270, "WONING 16 - slaapkamer 2"),
    (9271, "WONING 16 - slaapkamer 3"),
    (9268, "WONING 16 - TV"),
    (9266, "WONING 16 - Wasmachine"),
    (9273, "WONING 16 - watermeter"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetConfig {
    pub id: i64,
    pub name: String,
}

impl AssetConfig {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    pub fn column_prefix(&self) -> String {
        sanitize_prefix(&self.name)
    }
}

pub fn default_assets() -> Vec<AssetConfig> {
    DEFAULT_ASSETS
        .iter()
        .map(|(id, name)| AssetConfig::new(*id, *name))
        .collect()
}

/// Strips punctuation from an asset display name and turns each whitespace
/// character into `_`, so `"WONING 16 - Badkamer"` becomes `"WONING_16__Badkamer"`.
pub fn sanitize_prefix(name: &str) -> String {
    let kept: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || c.is_whitespace())
        .collect();
    kept.trim()
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect()
}

/// Affine map between degrees Celsius and the model's `[0,1]` input range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureScale {
    pub offset: f64,
    pub span: f64,
}

impl Default for TemperatureScale {
    fn default() -> Self {
        Self {
            offset: 10.0,
            span: 35.0,
        }
    }
}

impl TemperatureScale {
    pub fn normalize(&self, celsius: f64) -> f64 {
        (celsius - self.offset) / self.span
    }

    pub fn denormalize(&self, normalized: f64) -> f64 {
        normalized * self.span + self.offset
    }
}

/// What the tensor normalizer does when fewer buckets than the lookback window exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShortWindowPolicy {
    Reject,
    PadEarliest,
    PadZeros,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub timezone: Tz,
    pub bucket_minutes: u32,
    pub lookback_steps: usize,
    pub forecast_steps: usize,
    pub temperature_scale: TemperatureScale,
    pub exclude_pattern: Regex,
    pub short_window_policy: ShortWindowPolicy,
    pub model_version: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::Europe::Amsterdam,
            bucket_minutes: DEFAULT_BUCKET_MINUTES,
            lookback_steps: DEFAULT_LOOKBACK_STEPS,
            forecast_steps: DEFAULT_FORECAST_STEPS,
            temperature_scale: TemperatureScale::default(),
            exclude_pattern: Regex::new(DEFAULT_EXCLUDE_PATTERN)
                .expect("default exclusion pattern should compile"),
            short_window_policy: ShortWindowPolicy::PadEarliest,
            model_version: "woning16-v1".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn bucket_seconds(&self) -> i64 {
        i64::from(self.bucket_minutes) * 60
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket_minutes == 0 {
            return Err(invalid("bucket_minutes", "0", "must be > 0"));
        }
        if self.lookback_steps == 0 {
            return Err(invalid("lookback_steps", "0", "must be > 0"));
        }
        if self.forecast_steps == 0 {
            return Err(invalid("forecast_steps", "0", "must be > 0"));
        }
        if !(self.temperature_scale.span.is_finite() && self.temperature_scale.span > 0.0) {
            return Err(invalid(
                "temperature_scale.span",
                &self.temperature_scale.span.to_string(),
                "must be a positive finite number",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,
    pub twin_server_url: String,
    pub sensor_api_url: String,
    pub sensor_api_key: String,
    pub house_id: String,
    pub interval_minutes: u64,
    pub history_hours: u64,
    pub run_on_start: bool,
    pub model_path: Option<PathBuf>,
    pub assets: Vec<AssetConfig>,
    pub assets_path: Option<PathBuf>,
    pub sensor_timeout_ms: u64,
    pub twin_timeout_ms: u64,
    pub pipeline: PipelineConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            twin_server_url: "http://localhost:3001".to_string(),
            sensor_api_url: "https://api.calculus.group/v3".to_string(),
            sensor_api_key: String::new(),
            house_id: "woning16".to_string(),
            interval_minutes: 15,
            history_hours: 24,
            run_on_start: false,
            model_path: Some(PathBuf::from("model/woning16_model.json")),
            assets: default_assets(),
            assets_path: None,
            sensor_timeout_ms: 100_000,
            twin_timeout_ms: 30_000,
            pipeline: PipelineConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
    #[error("unknown time zone '{0}'")]
    UnknownTimezone(String),
    #[error("invalid exclusion pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
    #[error("failed to read asset list {path}: {source}")]
    AssetsRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse asset list {path}: {source}")]
    AssetsParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("asset list is empty")]
    NoAssets,
    #[error("assets {first} and {second} share column prefix '{prefix}'")]
    DuplicateAssetPrefix {
        prefix: String,
        first: i64,
        second: i64,
    },
}

pub fn service_config_from_env() -> Result<ServiceConfig, ConfigError> {
    service_config_from_lookup(|key| env::var(key).ok())
}

/// Builds a [`ServiceConfig`] from defaults overridden by whatever `lookup` returns.
/// Blank values count as unset.
pub fn service_config_from_lookup(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<ServiceConfig, ConfigError> {
    let get = |key: &str| {
        lookup(key)
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
    };
    let mut cfg = ServiceConfig::default();

    if let Some(raw) = get("THERMOCAST_BIND_ADDR") {
        cfg.bind_addr = raw
            .parse()
            .map_err(|_| invalid("THERMOCAST_BIND_ADDR", &raw, "expected host:port"))?;
    }
    if let Some(raw) = get("THERMOCAST_TWIN_SERVER_URL") {
        cfg.twin_server_url = raw.trim_end_matches('/').to_string();
    }
    if let Some(raw) = get("THERMOCAST_SENSOR_API_URL") {
        cfg.sensor_api_url = raw.trim_end_matches('/').to_string();
    }
    if let Some(raw) = get("THERMOCAST_SENSOR_API_KEY") {
        cfg.sensor_api_key = raw;
    }
    if let Some(raw) = get("THERMOCAST_HOUSE_ID") {
        cfg.house_id = raw;
    }
    if let Some(raw) = get("THERMOCAST_PREDICTION_INTERVAL_MINUTES") {
        cfg.interval_minutes = parse_positive("THERMOCAST_PREDICTION_INTERVAL_MINUTES", &raw)?;
    }
    if let Some(raw) = get("THERMOCAST_SENSOR_HISTORY_HOURS") {
        cfg.history_hours = parse_positive("THERMOCAST_SENSOR_HISTORY_HOURS", &raw)?;
    }
    if let Some(raw) = get("THERMOCAST_RUN_ON_START") {
        cfg.run_on_start = parse_bool(&raw)
            .ok_or_else(|| invalid("THERMOCAST_RUN_ON_START", &raw, "expected a boolean"))?;
    }
    if let Some(raw) = lookup("THERMOCAST_MODEL_PATH") {
        let trimmed = raw.trim();
        cfg.model_path = (!trimmed.is_empty()).then(|| PathBuf::from(trimmed));
    }
    if let Some(raw) = get("THERMOCAST_MODEL_VERSION") {
        cfg.pipeline.model_version = raw;
    }
    if let Some(raw) = get("THERMOCAST_TIMEZONE") {
        cfg.pipeline.timezone = raw
            .parse::<Tz>()
            .map_err(|_| ConfigError::UnknownTimezone(raw.clone()))?;
    }
    if let Some(raw) = get("THERMOCAST_EXCLUDE_PATTERN") {
        cfg.pipeline.exclude_pattern = Regex::new(&raw)?;
    }
    if let Some(raw) = get("THERMOCAST_LOOKBACK_STEPS") {
        cfg.pipeline.lookback_steps = parse_positive("THERMOCAST_LOOKBACK_STEPS", &raw)?;
    }
    if let Some(raw) = get("THERMOCAST_SHORT_WINDOW_POLICY") {
        cfg.pipeline.short_window_policy = parse_short_window_policy(&raw).ok_or_else(|| {
            invalid(
                "THERMOCAST_SHORT_WINDOW_POLICY",
                &raw,
                "expected reject, pad_earliest or pad_zeros",
            )
        })?;
    }
    if let Some(raw) = get("THERMOCAST_ASSETS_PATH") {
        let path = PathBuf::from(raw);
        cfg.assets = load_assets_file(&path)?;
        cfg.assets_path = Some(path);
    }

    cfg.pipeline.validate()?;
    validate_assets(&cfg.assets)?;
    Ok(cfg)
}

pub fn load_assets_file(path: &Path) -> Result<Vec<AssetConfig>, ConfigError> {
    let bytes = fs::read(path).map_err(|source| ConfigError::AssetsRead {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| ConfigError::AssetsParse {
        path: path.to_path_buf(),
        source,
    })
}

/// Every asset must map to a distinct column prefix, otherwise merged columns would collide.
pub fn validate_assets(assets: &[AssetConfig]) -> Result<(), ConfigError> {
    if assets.is_empty() {
        return Err(ConfigError::NoAssets);
    }

    let mut seen: Vec<(String, i64)> = Vec::with_capacity(assets.len());
    let mut prefixes = HashSet::with_capacity(assets.len());
    for asset in assets {
        let prefix = asset.column_prefix();
        if !prefixes.insert(prefix.clone()) {
            let first = seen
                .iter()
                .find(|(p, _)| *p == prefix)
                .map(|(_, id)| *id)
                .unwrap_or(asset.id);
            return Err(ConfigError::DuplicateAssetPrefix {
                prefix,
                first,
                second: asset.id,
            });
        }
        seen.push((prefix, asset.id));
    }
    Ok(())
}

fn parse_positive<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialEq + Default,
{
    match raw.parse::<T>() {
        Ok(value) if value != T::default() => Ok(value),
        _ => Err(invalid(key, raw, "expected a positive integer")),
    }
}

fn parse_short_window_policy(raw: &str) -> Option<ShortWindowPolicy> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "reject" => Some(ShortWindowPolicy::Reject),
        "pad_earliest" | "earliest" => Some(ShortWindowPolicy::PadEarliest),
        "pad_zeros" | "zeros" => Some(ShortWindowPolicy::PadZeros),
        _ => None,
    }
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
