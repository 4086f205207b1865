//! Logging setup and the lifecycle events emitted by the forecast server binary.

use std::env;
use std::net::SocketAddr;

use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub fn logging_config_from_env() -> LoggingConfig {
    logging_config_from_lookup(|key| env::var(key).ok())
}

/// Same as [`logging_config_from_env`], reading variables through `lookup`.
pub fn logging_config_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> LoggingConfig {
    let mut config = LoggingConfig::default();

    if let Some(level) = lookup("THERMOCAST_LOG_LEVEL") {
        let trimmed = level.trim();
        if !trimmed.is_empty() {
            config.level = trimmed.to_string();
        }
    }

    if let Some(parsed) = lookup("THERMOCAST_LOG_FORMAT").and_then(|raw| parse_log_format(&raw)) {
        config.format = parsed;
    }

    if let Some(parsed) = lookup("THERMOCAST_LOG_TARGET").and_then(|raw| parse_bool(&raw)) {
        config.include_target = parsed;
    }

    config
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(config.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_ansi(matches!(config.format, LogFormat::Pretty));

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    Ok(())
}

pub fn log_app_start(config: &LoggingConfig) {
    info!(
        component = "forecast_server",
        event = "app.start",
        log_level = %config.level,
        log_format = ?config.format,
        include_target = config.include_target
    );
}

pub fn log_app_bind(bound_addr: SocketAddr) {
    info!(
        component = "forecast_server",
        event = "app.bind",
        bind_addr = %bound_addr,
        status_route = "/api/ml/status",
        health_route = "/health"
    );
}

pub fn log_config_loaded(
    house_id: &str,
    asset_count: usize,
    interval_minutes: u64,
    assets_path: Option<&str>,
) {
    match assets_path {
        Some(assets_path) => info!(
            component = "forecast_server",
            event = "config.loaded",
            house_id,
            asset_count,
            interval_minutes,
            assets_path
        ),
        None => info!(
            component = "forecast_server",
            event = "config.loaded",
            house_id,
            asset_count,
            interval_minutes,
            assets_source = "builtin"
        ),
    }
}

pub fn log_app_shutdown(reason: &str) {
    info!(component = "forecast_server", event = "app.shutdown", reason);
}

fn parse_log_format(raw: &str) -> Option<LogFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" => Some(LogFormat::Pretty),
        _ => None,
    }
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
