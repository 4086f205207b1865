//! Thermocast: multi-room temperature forecasting service.
//!
//! Pipeline, leaf first:
//! - sensor payload flattening and per-asset merge into a wide frame
//! - feature selection, local-time resampling and cyclical encodings
//! - `[0,1]` normalization into a fixed lookback tensor
//! - dense forecast model and per-room decoding
//! - interval-driven prediction cycles with a status HTTP surface

mod config;
mod decoder;
mod features;
mod merge;
mod model;
mod observability;
mod predictor;
mod scheduler;
mod sensor_client;
mod series;
mod server;
mod tensor;
mod twin_client;

pub use config::{
    default_assets, load_assets_file, sanitize_prefix, service_config_from_env,
    service_config_from_lookup, validate_assets, AssetConfig, ConfigError, PipelineConfig,
    ServiceConfig, ShortWindowPolicy, TemperatureScale, DEFAULT_BUCKET_MINUTES,
    DEFAULT_EXCLUDE_PATTERN, DEFAULT_FORECAST_STEPS, DEFAULT_LOOKBACK_STEPS,
};
pub use decoder::{
    decode_forecast, horizon_label, DecodeError, ForecastMeta, ForecastResult,
    RoomForecastPoint, RoomForecasts, FORECAST_TYPE,
};
pub use features::{
    assert_schema_compatible, build_feature_frame, build_feature_schema, classify_column,
    is_target_room, FeatureColumn, FeatureError, FeatureFrame, FeatureKind, FeatureSchema,
    CYCLICAL_COLUMNS, FEATURE_SCHEMA_VERSION,
};
pub use merge::{
    fill_gaps, group_asset_points, merge_asset_series, outer_join, AssetSeries, FrameColumn,
    MergeError, WideFrame,
};
pub use model::{
    Activation, DenseLayerSpec, DenseNetwork, ForecastModel, ModelError, ModelLoader,
    ModelRequirements, ModelSlot, WeightsDocument, WeightsFileLoader,
};
pub use observability::{
    init_logging, log_app_bind, log_app_shutdown, log_app_start, log_config_loaded,
    logging_config_from_env, logging_config_from_lookup, LogFormat, LoggingConfig,
    LoggingInitError,
};
pub use predictor::{FeatureContract, PredictError, Predictor};
pub use scheduler::{
    spawn_scheduler, CycleOrchestrator, CycleOutcome, CyclePhase, OrchestratorSettings,
    SchedulerHandle, StatusBoard, StatusSnapshot,
};
pub use sensor_client::{
    aggregate_series_url, fetch_sensor_data, CalculusSensorClient, SensorClientConfig,
    SensorData, SensorSource, SourceError,
};
pub use series::{
    extract_series_points, metric_from_series_key, parse_timestamp, AssetPayload, DataSeries,
    DataSource, RawSeriesPoint, SeriesError, ValuePoint,
};
pub use server::{status_router, HealthResponse, StatusSource, HEALTH_ROUTE, STATUS_ROUTE};
pub use tensor::{build_input_tensor, normalize_columns, InputTensor, TensorError};
pub use twin_client::{PredictionEnvelope, TwinClient, TwinError, TwinSink};
