use std::sync::Arc;

use thermocast::{
    init_logging, log_app_bind, log_app_shutdown, log_app_start, log_config_loaded,
    logging_config_from_env, service_config_from_env, spawn_scheduler, status_router,
    CalculusSensorClient, CycleOrchestrator, ModelSlot, OrchestratorSettings, Predictor,
    SensorClientConfig, TwinClient, TwinSink, WeightsFileLoader,
};
use tracing::warn;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start(&logging_cfg);

    let cfg = service_config_from_env()?;
    log_config_loaded(
        &cfg.house_id,
        cfg.assets.len(),
        cfg.interval_minutes,
        cfg.assets_path.as_deref().and_then(|p| p.to_str()),
    );
    if cfg.model_path.is_none() {
        warn!(
            component = "forecast_server",
            event = "model.path.unset",
            "THERMOCAST_MODEL_PATH is empty; every prediction cycle will fail"
        );
    }

    let sensors = Arc::new(CalculusSensorClient::new(SensorClientConfig::from_service(
        &cfg,
    ))?);
    let twin = Arc::new(TwinClient::new(
        cfg.twin_server_url.clone(),
        cfg.house_id.clone(),
        cfg.twin_timeout_ms,
    )?);
    if let Err(err) = twin.get_current_state().await {
        warn!(
            component = "forecast_server",
            event = "twin.unreachable",
            twin_server_url = %cfg.twin_server_url,
            error = %err
        );
    }

    let predictor = Arc::new(Predictor::new(
        cfg.pipeline.clone(),
        ModelSlot::new(WeightsFileLoader::new(cfg.model_path.clone())),
    ));
    let orchestrator = Arc::new(CycleOrchestrator::new(
        sensors,
        twin,
        predictor,
        OrchestratorSettings {
            assets: cfg.assets.clone(),
            history_hours: cfg.history_hours,
            interval_minutes: cfg.interval_minutes,
        },
    ));
    let status = orchestrator.status();
    let scheduler = spawn_scheduler(orchestrator, cfg.run_on_start);

    let app = status_router(Arc::new(status));
    let listener = tokio::net::TcpListener::bind(cfg.bind_addr).await?;
    let bound_addr = listener.local_addr()?;

    log_app_bind(bound_addr);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(
                    component = "forecast_server",
                    event = "signal.error",
                    error = %err
                );
            }
        })
        .await;

    log_app_shutdown("ctrl_c");
    scheduler.shutdown().await;
    served?;

    Ok(())
}
