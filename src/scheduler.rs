//! Prediction cycle orchestration: fetch, predict, publish on a fixed interval,
//! with at most one cycle in flight and a status snapshot readable from any thread.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::AssetConfig;
use crate::decoder::ForecastResult;
use crate::predictor::Predictor;
use crate::sensor_client::{fetch_sensor_data, SensorData, SensorSource};
use crate::twin_client::TwinSink;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    #[default]
    Idle,
    Fetching,
    Predicting,
    Publishing,
}

impl CyclePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Predicting => "predicting",
            Self::Publishing => "publishing",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another cycle was already running.
    Skipped,
    NoData { failed_assets: Vec<i64> },
    Failed { phase: CyclePhase, error: String },
    PublishFailed { error: String },
    Completed { rooms: usize },
}

impl CycleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::NoData { .. } => "no_data",
            Self::Failed { .. } => "failed",
            Self::PublishFailed { .. } => "publish_failed",
            Self::Completed { .. } => "completed",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub scheduler_running: bool,
    pub prediction_interval_minutes: u64,
    pub last_prediction_time: Option<DateTime<Utc>>,
    pub next_scheduled_run: Option<DateTime<Utc>>,
    pub last_prediction_result: Option<ForecastResult>,
    pub phase: CyclePhase,
    pub last_outcome: Option<&'static str>,
}

/// Shared status. Writers replace the whole snapshot; readers get a clone.
#[derive(Clone, Default)]
pub struct StatusBoard {
    inner: Arc<RwLock<StatusSnapshot>>,
}

impl StatusBoard {
    pub fn new(snapshot: StatusSnapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(snapshot)),
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner
            .read()
            .expect("status lock should not be poisoned")
            .clone()
    }

    /// Edits a copy and swaps it in under one write guard, so concurrent
    /// writers never drop each other's changes.
    pub fn update(&self, edit: impl FnOnce(&mut StatusSnapshot)) {
        let mut current = self
            .inner
            .write()
            .expect("status lock should not be poisoned");
        let mut next = current.clone();
        edit(&mut next);
        *current = next;
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub assets: Vec<AssetConfig>,
    pub history_hours: u64,
    pub interval_minutes: u64,
}

pub struct CycleOrchestrator<S: SensorSource, T: TwinSink> {
    source: Arc<S>,
    sink: Arc<T>,
    predictor: Arc<Predictor>,
    settings: OrchestratorSettings,
    status: StatusBoard,
    cycle_lock: Mutex<()>,
}

impl<S: SensorSource, T: TwinSink> CycleOrchestrator<S, T> {
    pub fn new(
        source: Arc<S>,
        sink: Arc<T>,
        predictor: Arc<Predictor>,
        settings: OrchestratorSettings,
    ) -> Self {
        let status = StatusBoard::new(StatusSnapshot {
            prediction_interval_minutes: settings.interval_minutes,
            ..StatusSnapshot::default()
        });
        Self {
            source,
            sink,
            predictor,
            settings,
            status,
            cycle_lock: Mutex::new(()),
        }
    }

    pub fn status(&self) -> StatusBoard {
        self.status.clone()
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.settings.interval_minutes * 60)
    }

    pub async fn run_cycle(&self) -> CycleOutcome {
        self.run_cycle_at(Utc::now()).await
    }

    /// Runs one cycle over the history window ending at `now`. Never returns an
    /// error; every failure ends up in the outcome.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> CycleOutcome {
        let Ok(_guard) = self.cycle_lock.try_lock() else {
            info!(
                component = "scheduler",
                event = "cycle.skipped",
                reason = "cycle already in flight"
            );
            return CycleOutcome::Skipped;
        };

        info!(component = "scheduler", event = "cycle.start", at = %now);
        let outcome = self.execute(now).await;
        self.status.update(|s| {
            s.phase = CyclePhase::Idle;
            s.last_outcome = Some(outcome.label());
        });

        match &outcome {
            CycleOutcome::Completed { rooms } => info!(
                component = "scheduler",
                event = "cycle.complete",
                rooms,
                elapsed_ms = (Utc::now() - now).num_milliseconds()
            ),
            CycleOutcome::NoData { failed_assets } => error!(
                component = "scheduler",
                event = "cycle.no_data",
                failed_assets = failed_assets.len()
            ),
            CycleOutcome::Failed { phase, error } => error!(
                component = "scheduler",
                event = "cycle.failed",
                phase = phase.as_str(),
                error = %error
            ),
            CycleOutcome::PublishFailed { error } => error!(
                component = "scheduler",
                event = "cycle.publish_failed",
                error = %error
            ),
            CycleOutcome::Skipped => {}
        }
        outcome
    }

    async fn execute(&self, now: DateTime<Utc>) -> CycleOutcome {
        self.enter(CyclePhase::Fetching);
        let start = now - chrono::Duration::hours(self.settings.history_hours as i64);
        let frame = match fetch_sensor_data(
            Arc::clone(&self.source),
            &self.settings.assets,
            start,
            now,
        )
        .await
        {
            Ok(SensorData::Data(frame)) => frame,
            Ok(SensorData::Empty { failed_assets }) => {
                return CycleOutcome::NoData { failed_assets }
            }
            Err(err) => {
                return CycleOutcome::Failed {
                    phase: CyclePhase::Fetching,
                    error: err.to_string(),
                }
            }
        };

        self.enter(CyclePhase::Predicting);
        let predictor = Arc::clone(&self.predictor);
        let forecast =
            match tokio::task::spawn_blocking(move || predictor.predict_at(&frame, now)).await {
                Ok(Ok(forecast)) => forecast,
                Ok(Err(err)) => {
                    return CycleOutcome::Failed {
                        phase: CyclePhase::Predicting,
                        error: err.to_string(),
                    }
                }
                Err(err) => {
                    return CycleOutcome::Failed {
                        phase: CyclePhase::Predicting,
                        error: format!("prediction task aborted: {err}"),
                    }
                }
            };

        self.enter(CyclePhase::Publishing);
        if let Err(err) = self.sink.push_forecast(&forecast).await {
            return CycleOutcome::PublishFailed {
                error: err.to_string(),
            };
        }

        let rooms = forecast.rooms.len();
        let published_at = Utc::now();
        self.status.update(|s| {
            s.last_prediction_time = Some(published_at);
            s.last_prediction_result = Some(forecast);
        });
        CycleOutcome::Completed { rooms }
    }

    fn enter(&self, phase: CyclePhase) {
        self.status.update(|s| s.phase = phase);
    }
}

pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stops new ticks. A cycle already running is left to finish on its own task.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            warn!(
                component = "scheduler",
                event = "scheduler.join_failed",
                error = %err
            );
        }
    }
}

/// Drives `orchestrator` every interval. The first tick fires one interval after
/// start unless `run_on_start` is set. Each tick runs its cycle on its own task so
/// the ticker keeps cadence and a panicking cycle cannot take the scheduler down.
pub fn spawn_scheduler<S: SensorSource, T: TwinSink>(
    orchestrator: Arc<CycleOrchestrator<S, T>>,
    run_on_start: bool,
) -> SchedulerHandle {
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let period = orchestrator.interval();
    let status = orchestrator.status();
    let first_wait = if run_on_start { Duration::ZERO } else { period };
    let first_tick = Instant::now() + first_wait;

    status.update(|s| {
        s.scheduler_running = true;
        s.next_scheduled_run = Some(next_run_after(Utc::now(), first_wait));
    });
    info!(
        component = "scheduler",
        event = "scheduler.start",
        interval_minutes = period.as_secs() / 60,
        run_on_start
    );

    let task = tokio::spawn(async move {
        let mut ticker = interval_at(first_tick, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    status.update(|s| s.next_scheduled_run = Some(next_run_after(Utc::now(), period)));
                    let cycle = Arc::clone(&orchestrator);
                    tokio::spawn(async move {
                        cycle.run_cycle().await;
                    });
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        status.update(|s| {
            s.scheduler_running = false;
            s.next_scheduled_run = None;
        });
        info!(component = "scheduler", event = "scheduler.stopped");
    });

    SchedulerHandle { shutdown, task }
}

fn next_run_after(now: DateTime<Utc>, wait: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_labels_are_stable() {
        assert_eq!(CycleOutcome::Skipped.label(), "skipped");
        assert_eq!(
            CycleOutcome::NoData {
                failed_assets: vec![1]
            }
            .label(),
            "no_data"
        );
        assert_eq!(
            CycleOutcome::PublishFailed {
                error: "x".to_string()
            }
            .label(),
            "publish_failed"
        );
        assert_eq!(CycleOutcome::Completed { rooms: 2 }.label(), "completed");
    }

    #[test]
    fn status_board_replaces_whole_snapshot() {
        let board = StatusBoard::new(StatusSnapshot {
            prediction_interval_minutes: 15,
            ..StatusSnapshot::default()
        });
        let before = board.snapshot();
        board.update(|s| s.phase = CyclePhase::Fetching);

        assert_eq!(before.phase, CyclePhase::Idle);
        assert_eq!(board.snapshot().phase, CyclePhase::Fetching);
        assert_eq!(board.snapshot().prediction_interval_minutes, 15);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let board = StatusBoard::default();
        let writers: Vec<_> = (0..2)
            .map(|_| {
                let board = board.clone();
                std::thread::spawn(move || {
                    for _ in 0..20_000 {
                        board.update(|s| s.prediction_interval_minutes += 1);
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().expect("writer thread should not panic");
        }

        assert_eq!(board.snapshot().prediction_interval_minutes, 40_000);
    }

    #[test]
    fn snapshot_serializes_wire_keys() {
        let json = serde_json::to_value(StatusSnapshot {
            scheduler_running: true,
            prediction_interval_minutes: 15,
            phase: CyclePhase::Publishing,
            last_outcome: Some("completed"),
            ..StatusSnapshot::default()
        })
        .unwrap();

        assert_eq!(json["scheduler_running"], true);
        assert_eq!(json["prediction_interval_minutes"], 15);
        assert!(json["last_prediction_time"].is_null());
        assert!(json["next_scheduled_run"].is_null());
        assert!(json["last_prediction_result"].is_null());
        assert_eq!(json["phase"], "publishing");
        assert_eq!(json["last_outcome"], "completed");
    }
}
