//! Wide frame to published forecast: features, tensor, model, decoder. The
//! predictor fixes its feature contract on the first successful prediction and
//! rejects any later frame whose layout differs.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::decoder::{decode_forecast, DecodeError, ForecastResult};
use crate::features::{
    assert_schema_compatible, build_feature_frame, FeatureError, FeatureFrame,
};
use crate::merge::WideFrame;
use crate::model::{ModelError, ModelRequirements, ModelSlot};
use crate::tensor::{build_input_tensor, TensorError};

/// Layout every later cycle must reproduce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureContract {
    pub schema_version: u32,
    pub fingerprint: String,
    pub columns: Vec<String>,
    pub target_rooms: Vec<String>,
    pub input_width: usize,
}

impl FeatureContract {
    fn from_frame(frame: &FeatureFrame) -> Self {
        Self {
            schema_version: frame.schema.version,
            fingerprint: frame.schema.fingerprint.clone(),
            columns: frame
                .schema
                .column_names()
                .into_iter()
                .map(str::to_string)
                .collect(),
            target_rooms: frame.schema.target_rooms.clone(),
            input_width: frame.column_count(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PredictError {
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("{field} changed: expected [{expected}], got [{actual}]")]
    ContractMismatch {
        field: &'static str,
        expected: String,
        actual: String,
    },
}

pub struct Predictor {
    cfg: PipelineConfig,
    model: ModelSlot,
    contract: Mutex<Option<FeatureContract>>,
}

impl Predictor {
    pub fn new(cfg: PipelineConfig, model: ModelSlot) -> Self {
        Self {
            cfg,
            model,
            contract: Mutex::new(None),
        }
    }

    pub fn pipeline(&self) -> &PipelineConfig {
        &self.cfg
    }

    pub fn model_loaded(&self) -> bool {
        self.model.is_loaded()
    }

    pub fn contract(&self) -> Option<FeatureContract> {
        self.contract
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn predict(&self, frame: &WideFrame) -> Result<ForecastResult, PredictError> {
        self.predict_at(frame, Utc::now())
    }

    pub fn predict_at(
        &self,
        frame: &WideFrame,
        generated_at: DateTime<Utc>,
    ) -> Result<ForecastResult, PredictError> {
        let features = build_feature_frame(frame, &self.cfg)?;
        let observed = FeatureContract::from_frame(&features);
        if let Some(fixed) = self.contract() {
            check_contract(&fixed, &observed)?;
            assert_schema_compatible(fixed.schema_version, &fixed.fingerprint, &features.schema)?;
        }

        let tensor = build_input_tensor(&features, &self.cfg)?;
        let (lookback_steps, input_width) = tensor.shape();
        let requirements = ModelRequirements {
            lookback_steps,
            input_width,
            output_len: observed.target_rooms.len() * self.cfg.forecast_steps,
        };
        let model = self.model.get_or_load(&requirements)?;
        if let Some(trained_on) = model.feature_fingerprint() {
            if trained_on != observed.fingerprint {
                return Err(PredictError::ContractMismatch {
                    field: "model feature fingerprint",
                    expected: trained_on.to_string(),
                    actual: observed.fingerprint,
                });
            }
        }

        let output = model.forward(&tensor)?;
        debug!(
            component = "predictor",
            event = "predict.forward",
            outputs = output.len(),
            padded_rows = tensor.padded_rows()
        );

        let version = model.version().unwrap_or(self.cfg.model_version.as_str());
        let local_time = generated_at.with_timezone(&self.cfg.timezone).fixed_offset();
        let result = decode_forecast(
            &output,
            &observed.target_rooms,
            &self.cfg,
            version,
            local_time,
        )?;

        self.fix_contract(observed);
        info!(
            component = "predictor",
            event = "predict.complete",
            rooms = result.rooms.len(),
            steps = self.cfg.forecast_steps,
            model_version = %version
        );
        Ok(result)
    }

    fn fix_contract(&self, observed: FeatureContract) {
        let mut guard = self.contract.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            info!(
                component = "predictor",
                event = "predict.contract.fixed",
                columns = observed.columns.len(),
                target_rooms = observed.target_rooms.len(),
                fingerprint = %observed.fingerprint
            );
            *guard = Some(observed);
        }
    }
}

fn check_contract(fixed: &FeatureContract, observed: &FeatureContract) -> Result<(), PredictError> {
    if fixed.target_rooms != observed.target_rooms {
        return Err(PredictError::ContractMismatch {
            field: "target rooms",
            expected: fixed.target_rooms.join(", "),
            actual: observed.target_rooms.join(", "),
        });
    }
    if fixed.columns != observed.columns {
        return Err(PredictError::ContractMismatch {
            field: "feature columns",
            expected: fixed.columns.join(", "),
            actual: observed.columns.join(", "),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::FrameColumn;
    use crate::model::{ForecastModel, WeightsFileLoader};
    use crate::tensor::InputTensor;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    /// Echoes the last normalized temperature of each room for every step.
    struct Persistence {
        lookback: usize,
        width: usize,
        rooms: usize,
        steps: usize,
        fingerprint: Option<String>,
    }

    impl ForecastModel for Persistence {
        fn expected_input(&self) -> (usize, usize) {
            (self.lookback, self.width)
        }

        fn output_len(&self) -> usize {
            self.rooms * self.steps
        }

        fn feature_fingerprint(&self) -> Option<&str> {
            self.fingerprint.as_deref()
        }

        fn forward(&self, input: &InputTensor) -> Result<Vec<f32>, ModelError> {
            let last = input.row(self.lookback - 1);
            Ok((0..self.rooms)
                .flat_map(|room| std::iter::repeat(last[room]).take(self.steps))
                .collect())
        }
    }

    fn cfg() -> PipelineConfig {
        PipelineConfig {
            lookback_steps: 4,
            forecast_steps: 2,
            ..PipelineConfig::default()
        }
    }

    fn predictor(fingerprint: Option<String>) -> Predictor {
        let slot = ModelSlot::new(
            move |req: &ModelRequirements| -> Result<Arc<dyn ForecastModel>, ModelError> {
                let model: Arc<dyn ForecastModel> = Arc::new(Persistence {
                    lookback: req.lookback_steps,
                    width: req.input_width,
                    rooms: req.output_len / 2,
                    steps: 2,
                    fingerprint: fingerprint.clone(),
                });
                Ok(model)
            },
        );
        Predictor::new(cfg(), slot)
    }

    fn wide(columns: &[(&str, f64)]) -> WideFrame {
        let start = Utc.with_ymd_and_hms(2025, 1, 6, 10, 0, 0).unwrap();
        WideFrame {
            timestamps: (0..6).map(|i| start + Duration::minutes(10 * i)).collect(),
            columns: columns
                .iter()
                .map(|(name, value)| FrameColumn {
                    name: (*name).to_string(),
                    values: vec![Some(*value); 6],
                })
                .collect(),
        }
    }

    #[test]
    fn predicts_each_target_room_in_order() {
        let p = predictor(None);
        let frame = wide(&[("Living_temperature", 21.0), ("Hal_temperature", 18.5)]);
        let result = p.predict(&frame).unwrap();

        assert_eq!(
            result.rooms.room_names(),
            vec!["Living_temperature", "Hal_temperature"]
        );
        let living = result.rooms.get("Living_temperature").unwrap();
        assert_eq!(living.len(), 2);
        assert_eq!(living[0].temp, 21.0);
        assert_eq!(living[1].offset_min, 20);
        assert_eq!(result.rooms.get("Hal_temperature").unwrap()[0].temp, 18.5);
        assert_eq!(result.meta.model_version, "woning16-v1");
        assert!(p.model_loaded());
        assert_eq!(p.contract().unwrap().input_width, 6);
    }

    #[test]
    fn changed_layout_after_first_prediction_is_rejected() {
        let p = predictor(None);
        p.predict(&wide(&[("Living_temperature", 21.0)])).unwrap();

        let err = p
            .predict(&wide(&[("Living_temperature", 21.0), ("Hal_temperature", 19.0)]))
            .unwrap_err();
        assert!(matches!(
            err,
            PredictError::ContractMismatch { field: "target rooms", .. }
        ));

        let err = p
            .predict(&wide(&[("Living_temperature", 21.0), ("Living_pir", 1.0)]))
            .unwrap_err();
        assert!(matches!(
            err,
            PredictError::ContractMismatch { field: "feature columns", .. }
        ));
    }

    #[test]
    fn model_trained_on_another_layout_is_rejected() {
        let p = predictor(Some("not-this-layout".to_string()));
        let err = p.predict(&wide(&[("Living_temperature", 21.0)])).unwrap_err();
        assert!(matches!(
            err,
            PredictError::ContractMismatch { field: "model feature fingerprint", .. }
        ));
        assert!(p.contract().is_none());
    }

    #[test]
    fn missing_weights_fail_before_any_forecast() {
        let p = Predictor::new(cfg(), ModelSlot::new(WeightsFileLoader::new(None)));
        let err = p.predict(&wide(&[("Living_temperature", 21.0)])).unwrap_err();
        assert!(matches!(err, PredictError::Model(ModelError::NoWeightsConfigured)));
        assert!(p.contract().is_none());
    }
}
