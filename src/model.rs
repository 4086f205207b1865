//! Forecast model contract, a dense-network implementation loaded from a JSON
//! weights document, and the lazily filled slot that owns the loaded model.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::tensor::InputTensor;

pub trait ForecastModel: Send + Sync {
    /// `(lookback_steps, input_width)` the model was trained on.
    fn expected_input(&self) -> (usize, usize);

    /// Length of the vector returned by [`ForecastModel::forward`].
    fn output_len(&self) -> usize;

    fn version(&self) -> Option<&str> {
        None
    }

    /// Feature schema fingerprint the weights were trained against, if recorded.
    fn feature_fingerprint(&self) -> Option<&str> {
        None
    }

    fn forward(&self, input: &InputTensor) -> Result<Vec<f32>, ModelError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelRequirements {
    pub lookback_steps: usize,
    pub input_width: usize,
    pub output_len: usize,
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("no model weights path configured")]
    NoWeightsConfigured,
    #[error("model has not been loaded")]
    NotLoaded,
    #[error("failed to read model weights {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse model weights {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid layer {index}: {reason}")]
    InvalidLayer { index: usize, reason: String },
    #[error("{what} mismatch: model expects {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("model produced a non-finite value at output {0}")]
    NonFiniteOutput(usize),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    #[default]
    Identity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseLayerSpec {
    /// `out × in`, one row per output unit.
    pub weights: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
    #[serde(default)]
    pub activation: Activation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightsDocument {
    #[serde(default)]
    pub model_version: Option<String>,
    #[serde(default)]
    pub feature_fingerprint: Option<String>,
    pub lookback_steps: usize,
    pub input_width: usize,
    pub layers: Vec<DenseLayerSpec>,
}

#[derive(Debug, Clone)]
struct DenseLayer {
    in_dim: usize,
    out_dim: usize,
    weights: Vec<f32>,
    bias: Vec<f32>,
    activation: Activation,
}

impl DenseLayer {
    fn apply(&self, input: &[f32]) -> Vec<f32> {
        (0..self.out_dim)
            .map(|o| {
                let row = &self.weights[o * self.in_dim..(o + 1) * self.in_dim];
                let sum = row
                    .iter()
                    .zip(input)
                    .fold(self.bias[o], |acc, (w, x)| acc + w * x);
                match self.activation {
                    Activation::Relu => sum.max(0.0),
                    Activation::Identity => sum,
                }
            })
            .collect()
    }
}

/// Flatten followed by a stack of fully connected layers.
#[derive(Debug, Clone)]
pub struct DenseNetwork {
    lookback_steps: usize,
    input_width: usize,
    layers: Vec<DenseLayer>,
    version: Option<String>,
    fingerprint: Option<String>,
}

impl DenseNetwork {
    pub fn from_document(doc: WeightsDocument) -> Result<Self, ModelError> {
        if doc.layers.is_empty() {
            return Err(ModelError::InvalidLayer {
                index: 0,
                reason: "network has no layers".to_string(),
            });
        }

        let mut in_dim = doc.lookback_steps * doc.input_width;
        let mut layers = Vec::with_capacity(doc.layers.len());
        for (index, layer_spec) in doc.layers.into_iter().enumerate() {
            let out_dim = layer_spec.bias.len();
            if layer_spec.weights.len() != out_dim {
                return Err(ModelError::InvalidLayer {
                    index,
                    reason: format!("{} weight rows for {} biases", layer_spec.weights.len(), out_dim),
                });
            }
            if let Some(row) = layer_spec.weights.iter().find(|row| row.len() != in_dim) {
                return Err(ModelError::InvalidLayer {
                    index,
                    reason: format!("weight row has {} inputs, expected {in_dim}", row.len()),
                });
            }
            layers.push(DenseLayer {
                in_dim,
                out_dim,
                weights: layer_spec.weights.into_iter().flatten().collect(),
                bias: layer_spec.bias,
                activation: layer_spec.activation,
            });
            in_dim = out_dim;
        }

        Ok(Self {
            lookback_steps: doc.lookback_steps,
            input_width: doc.input_width,
            layers,
            version: doc.model_version,
            fingerprint: doc.feature_fingerprint,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let bytes = fs::read(path).map_err(|source| ModelError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let doc: WeightsDocument =
            serde_json::from_slice(&bytes).map_err(|source| ModelError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_document(doc)
    }
}

impl ForecastModel for DenseNetwork {
    fn expected_input(&self) -> (usize, usize) {
        (self.lookback_steps, self.input_width)
    }

    fn output_len(&self) -> usize {
        self.layers.last().map(|l| l.out_dim).unwrap_or_default()
    }

    fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    fn feature_fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    fn forward(&self, input: &InputTensor) -> Result<Vec<f32>, ModelError> {
        let (rows, cols) = input.shape();
        check_dim("lookback rows", self.lookback_steps, rows)?;
        check_dim("input width", self.input_width, cols)?;

        let mut activations = input.as_slice().to_vec();
        for layer in &self.layers {
            activations = layer.apply(&activations);
        }
        if let Some(idx) = activations.iter().position(|v| !v.is_finite()) {
            return Err(ModelError::NonFiniteOutput(idx));
        }
        Ok(activations)
    }
}

pub trait ModelLoader: Send + Sync {
    fn load(&self, requirements: &ModelRequirements) -> Result<Arc<dyn ForecastModel>, ModelError>;
}

impl<F> ModelLoader for F
where
    F: Fn(&ModelRequirements) -> Result<Arc<dyn ForecastModel>, ModelError> + Send + Sync,
{
    fn load(&self, requirements: &ModelRequirements) -> Result<Arc<dyn ForecastModel>, ModelError> {
        self(requirements)
    }
}

/// Loads a [`DenseNetwork`] from a weights file; without a path it refuses to load.
#[derive(Debug, Clone)]
pub struct WeightsFileLoader {
    path: Option<PathBuf>,
}

impl WeightsFileLoader {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }
}

impl ModelLoader for WeightsFileLoader {
    fn load(&self, _requirements: &ModelRequirements) -> Result<Arc<dyn ForecastModel>, ModelError> {
        let path = self.path.as_ref().ok_or(ModelError::NoWeightsConfigured)?;
        let network = DenseNetwork::load(path)?;
        info!(
            component = "model",
            event = "model.weights.loaded",
            path = %path.display(),
            layers = network.layers.len(),
            output_len = network.output_len(),
            version = network.version().unwrap_or("-")
        );
        Ok(Arc::new(network))
    }
}

/// Holds the model for the process lifetime. The first caller loads it under the
/// lock; later callers get the cached instance, checked against their requirements.
pub struct ModelSlot {
    loader: Box<dyn ModelLoader>,
    model: Mutex<Option<Arc<dyn ForecastModel>>>,
}

impl ModelSlot {
    pub fn new(loader: impl ModelLoader + 'static) -> Self {
        Self {
            loader: Box::new(loader),
            model: Mutex::new(None),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.model
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn current(&self) -> Result<Arc<dyn ForecastModel>, ModelError> {
        self.model
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ModelError::NotLoaded)
    }

    pub fn get_or_load(
        &self,
        requirements: &ModelRequirements,
    ) -> Result<Arc<dyn ForecastModel>, ModelError> {
        let mut guard = self.model.lock().unwrap_or_else(PoisonError::into_inner);
        let model = match guard.as_ref() {
            Some(model) => Arc::clone(model),
            None => {
                let loaded = self.loader.load(requirements)?;
                check_requirements(loaded.as_ref(), requirements)?;
                *guard = Some(Arc::clone(&loaded));
                loaded
            }
        };
        check_requirements(model.as_ref(), requirements)?;
        Ok(model)
    }
}

fn check_requirements(
    model: &dyn ForecastModel,
    requirements: &ModelRequirements,
) -> Result<(), ModelError> {
    let (lookback, width) = model.expected_input();
    check_dim("lookback rows", lookback, requirements.lookback_steps)?;
    check_dim("input width", width, requirements.input_width)?;
    check_dim("output length", model.output_len(), requirements.output_len)
}

fn check_dim(what: &'static str, expected: usize, actual: usize) -> Result<(), ModelError> {
    if expected == actual {
        Ok(())
    } else {
        Err(ModelError::ShapeMismatch {
            what,
            expected,
            actual,
        })
    }
}
