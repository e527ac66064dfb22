//! Anomaly model artifacts: fitted scaler, dimensionality reducer, class
//! labels and the trained discriminator weights.
//!
//! The discriminator is opaque to the rest of the pipeline behind the
//! [`Classifier`] trait; tests substitute a stub implementation.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{linear, Linear, Module, VarBuilder, VarMap};
use ndarray::Array2;
use serde::Deserialize;
use tracing::info;

use crate::error::{IdsError, Result};
use crate::flow::{FeatureVector, FEATURE_DIM};

/// Temporal window length expected by the discriminator.
pub const SEQ_LEN: usize = 32;

/// Dimensionality after reduction.
pub const REDUCED_DIM: usize = 12;

/// Raw discriminator output for one window.
#[derive(Debug, Clone)]
pub struct Inference {
    /// Discriminator realness score; higher = more typical of the
    /// training distribution.
    pub real_score: f32,
    pub class_logits: Vec<f32>,
}

/// Single-call inference seam over the trained artifact.
pub trait Classifier: Send + Sync {
    fn infer(&self, window: &Array2<f32>) -> Result<Inference>;
}

/// Fitted standard scaler (per-feature mean and scale).
#[derive(Debug, Clone, Deserialize)]
pub struct Scaler {
    pub mean: Vec<f32>,
    pub scale: Vec<f32>,
}

impl Scaler {
    pub fn transform(&self, x: &FeatureVector) -> FeatureVector {
        let mut out = [0f32; FEATURE_DIM];
        for i in 0..FEATURE_DIM {
            let scale = if self.scale[i].abs() > 1e-12 { self.scale[i] } else { 1.0 };
            out[i] = (x[i] - self.mean[i]) / scale;
        }
        out
    }

    fn validate(&self) -> Result<()> {
        if self.mean.len() != FEATURE_DIM || self.scale.len() != FEATURE_DIM {
            return Err(IdsError::load(
                "scaler",
                format!(
                    "expected {} means/scales, got {}/{}",
                    FEATURE_DIM,
                    self.mean.len(),
                    self.scale.len()
                ),
            ));
        }
        Ok(())
    }
}

/// Fitted linear reducer: centers on `mean`, projects onto `components`
/// (REDUCED_DIM rows of FEATURE_DIM loadings).
#[derive(Debug, Clone, Deserialize)]
pub struct Reducer {
    pub mean: Vec<f32>,
    pub components: Vec<Vec<f32>>,
}

impl Reducer {
    pub fn transform(&self, x: &FeatureVector) -> Vec<f32> {
        let mut centered = [0f32; FEATURE_DIM];
        for i in 0..FEATURE_DIM {
            centered[i] = x[i] - self.mean[i];
        }
        self.components
            .iter()
            .map(|row| row.iter().zip(centered.iter()).map(|(a, b)| a * b).sum())
            .collect()
    }

    fn validate(&self) -> Result<()> {
        if self.mean.len() != FEATURE_DIM
            || self.components.len() != REDUCED_DIM
            || self.components.iter().any(|row| row.len() != FEATURE_DIM)
        {
            return Err(IdsError::load(
                "reducer",
                format!(
                    "expected {}x{} components with {} means",
                    REDUCED_DIM, FEATURE_DIM, FEATURE_DIM
                ),
            ));
        }
        Ok(())
    }
}

/// Discriminator network: shared trunk over the flattened window, one
/// realness head and one class head.
pub struct Discriminator {
    fc1: Linear,
    fc2: Linear,
    real_head: Linear,
    class_head: Linear,
}

impl Discriminator {
    const HIDDEN1: usize = 128;
    const HIDDEN2: usize = 64;

    fn new(vb: &VarBuilder, num_classes: usize) -> candle_core::Result<Self> {
        let input = SEQ_LEN * REDUCED_DIM;
        let fc1 = linear(input, Self::HIDDEN1, vb.pp("fc1"))?;
        let fc2 = linear(Self::HIDDEN1, Self::HIDDEN2, vb.pp("fc2"))?;
        let real_head = linear(Self::HIDDEN2, 1, vb.pp("real_head"))?;
        let class_head = linear(Self::HIDDEN2, num_classes, vb.pp("class_head"))?;
        Ok(Self {
            fc1,
            fc2,
            real_head,
            class_head,
        })
    }

    fn forward(&self, input: &Tensor) -> candle_core::Result<(Tensor, Tensor)> {
        let x = self.fc1.forward(input)?.relu()?;
        let x = self.fc2.forward(&x)?.relu()?;
        let real = self.real_head.forward(&x)?;
        let logits = self.class_head.forward(&x)?;
        Ok((real, logits))
    }
}

struct CandleClassifier {
    model: Discriminator,
    device: Device,
}

impl Classifier for CandleClassifier {
    fn infer(&self, window: &Array2<f32>) -> Result<Inference> {
        let flat: Vec<f32> = window.iter().copied().collect();
        let input = Tensor::from_vec(flat, (1, SEQ_LEN * REDUCED_DIM), &self.device)
            .map_err(|e| IdsError::Inference(e.to_string()))?;

        let (real, logits) = self
            .model
            .forward(&input)
            .map_err(|e| IdsError::Inference(e.to_string()))?;

        let real_score = real
            .flatten_all()
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(|e| IdsError::Inference(e.to_string()))?[0];
        let class_logits = logits
            .flatten_all()
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(|e| IdsError::Inference(e.to_string()))?;

        Ok(Inference {
            real_score,
            class_logits,
        })
    }
}

/// Everything the anomaly detector loads from disk.
pub struct ModelBundle {
    pub labels: Vec<String>,
    pub scaler: Scaler,
    pub reducer: Reducer,
    pub classifier: Box<dyn Classifier>,
}

impl ModelBundle {
    /// Load all artifacts from `dir`. Any missing or malformed artifact
    /// is fatal: the deployment is misconfigured.
    pub fn load(dir: &Path) -> Result<Self> {
        let labels: Vec<String> = read_json(&dir.join("labels.json"), "labels")?;
        if labels.is_empty() || labels[0] != "Benign" {
            return Err(IdsError::load("labels", "index 0 must be \"Benign\""));
        }

        let scaler: Scaler = read_json(&dir.join("scaler.json"), "scaler")?;
        scaler.validate()?;
        let reducer: Reducer = read_json(&dir.join("reducer.json"), "reducer")?;
        reducer.validate()?;

        let device = Device::Cpu;
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = Discriminator::new(&vb, labels.len())
            .map_err(|e| IdsError::load("discriminator", e))?;

        let weights = dir.join("discriminator.safetensors");
        varmap
            .load(&weights)
            .map_err(|e| IdsError::load(format!("discriminator weights {}", weights.display()), e))?;

        info!(
            "Loaded anomaly model from {} ({} classes)",
            dir.display(),
            labels.len()
        );

        Ok(Self {
            labels,
            scaler,
            reducer,
            classifier: Box::new(CandleClassifier { model, device }),
        })
    }

    /// Build a bundle around an arbitrary classifier (tests, benchmarks).
    pub fn with_classifier(
        labels: Vec<String>,
        scaler: Scaler,
        reducer: Reducer,
        classifier: Box<dyn Classifier>,
    ) -> Self {
        Self {
            labels,
            scaler,
            reducer,
            classifier,
        }
    }

    /// Scale, reduce, and replicate the current feature vector over the
    /// temporal window. The vector already summarizes the flow's whole
    /// history; replication presents it to the encoder as steady state,
    /// matching the training-side convention.
    pub fn preprocess(&self, features: &FeatureVector) -> Array2<f32> {
        let scaled = self.scaler.transform(features);
        let reduced = self.reducer.transform(&scaled);
        let mut window = Array2::<f32>::zeros((SEQ_LEN, REDUCED_DIM));
        for mut row in window.rows_mut() {
            for (slot, value) in row.iter_mut().zip(reduced.iter()) {
                *slot = *value;
            }
        }
        window
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| IdsError::load(format!("{} {}", what, path.display()), e))?;
    serde_json::from_str(&raw).map_err(|e| IdsError::load(format!("{} {}", what, path.display()), e))
}
