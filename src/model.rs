//! Compute model seam and the reference classifier

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_nn::{linear, loss, ops, Linear, VarBuilder, VarMap};
use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Named tensors
pub type TensorMap = HashMap<String, Tensor>;

/// One batch handed to a step function
pub type Batch = TensorMap;

/// Step outputs
pub type Outputs = TensorMap;

/// Input features
pub const FEATURES_KEY: &str = "features";
/// Unnormalised class scores
pub const LOGITS_KEY: &str = "logits";
/// Class probabilities
pub const PROBS_KEY: &str = "probs";
/// Labels, echoed from the batch for metrics
pub const TARGET_KEY: &str = "target";
/// Supervised loss
pub const LOSS_KEY: &str = "loss";

/// Model shared by the engines of a trainer
pub type SharedModel = Arc<RwLock<dyn Model>>;

/// A trainable compute model
pub trait Model: Send + Sync {
    /// Compute outputs for a batch
    ///
    /// Outputs carry `logits` when predictions exist, plus `target` and
    /// `loss` when the batch holds labels.
    fn forward(&self, batch: &Batch) -> Result<Outputs>;

    /// Switch between training and evaluation mode
    fn set_training(&mut self, training: bool);

    /// Whether the model is in training mode
    fn is_training(&self) -> bool;

    /// Write parameters to `path`
    fn save(&self, path: &Path) -> Result<()>;

    /// Read parameters from `path`
    fn load(&mut self, path: &Path) -> Result<()>;
}

/// Mean of a tensor as `f64`
pub fn scalar(tensor: &Tensor) -> Result<f64> {
    Ok(tensor.to_dtype(DType::F64)?.mean_all()?.to_scalar::<f64>()?)
}

/// Detach every output from the autograd graph
pub fn detach_outputs(outputs: Outputs) -> Outputs {
    outputs
        .into_iter()
        .map(|(key, tensor)| (key, tensor.detach()))
        .collect()
}

const HIDDEN_FEATURES: usize = 100;

/// Two-layer classifier: Linear -> tanh -> Linear, cross-entropy loss
pub struct Classifier {
    fc1: Linear,
    fc2: Linear,
    var_map: VarMap,
    in_features: usize,
    num_classes: usize,
    training: bool,
}

impl Classifier {
    /// Create a classifier with freshly initialised parameters
    pub fn new(in_features: usize, num_classes: usize, device: &Device) -> Result<Self> {
        if in_features == 0 || num_classes < 2 {
            return Err(Error::config(format!(
                "classifier needs in_features >= 1 and num_classes >= 2, got {} and {}",
                in_features, num_classes
            )));
        }
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
        let fc1 = linear(in_features, HIDDEN_FEATURES, vb.pp("fc1"))?;
        let fc2 = linear(HIDDEN_FEATURES, num_classes, vb.pp("fc2"))?;

        Ok(Self {
            fc1,
            fc2,
            var_map,
            in_features,
            num_classes,
            training: true,
        })
    }

    /// Parameter store, for building an optimizer
    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    /// Input width
    pub fn in_features(&self) -> usize {
        self.in_features
    }

    /// Number of classes
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }
}

impl Model for Classifier {
    fn forward(&self, batch: &Batch) -> Result<Outputs> {
        let features = batch.get(FEATURES_KEY).ok_or_else(|| {
            Error::invalid_input(format!("batch has no '{}' tensor", FEATURES_KEY))
        })?;
        let logits = features.apply(&self.fc1)?.tanh()?.apply(&self.fc2)?;
        let probs = ops::softmax_last_dim(&logits)?;

        let mut outputs = Outputs::new();
        if let Some(target) = batch.get(TARGET_KEY) {
            let loss = loss::cross_entropy(&logits, target)?;
            outputs.insert(TARGET_KEY.to_string(), target.clone());
            outputs.insert(LOSS_KEY.to_string(), loss);
        }
        outputs.insert(LOGITS_KEY.to_string(), logits);
        outputs.insert(PROBS_KEY.to_string(), probs);
        Ok(outputs)
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn save(&self, path: &Path) -> Result<()> {
        self.var_map.save(path)?;
        Ok(())
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        self.var_map.load(path)?;
        Ok(())
    }
}
