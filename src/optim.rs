//! Optimizer seam and SGD
//!
//! Optimizers keep per-parameter gradient buffers so several backward passes
//! can be accumulated before one update.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::VarMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Optimizer shared between a trainer and the accelerator
pub type SharedOptimizer = Arc<Mutex<dyn Optimizer>>;

/// Gradient-based parameter updater
pub trait Optimizer: Send {
    /// Optimizer name
    fn name(&self) -> &str;

    /// Add gradients from one backward pass into the gradient buffers
    fn accumulate(&mut self, grads: &GradStore) -> Result<()>;

    /// Update parameters from the gradient buffers
    fn step(&mut self) -> Result<()>;

    /// Clear the gradient buffers
    fn zero_grad(&mut self);

    /// Current learning rate
    fn learning_rate(&self) -> f64;

    /// Set learning rate
    fn set_learning_rate(&mut self, lr: f64);

    /// Number of updates applied
    fn step_count(&self) -> usize;

    /// Optimizer state for checkpointing
    fn state_dict(&self) -> Result<OptimizerState>;

    /// Restore optimizer state
    fn load_state_dict(&mut self, state: OptimizerState) -> Result<()>;
}

/// Serialized tensor buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorState {
    /// Tensor shape
    pub shape: Vec<usize>,
    /// Row-major values
    pub data: Vec<f32>,
}

impl TensorState {
    /// Capture a tensor
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        Ok(Self {
            shape: tensor.dims().to_vec(),
            data: tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?,
        })
    }

    /// Rebuild the tensor on `device` with `dtype`
    pub fn to_tensor(&self, device: &Device, dtype: DType) -> Result<Tensor> {
        Ok(Tensor::from_vec(self.data.clone(), self.shape.as_slice(), device)?.to_dtype(dtype)?)
    }
}

/// Checkpointable optimizer state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    /// Optimizer name
    pub name: String,
    /// Learning rate at save time
    pub learning_rate: f64,
    /// Updates applied
    pub step_count: usize,
    /// Momentum buffers keyed by parameter name
    pub momentum_buffers: BTreeMap<String, TensorState>,
}

/// SGD optimizer with momentum and weight decay
pub struct Sgd {
    vars: Vec<(String, Var)>,
    learning_rate: f64,
    momentum: f64,
    weight_decay: f64,
    step_count: usize,
    grads: HashMap<String, Tensor>,
    momentum_buffers: HashMap<String, Tensor>,
}

impl Sgd {
    /// Create an SGD optimizer over every variable of `var_map`
    pub fn new(var_map: &VarMap, learning_rate: f64, momentum: f64, weight_decay: f64) -> Result<Self> {
        if learning_rate <= 0.0 {
            return Err(Error::config(format!("learning rate must be positive, got {}", learning_rate)));
        }
        if !(0.0..1.0).contains(&momentum) {
            return Err(Error::config(format!("momentum must be in [0, 1), got {}", momentum)));
        }
        if weight_decay < 0.0 {
            return Err(Error::config(format!("weight decay must be >= 0, got {}", weight_decay)));
        }

        let mut vars: Vec<(String, Var)> = var_map
            .data()
            .lock()
            .map_err(|_| Error::internal("variable map lock poisoned"))?
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(Self {
            vars,
            learning_rate,
            momentum,
            weight_decay,
            step_count: 0,
            grads: HashMap::new(),
            momentum_buffers: HashMap::new(),
        })
    }

    /// Number of parameters tensors updated
    pub fn parameter_count(&self) -> usize {
        self.vars.len()
    }

    fn update_parameter(&mut self, name: &str, var: &Var, grad: &Tensor) -> Result<()> {
        let param = var.as_tensor();
        let effective_grad = if self.weight_decay > 0.0 {
            (grad + (param * self.weight_decay)?)?
        } else {
            grad.clone()
        };

        let update = if self.momentum > 0.0 {
            // v_t = mu * v_{t-1} + g_t
            let velocity = match self.momentum_buffers.get(name) {
                Some(buffer) => ((buffer * self.momentum)? + &effective_grad)?,
                None => effective_grad,
            };
            self.momentum_buffers.insert(name.to_string(), velocity.clone());
            velocity
        } else {
            effective_grad
        };

        var.set(&(param - (update * self.learning_rate)?)?)?;
        Ok(())
    }
}

impl Optimizer for Sgd {
    fn name(&self) -> &str {
        if self.momentum > 0.0 {
            "sgd_momentum"
        } else {
            "sgd"
        }
    }

    fn accumulate(&mut self, grads: &GradStore) -> Result<()> {
        for (name, var) in &self.vars {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let summed = match self.grads.get(name) {
                Some(existing) => (existing + grad)?,
                None => grad.detach(),
            };
            self.grads.insert(name.clone(), summed);
        }
        Ok(())
    }

    fn step(&mut self) -> Result<()> {
        let vars = self.vars.clone();
        for (name, var) in &vars {
            if let Some(grad) = self.grads.get(name).cloned() {
                self.update_parameter(name, var, &grad)?;
            }
        }
        self.step_count += 1;
        Ok(())
    }

    fn zero_grad(&mut self) {
        self.grads.clear();
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn step_count(&self) -> usize {
        self.step_count
    }

    fn state_dict(&self) -> Result<OptimizerState> {
        let momentum_buffers = self
            .momentum_buffers
            .iter()
            .map(|(name, buffer)| Ok((name.clone(), TensorState::from_tensor(buffer)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        Ok(OptimizerState {
            name: self.name().to_string(),
            learning_rate: self.learning_rate,
            step_count: self.step_count,
            momentum_buffers,
        })
    }

    fn load_state_dict(&mut self, state: OptimizerState) -> Result<()> {
        let mut buffers = HashMap::new();
        for (name, buffer) in &state.momentum_buffers {
            let var = self
                .vars
                .iter()
                .find(|(var_name, _)| var_name == name)
                .map(|(_, var)| var)
                .ok_or_else(|| Error::checkpoint(format!("unknown parameter '{}' in optimizer state", name)))?;
            if buffer.shape != var.dims() {
                return Err(Error::checkpoint(format!(
                    "momentum buffer for '{}' has shape {:?}, parameter has {:?}",
                    name,
                    buffer.shape,
                    var.dims()
                )));
            }
            buffers.insert(name.clone(), buffer.to_tensor(var.device(), var.dtype())?);
        }

        self.momentum_buffers = buffers;
        self.learning_rate = state.learning_rate;
        self.step_count = state.step_count;
        Ok(())
    }
}
