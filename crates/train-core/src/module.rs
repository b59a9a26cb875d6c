//! Module and optimizer traits
//!
//! Train-state containers never touch parameters directly: they read and
//! push state dicts through these traits, and the implementations enforce
//! structural compatibility.

use crate::{Error, Result, StateDict, Tensor, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// A model whose trainable values can be exported and restored
pub trait Module: Send {
    /// Snapshot of every named parameter
    fn state_dict(&self) -> StateDict;

    /// Replace parameters with values from `state`
    fn load_state_dict(&mut self, state: &StateDict) -> Result<()>;
}

/// An optimizer with internal state
pub trait Optimizer: Send {
    fn state_dict(&self) -> StateDict;

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()>;

    /// Apply one update to `params` given per-parameter gradients
    fn step(&mut self, params: &mut ParamStore, grads: &BTreeMap<String, Tensor>) -> Result<()>;
}

impl<O: Optimizer + ?Sized> Optimizer for Box<O> {
    fn state_dict(&self) -> StateDict {
        (**self).state_dict()
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        (**self).load_state_dict(state)
    }

    fn step(&mut self, params: &mut ParamStore, grads: &BTreeMap<String, Tensor>) -> Result<()> {
        (**self).step(params, grads)
    }
}

/// Named parameter store
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamStore {
    params: BTreeMap<String, Tensor>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a parameter
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.params.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.params.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        self.params.get_mut(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.params.iter()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

impl FromIterator<(String, Tensor)> for ParamStore {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Self {
            params: iter.into_iter().collect(),
        }
    }
}

impl Module for ParamStore {
    fn state_dict(&self) -> StateDict {
        self.params
            .iter()
            .map(|(name, t)| (name.clone(), Value::Tensor(t.clone())))
            .collect()
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        if let Some(extra) = state.keys().find(|k| !self.params.contains_key(*k)) {
            return Err(Error::StateDictMismatch {
                key: extra.clone(),
                reason: "unexpected key".to_string(),
            });
        }

        // Validate everything before mutating so a failed load leaves the store intact.
        let mut incoming = Vec::with_capacity(self.params.len());
        for (name, current) in &self.params {
            let value = state.get(name).ok_or_else(|| Error::StateDictMismatch {
                key: name.clone(),
                reason: "missing key".to_string(),
            })?;
            let tensor = value.as_tensor().ok_or_else(|| Error::TypeMismatch {
                key: name.clone(),
                expected: "tensor".to_string(),
                actual: value.type_name().to_string(),
            })?;
            if tensor.shape() != current.shape() {
                return Err(Error::StateDictMismatch {
                    key: name.clone(),
                    reason: format!(
                        "shape {:?} does not match {:?}",
                        tensor.shape(),
                        current.shape()
                    ),
                });
            }
            incoming.push((name.clone(), tensor.clone()));
        }

        for (name, tensor) in incoming {
            self.params.insert(name, tensor);
        }
        debug!(params = self.params.len(), "Loaded parameter state dict");
        Ok(())
    }
}

/// Stochastic gradient descent with optional momentum
#[derive(Debug, Clone, PartialEq)]
pub struct Sgd {
    lr: f64,
    momentum: f64,
    buffers: BTreeMap<String, Tensor>,
}

impl Sgd {
    pub fn new(lr: f64) -> Self {
        Self::with_momentum(lr, 0.0)
    }

    pub fn with_momentum(lr: f64, momentum: f64) -> Self {
        Self {
            lr,
            momentum,
            buffers: BTreeMap::new(),
        }
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn momentum(&self) -> f64 {
        self.momentum
    }

    /// Momentum buffer for a parameter, present after its first step
    pub fn buffer(&self, name: &str) -> Option<&Tensor> {
        self.buffers.get(name)
    }
}

impl Optimizer for Sgd {
    fn state_dict(&self) -> StateDict {
        let mut group = StateDict::new();
        group.insert("lr".to_string(), Value::Float(self.lr));
        group.insert("momentum".to_string(), Value::Float(self.momentum));

        let buffers: StateDict = self
            .buffers
            .iter()
            .map(|(name, t)| (name.clone(), Value::Tensor(t.clone())))
            .collect();

        let mut state = StateDict::new();
        state.insert("param_groups".to_string(), Value::Map(group));
        state.insert("state".to_string(), Value::Map(buffers));
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        let group = crate::get_map(state, "param_groups")?;
        let read_float = |key: &str| -> Result<f64> {
            group
                .get(key)
                .and_then(Value::as_f64)
                .ok_or_else(|| Error::MissingKey {
                    key: format!("param_groups.{}", key),
                })
        };
        let lr = read_float("lr")?;
        let momentum = read_float("momentum")?;

        let mut buffers = BTreeMap::new();
        for (name, value) in crate::get_map(state, "state")? {
            let tensor = value.as_tensor().ok_or_else(|| Error::TypeMismatch {
                key: format!("state.{}", name),
                expected: "tensor".to_string(),
                actual: value.type_name().to_string(),
            })?;
            buffers.insert(name.clone(), tensor.clone());
        }

        self.lr = lr;
        self.momentum = momentum;
        self.buffers = buffers;
        debug!(lr, momentum, buffers = self.buffers.len(), "Loaded optimizer state dict");
        Ok(())
    }

    fn step(&mut self, params: &mut ParamStore, grads: &BTreeMap<String, Tensor>) -> Result<()> {
        for (name, grad) in grads {
            let param = params.get_mut(name).ok_or_else(|| Error::StateDictMismatch {
                key: name.clone(),
                reason: "gradient for unknown parameter".to_string(),
            })?;
            if param.shape() != grad.shape() {
                return Err(Error::StateDictMismatch {
                    key: name.clone(),
                    reason: format!(
                        "gradient shape {:?} does not match {:?}",
                        grad.shape(),
                        param.shape()
                    ),
                });
            }

            let update = if self.momentum > 0.0 {
                let momentum = self.momentum as f32;
                match self.buffers.get_mut(name) {
                    // First step seeds the buffer with the raw gradient.
                    None => {
                        self.buffers.insert(name.clone(), grad.clone());
                        grad.clone()
                    }
                    Some(buf) => {
                        if buf.shape() != grad.shape() {
                            return Err(Error::StateDictMismatch {
                                key: name.clone(),
                                reason: "momentum buffer shape mismatch".to_string(),
                            });
                        }
                        for (b, g) in buf.data_mut().iter_mut().zip(grad.data()) {
                            *b = momentum * *b + g;
                        }
                        buf.clone()
                    }
                }
            } else {
                grad.clone()
            };

            let lr = self.lr as f32;
            for (p, u) in param.data_mut().iter_mut().zip(update.data()) {
                *p -= lr * u;
            }
        }
        Ok(())
    }
}
