//! Exponential moving average of model parameters
//!
//! `AveragedModel` keeps a deep copy of a module whose tensors track
//!
//! ```text
//! ema = decay * ema + (1 - decay) * live
//! ```
//!
//! The first update copies the live parameters verbatim.

use tracing::debug;
use train_core::{counter_value, Error, Module, Result, StateDict, Value};

/// Shadow copy of a module updated as a decayed running average
#[derive(Debug, Clone)]
pub struct AveragedModel<M> {
    module: M,
    decay: f64,
    n_averaged: u64,
}

impl<M: Module + Clone> AveragedModel<M> {
    /// Wrap a copy of `model`
    pub fn new(model: &M, decay: f64) -> Self {
        Self {
            module: model.clone(),
            decay,
            n_averaged: 0,
        }
    }

    /// The averaged module
    pub fn module(&self) -> &M {
        &self.module
    }

    pub fn module_mut(&mut self) -> &mut M {
        &mut self.module
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }

    /// Number of updates folded into the average
    pub fn n_averaged(&self) -> u64 {
        self.n_averaged
    }

    /// Fold the live parameters of `model` into the average
    pub fn update_parameters(&mut self, model: &M) -> Result<()> {
        let live = model.state_dict();
        let next = if self.n_averaged == 0 {
            live
        } else {
            let current = self.module.state_dict();
            average(&current, &live, self.decay)?
        };

        self.module.load_state_dict(&next)?;
        self.n_averaged += 1;
        debug!(n_averaged = self.n_averaged, decay = self.decay, "EMA parameters updated");
        Ok(())
    }

    pub fn state_dict(&self) -> Result<StateDict> {
        let mut state = StateDict::new();
        state.insert("module".to_string(), Value::Map(self.module.state_dict()));
        state.insert(
            "n_averaged".to_string(),
            counter_value("n_averaged", self.n_averaged)?,
        );
        Ok(state)
    }

    pub fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        let module = train_core::get_map(state, "module")?;
        let n_averaged = match state.get("n_averaged") {
            Some(Value::Int(n)) if *n >= 0 => *n as u64,
            Some(other) => {
                return Err(Error::TypeMismatch {
                    key: "n_averaged".to_string(),
                    expected: "non-negative int".to_string(),
                    actual: other.type_name().to_string(),
                })
            }
            None => self.n_averaged,
        };

        self.module.load_state_dict(module)?;
        self.n_averaged = n_averaged;
        Ok(())
    }
}

/// Blend two structurally identical state dicts
fn average(ema: &StateDict, live: &StateDict, decay: f64) -> Result<StateDict> {
    live.iter()
        .map(|(key, live_value)| {
            let blended = match (ema.get(key), live_value) {
                (Some(Value::Tensor(e)), Value::Tensor(l)) => {
                    if e.shape() != l.shape() {
                        return Err(Error::StateDictMismatch {
                            key: key.clone(),
                            reason: format!(
                                "EMA shape {:?} does not match live shape {:?}",
                                e.shape(),
                                l.shape()
                            ),
                        });
                    }
                    let decay = decay as f32;
                    let mut out = e.clone();
                    for (o, x) in out.data_mut().iter_mut().zip(l.data()) {
                        *o = decay * *o + (1.0 - decay) * x;
                    }
                    Value::Tensor(out)
                }
                (Some(Value::Float(e)), Value::Float(l)) => Value::Float(decay * e + (1.0 - decay) * l),
                (Some(Value::Map(e)), Value::Map(l)) => Value::Map(average(e, l, decay)?),
                // Counters and other non-float leaves follow the live model.
                _ => live_value.clone(),
            };
            Ok((key.clone(), blended))
        })
        .collect()
}
