//! Train-state containers
//!
//! Three levels, each extending the previous one:
//!
//! - [`TrainState`]: the step counter.
//! - [`BasicTrainState`]: adds a model and optimizer with their state dicts.
//! - [`DenoisingModelTrainState`]: adds an EMA copy of the model.
//!
//! Restoring is all-or-nothing: when any part of a checkpoint fails to load,
//! the step, model, optimizer and EMA model keep their previous values.

use std::path::Path;

use tracing::{debug, info, warn};
use train_core::{
    counter_value, get_map, get_step, EmaConfig, Error, Module, Optimizer, Result, StateDict,
    Step, Value,
};

use crate::codec::{read_checkpoint_file, write_checkpoint_file, CheckpointKind};
use crate::ema::AveragedModel;

/// Default decay for the EMA model
pub const DEFAULT_EMA_DECAY: f64 = 0.999;

/// Behavior shared by every train-state container
pub trait Snapshot {
    /// Number of gradient steps applied
    fn step(&self) -> Step;

    fn set_step(&mut self, step: Step);

    /// Checkpoint kind written by this container
    fn kind(&self) -> CheckpointKind;

    /// State dictionary for saving
    fn state_dict(&self) -> Result<StateDict>;

    /// Update fields from a loaded checkpoint
    fn update_from_checkpoint(&mut self, checkpoint: &StateDict) -> Result<()>;

    /// The step as a plain integer
    fn int_step(&self) -> u64 {
        self.step()
    }

    /// Save the current state to a single checkpoint file
    fn save_checkpoint(&self, path: &Path) -> Result<u64> {
        write_checkpoint_file(path, self.kind(), &self.state_dict()?)
    }

    /// Restore a checkpoint into this state in place.
    ///
    /// The step is taken from the checkpoint when present and kept
    /// otherwise. A checkpoint behind the current step is rejected and
    /// leaves the state untouched.
    fn restore_into(&mut self, path: &Path) -> Result<&mut Self>
    where
        Self: Sized,
    {
        let (header, checkpoint) = read_checkpoint_file(path)?;
        if header.kind != self.kind() {
            warn!(
                path = %path.display(),
                checkpoint_kind = ?header.kind,
                state_kind = ?self.kind(),
                "Restoring checkpoint written by a different container"
            );
        }
        self.restore_from_state(&checkpoint)?;
        info!(path = %path.display(), step = self.step(), "Restored checkpoint into reference state");
        Ok(self)
    }

    /// Restore an already loaded checkpoint in place
    fn restore_from_state(&mut self, checkpoint: &StateDict) -> Result<()> {
        if let Some(restored) = get_step(checkpoint)? {
            if restored < self.step() {
                return Err(Error::StepRegression {
                    current: self.step(),
                    restored,
                });
            }
        }
        self.update_from_checkpoint(checkpoint)
    }
}

/// Base train state holding the step counter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrainState {
    step: Step,
}

impl TrainState {
    pub fn new(step: Step) -> Self {
        Self { step }
    }

    /// Create a new state from a checkpoint file
    pub fn restore_from_checkpoint(path: &Path) -> Result<Self> {
        let (_, checkpoint) = read_checkpoint_file(path)?;
        let step = get_step(&checkpoint)?.unwrap_or(0);
        info!(path = %path.display(), step, "Restored train state");
        Ok(Self { step })
    }
}

impl Snapshot for TrainState {
    fn step(&self) -> Step {
        self.step
    }

    fn set_step(&mut self, step: Step) {
        self.step = step;
    }

    fn kind(&self) -> CheckpointKind {
        CheckpointKind::Base
    }

    fn state_dict(&self) -> Result<StateDict> {
        let mut state = StateDict::new();
        state.insert("step".to_string(), counter_value("step", self.step)?);
        Ok(state)
    }

    fn update_from_checkpoint(&mut self, checkpoint: &StateDict) -> Result<()> {
        if let Some(step) = get_step(checkpoint)? {
            self.step = step;
        }
        Ok(())
    }
}

/// Train state holding a model, its optimizer and their state dicts
#[derive(Debug, Clone)]
pub struct BasicTrainState<M, O> {
    base: TrainState,
    model: M,
    optimizer: O,
    params: StateDict,
    opt_state: StateDict,
}

impl<M: Module, O: Optimizer> BasicTrainState<M, O> {
    /// Wrap a model and optimizer, snapshotting their current state
    pub fn new(model: M, optimizer: O, step: Step) -> Self {
        Self::from_parts(model, optimizer, None, None, step)
    }

    /// Wrap a model and optimizer with explicit state snapshots; `None`
    /// snapshots are taken from the model and optimizer
    pub fn from_parts(
        model: M,
        optimizer: O,
        params: Option<StateDict>,
        opt_state: Option<StateDict>,
        step: Step,
    ) -> Self {
        let params = params.unwrap_or_else(|| model.state_dict());
        let opt_state = opt_state.unwrap_or_else(|| optimizer.state_dict());
        Self {
            base: TrainState::new(step),
            model,
            optimizer,
            params,
            opt_state,
        }
    }

    /// Load a checkpoint into `model` and `optimizer` and wrap them
    pub fn restore_from_checkpoint(path: &Path, model: M, optimizer: O) -> Result<Self> {
        let (_, checkpoint) = read_checkpoint_file(path)?;
        let mut state = Self::new(model, optimizer, 0);
        state.update_from_checkpoint(&checkpoint)?;
        info!(path = %path.display(), step = state.step(), "Restored basic train state");
        Ok(state)
    }

    /// Replace state values with updated fields
    pub fn replace(&mut self, step: Step, params: StateDict, opt_state: StateDict) {
        self.base.set_step(step);
        self.params = params;
        self.opt_state = opt_state;
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn optimizer_mut(&mut self) -> &mut O {
        &mut self.optimizer
    }

    /// Mutable access to model and optimizer together, for a training step
    pub fn parts_mut(&mut self) -> (&mut M, &mut O) {
        (&mut self.model, &mut self.optimizer)
    }

    /// Parameter snapshot held by this state
    pub fn params(&self) -> &StateDict {
        &self.params
    }

    /// Optimizer state snapshot held by this state
    pub fn opt_state(&self) -> &StateDict {
        &self.opt_state
    }

    pub fn into_parts(self) -> (M, O) {
        (self.model, self.optimizer)
    }

    /// Load `params` and `opt_state` into the model and optimizer, putting
    /// both back to their previous state if either load fails
    fn load_parts(&mut self, params: &StateDict, opt_state: &StateDict) -> Result<()> {
        let saved_params = self.model.state_dict();
        let saved_opt_state = self.optimizer.state_dict();

        let loaded = self
            .model
            .load_state_dict(params)
            .and_then(|()| self.optimizer.load_state_dict(opt_state));
        if let Err(err) = loaded {
            warn!(error = %err, "Checkpoint load failed, rolling back model and optimizer");
            self.model.load_state_dict(&saved_params)?;
            self.optimizer.load_state_dict(&saved_opt_state)?;
            return Err(err);
        }
        Ok(())
    }
}

impl<M: Module, O: Optimizer> Snapshot for BasicTrainState<M, O> {
    fn step(&self) -> Step {
        self.base.step()
    }

    fn set_step(&mut self, step: Step) {
        self.base.set_step(step);
    }

    fn kind(&self) -> CheckpointKind {
        CheckpointKind::Basic
    }

    fn state_dict(&self) -> Result<StateDict> {
        let mut state = self.base.state_dict()?;
        state.insert("params".to_string(), Value::Map(self.model.state_dict()));
        state.insert("opt_state".to_string(), Value::Map(self.optimizer.state_dict()));
        Ok(state)
    }

    fn update_from_checkpoint(&mut self, checkpoint: &StateDict) -> Result<()> {
        let step = get_step(checkpoint)?;
        let params = get_map(checkpoint, "params")?;
        let opt_state = get_map(checkpoint, "opt_state")?;

        self.load_parts(params, opt_state)?;
        if let Some(step) = step {
            self.base.set_step(step);
        }
        self.params = params.clone();
        self.opt_state = opt_state.clone();
        Ok(())
    }
}

/// Train state with an additional EMA copy of the model
#[derive(Debug, Clone)]
pub struct DenoisingModelTrainState<M, O> {
    basic: BasicTrainState<M, O>,
    ema_decay: f64,
    ema_model: Option<AveragedModel<M>>,
    ema: StateDict,
}

impl<M: Module + Clone, O: Optimizer> DenoisingModelTrainState<M, O> {
    /// Wrap a model and optimizer and start an EMA copy of the model
    pub fn new(model: M, optimizer: O, step: Step, ema_decay: f64) -> Self {
        Self::with_ema(BasicTrainState::new(model, optimizer, step), ema_decay)
    }

    /// Like [`new`](Self::new), with the decay taken from `config`
    pub fn from_config(model: M, optimizer: O, step: Step, config: &EmaConfig) -> Self {
        Self::new(model, optimizer, step, config.decay)
    }

    /// Wrap a model and optimizer without an EMA model
    pub fn without_ema(model: M, optimizer: O, step: Step) -> Self {
        Self {
            basic: BasicTrainState::new(model, optimizer, step),
            ema_decay: DEFAULT_EMA_DECAY,
            ema_model: None,
            ema: StateDict::new(),
        }
    }

    fn with_ema(basic: BasicTrainState<M, O>, ema_decay: f64) -> Self {
        let ema_model = AveragedModel::new(&basic.model, ema_decay);
        let ema = ema_model.module().state_dict();
        Self {
            basic,
            ema_decay,
            ema_model: Some(ema_model),
            ema,
        }
    }

    /// Load a checkpoint into `model` and `optimizer`, then start the EMA
    /// model from the loaded weights. Averaged parameters stored in the
    /// checkpoint replace that starting copy.
    pub fn restore_from_checkpoint(
        path: &Path,
        model: M,
        optimizer: O,
        ema_decay: f64,
    ) -> Result<Self> {
        let (_, checkpoint) = read_checkpoint_file(path)?;
        let ema_state = optional_map(&checkpoint, "ema")?;

        let mut basic = BasicTrainState::new(model, optimizer, 0);
        basic.update_from_checkpoint(&checkpoint)?;

        let mut state = Self::with_ema(basic, ema_decay);
        if let (Some(ema_state), Some(ema_model)) = (ema_state, state.ema_model.as_mut()) {
            ema_model.load_state_dict(ema_state)?;
        }
        state.refresh_ema_snapshot();

        info!(
            path = %path.display(),
            step = state.step(),
            has_ema = ema_state.is_some(),
            "Restored denoising model train state"
        );
        Ok(state)
    }

    /// Parameters of the EMA model
    pub fn ema_parameters(&self) -> Result<StateDict> {
        self.ema_model
            .as_ref()
            .map(|ema| ema.module().state_dict())
            .ok_or(Error::EmaModelMissing)
    }

    /// Fold the live model into the EMA model
    pub fn update_ema(&mut self) -> Result<()> {
        let ema_model = self.ema_model.as_mut().ok_or(Error::EmaModelMissing)?;
        ema_model.update_parameters(&self.basic.model)?;
        self.ema = ema_model.module().state_dict();
        Ok(())
    }

    /// Replace state values with updated fields
    pub fn replace(
        &mut self,
        step: Step,
        params: StateDict,
        opt_state: StateDict,
        ema: StateDict,
    ) {
        self.basic.replace(step, params, opt_state);
        self.ema = ema;
    }

    pub fn ema_model(&self) -> Option<&AveragedModel<M>> {
        self.ema_model.as_ref()
    }

    pub fn ema_decay(&self) -> f64 {
        self.ema_decay
    }

    /// EMA parameter snapshot held by this state
    pub fn ema(&self) -> &StateDict {
        &self.ema
    }

    pub fn basic(&self) -> &BasicTrainState<M, O> {
        &self.basic
    }

    pub fn basic_mut(&mut self) -> &mut BasicTrainState<M, O> {
        &mut self.basic
    }

    fn refresh_ema_snapshot(&mut self) {
        if let Some(ema_model) = &self.ema_model {
            self.ema = ema_model.module().state_dict();
        }
    }
}

impl<M: Module + Clone, O: Optimizer> Snapshot for DenoisingModelTrainState<M, O> {
    fn step(&self) -> Step {
        self.basic.step()
    }

    fn set_step(&mut self, step: Step) {
        self.basic.set_step(step);
    }

    fn kind(&self) -> CheckpointKind {
        CheckpointKind::Denoising
    }

    fn state_dict(&self) -> Result<StateDict> {
        let mut state = self.basic.state_dict()?;
        if let Some(ema_model) = &self.ema_model {
            state.insert("ema".to_string(), Value::Map(ema_model.state_dict()?));
        }
        Ok(state)
    }

    fn update_from_checkpoint(&mut self, checkpoint: &StateDict) -> Result<()> {
        // The EMA entry is loaded into a copy first so a bad entry fails
        // before the model and optimizer change.
        let staged = match (optional_map(checkpoint, "ema")?, self.ema_model.as_ref()) {
            (Some(ema_state), Some(ema_model)) => {
                let mut staged = ema_model.clone();
                staged.load_state_dict(ema_state)?;
                Some(staged)
            }
            (Some(_), None) => {
                warn!("Checkpoint has EMA state but this train state has no EMA model");
                None
            }
            (None, _) => None,
        };

        self.basic.update_from_checkpoint(checkpoint)?;

        match staged {
            Some(staged) => self.ema_model = Some(staged),
            None if self.ema_model.is_some() => {
                debug!("Checkpoint has no EMA state, restarting EMA from the restored model");
                self.ema_model = Some(AveragedModel::new(&self.basic.model, self.ema_decay));
            }
            None => {}
        }
        self.refresh_ema_snapshot();
        Ok(())
    }
}

/// Nested map under `key`, or `None` when the key is absent
fn optional_map<'a>(state: &'a StateDict, key: &str) -> Result<Option<&'a StateDict>> {
    if state.contains_key(key) {
        get_map(state, key).map(Some)
    } else {
        Ok(None)
    }
}
