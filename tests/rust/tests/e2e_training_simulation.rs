//! End-to-end training simulation
//!
//! Drives a small model through a training loop with:
//! - an EMA-tracking train state
//! - periodic checkpoints through the checkpoint manager
//! - scalar logging gated to the primary process
//! - resuming into a fresh reference state

use anyhow::Result;
use std::collections::BTreeMap;
use train_core::{
    telemetry, CheckpointConfig, EmaConfig, FixedRank, LoggingConfig, Module, Optimizer,
    ParamStore, Sgd, Tensor, TrainConfig,
};
use train_state::{
    CheckpointManager, CheckpointManagerConfig, DenoisingModelTrainState, Snapshot,
};
use train_utils::{load_scalars_from_tfevents, opt_chain, EventWriter, PrimaryOnly};

fn init_model() -> ParamStore {
    let mut model = ParamStore::new();
    model.insert("w", Tensor::from_vec(vec![4.0, -2.0]));
    model.insert("b", Tensor::scalar(1.0));
    model
}

/// Gradient of 0.5 * ||p||^2, which pulls every parameter toward zero
fn grads(model: &ParamStore) -> BTreeMap<String, Tensor> {
    model.iter().map(|(k, t)| (k.clone(), t.clone())).collect()
}

fn loss(model: &ParamStore) -> f64 {
    model
        .iter()
        .flat_map(|(_, t)| t.data().iter())
        .map(|v| 0.5 * f64::from(*v) * f64::from(*v))
        .sum()
}

type State = DenoisingModelTrainState<ParamStore, Box<dyn Optimizer>>;

fn new_state(config: &EmaConfig) -> Result<State> {
    let optimizer: Box<dyn Optimizer> = Box::new(Sgd::new(0.1));
    let optimizer = opt_chain(vec![optimizer])?;
    Ok(DenoisingModelTrainState::from_config(init_model(), optimizer, 0, config))
}

async fn train(
    state: &mut State,
    steps: u64,
    manager: &CheckpointManager,
    writer: &mut PrimaryOnly<EventWriter, FixedRank>,
) -> Result<()> {
    for _ in 0..steps {
        {
            let (model, optimizer) = state.basic_mut().parts_mut();
            let g = grads(model);
            optimizer.step(model, &g)?;
        }
        state.update_ema()?;
        let step = state.step() + 1;
        state.set_step(step);

        let current_loss = loss(state.basic().model());
        writer
            .run(|w| w.add_scalar("train/loss", current_loss, step))?
            .transpose()?;

        if manager.should_save(step) {
            manager.save(&*state).await?;
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_training_resume_flow() -> Result<()> {
    let ckpt_dir = tempfile::tempdir()?;
    let log_dir = tempfile::tempdir()?;

    let config = TrainConfig {
        checkpoint: CheckpointConfig {
            directory: ckpt_dir.path().to_path_buf(),
            keep_count: 2,
            save_interval_steps: 5,
        },
        ema: EmaConfig { decay: 0.9 },
        logging: LoggingConfig {
            event_dir: Some(log_dir.path().to_path_buf()),
            ..LoggingConfig::default()
        },
    };
    config.validate()?;
    telemetry::init_from_config(&config.logging);

    let manager =
        CheckpointManager::open(CheckpointManagerConfig::from(config.checkpoint.clone())).await?;
    let event_writer = EventWriter::from_config(&config.logging)?
        .ok_or_else(|| anyhow::anyhow!("event_dir is set"))?;
    let mut writer = PrimaryOnly::with_rank_source(event_writer, FixedRank(0));

    let mut state = new_state(&config.ema)?;
    let initial_loss = loss(state.basic().model());
    train(&mut state, 20, &manager, &mut writer).await?;
    writer.run(|w| w.flush())?.transpose()?;

    // Retention keeps the newest two checkpoints.
    assert_eq!(manager.all_steps(), vec![15, 20]);

    // Loss decreased and was logged once per step.
    let scalars = load_scalars_from_tfevents(log_dir.path())?;
    assert_eq!(scalars.len(), 20);
    let final_loss = scalars[&20]["train/loss"];
    assert!(final_loss < initial_loss);

    // EMA lags behind the live parameters while both decay toward zero.
    let ema = state.ema_parameters()?;
    let live_w = state.basic().model().get("w").unwrap().data()[0];
    let ema_w = ema["w"].as_tensor().unwrap().data()[0];
    assert!(ema_w > live_w);

    // Resume into a fresh reference state.
    let mut resumed = new_state(&config.ema)?;
    let restored_step = manager.restore_latest_into(&mut resumed).await?;
    assert_eq!(restored_step, 20);
    assert_eq!(resumed.step(), 20);
    assert_eq!(resumed.basic().model(), state.basic().model());
    assert_eq!(resumed.ema_parameters()?, ema);
    assert_eq!(
        resumed.basic().optimizer().state_dict(),
        state.basic().optimizer().state_dict()
    );

    // Going back to an older checkpoint would move the step backwards.
    assert!(manager.restore_step_into(15, &mut resumed).await.is_err());
    assert_eq!(resumed.step(), 20);

    Ok(())
}

#[tokio::test]
async fn test_non_primary_writes_nothing() -> Result<()> {
    let log_dir = tempfile::tempdir()?;
    let mut writer = PrimaryOnly::with_rank_source(log_dir.path().to_path_buf(), FixedRank(1));

    let created = writer.run(|dir| EventWriter::create(dir.as_path()))?;
    assert!(created.is_none());
    assert!(load_scalars_from_tfevents(log_dir.path())?.is_empty());

    Ok(())
}

#[test]
fn test_module_state_matches_checkpoint_keys() -> Result<()> {
    let state = new_state(&EmaConfig::default())?;
    let sd = state.state_dict()?;
    assert!(sd.contains_key("step"));
    assert!(sd.contains_key("params"));
    assert!(sd.contains_key("opt_state"));
    assert!(sd.contains_key("ema"));
    assert_eq!(
        sd["params"].as_map().unwrap(),
        &state.basic().model().state_dict()
    );
    Ok(())
}
