//! Tests for checkpoint persistence and the freeze policy

use std::collections::HashMap;

use approx::assert_relative_eq;
use candle_core::Tensor;

use super::fixtures::small_unet;
use crate::error::Error;
use crate::model::{ParamGroup, SegmentationModel, UNet, UNetConfig};
use crate::training::checkpoints::{Checkpoint, CheckpointStore};
use crate::training::optimizers::{Adam, AdamConfig, Optimizer};

/// Adam after one unit-gradient step over every trainable parameter of `model`
fn stepped_adam(model: &UNet) -> Adam {
    let mut optimizer = Adam::new(model.parameters(), 1e-3, AdamConfig::default()).unwrap();
    let gradients: HashMap<String, Tensor> = optimizer
        .tracked()
        .iter()
        .map(|p| (p.key.clone(), p.var.as_tensor().ones_like().unwrap()))
        .collect();
    optimizer.apply(&gradients).unwrap();
    optimizer
}

fn flat(tensor: &Tensor) -> Vec<f32> {
    tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap()
}

#[test]
fn test_checkpoint_save_load_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path());
    let model = small_unet().unwrap();
    let optimizer = stepped_adam(&model);

    let path = store
        .save_epoch(Checkpoint::capture(3, model.parameters(), &optimizer))
        .unwrap();
    assert_eq!(path, store.checkpoint_path(3));

    let loaded = CheckpointStore::load(&path).unwrap();
    assert_eq!(loaded.epoch, 3);
    assert_eq!(loaded.optimizer.step, 1);
    assert_relative_eq!(loaded.optimizer.learning_rate, 1e-3);
    assert_eq!(loaded.optimizer.num_tracked(), model.parameters().len());
    assert_eq!(loaded.optimizer.param_steps.len(), model.parameters().len());
    assert!(loaded.optimizer.param_steps.values().all(|&t| t == 1));
    assert_eq!(loaded.model.len(), model.parameters().len());

    for (key, tensor) in model.parameters().state() {
        assert_eq!(flat(&loaded.model[&key]), flat(&tensor), "parameter {key}");
    }
}

#[test]
fn test_restore_into_fresh_model() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path());
    let trained = small_unet().unwrap();
    let path = store
        .save_epoch(Checkpoint::capture(0, trained.parameters(), &stepped_adam(&trained)))
        .unwrap();

    let mut fresh = small_unet().unwrap();
    let mut optimizer = Adam::new(fresh.parameters(), 5e-4, AdamConfig::default()).unwrap();
    CheckpointStore::load(&path)
        .unwrap()
        .restore(fresh.parameters_mut(), &mut optimizer)
        .unwrap();

    let expected = trained.parameters().state();
    for (key, tensor) in fresh.parameters().state() {
        assert_eq!(flat(&tensor), flat(&expected[&key]), "parameter {key}");
    }
    assert_eq!(optimizer.step_count(), 1);
    // The learning rate travels with the optimizer state
    assert_relative_eq!(optimizer.learning_rate(), 1e-3);
}

#[test]
fn test_restore_rejects_other_architecture() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wide.safetensors");
    let wide = UNet::new(
        UNetConfig {
            in_channels: 1,
            num_classes: 3,
            features: vec![8],
            dropout: 0.0,
        },
        &candle_core::Device::Cpu,
    )
    .unwrap();
    let optimizer = Adam::new(wide.parameters(), 1e-3, AdamConfig::default()).unwrap();
    CheckpointStore::save(Checkpoint::capture(0, wide.parameters(), &optimizer), &path).unwrap();

    let mut narrow = small_unet().unwrap();
    let before = narrow.parameters().state();
    let mut narrow_optimizer =
        Adam::new(narrow.parameters(), 1e-3, AdamConfig::default()).unwrap();
    let result = CheckpointStore::load(&path)
        .unwrap()
        .restore(narrow.parameters_mut(), &mut narrow_optimizer);

    assert!(matches!(result, Err(Error::Format(_))));
    for (key, tensor) in narrow.parameters().state() {
        assert_eq!(flat(&tensor), flat(&before[&key]), "parameter {key}");
    }
}

#[test]
fn test_save_into_missing_directory_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing").join("unet-epoch0.safetensors");
    let model = small_unet().unwrap();
    let optimizer = Adam::new(model.parameters(), 1e-3, AdamConfig::default()).unwrap();

    let result = CheckpointStore::save(Checkpoint::capture(0, model.parameters(), &optimizer), &path);

    assert!(matches!(result, Err(Error::Io(_))));
    assert!(!path.exists());
}

#[test]
fn test_freeze_policy_after_restore_drops_frozen_moments() {
    let mut model = small_unet().unwrap();
    let mut optimizer = stepped_adam(&model);
    let final_layer = model
        .parameters()
        .iter()
        .filter(|p| p.group == ParamGroup::FinalLayer)
        .count();

    CheckpointStore::apply_freeze_policy(model.parameters_mut(), true);
    assert!(!optimizer.is_bound_to(model.parameters()));
    optimizer.rebind(model.parameters());

    assert!(optimizer.is_bound_to(model.parameters()));
    assert_eq!(optimizer.tracked().len(), final_layer);
    assert_eq!(optimizer.state().num_tracked(), final_layer);
    assert_eq!(optimizer.step_count(), 1);
}

#[test]
fn test_freeze_policy_toggles_back_to_full_training() {
    let mut model = small_unet().unwrap();
    let total = model.parameters().len();

    CheckpointStore::apply_freeze_policy(model.parameters_mut(), true);
    let summary = model.parameters().group_summary();
    assert_eq!(summary[&ParamGroup::Encoder].1, 0);
    assert_eq!(summary[&ParamGroup::Bottleneck].1, 0);
    assert_eq!(summary[&ParamGroup::Decoder].1, 0);
    assert_eq!(
        summary[&ParamGroup::FinalLayer].0,
        summary[&ParamGroup::FinalLayer].1
    );

    CheckpointStore::apply_freeze_policy(model.parameters_mut(), false);
    assert_eq!(model.parameters().trainable().count(), total);
}
