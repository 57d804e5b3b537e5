//! Cross-component tests for the training pipeline
//!
//! Unit tests live next to each component; the modules here drive the
//! trainer, checkpoint store and metrics engine together.


mod checkpoint_tests;

pub use fixtures::{
    segmentation_loader, small_unet, test_config, MismatchedModel, ScriptedModel,
    TrainingTestFixture,
};
