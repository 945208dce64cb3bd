//! Run configuration and on-disk directory layout
//!
//! A [`RunConfig`] is built once from the command line and never mutated.
//! Every run-scoped directory is namespaced by the composite key returned by
//! [`RunConfig::model_dir`], and created in a single idempotent step by
//! [`RunLayout::ensure`] rather than as a constructor side effect.

use std::path::PathBuf;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Which half of the harness a run executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Run the training loop
    Train,
    /// Evaluate the held-out split and report accuracy
    Test,
}

/// Immutable parameters of a single training run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Model name, used to locate the model config file
    pub model_name: String,

    /// Dataset name under `dataset_root`
    pub dataset_name: String,

    /// Root directory holding datasets
    pub dataset_root: PathBuf,

    /// Root directory for checkpoints
    pub checkpoint_root: PathBuf,

    /// Root directory for scalar logs
    pub log_root: PathBuf,

    /// Root directory for rendered samples
    pub sample_root: PathBuf,

    /// Root directory for evaluation results
    pub result_root: PathBuf,

    /// Root directory for model config files
    pub config_root: PathBuf,

    /// Classifier head width, substituted for `output=feature` in the config
    pub feature_size: usize,

    /// Adam learning rate
    pub learning_rate: f64,

    /// Total optimizer steps to run
    pub iterations: usize,

    /// Square image side length fed to the network
    pub img_size: usize,

    /// Samples per batch
    pub batch_size: usize,

    /// Fraction of the dataset assigned to the training split
    pub train_split: f64,

    /// Seed for dataset splitting and batch shuffling
    pub seed: u64,

    /// Phase selector
    pub phase: Phase,
}

impl RunConfig {
    /// Composite key namespacing every per-run directory.
    pub fn model_dir(&self) -> String {
        format!("{}_{}_{}", self.model_name, self.dataset_name, self.img_size)
    }

    /// Path of the dataset on disk.
    pub fn dataset_path(&self) -> PathBuf {
        self.dataset_root.join(&self.dataset_name)
    }

    /// Validate the run parameters before any work happens.
    pub fn validate(&self) -> Result<()> {
        if self.model_name.is_empty() {
            return Err(Error::invalid_input("model name must not be empty"));
        }
        if self.batch_size == 0 {
            return Err(Error::invalid_input("batch size must be positive"));
        }
        if self.img_size == 0 {
            return Err(Error::invalid_input("image size must be positive"));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(Error::invalid_input(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(self.train_split > 0.0 && self.train_split < 1.0) {
            return Err(Error::invalid_input(format!(
                "train split must lie strictly between 0 and 1, got {}",
                self.train_split
            )));
        }
        Ok(())
    }
}

/// Resolved per-run directories
#[derive(Debug, Clone)]
pub struct RunLayout {
    /// Rendered sample output
    pub sample_dir: PathBuf,
    /// Checkpoint records and manifest
    pub checkpoint_dir: PathBuf,
    /// Scalar log sink
    pub log_dir: PathBuf,
    /// Evaluation output
    pub result_dir: PathBuf,
    /// Model config files for this model
    pub config_dir: PathBuf,
}

impl RunLayout {
    /// Resolve the directory layout for a run. No directories are touched.
    pub fn new(config: &RunConfig) -> Self {
        let key = config.model_dir();
        Self {
            sample_dir: config.sample_root.join(&key),
            checkpoint_dir: config.checkpoint_root.join(&key),
            log_dir: config.log_root.join(&key),
            result_dir: config.result_root.join(&key),
            // Config files are shared across image sizes, keyed by model only.
            config_dir: config.config_root.join(&config.model_name),
        }
    }

    /// Create every run directory. Idempotent; invoked once by the orchestrator.
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            &self.sample_dir,
            &self.checkpoint_dir,
            &self.log_dir,
            &self.result_dir,
            &self.config_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Path of the model config file for `model_name`.
    pub fn config_file(&self, model_name: &str) -> PathBuf {
        self.config_dir.join(format!("{model_name}.cfg"))
    }
}

/// Build a [`RunConfig`] rooted under `root` with small defaults. Test helper.
#[cfg(test)]
pub(crate) fn config_under_root(
    root: &std::path::Path,
    model_name: &str,
    dataset_name: &str,
) -> RunConfig {
    RunConfig {
        model_name: model_name.to_string(),
        dataset_name: dataset_name.to_string(),
        dataset_root: root.join("dataset"),
        checkpoint_root: root.join("checkpoint"),
        log_root: root.join("logs"),
        sample_root: root.join("samples"),
        result_root: root.join("results"),
        config_root: root.join("config"),
        feature_size: 128,
        learning_rate: 1e-3,
        iterations: 10,
        img_size: 32,
        batch_size: 16,
        train_split: 0.8,
        seed: 42,
        phase: Phase::Train,
    }
}
