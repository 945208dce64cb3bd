//! convtrain - a thin training harness for convolutional image classifiers
//!
//! This crate orchestrates training for a small CNN classifier on top of the
//! candle framework: it loads an image-folder dataset, builds a network from
//! a sectioned model config file, runs a synchronous iteration loop with
//! periodic validation, checkpoints weights and optimizer state through a
//! manifest-backed store, and logs scalars for external visualization.
//!
//! The deep-learning primitives (tensors, autograd, layers, loss) belong to
//! candle; everything here is control flow around them.

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod metrics;
pub mod network;
pub mod optim;
pub mod trainer;

// Re-exports
pub use checkpoint::{CheckpointManifest, CheckpointStore};
pub use config::{Phase, RunConfig, RunLayout};
pub use data::{Batch, BatchLoader, Dataset, ImageFolderDataset, InMemoryDataset, Subset};
pub use error::{Error, Result};
pub use metrics::ScalarWriter;
pub use network::{Net, NetworkSpec};
pub use optim::{AdamW, ParamsAdamW};
pub use trainer::{steps_per_epoch, EvalHook, NoopHook, PredictionWriter, Trainer, TrainingState};
