//! Training orchestration
//!
//! The [`Trainer`] drives the iteration loop from a (possibly resumed) start
//! index to the configured total, alternating optimization steps with
//! epoch-boundary validation, scalar logging and checkpointing. Everything
//! here runs on one logical thread; batch loading, the forward/backward pass
//! and checkpoint IO are treated as atomic black-box steps.
//!
//! Failure semantics are deliberately blunt: a missing config, an empty
//! dataset or an unreadable checkpoint ends the run. No error inside the
//! loop is retried.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{VarBuilder, VarMap};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::{RunConfig, RunLayout};
use crate::data::{random_split, Batch, BatchLoader, Dataset, ImageFolderDataset};
use crate::error::{Error, Result};
use crate::metrics::ScalarWriter;
use crate::network::{Net, NetworkSpec};
use crate::optim::{AdamW, ParamsAdamW};

/// Number of optimizer steps that make up one epoch over the training split.
///
/// Clamped to 1 so a split smaller than one batch still defines an epoch.
pub fn steps_per_epoch(train_len: usize, batch_size: usize) -> usize {
    (train_len / batch_size).max(1)
}

/// Count of entries in `predicted` that match `labels`.
fn batch_correct(predicted: &Tensor, labels: &Tensor) -> Result<usize> {
    let correct = predicted
        .eq(labels)?
        .to_dtype(DType::U32)?
        .sum_all()?
        .to_scalar::<u32>()?;
    Ok(correct as usize)
}

/// Per-batch observer for evaluation passes.
///
/// The seam where an external visualizer plugs in; the trainer itself only
/// forwards tensors and never interprets what the hook does with them.
pub trait EvalHook: Send {
    /// Called once per evaluation batch with predictions already computed.
    fn on_batch(&mut self, images: &Tensor, predicted: &Tensor, labels: &Tensor) -> Result<()>;
}

/// Evaluation hook that does nothing
pub struct NoopHook;

impl EvalHook for NoopHook {
    fn on_batch(&mut self, _images: &Tensor, _predicted: &Tensor, _labels: &Tensor) -> Result<()> {
        Ok(())
    }
}

#[derive(Serialize)]
struct PredictionRecord {
    predicted: Vec<u32>,
    labels: Vec<u32>,
}

/// Evaluation hook that appends per-batch predictions to the result directory
pub struct PredictionWriter {
    writer: BufWriter<File>,
}

impl PredictionWriter {
    /// Open `predictions.jsonl` inside `result_dir`.
    pub fn create<P: AsRef<Path>>(result_dir: P) -> Result<Self> {
        let path = result_dir.as_ref().join("predictions.jsonl");
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl EvalHook for PredictionWriter {
    fn on_batch(&mut self, _images: &Tensor, predicted: &Tensor, labels: &Tensor) -> Result<()> {
        let record = PredictionRecord {
            predicted: predicted.to_vec1::<u32>()?,
            labels: labels.to_vec1::<u32>()?,
        };
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Loop-internal bookkeeping, owned exclusively by the trainer
#[derive(Debug, Clone)]
pub struct TrainingState {
    /// Iteration the run started (or resumed) from
    pub start_iteration: usize,
    /// Iteration the loop has reached
    pub current_iteration: usize,
    /// Completed epochs since the run started
    pub epoch: usize,
    loss_sum: f64,
    loss_count: usize,
}

impl TrainingState {
    fn new(start_iteration: usize) -> Self {
        Self {
            start_iteration,
            current_iteration: start_iteration,
            epoch: 0,
            loss_sum: 0.0,
            loss_count: 0,
        }
    }

    fn record_loss(&mut self, loss: f64) {
        self.loss_sum += loss;
        self.loss_count += 1;
    }

    fn mean_loss(&self) -> f64 {
        if self.loss_count == 0 {
            0.0
        } else {
            self.loss_sum / self.loss_count as f64
        }
    }

    fn reset_loss(&mut self) {
        self.loss_sum = 0.0;
        self.loss_count = 0;
    }
}

/// Orchestrates network, optimizer, loaders, checkpoints and metrics
pub struct Trainer {
    config: RunConfig,
    varmap: VarMap,
    network: Net,
    optimizer: AdamW,
    train_loader: BatchLoader,
    val_loader: BatchLoader,
    checkpoints: CheckpointStore,
    scalars: ScalarWriter,
    state: TrainingState,
    eval_hook: Box<dyn EvalHook>,
}

impl Trainer {
    /// Build a trainer for the run: scan the dataset from disk, parse the
    /// model config, construct network and optimizer on `device`, and resume
    /// from the latest checkpoint when one exists.
    pub fn build(config: RunConfig, device: &Device) -> Result<Self> {
        let dataset = ImageFolderDataset::new(config.dataset_path(), config.img_size)?;
        Self::build_with(config, device, Arc::new(dataset), Box::new(NoopHook))
    }

    /// Build with an injected dataset and evaluation hook.
    ///
    /// The composition seam: synthetic datasets, alternative providers and
    /// visualizers all enter here instead of through trainer subtypes.
    pub fn build_with(
        config: RunConfig,
        device: &Device,
        dataset: Arc<dyn Dataset>,
        eval_hook: Box<dyn EvalHook>,
    ) -> Result<Self> {
        config.validate()?;

        let layout = RunLayout::new(&config);
        layout.ensure()?;

        let spec = NetworkSpec::from_file(layout.config_file(&config.model_name))?;

        if dataset.is_empty() {
            return Err(Error::dataset(format!(
                "dataset `{}` yields zero samples",
                config.dataset_name
            )));
        }
        let num_classes = dataset.num_classes();

        let (train_split, val_split) = random_split(dataset, config.train_split, config.seed);
        let train_loader = BatchLoader::new(
            Arc::new(train_split),
            config.batch_size,
            true,
            device.clone(),
            config.seed,
        )?;
        let val_loader = BatchLoader::new(
            Arc::new(val_split),
            config.batch_size,
            true,
            device.clone(),
            config.seed.wrapping_add(1),
        )?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let network = Net::from_spec(
            &spec,
            config.img_size,
            num_classes,
            config.feature_size,
            vb,
        )?;

        let mut optimizer = AdamW::new(
            &varmap,
            ParamsAdamW {
                learning_rate: config.learning_rate,
                ..Default::default()
            },
        );

        let checkpoints = CheckpointStore::create(&layout.checkpoint_dir)?;
        let start_iteration = match checkpoints.find_latest()? {
            Some(manifest) => {
                info!(
                    iteration = manifest.iteration,
                    file = %manifest.file,
                    "latest checkpoint restored"
                );
                checkpoints.restore(&manifest, &varmap, &mut optimizer, device)?;
                manifest.iteration
            }
            None => 0,
        };

        let scalars = ScalarWriter::create(&layout.log_dir)?;

        Ok(Self {
            config,
            varmap,
            network,
            optimizer,
            train_loader,
            val_loader,
            checkpoints,
            scalars,
            state: TrainingState::new(start_iteration),
            eval_hook,
        })
    }

    /// Loop-internal state, for inspection.
    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// Number of optimizer steps applied over the trainer's lifetime,
    /// including steps restored from a checkpoint.
    pub fn optimizer_steps(&self) -> usize {
        self.optimizer.step_count()
    }

    /// Total trainable parameter count.
    pub fn num_parameters(&self) -> usize {
        self.varmap
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().elem_count())
            .sum()
    }

    /// Replace the evaluation hook.
    pub fn set_eval_hook(&mut self, hook: Box<dyn EvalHook>) {
        self.eval_hook = hook;
    }

    /// Run the training loop from the start index to the configured total.
    pub fn train(&mut self) -> Result<()> {
        let total = self.config.iterations;
        let start = self.state.start_iteration;
        if start >= total {
            warn!(
                start,
                total, "run already at or past the configured iteration count"
            );
            return Ok(());
        }

        let spe = steps_per_epoch(self.train_loader.dataset_size(), self.config.batch_size);
        info!(
            dataset = %self.config.dataset_name,
            train_samples = self.train_loader.dataset_size(),
            val_samples = self.val_loader.dataset_size(),
            batch_size = self.config.batch_size,
            img_size = self.config.img_size,
            steps_per_epoch = spe,
            max_steps = total,
            "training"
        );

        for idx in start..total {
            self.state.current_iteration = idx;

            if idx == 0 {
                info!(parameters = self.num_parameters(), "network parameters");
            }

            if idx % spe == 0 {
                if idx > start {
                    self.epoch_boundary(idx, total, spe)?;
                }
                self.train_loader.restart();
            }

            let batch = match self.train_loader.next_batch()? {
                Some(batch) => batch,
                None => {
                    // Mid-epoch exhaustion (resume offsets): begin a new pass.
                    self.train_loader.restart();
                    self.train_loader.next_batch()?.ok_or_else(|| {
                        Error::dataset("training split yields no batches")
                    })?
                }
            };

            let loss = self.train_step(&batch)?;
            self.state.record_loss(loss as f64);
            self.scalars.add_scalar("loss", loss as f64, idx)?;
            debug!(step = idx, loss, "train step");
        }

        self.state.current_iteration = total;
        // Final checkpoint so a completed run resumes as a no-op.
        self.checkpoints.save(total, &self.varmap, &self.optimizer)?;
        info!(steps = total - start, "training finished");
        Ok(())
    }

    /// One optimization step. Returns the scalar loss; the logits never leave
    /// this function.
    fn train_step(&mut self, batch: &Batch) -> Result<f32> {
        let logits = self.network.forward(&batch.images)?;
        let loss = candle_nn::loss::cross_entropy(&logits, &batch.labels)?;
        let grads = loss.backward()?;
        self.optimizer.step(&grads)?;
        Ok(loss.to_scalar::<f32>()?)
    }

    fn epoch_boundary(&mut self, idx: usize, total: usize, spe: usize) -> Result<()> {
        self.state.epoch += 1;
        let mean_loss = self.state.mean_loss();
        info!(
            epoch = self.state.epoch,
            of = total / spe,
            train_loss = mean_loss,
            "epoch boundary"
        );
        self.scalars.add_scalar("train_loss", mean_loss, idx)?;

        let val_acc = self.evaluate()?;
        info!(epoch = self.state.epoch, val_acc, "validation");
        self.scalars.add_scalar("val_acc", val_acc, idx)?;

        self.checkpoints.save(idx, &self.varmap, &self.optimizer)?;
        self.state.reset_loss();
        Ok(())
    }

    /// One full pass over the validation split without gradient tracking.
    /// Returns the top-1 accuracy percentage.
    pub fn evaluate(&mut self) -> Result<f64> {
        self.val_loader.restart();
        let mut correct = 0usize;
        let mut total = 0usize;

        while let Some(batch) = self.val_loader.next_batch()? {
            // No backward pass happens here, so the graph is dropped with
            // the logits and parameters are never touched.
            let logits = self.network.forward(&batch.images)?;
            let predicted = logits.argmax(D::Minus1)?;
            correct += batch_correct(&predicted, &batch.labels)?;
            total += batch.batch_size;
            self.eval_hook
                .on_batch(&batch.images, &predicted, &batch.labels)?;
        }

        if total == 0 {
            return Err(Error::dataset("validation split yields zero samples"));
        }
        Ok(100.0 * correct as f64 / total as f64)
    }
}
