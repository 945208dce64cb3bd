use anyhow::{Context, Result};
use candle_core::Device;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use convtrain::{Phase, PredictionWriter, RunConfig, RunLayout, Trainer};

#[derive(Parser)]
#[command(name = "convtrain")]
#[command(about = "Training harness for convolutional image classifiers", long_about = None)]
struct Cli {
    /// Model name; the model config is read from <config-dir>/<name>/<name>.cfg
    #[arg(long)]
    model_name: String,

    /// Dataset name under the dataset root
    #[arg(long)]
    dataset: String,

    /// Root directory holding datasets
    #[arg(long, default_value = "./dataset")]
    dataset_dir: PathBuf,

    /// Root directory for checkpoints
    #[arg(long, default_value = "./checkpoint")]
    checkpoint_dir: PathBuf,

    /// Root directory for scalar logs
    #[arg(long, default_value = "./logs")]
    log_dir: PathBuf,

    /// Root directory for rendered samples
    #[arg(long, default_value = "./samples")]
    sample_dir: PathBuf,

    /// Root directory for evaluation results
    #[arg(long, default_value = "./results")]
    result_dir: PathBuf,

    /// Root directory for model config files
    #[arg(long, default_value = "./config")]
    config_dir: PathBuf,

    /// Classifier head width, substituted for `output=feature`
    #[arg(long, default_value_t = 128)]
    feature_size: usize,

    /// Learning rate
    #[arg(long, default_value_t = 1e-3)]
    lr: f64,

    /// Total optimizer steps
    #[arg(long, default_value_t = 10_000)]
    iteration: usize,

    /// Square image side length
    #[arg(long, default_value_t = 32)]
    img_size: usize,

    /// Samples per batch
    #[arg(long, default_value_t = 16)]
    batch_size: usize,

    /// Fraction of the dataset used for training
    #[arg(long, default_value_t = 0.8)]
    train_size: f64,

    /// Seed for splits and shuffling
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Run phase
    #[arg(long, value_enum, default_value = "train")]
    phase: Phase,
}

impl Cli {
    fn into_config(self) -> RunConfig {
        RunConfig {
            model_name: self.model_name,
            dataset_name: self.dataset,
            dataset_root: self.dataset_dir,
            checkpoint_root: self.checkpoint_dir,
            log_root: self.log_dir,
            sample_root: self.sample_dir,
            result_root: self.result_dir,
            config_root: self.config_dir,
            feature_size: self.feature_size,
            learning_rate: self.lr,
            iterations: self.iteration,
            img_size: self.img_size,
            batch_size: self.batch_size,
            train_split: self.train_size,
            seed: self.seed,
            phase: self.phase,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = cli.into_config();
    config.validate().context("invalid run parameters")?;

    let device = Device::cuda_if_available(0).context("device selection failed")?;
    info!(?device, model = %config.model_name, "starting run");

    match config.phase {
        Phase::Train => {
            let mut trainer =
                Trainer::build(config, &device).context("failed to build trainer")?;
            trainer.train().context("training run failed")?;
        }
        Phase::Test => {
            let layout = RunLayout::new(&config);
            let mut trainer =
                Trainer::build(config, &device).context("failed to build trainer")?;
            trainer.set_eval_hook(Box::new(
                PredictionWriter::create(&layout.result_dir)
                    .context("cannot open prediction log")?,
            ));
            let accuracy = trainer.evaluate().context("evaluation failed")?;
            info!(accuracy, "evaluation finished");
            println!("accuracy: {accuracy:.3}");
        }
    }

    Ok(())
}
