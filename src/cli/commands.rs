// ============================================================
// Layer 1 — CLI Commands and Arguments
// ============================================================
// Three subcommands: `train`, `evaluate` and `predict`.
//
// `train` resolves its configuration in layers:
//   preset (--preset) → JSON file (--config) → the flags below
// Flags left unset keep the value from the layers beneath.

use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::application::config::{Preset, TrainConfig};

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train a classifier on a benign/malignant image folder
    Train(TrainArgs),

    /// Re-evaluate a saved run on its test patients
    Evaluate(EvaluateArgs),

    /// Classify image files with a saved run
    Predict(PredictArgs),
}

#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Starting set of hyperparameters
    #[arg(long, value_enum, default_value_t = Preset::AntiOverfitting)]
    pub preset: Preset,

    /// Partial JSON config merged on top of the preset
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Dataset root containing `benign/` and `malignant/` folders
    #[arg(long)]
    pub data_root: Option<PathBuf>,

    /// Directory for the run artifact and history CSV
    #[arg(long)]
    pub save_dir: Option<PathBuf>,

    /// Base name of the artifact and history files
    #[arg(long)]
    pub run_name: Option<String>,

    #[arg(long)]
    pub epochs: Option<usize>,

    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Base learning rate
    #[arg(long)]
    pub lr: Option<f64>,

    /// Seed for the split, sampler and augmentation
    #[arg(long)]
    pub seed: Option<u64>,

    /// torchvision ResNet state dict (.pth) for the backbone
    #[arg(long)]
    pub pretrained_weights: Option<PathBuf>,

    /// Loader worker threads (0 = load on the training thread, the only
    /// setting with a fixed gradient-step order)
    #[arg(long)]
    pub num_workers: Option<usize>,

    /// Patience in epochs without a validation-AUC improvement
    #[arg(long)]
    pub patience: Option<usize>,

    /// Skip decoding every image before training
    #[arg(long)]
    pub skip_verify: bool,

    /// Print the resolved config as JSON and exit
    #[arg(long)]
    pub dump_config: bool,
}

/// Resolve preset, config file and flag overrides into one config.
/// The application layer never sees clap types.
impl TryFrom<TrainArgs> for TrainConfig {
    type Error = anyhow::Error;

    fn try_from(a: TrainArgs) -> Result<Self> {
        let mut cfg = TrainConfig::from_preset_and_file(a.preset, a.config.as_deref())?;
        if let Some(v) = a.data_root {
            cfg.data_root = v;
        }
        if let Some(v) = a.save_dir {
            cfg.save_dir = v;
        }
        if let Some(v) = a.run_name {
            cfg.run_name = v;
        }
        if let Some(v) = a.epochs {
            cfg.epochs = v;
        }
        if let Some(v) = a.batch_size {
            cfg.batch_size = v;
        }
        if let Some(v) = a.lr {
            cfg.lr = v;
        }
        if let Some(v) = a.seed {
            cfg.seed = v;
        }
        if let Some(v) = a.pretrained_weights {
            cfg.pretrained_weights = Some(v);
        }
        if let Some(v) = a.num_workers {
            cfg.num_workers = v;
        }
        if let Some(v) = a.patience {
            cfg.patience = v;
        }
        if a.skip_verify {
            cfg.verify_images = false;
        }
        Ok(cfg)
    }
}

#[derive(Args, Debug)]
pub struct EvaluateArgs {
    /// Run artifact written by `train` (<save_dir>/<run_name>.mpk.gz)
    #[arg(long)]
    pub artifact: PathBuf,

    /// Dataset root, if it moved since training
    #[arg(long)]
    pub data_root: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct PredictArgs {
    /// Run artifact written by `train`
    #[arg(long)]
    pub artifact: PathBuf,

    /// Image files to classify
    #[arg(required = true)]
    pub images: Vec<PathBuf>,
}
