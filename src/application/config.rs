// ============================================================
// Layer 2 — Training Configuration
// ============================================================
// All hyperparameters for a run, resolved once at start-up and
// then passed by reference everywhere:
//
//   1. Preset               (anti-overfitting | offline)
//   2. --config file.json   (partial JSON, deep-merged on top)
//   3. CLI flag overrides
//   4. validate()           (before any data is read)
//
// Serialisable so the resolved config is stored in the run
// artifact and `evaluate` can rebuild the exact same split.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fs, path::{Path, PathBuf}};

use crate::data::{augmentation::AugmentationConfig, patient::PatientIdExtractor, splitter::SplitPlan};
use crate::ml::{
    backbone::ResNetConfig,
    loss::FocalLossConfig,
    model::{ClassifierConfig, ParamGroup},
    scheduler::LrSchedule,
};

/// Named starting point for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Preset {
    /// layer4 + deep head, focal loss, strong augmentation
    AntiOverfitting,
    /// last layer3 block + layer4, weighted cross-entropy, lighter augmentation
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub preset: Preset,
    pub data_root: PathBuf,
    pub save_dir: PathBuf,
    pub run_name: String,
    pub seed: u64,

    // ── data ──
    pub patient_pattern: String,
    pub test_fraction: f64,
    pub val_fraction: f64,
    pub verify_images: bool,
    pub image_size: u32,
    pub augmentation: AugmentationConfig,
    pub batch_size: usize,
    pub num_workers: usize,

    // ── class balance ──
    pub weighted_sampler: bool,
    pub weighted_loss: bool,
    pub class_weight_norm: f64,

    // ── model ──
    pub pretrained_weights: Option<PathBuf>,
    pub resnet_blocks: Vec<usize>,
    pub resnet_width: usize,
    pub bn_momentum: f64,
    pub head_hidden: Vec<usize>,
    pub head_dropout: Vec<f64>,
    pub trainable_groups: Vec<ParamGroup>,

    // ── optimisation ──
    pub epochs: usize,
    pub lr: f64,
    pub weight_decay: f64,
    pub grad_clip_norm: Option<f64>,
    pub warmup_epochs: usize,
    pub restart_period: usize,
    pub restart_mult: usize,
    pub min_lr: f64,
    pub focal_gamma: f64,
    pub label_smoothing: f64,

    // ── early stopping ──
    pub patience: usize,
    pub min_delta: f64,
}

impl TrainConfig {
    pub fn preset(preset: Preset) -> Self {
        match preset {
            Preset::AntiOverfitting => Self {
                preset,
                data_root: PathBuf::from("data/breakhis"),
                save_dir: PathBuf::from("models"),
                run_name: "histo_anti_overfitting".to_string(),
                seed: 42,
                patient_pattern: crate::data::patient::DEFAULT_PATIENT_PATTERN.to_string(),
                test_fraction: 0.2,
                val_fraction: 0.25,
                verify_images: true,
                image_size: 224,
                augmentation: AugmentationConfig::aggressive(),
                batch_size: 16,
                num_workers: 2,
                weighted_sampler: true,
                weighted_loss: true,
                class_weight_norm: 1.0,
                pretrained_weights: None,
                resnet_blocks: vec![3, 4, 6, 3],
                resnet_width: 64,
                bn_momentum: 0.1,
                head_hidden: vec![1024, 512],
                head_dropout: vec![0.7, 0.6, 0.5],
                trainable_groups: vec![ParamGroup::Layer4, ParamGroup::Head],
                epochs: 50,
                lr: 1e-4,
                weight_decay: 5e-4,
                grad_clip_norm: Some(1.0),
                warmup_epochs: 0,
                restart_period: 5,
                restart_mult: 2,
                min_lr: 1e-6,
                focal_gamma: 2.0,
                label_smoothing: 0.2,
                patience: 12,
                min_delta: 0.001,
            },
            Preset::Offline => Self {
                preset,
                run_name: "histo_offline".to_string(),
                test_fraction: 0.15,
                // 15% of the whole dataset out of the remaining 85%.
                val_fraction: 0.15 / 0.85,
                augmentation: AugmentationConfig::moderate(),
                batch_size: 32,
                class_weight_norm: 2.0,
                bn_momentum: 0.01,
                head_hidden: vec![512],
                head_dropout: vec![0.5, 0.3],
                trainable_groups: vec![ParamGroup::Layer3Tail, ParamGroup::Layer4, ParamGroup::Head],
                epochs: 30,
                lr: 1e-3,
                weight_decay: 1e-5,
                focal_gamma: 0.0,
                label_smoothing: 0.1,
                patience: 8,
                min_delta: 0.002,
                ..Self::preset(Preset::AntiOverfitting)
            },
        }
    }

    /// Preset, then a JSON file deep-merged on top of it.
    pub fn from_preset_and_file(preset: Preset, file: Option<&Path>) -> Result<Self> {
        let base = Self::preset(preset);
        let Some(path) = file else {
            return Ok(base);
        };
        let text = fs::read_to_string(path)
            .with_context(|| format!("Cannot read config file '{}'", path.display()))?;
        let overlay: Value = serde_json::from_str(&text)
            .with_context(|| format!("Config file '{}' is not valid JSON", path.display()))?;

        // A preset named in the file replaces the one from the command line.
        let base = match overlay.get("preset") {
            Some(p) => Self::preset(
                serde_json::from_value(p.clone()).context("Unknown preset in config file")?,
            ),
            None => base,
        };

        let mut merged = serde_json::to_value(&base)?;
        merge_json(&mut merged, overlay);
        serde_json::from_value(merged)
            .with_context(|| format!("Config file '{}' has invalid fields", path.display()))
    }

    /// Reject values that would make the run meaningless.
    pub fn validate(&self) -> Result<()> {
        let unit_open = |name: &str, v: f64| -> Result<()> {
            if !(v > 0.0 && v < 1.0) {
                bail!("{name} must lie strictly between 0 and 1, got {v}");
            }
            Ok(())
        };
        unit_open("test_fraction", self.test_fraction)?;
        unit_open("val_fraction", self.val_fraction)?;

        for (name, v) in [
            ("batch_size", self.batch_size),
            ("epochs", self.epochs),
            ("patience", self.patience),
            ("image_size", self.image_size as usize),
            ("restart_period", self.restart_period),
            ("restart_mult", self.restart_mult),
            ("resnet_width", self.resnet_width),
        ] {
            if v == 0 {
                bail!("{name} must be greater than zero");
            }
        }
        if self.resnet_blocks.len() != 4 || self.resnet_blocks.contains(&0) {
            bail!("resnet_blocks must list four non-zero stage sizes, got {:?}", self.resnet_blocks);
        }
        if self.head_dropout.len() != self.head_hidden.len() + 1 {
            bail!(
                "head_dropout needs {} rates (one per hidden layer plus the output), got {}",
                self.head_hidden.len() + 1,
                self.head_dropout.len()
            );
        }
        if self.head_dropout.iter().any(|p| !(0.0..1.0).contains(p)) {
            bail!("head_dropout rates must lie in [0, 1), got {:?}", self.head_dropout);
        }
        if self.head_hidden.contains(&0) {
            bail!("head_hidden widths must be non-zero");
        }
        if !(0.0..1.0).contains(&self.label_smoothing) {
            bail!("label_smoothing must lie in [0, 1), got {}", self.label_smoothing);
        }
        if self.focal_gamma < 0.0 {
            bail!("focal_gamma must be non-negative, got {}", self.focal_gamma);
        }
        if self.class_weight_norm <= 0.0 {
            bail!("class_weight_norm must be positive, got {}", self.class_weight_norm);
        }
        if self.lr <= 0.0 || self.min_lr < 0.0 || self.min_lr > self.lr {
            bail!("learning rates must satisfy 0 <= min_lr <= lr and lr > 0");
        }
        if self.weight_decay < 0.0 || self.min_delta < 0.0 {
            bail!("weight_decay and min_delta must be non-negative");
        }
        if let Some(clip) = self.grad_clip_norm {
            if clip <= 0.0 {
                bail!("grad_clip_norm must be positive when set, got {clip}");
            }
        }
        if !(0.0..=1.0).contains(&self.bn_momentum) {
            bail!("bn_momentum must lie in [0, 1], got {}", self.bn_momentum);
        }
        if self.trainable_groups.is_empty() {
            bail!("trainable_groups must name at least one parameter group");
        }
        self.augmentation.validate()?;
        if self.run_name.trim().is_empty() || self.run_name.contains(['/', '\\', '.']) {
            bail!("run_name must be a plain file name without dots, got '{}'", self.run_name);
        }
        PatientIdExtractor::new(&self.patient_pattern)?;
        Ok(())
    }

    pub fn split_plan(&self) -> SplitPlan {
        SplitPlan {
            test_fraction: self.test_fraction,
            val_fraction: self.val_fraction,
            seed: self.seed,
        }
    }

    pub fn classifier_config(&self) -> ClassifierConfig {
        let backbone = ResNetConfig::new()
            .with_blocks(self.resnet_blocks.clone())
            .with_width(self.resnet_width)
            .with_bn_momentum(self.bn_momentum);
        ClassifierConfig::new(backbone)
            .with_head_hidden(self.head_hidden.clone())
            .with_head_dropout(self.head_dropout.clone())
            .with_trainable_groups(self.trainable_groups.clone())
    }

    /// Loss settings; `class_weights` is used only when `weighted_loss` is on.
    pub fn loss_config(&self, class_weights: Option<Vec<f32>>) -> FocalLossConfig {
        FocalLossConfig::new()
            .with_gamma(self.focal_gamma)
            .with_label_smoothing(self.label_smoothing)
            .with_class_weights(if self.weighted_loss { class_weights } else { None })
    }

    pub fn lr_schedule(&self) -> LrSchedule {
        LrSchedule {
            base_lr: self.lr,
            min_lr: self.min_lr,
            warmup_epochs: self.warmup_epochs,
            restart_period: self.restart_period,
            restart_mult: self.restart_mult,
        }
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.save_dir.join(format!("{}.mpk.gz", self.run_name))
    }

    pub fn history_path(&self) -> PathBuf {
        self.save_dir.join(format!("{}_history.csv", self.run_name))
    }
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self::preset(Preset::AntiOverfitting)
    }
}

/// Recursively overwrite `base` with the fields present in `overlay`.
fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_json(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_presets_are_valid() {
        TrainConfig::preset(Preset::AntiOverfitting).validate().unwrap();
        TrainConfig::preset(Preset::Offline).validate().unwrap();
    }

    #[test]
    fn test_offline_split_is_70_15_15() {
        let cfg = TrainConfig::preset(Preset::Offline);
        let val_of_total = (1.0 - cfg.test_fraction) * cfg.val_fraction;
        assert!((val_of_total - 0.15).abs() < 1e-12);
        assert_eq!(cfg.focal_gamma, 0.0);
        assert_eq!(cfg.trainable_groups[0], ParamGroup::Layer3Tail);
    }

    #[test]
    fn test_partial_json_overrides_preset() {
        let mut file = NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            br#"{ "epochs": 3, "augmentation": { "hflip_p": 0.0 }, "trainable_groups": ["head"] }"#,
        )
        .unwrap();

        let cfg = TrainConfig::from_preset_and_file(Preset::AntiOverfitting, Some(file.path())).unwrap();
        assert_eq!(cfg.epochs, 3);
        assert_eq!(cfg.augmentation.hflip_p, 0.0);
        // Untouched nested fields keep their preset values.
        assert_eq!(cfg.augmentation.vflip_p, 0.5);
        assert_eq!(cfg.trainable_groups, vec![ParamGroup::Head]);
        assert_eq!(cfg.lr, 1e-4);
    }

    #[test]
    fn test_preset_in_file_wins() {
        let mut file = NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, br#"{ "preset": "offline" }"#).unwrap();
        let cfg = TrainConfig::from_preset_and_file(Preset::AntiOverfitting, Some(file.path())).unwrap();
        assert_eq!(cfg, TrainConfig::preset(Preset::Offline));
    }

    #[test]
    fn test_validation_catches_bad_values() {
        let base = TrainConfig::default();

        let mut cfg = base.clone();
        cfg.test_fraction = 1.0;
        assert!(cfg.validate().is_err());

        let mut cfg = base.clone();
        cfg.head_dropout.pop();
        assert!(cfg.validate().is_err());

        let mut cfg = base.clone();
        cfg.patient_pattern = "no-group".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = base.clone();
        cfg.augmentation.erase_scale = (0.15, 0.02);
        assert!(cfg.validate().is_err());

        let mut cfg = base;
        cfg.batch_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let cfg = TrainConfig::preset(Preset::Offline);
        let json = serde_json::to_string(&cfg).unwrap();
        let back: TrainConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, back);
    }
}
