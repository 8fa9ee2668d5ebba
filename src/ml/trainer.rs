// ============================================================
// Layer 5 — Training Loop
// ============================================================
// Epoch loop over the training split with AUC early stopping.
//
// Per epoch:
//   1. draw the epoch's training positions (weighted or shuffled)
//   2. training pass on the autodiff backend:
//        forward → focal loss → backward → Adam step
//      only parameters outside frozen groups receive gradients
//   3. learning-rate schedule step (lr for the next epoch)
//   4. validation pass on the inner backend via model.valid()
//   5. history row + early-stopping decision
//
// When the loop ends (patience or max epochs) the best snapshot
// is loaded back into the live model before it is returned.
//
// Key Burn insight:
//   - B is Autodiff<Inner>; model.valid() yields the same model on
//     Inner with dropout off and BatchNorm on running statistics
//   - argmax(1) returns [batch, 1] so we flatten before .equal()

use anyhow::{bail, Result};
use burn::{
    data::dataloader::DataLoaderBuilder,
    grad_clipping::GradientClippingConfig,
    module::AutodiffModule,
    optim::{decay::WeightDecayConfig, AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    tensor::backend::AutodiffBackend,
};
use std::sync::Arc;

use crate::application::config::TrainConfig;
use crate::data::{
    augmentation::ImagePipeline,
    balance::{epoch_seed, ClassWeights, EpochSampler},
    batcher::ImageBatcher,
    dataset::ImageDataset,
};
use crate::domain::{sample::Sample, split::SplitAssignment};
use crate::infra::metrics::{EpochMetrics, HistoryLogger};
use crate::ml::{
    early_stopping::{EarlyStopping, TrainingState},
    evaluator::{evaluate, evaluation_loader},
    model::{PathologyClassifier, PathologyClassifierRecord},
};

/// What the epoch loop hands back to the use case.
pub struct TrainingOutcome<B: AutodiffBackend> {
    /// Best-restored model (or the final one if no epoch improved).
    pub model: PathologyClassifier<B>,
    pub state: TrainingState,
    pub stopped_epoch: usize,
    pub best_epoch: Option<usize>,
    pub best_val_auc: f64,
    pub history: Vec<EpochMetrics>,
}

/// Train `model` on the train split, validating on the val split.
pub fn train<B: AutodiffBackend>(
    cfg: &TrainConfig,
    mut model: PathologyClassifier<B>,
    samples: &[Sample],
    split: &SplitAssignment,
    weights: &ClassWeights,
    history: &mut HistoryLogger,
    device: &B::Device,
) -> Result<TrainingOutcome<B>> {
    let train_indices = &split.train.indices;
    if train_indices.is_empty() || split.val.indices.is_empty() {
        bail!("Training needs non-empty train and validation splits");
    }

    // ── Adam with L2 weight decay and gradient-norm clipping ──────────────────
    let mut optim_cfg = AdamConfig::new()
        .with_weight_decay(Some(WeightDecayConfig::new(cfg.weight_decay as f32)));
    if let Some(clip) = cfg.grad_clip_norm {
        // Burn clips each parameter tensor's norm, not the global norm.
        optim_cfg = optim_cfg.with_grad_clipping(Some(GradientClippingConfig::Norm(clip as f32)));
    }
    let mut optim = optim_cfg.init();
    let schedule = cfg.lr_schedule();

    // ── Losses: autodiff for training, inner backend for validation ───────────
    let class_weights = Some(weights.as_f32());
    let loss_fn = cfg.loss_config(class_weights.clone()).init::<B>(device);
    let val_loss_fn = cfg.loss_config(class_weights).init::<B::InnerBackend>(device);

    // ── Epoch sampler over training positions ─────────────────────────────────
    let sampler = if cfg.weighted_sampler {
        let labels: Vec<_> = train_indices.iter().map(|&i| samples[i].label).collect();
        EpochSampler::Weighted { weights: weights.per_sample(&labels), seed: cfg.seed }
    } else {
        EpochSampler::Shuffled { len: train_indices.len(), seed: cfg.seed }
    };
    let pipeline = Arc::new(ImagePipeline::training(&cfg.augmentation, cfg.image_size));

    // ── Validation loader is the same every epoch ─────────────────────────────
    let (val_loader, val_batcher) = evaluation_loader::<B::InnerBackend>(
        samples,
        &split.val.indices,
        cfg.image_size,
        cfg.batch_size,
        cfg.num_workers,
        device,
    );

    let mut stopper: EarlyStopping<PathologyClassifierRecord<B>> =
        EarlyStopping::new(cfg.patience, cfg.min_delta, cfg.epochs);
    let mut state = TrainingState::Running;
    let mut stopped_epoch = 0;
    let mut rows = Vec::with_capacity(cfg.epochs);

    for epoch in 1..=cfg.epochs {
        let lr = schedule.lr_at(epoch - 1);

        // ── Training phase ────────────────────────────────────────────────────
        let epoch_indices: Vec<usize> = sampler
            .draw(epoch)?
            .into_iter()
            .map(|pos| train_indices[pos])
            .collect();
        let batcher = ImageBatcher::<B>::new(device.clone(), pipeline.clone(), epoch_seed(cfg.seed, epoch));
        let mut builder = DataLoaderBuilder::new(batcher.clone()).batch_size(cfg.batch_size);
        if cfg.num_workers > 0 {
            builder = builder.num_workers(cfg.num_workers);
        }
        let train_loader = builder.build(ImageDataset::new(samples, &epoch_indices));

        let mut loss_sum = 0.0f64;
        let mut correct = 0usize;
        let mut seen = 0usize;

        for batch in train_loader.iter() {
            if let Some(failure) = batcher.take_failure() {
                bail!("Training aborted at epoch {epoch}: {failure}");
            }
            let batch_size = batch.targets.dims()[0];
            let logits = model.forward(batch.images);
            let loss = loss_fn.forward(logits.clone(), batch.targets.clone());

            loss_sum += loss.clone().into_scalar().elem::<f64>() * batch_size as f64;
            let hits: i64 = logits
                .argmax(1)
                .flatten::<1>(0, 1)
                .equal(batch.targets)
                .int()
                .sum()
                .into_scalar()
                .elem::<i64>();
            correct += hits as usize;
            seen += batch_size;

            let grads = loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optim.step(lr, model, grads);
        }

        if seen == 0 {
            bail!("Training loader produced no samples at epoch {epoch}");
        }

        // ── Validation phase ──────────────────────────────────────────────────
        let val = evaluate(&model.valid(), val_loader.as_ref(), &val_batcher, &val_loss_fn)?;

        let row = EpochMetrics {
            epoch,
            train_loss: loss_sum / seen as f64,
            train_acc: correct as f64 / seen as f64,
            val_loss: val.loss,
            val_acc: val.metrics.accuracy,
            val_f1: val.metrics.f1,
            val_auc: val.metrics.auc,
            lr,
        };
        tracing::info!(
            "Epoch {:>3}/{} | lr={:.2e} | train_loss={:.4} train_acc={:.3} | val_loss={:.4} val_acc={:.3} val_f1={:.3} val_auc={:.4}",
            epoch,
            cfg.epochs,
            lr,
            row.train_loss,
            row.train_acc,
            row.val_loss,
            row.val_acc,
            row.val_f1,
            row.val_auc,
        );
        history.log(&row)?;
        rows.push(row);

        state = stopper.observe(epoch, val.metrics.auc, || model.clone().into_record());
        stopped_epoch = epoch;
        if state != TrainingState::Running {
            tracing::info!("Training {} after epoch {}", state, epoch);
            break;
        }
    }

    // ── Restore the best snapshot ─────────────────────────────────────────────
    let best_val_auc = stopper.best_auc();
    let best_epoch = stopper.best_epoch();
    let model = match stopper.into_best() {
        Some(best) => {
            tracing::info!("Restoring best model from epoch {} (val AUC {:.4})", best.epoch, best.auc);
            model.load_record(best.snapshot)
        }
        None => {
            tracing::warn!("Validation AUC never improved; keeping the final weights");
            model
        }
    };

    Ok(TrainingOutcome {
        model,
        state,
        stopped_epoch,
        best_epoch,
        best_val_auc,
        history: rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::config::Preset;
    use crate::data::{patient::PatientIdExtractor, splitter::split_by_patient};
    use crate::domain::{
        sample::{ClassCounts, Label},
        split::SplitGroup,
    };
    use crate::ml::model::ParamGroup;
    use burn::backend::{Autodiff, NdArray};
    use image::{Rgb, RgbImage};
    use std::fs;
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray>;

    /// Four patients per class, two images each, BreakHis-style names.
    fn dataset(dir: &TempDir) -> Vec<Sample> {
        let mut samples = Vec::new();
        for label in Label::ALL {
            let class_dir = dir.path().join(label.dir_name());
            fs::create_dir_all(&class_dir).unwrap();
            let code = if label == Label::Malignant { "M" } else { "B" };
            for patient in 0..4u8 {
                for image in 0..2u8 {
                    let name = format!("SOB_{code}_P{}{patient}-40-00{image}.png", label.index());
                    let path = class_dir.join(name);
                    let tint = if label == Label::Malignant { 200 } else { 40 };
                    RgbImage::from_fn(24, 24, |x, y| Rgb([tint, (x * 8) as u8, (y * 8 + patient as u32) as u8]))
                        .save(&path)
                        .unwrap();
                    samples.push(Sample::new(path, label));
                }
            }
        }
        samples
    }

    fn tiny_config(dir: &TempDir) -> TrainConfig {
        let mut cfg = TrainConfig::preset(Preset::AntiOverfitting);
        cfg.save_dir = dir.path().join("runs");
        cfg.epochs = 3;
        cfg.batch_size = 4;
        cfg.num_workers = 0;
        cfg.image_size = 32;
        cfg.augmentation.resize = 40;
        cfg.resnet_blocks = vec![1, 1, 1, 1];
        cfg.resnet_width = 4;
        cfg.head_hidden = vec![8];
        cfg.head_dropout = vec![0.1, 0.1];
        cfg.trainable_groups = vec![ParamGroup::Layer4, ParamGroup::Head];
        cfg.patience = 10;
        cfg
    }

    #[test]
    fn test_training_runs_to_max_epochs_and_logs_history() {
        let dir = TempDir::new().unwrap();
        let samples = dataset(&dir);
        let cfg = tiny_config(&dir);
        cfg.validate().unwrap();

        let extractor = PatientIdExtractor::new(&cfg.patient_pattern).unwrap();
        let split = split_by_patient(&samples, &extractor, cfg.split_plan()).unwrap();
        assert_eq!(extractor.fallback_count(), 0);

        let counts = ClassCounts::from_labels(split.train.indices.iter().map(|&i| samples[i].label));
        let weights = ClassWeights::inverse_frequency(&counts, cfg.class_weight_norm).unwrap();

        let device = Default::default();
        let built = cfg.classifier_config().build::<TestBackend>(None, &device);
        let mut history = HistoryLogger::create(cfg.history_path()).unwrap();

        let outcome = train(&cfg, built.model, &samples, &split, &weights, &mut history, &device).unwrap();

        assert_eq!(outcome.stopped_epoch, 3);
        assert_eq!(outcome.state, TrainingState::StoppedByMaxEpochs);
        assert_eq!(outcome.history.len(), 3);
        assert!(outcome.history.iter().all(|r| r.train_loss.is_finite() && r.val_loss.is_finite()));
        assert!((0.0..=1.0).contains(&outcome.best_val_auc));

        let csv = fs::read_to_string(cfg.history_path()).unwrap();
        assert_eq!(csv.lines().count(), 4);
    }

    #[test]
    fn test_patience_stops_early() {
        let dir = TempDir::new().unwrap();
        let samples = dataset(&dir);
        let mut cfg = tiny_config(&dir);
        cfg.epochs = 6;
        cfg.patience = 1;
        // Unreachable improvement margin: every epoch after the first counts against patience.
        cfg.min_delta = 2.0;

        let extractor = PatientIdExtractor::new(&cfg.patient_pattern).unwrap();
        let split = split_by_patient(&samples, &extractor, cfg.split_plan()).unwrap();
        let counts = ClassCounts::from_labels(split.train.indices.iter().map(|&i| samples[i].label));
        let weights = ClassWeights::inverse_frequency(&counts, 1.0).unwrap();

        let device = Default::default();
        let model = cfg.classifier_config().build::<TestBackend>(None, &device).model;
        let mut history = HistoryLogger::create(cfg.history_path()).unwrap();

        let outcome = train(&cfg, model, &samples, &split, &weights, &mut history, &device).unwrap();
        assert_eq!(outcome.state, TrainingState::StoppedByPatience);
        assert_eq!(outcome.stopped_epoch, 1);
        assert_eq!(outcome.best_epoch, None);
    }

    #[test]
    fn test_best_epoch_weights_are_restored() {
        let dir = TempDir::new().unwrap();
        let samples = dataset(&dir);
        let mut cfg = tiny_config(&dir);
        // No dropout, so the only randomness left is seeded by cfg.seed.
        cfg.head_dropout = vec![0.0, 0.0];

        // Validation holds one benign patient, so every epoch scores AUC 0.5.
        let benign: Vec<usize> = (0..samples.len()).filter(|&i| samples[i].label == Label::Benign).collect();
        let split = SplitAssignment {
            train: SplitGroup {
                patients: vec![],
                indices: (0..samples.len()).filter(|i| !benign[..2].contains(i)).collect(),
            },
            val: SplitGroup { patients: vec![], indices: benign[..2].to_vec() },
            test: SplitGroup::default(),
        };
        let counts = ClassCounts::from_labels(split.train.indices.iter().map(|&i| samples[i].label));
        let weights = ClassWeights::inverse_frequency(&counts, 1.0).unwrap();

        let device = Default::default();
        let initial = cfg.classifier_config().build::<TestBackend>(None, &device).model;
        let run = |epochs: usize, min_delta: f64, name: &str| {
            let mut cfg = cfg.clone();
            cfg.epochs = epochs;
            cfg.min_delta = min_delta;
            let mut history = HistoryLogger::create(dir.path().join(format!("{name}.csv"))).unwrap();
            train(&cfg, initial.clone(), &samples, &split, &weights, &mut history, &device).unwrap()
        };

        // 0.5 clears a 0.4 margin once, at epoch 1; a 0.6 margin is never cleared.
        let restored = run(3, 0.4, "restored");
        let after_one = run(1, 0.6, "one");
        let after_three = run(3, 0.6, "three");
        assert_eq!(restored.best_epoch, Some(1));
        assert_eq!(restored.state, TrainingState::StoppedByMaxEpochs);
        assert_eq!(restored.stopped_epoch, 3);
        assert_eq!(after_three.best_epoch, None);

        let x = Tensor::<NdArray, 4>::ones([2, 3, 32, 32], &device);
        let logits = |outcome: &TrainingOutcome<TestBackend>| -> Vec<f32> {
            outcome.model.valid().forward(x.clone()).into_data().to_vec().unwrap()
        };
        let (restored, after_one, after_three) = (logits(&restored), logits(&after_one), logits(&after_three));
        for (a, b) in restored.iter().zip(&after_one) {
            assert!((a - b).abs() < 1e-5, "restored {a} vs epoch-1 {b}");
        }
        assert_ne!(restored, after_three);
    }
}
