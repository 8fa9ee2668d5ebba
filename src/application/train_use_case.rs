// ============================================================
// Layer 2 — TrainUseCase
// ============================================================
// Orchestrates a full training run in order:
//
//   Step 1: Validate config                (Layer 2)
//   Step 2: Discover labelled images       (Layer 4 - data)
//   Step 3: Integrity pre-pass             (Layer 4 - data)
//   Step 4: Patient-level split            (Layer 4 - data)
//   Step 5: Class weights from train split (Layer 4 - data)
//   Step 6: Build model, freeze groups     (Layer 5 - ml)
//   Step 7: Epoch loop + early stopping    (Layer 5 - ml)
//   Step 8: Evaluate on the test patients  (Layer 5 - ml)
//   Step 9: Save artifact                  (Layer 6 - infra)
//
// Steps 2–5 are shared with `evaluate`, which must rebuild the
// exact same split from the config stored in an artifact.

use anyhow::{Context, Result};
use burn::{module::AutodiffModule, prelude::*, tensor::backend::AutodiffBackend};
use std::path::PathBuf;

use crate::application::config::TrainConfig;
use crate::data::{
    balance::ClassWeights,
    loader::{log_dataset_stats, validate_images, ImageFolderScanner},
    patient::PatientIdExtractor,
    splitter::split_by_patient,
};
use crate::domain::{
    sample::{ClassCounts, Sample},
    split::SplitAssignment,
    traits::SampleSource,
};
use crate::infra::{
    checkpoint::{save_artifact, Preprocessing, RunManifest},
    metrics::HistoryLogger,
};
use crate::ml::{
    evaluator::{evaluate, evaluation_loader, Evaluation},
    model::PathologyClassifier,
    trainer::train,
    TrainingBackend,
};

// ─── Shared data preparation ──────────────────────────────────────────────────

/// Samples, split and class weights for one configuration.
pub struct PreparedData {
    pub samples: Vec<Sample>,
    pub split: SplitAssignment,
    pub weights: ClassWeights,
    pub corrupt_images: usize,
    pub patient_id_fallbacks: usize,
}

/// Steps 2–5: discover, verify, split and weight.
pub fn prepare_data(cfg: &TrainConfig) -> Result<PreparedData> {
    // ── Step 2: Discover labelled images ──────────────────────────────────────
    tracing::info!("Scanning dataset under '{}'", cfg.data_root.display());
    let discovered = ImageFolderScanner::new(&cfg.data_root).discover()?;

    // ── Step 3: Integrity pre-pass ────────────────────────────────────────────
    let (samples, corrupt_images) = if cfg.verify_images {
        let report = validate_images(discovered)?;
        let corrupt = report.corrupt.len();
        (report.valid, corrupt)
    } else {
        (discovered, 0)
    };
    log_dataset_stats(&samples);

    // ── Step 4: Patient-level split ───────────────────────────────────────────
    let extractor = PatientIdExtractor::new(&cfg.patient_pattern)?;
    let split = split_by_patient(&samples, &extractor, cfg.split_plan())
        .context("Cannot build a leakage-free patient split")?;
    let patient_id_fallbacks = extractor.fallback_count();
    if patient_id_fallbacks > 0 {
        tracing::warn!(
            "{} file names did not match the patient pattern and count as their own patient",
            patient_id_fallbacks
        );
    }

    // ── Step 5: Class weights from the training split ─────────────────────────
    let train_counts = ClassCounts::from_labels(split.train.indices.iter().map(|&i| samples[i].label));
    let weights = ClassWeights::inverse_frequency(&train_counts, cfg.class_weight_norm)?;
    tracing::info!(
        "Class weights (train {}): benign={:.4} malignant={:.4} [sampler: {}, loss: {}]",
        train_counts,
        weights.0[0],
        weights.0[1],
        cfg.weighted_sampler,
        cfg.weighted_loss
    );

    Ok(PreparedData { samples, split, weights, corrupt_images, patient_id_fallbacks })
}

/// Evaluate `model` on the test patients of `data`.
pub fn evaluate_test_split<B: Backend>(
    cfg: &TrainConfig,
    model: &PathologyClassifier<B>,
    data: &PreparedData,
    device: &B::Device,
) -> Result<Evaluation> {
    let (loader, batcher) = evaluation_loader::<B>(
        &data.samples,
        &data.split.test.indices,
        cfg.image_size,
        cfg.batch_size,
        cfg.num_workers,
        device,
    );
    let loss_fn = cfg.loss_config(Some(data.weights.as_f32())).init::<B>(device);
    evaluate(model, loader.as_ref(), &batcher, &loss_fn)
}

// ─── TrainUseCase ─────────────────────────────────────────────────────────────

/// Where a finished run left its files, and what it recorded.
#[derive(Debug)]
pub struct TrainReport {
    pub artifact_path: PathBuf,
    pub history_path: PathBuf,
    pub manifest: RunManifest,
}

pub struct TrainUseCase {
    config: TrainConfig,
}

impl TrainUseCase {
    pub fn new(config: TrainConfig) -> Self {
        Self { config }
    }

    /// Run on the default device of the configured backend.
    pub fn execute(&self) -> Result<TrainReport> {
        let device: <TrainingBackend as Backend>::Device = Default::default();
        tracing::info!("Using device: {:?}", device);
        self.execute_on::<TrainingBackend>(&device)
    }

    pub fn execute_on<B: AutodiffBackend>(&self, device: &B::Device) -> Result<TrainReport> {
        let cfg = &self.config;

        // ── Step 1: Validate before touching any data ─────────────────────────
        cfg.validate()?;
        tracing::info!("Run '{}' with preset {:?}, seed {}", cfg.run_name, cfg.preset, cfg.seed);

        // ── Steps 2–5 ─────────────────────────────────────────────────────────
        let data = prepare_data(cfg)?;

        // ── Step 6: Build model ───────────────────────────────────────────────
        let built = cfg
            .classifier_config()
            .build::<B>(cfg.pretrained_weights.as_deref(), device);
        tracing::info!("Backbone weights: {}", built.weight_source);

        // ── Step 7: Epoch loop ────────────────────────────────────────────────
        let mut history = HistoryLogger::create(cfg.history_path())?;
        let outcome = train(cfg, built.model, &data.samples, &data.split, &data.weights, &mut history, device)?;

        // ── Step 8: Test evaluation on the best-restored model ────────────────
        let model = outcome.model.valid();
        let test = evaluate_test_split(cfg, &model, &data, device)?;
        tracing::info!(
            "Test ({} images): acc={:.4} f1={:.4} auc={:.4} sens={:.4} spec={:.4}",
            test.truth.len(),
            test.metrics.accuracy,
            test.metrics.f1,
            test.metrics.auc,
            test.metrics.sensitivity,
            test.metrics.specificity
        );

        // ── Step 9: Save artifact ─────────────────────────────────────────────
        let manifest = RunManifest {
            config: cfg.clone(),
            weight_source: built.weight_source,
            params: built.params,
            stop_reason: outcome.state,
            stopped_epoch: outcome.stopped_epoch,
            best_epoch: outcome.best_epoch,
            best_val_auc: outcome.best_val_auc,
            test_metrics: test.metrics,
            test_loss: test.loss,
            class_names: RunManifest::class_names(),
            preprocessing: Preprocessing::imagenet(cfg.image_size),
            corrupt_images: data.corrupt_images,
            patient_id_fallbacks: data.patient_id_fallbacks,
        };
        let artifact_path = save_artifact(&cfg.artifact_path(), &model, &manifest)?;

        Ok(TrainReport {
            artifact_path,
            history_path: history.csv_path().to_path_buf(),
            manifest,
        })
    }
}
