// ============================================================
// Layer 6 — Run Artifact Store
// ============================================================
// Saves and restores the final model of a run as ONE file:
//
//   <save_dir>/<run_name>.mpk.gz
//     ├── model     — best-restored PathologyClassifier record
//     └── manifest  — JSON RunManifest (config, provenance,
//                     stop reason, test metrics, preprocessing)
//
// The manifest carries the full TrainConfig so `evaluate` and
// `predict` can rebuild the architecture before loading the
// weights, and re-create the exact patient split.
//
// Burn's NamedMpkGzFileRecorder:
//   - MessagePack with field names, gzip-compressed
//   - FullPrecisionSettings keeps f32 weights bit-exact

use anyhow::{Context, Result};
use burn::{
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkGzFileRecorder, Record, Recorder},
};
use serde::{Deserialize, Serialize};
use std::{fs, path::{Path, PathBuf}};

use crate::application::config::TrainConfig;
use crate::data::augmentation::{IMAGENET_MEAN, IMAGENET_STD};
use crate::domain::sample::Label;
use crate::ml::{
    early_stopping::TrainingState,
    metrics::BinaryMetrics,
    model::{ParamCounts, PathologyClassifier, PathologyClassifierRecord, WeightSource},
};

/// Input preprocessing a consumer of the artifact must repeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preprocessing {
    pub image_size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Preprocessing {
    pub fn imagenet(image_size: u32) -> Self {
        Self { image_size, mean: IMAGENET_MEAN, std: IMAGENET_STD }
    }
}

/// Everything known about a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub config: TrainConfig,
    pub weight_source: WeightSource,
    pub params: ParamCounts,
    pub stop_reason: TrainingState,
    pub stopped_epoch: usize,
    pub best_epoch: Option<usize>,
    pub best_val_auc: f64,
    pub test_metrics: BinaryMetrics,
    pub test_loss: f64,
    pub class_names: Vec<String>,
    pub preprocessing: Preprocessing,
    pub corrupt_images: usize,
    pub patient_id_fallbacks: usize,
}

impl RunManifest {
    pub fn class_names() -> Vec<String> {
        Label::ALL.iter().map(|l| l.to_string()).collect()
    }
}

#[derive(Record)]
pub struct ArtifactRecord<B: Backend> {
    pub model: PathologyClassifierRecord<B>,
    /// RunManifest as JSON.
    pub manifest: String,
}

type ArtifactRecorder = NamedMpkGzFileRecorder<FullPrecisionSettings>;

/// Save `model` and `manifest` to `path` (extension `.mpk.gz`).
pub fn save_artifact<B: Backend>(
    path: &Path,
    model: &PathologyClassifier<B>,
    manifest: &RunManifest,
) -> Result<PathBuf> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("Cannot create directory '{}'", dir.display()))?;
    }
    let record = ArtifactRecord {
        model: model.clone().into_record(),
        manifest: serde_json::to_string(manifest)?,
    };

    // The recorder appends its own extension.
    let stem = strip_artifact_extension(path);
    ArtifactRecorder::new()
        .record(record, stem.clone())
        .map_err(|e| anyhow::anyhow!("Failed to save artifact to '{}': {:?}", path.display(), e))?;

    let written = stem.with_extension("mpk.gz");
    tracing::info!("Saved run artifact to '{}'", written.display());
    Ok(written)
}

/// Load an artifact, rebuilding the model from its manifest.
pub fn load_artifact<B: Backend>(
    path: &Path,
    device: &B::Device,
) -> Result<(PathologyClassifier<B>, RunManifest)> {
    if !path.exists() {
        anyhow::bail!("Artifact '{}' not found. Have you run 'train' first?", path.display());
    }
    let record: ArtifactRecord<B> = ArtifactRecorder::new()
        .load(strip_artifact_extension(path), device)
        .map_err(|e| anyhow::anyhow!("Cannot load artifact '{}': {:?}", path.display(), e))?;

    let manifest: RunManifest = serde_json::from_str(&record.manifest)
        .with_context(|| format!("Artifact '{}' has an unreadable manifest", path.display()))?;

    let model = manifest
        .config
        .classifier_config()
        .init::<B>(device)
        .load_record(record.model);
    Ok((model, manifest))
}

fn strip_artifact_extension(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    match s.strip_suffix(".mpk.gz") {
        Some(stem) => PathBuf::from(stem),
        None => path.to_path_buf(),
    }
}
