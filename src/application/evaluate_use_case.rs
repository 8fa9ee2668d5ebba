// ============================================================
// Layer 2 — EvaluateUseCase
// ============================================================
// Re-scores a saved run on its own test patients:
//
//   Step 1: Load artifact (model + manifest)   (Layer 6 - infra)
//   Step 2: Rebuild the split from the stored
//           config: same data root, pattern,
//           fractions and seed                 (Layer 4 - data)
//   Step 3: Evaluate the test split            (Layer 5 - ml)
//
// The recomputed metrics should match the ones recorded at the
// end of training; a mismatch means the dataset on disk changed.

use anyhow::Result;
use burn::prelude::*;
use std::path::PathBuf;

use crate::application::train_use_case::{evaluate_test_split, prepare_data};
use crate::infra::checkpoint::{load_artifact, RunManifest};
use crate::ml::{evaluator::Evaluation, InferenceBackend};

/// Recorded manifest next to a fresh evaluation.
#[derive(Debug)]
pub struct EvaluateReport {
    pub manifest: RunManifest,
    pub recomputed: Evaluation,
    /// Test images the rebuilt split holds.
    pub test_images: usize,
}

impl EvaluateReport {
    /// Whether the fresh test metrics reproduce the recorded ones.
    pub fn matches_recorded(&self, tolerance: f64) -> bool {
        let (a, b) = (&self.manifest.test_metrics, &self.recomputed.metrics);
        a.confusion == b.confusion && (a.auc - b.auc).abs() <= tolerance
    }
}

pub struct EvaluateUseCase {
    artifact: PathBuf,
    data_root: Option<PathBuf>,
}

impl EvaluateUseCase {
    /// `data_root` overrides the dataset location stored in the artifact.
    pub fn new(artifact: PathBuf, data_root: Option<PathBuf>) -> Self {
        Self { artifact, data_root }
    }

    pub fn execute(&self) -> Result<EvaluateReport> {
        let device: <InferenceBackend as Backend>::Device = Default::default();
        self.execute_on::<InferenceBackend>(&device)
    }

    pub fn execute_on<B: Backend>(&self, device: &B::Device) -> Result<EvaluateReport> {
        // ── Step 1: Load artifact ─────────────────────────────────────────────
        let (model, manifest) = load_artifact::<B>(&self.artifact, device)?;
        let mut cfg = manifest.config.clone();
        if let Some(root) = &self.data_root {
            cfg.data_root = root.clone();
        }
        tracing::info!(
            "Evaluating run '{}' (stopped: {}, best epoch {:?})",
            cfg.run_name,
            manifest.stop_reason,
            manifest.best_epoch
        );

        // ── Step 2: Rebuild the patient split ─────────────────────────────────
        let data = prepare_data(&cfg)?;
        if data.corrupt_images != manifest.corrupt_images {
            tracing::warn!(
                "Corrupt image count changed since training ({} → {}); the split may differ",
                manifest.corrupt_images,
                data.corrupt_images
            );
        }

        // ── Step 3: Evaluate ──────────────────────────────────────────────────
        let recomputed = evaluate_test_split(&cfg, &model, &data, device)?;
        let report = EvaluateReport {
            test_images: data.split.test.indices.len(),
            manifest,
            recomputed,
        };
        if !report.matches_recorded(1e-6) {
            tracing::warn!("Recomputed test metrics differ from the recorded ones");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::train_use_case::{
        tests::{tiny_config, write_dataset},
        TrainUseCase,
    };
    use burn::backend::{Autodiff, NdArray};
    use tempfile::TempDir;

    #[test]
    fn test_recomputed_metrics_match_training_run() {
        let dir = TempDir::new().unwrap();
        let mut cfg = tiny_config(dir.path());
        cfg.epochs = 1;
        write_dataset(&cfg.data_root);

        let trained = TrainUseCase::new(cfg.clone())
            .execute_on::<Autodiff<NdArray>>(&Default::default())
            .unwrap();

        let report = EvaluateUseCase::new(trained.artifact_path, None)
            .execute_on::<NdArray>(&Default::default())
            .unwrap();
        assert_eq!(report.test_images, trained.manifest.test_metrics.confusion.total());
        assert_eq!(report.manifest, trained.manifest);
        assert!(report.matches_recorded(1e-5));
    }

    #[test]
    fn test_missing_dataset_root_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut cfg = tiny_config(dir.path());
        cfg.epochs = 1;
        write_dataset(&cfg.data_root);
        let trained = TrainUseCase::new(cfg)
            .execute_on::<Autodiff<NdArray>>(&Default::default())
            .unwrap();

        let err = EvaluateUseCase::new(trained.artifact_path, Some(dir.path().join("gone")))
            .execute_on::<NdArray>(&Default::default())
            .unwrap_err();
        assert!(err.to_string().contains("gone"));
    }
}
