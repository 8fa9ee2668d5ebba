// ============================================================
// Layer 5 — Inferencer
// ============================================================
// Classifies image files with a trained model:
//
//   file → evaluation pipeline (resize + normalise)
//        → model → softmax → P(malignant), argmax label
//
// Images are processed in chunks so a long file list never has
// to fit on the device at once.

use anyhow::{bail, Result};
use burn::{prelude::*, tensor::activation::softmax};
use rand::{rngs::StdRng, SeedableRng};
use std::path::{Path, PathBuf};

use crate::data::augmentation::ImagePipeline;
use crate::domain::sample::Label;
use crate::infra::checkpoint::{load_artifact, RunManifest};
use crate::ml::model::PathologyClassifier;

/// The model's verdict on one image.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub path: PathBuf,
    pub label: Label,
    pub malignant_probability: f64,
}

pub struct Inferencer<B: Backend> {
    model: PathologyClassifier<B>,
    pipeline: ImagePipeline,
    batch_size: usize,
    device: B::Device,
}

impl<B: Backend> Inferencer<B> {
    pub fn new(model: PathologyClassifier<B>, image_size: u32, batch_size: usize, device: B::Device) -> Self {
        Self {
            model,
            pipeline: ImagePipeline::evaluation(image_size),
            batch_size: batch_size.max(1),
            device,
        }
    }

    /// Load a run artifact and prepare it for prediction.
    pub fn from_artifact(path: &Path, device: B::Device) -> Result<(Self, RunManifest)> {
        let (model, manifest) = load_artifact::<B>(path, &device)?;
        tracing::info!(
            "Loaded model '{}' (best val AUC {:.4}, image size {})",
            manifest.config.run_name,
            manifest.best_val_auc,
            manifest.preprocessing.image_size
        );
        let inferencer = Self::new(
            model,
            manifest.preprocessing.image_size,
            manifest.config.batch_size,
            device,
        );
        Ok((inferencer, manifest))
    }

    /// Predict every path, in order.
    pub fn predict(&self, paths: &[PathBuf]) -> Result<Vec<Prediction>> {
        if paths.is_empty() {
            bail!("No images given to classify");
        }
        let size = self.pipeline.image_size() as usize;
        // The evaluation pipeline draws nothing from the RNG.
        let mut rng = StdRng::seed_from_u64(0);

        let mut predictions = Vec::with_capacity(paths.len());
        for chunk in paths.chunks(self.batch_size) {
            let mut pixels = Vec::with_capacity(chunk.len() * self.pipeline.output_len());
            for path in chunk {
                pixels.extend(self.pipeline.load(path, &mut rng)?);
            }
            let images = Tensor::<B, 4>::from_data(
                TensorData::new(pixels, [chunk.len(), 3, size, size]),
                &self.device,
            );

            let probs: Vec<f32> = softmax(self.model.forward(images), 1)
                .into_data()
                .convert::<f32>()
                .to_vec()
                .map_err(|e| anyhow::anyhow!("Cannot read probabilities: {e:?}"))?;

            for (path, row) in chunk.iter().zip(probs.chunks_exact(2)) {
                let label = if row[1] > row[0] { Label::Malignant } else { Label::Benign };
                tracing::debug!("'{}' → {} (p_malignant={:.4})", path.display(), label, row[1]);
                predictions.push(Prediction {
                    path: path.clone(),
                    label,
                    malignant_probability: row[1] as f64,
                });
            }
        }
        Ok(predictions)
    }
}
