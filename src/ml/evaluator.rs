// ============================================================
// Layer 5 — Evaluator
// ============================================================
// One deterministic pass over an unshuffled loader:
//
//   logits → softmax → P(malignant), argmax class
//   per-sample loss summed, divided by sample count
//
// Runs on whatever backend the model lives on; callers pass the
// inference backend (`model.valid()`) so dropout is off and
// BatchNorm uses its running statistics.

use anyhow::{bail, Result};
use burn::{
    data::dataloader::{DataLoader, DataLoaderBuilder},
    prelude::*,
    tensor::activation::softmax,
};
use std::sync::Arc;

use crate::data::{
    augmentation::ImagePipeline,
    batcher::{ImageBatch, ImageBatcher},
    dataset::ImageDataset,
};
use crate::domain::sample::{Label, Sample};
use crate::ml::{loss::FocalLoss, metrics::BinaryMetrics, model::PathologyClassifier};

/// Everything one evaluation pass produces.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub loss: f64,
    pub metrics: BinaryMetrics,
    pub predictions: Vec<Label>,
    /// Malignant probability per sample, in loader order.
    pub scores: Vec<f64>,
    pub truth: Vec<Label>,
}

/// Host-side copy of one batch's outputs.
pub(crate) struct BatchOutputs {
    pub predictions: Vec<Label>,
    pub scores: Vec<f64>,
    pub truth: Vec<Label>,
}

/// Pull probabilities, predicted classes and targets off the device.
pub(crate) fn batch_outputs<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
) -> Result<BatchOutputs> {
    let probs: Vec<f32> = softmax(logits, 1)
        .into_data()
        .convert::<f32>()
        .to_vec()
        .map_err(|e| anyhow::anyhow!("Cannot read probabilities: {e:?}"))?;
    let targets: Vec<i64> = targets
        .into_data()
        .convert::<i64>()
        .to_vec()
        .map_err(|e| anyhow::anyhow!("Cannot read targets: {e:?}"))?;

    let mut out = BatchOutputs {
        predictions: Vec::with_capacity(targets.len()),
        scores: Vec::with_capacity(targets.len()),
        truth: Vec::with_capacity(targets.len()),
    };
    for (row, &t) in probs.chunks_exact(2).zip(&targets) {
        let predicted = if row[1] > row[0] { Label::Malignant } else { Label::Benign };
        let Some(truth) = Label::from_index(t as usize) else {
            bail!("Unexpected class index {t} in batch targets");
        };
        out.predictions.push(predicted);
        out.scores.push(row[1] as f64);
        out.truth.push(truth);
    }
    Ok(out)
}

/// Unshuffled loader over `indices` with the deterministic pipeline.
///
/// Returns the batcher too, so callers can check it for load failures.
pub fn evaluation_loader<B: Backend>(
    samples: &[Sample],
    indices: &[usize],
    image_size: u32,
    batch_size: usize,
    num_workers: usize,
    device: &B::Device,
) -> (Arc<dyn DataLoader<ImageBatch<B>>>, ImageBatcher<B>) {
    let batcher = ImageBatcher::<B>::new(device.clone(), Arc::new(ImagePipeline::evaluation(image_size)), 0);
    let mut builder = DataLoaderBuilder::new(batcher.clone()).batch_size(batch_size);
    if num_workers > 0 {
        builder = builder.num_workers(num_workers);
    }
    (builder.build(ImageDataset::new(samples, indices)), batcher)
}

/// Evaluate `model` over every batch of `loader`.
///
/// `batcher` must be the one the loader was built from; a load
/// failure it reports aborts the pass.
pub fn evaluate<B: Backend>(
    model: &PathologyClassifier<B>,
    loader: &dyn DataLoader<ImageBatch<B>>,
    batcher: &ImageBatcher<B>,
    loss_fn: &FocalLoss<B>,
) -> Result<Evaluation> {
    let mut loss_sum = 0.0f64;
    let mut predictions = Vec::new();
    let mut scores = Vec::new();
    let mut truth = Vec::new();

    for batch in loader.iter() {
        if let Some(failure) = batcher.take_failure() {
            bail!("Evaluation aborted: {failure}");
        }
        let logits = model.forward(batch.images);
        let batch_loss: f64 = loss_fn
            .forward_per_sample(logits.clone(), batch.targets.clone())
            .sum()
            .into_scalar()
            .elem::<f64>();
        loss_sum += batch_loss;

        let out = batch_outputs(logits, batch.targets)?;
        predictions.extend(out.predictions);
        scores.extend(out.scores);
        truth.extend(out.truth);
    }

    if truth.is_empty() {
        bail!("Evaluation loader produced no samples");
    }

    let metrics = BinaryMetrics::compute(&predictions, &scores, &truth);
    Ok(Evaluation {
        loss: loss_sum / truth.len() as f64,
        metrics,
        predictions,
        scores,
        truth,
    })
}
