// ============================================================
// Layer 5 — ML / Model Layer (Burn)
// ============================================================
// All Burn model code lives here: the network, the loss, the
// training loop and everything that turns logits into numbers.
//
//   backbone.rs       — ResNet with bottleneck blocks
//                       (torchvision layout, .pth loading)
//
//   model.rs          — PathologyClassifier = backbone + head
//                       ParamGroup frozen/trainable partition,
//                       WeightSource provenance, param counts
//
//   loss.rs           — focal loss with label smoothing and
//                       per-class alpha (γ = 0 → cross-entropy)
//
//   scheduler.rs      — warmup + cosine warm restarts
//
//   early_stopping.rs — validation-AUC patience tracker
//
//   metrics.rs        — confusion matrix, ROC-AUC, report
//
//   evaluator.rs      — deterministic evaluation pass
//
//   trainer.rs        — the epoch loop
//
//   inferencer.rs     — classify image files with an artifact
//
// Backends: WGPU by default; build with `--features cpu` to run
// on the NdArray CPU backend instead.

use burn::backend::Autodiff;

#[cfg(not(feature = "cpu"))]
pub type InferenceBackend = burn::backend::Wgpu;
#[cfg(feature = "cpu")]
pub type InferenceBackend = burn::backend::NdArray;

/// Backend the epoch loop differentiates through.
pub type TrainingBackend = Autodiff<InferenceBackend>;

/// ResNet backbone
pub mod backbone;

/// Classifier model and parameter groups
pub mod model;

/// Focal loss
pub mod loss;

/// Learning-rate schedule
pub mod scheduler;

/// AUC early stopping
pub mod early_stopping;

/// Binary classification metrics
pub mod metrics;

/// Evaluation pass over a loader
pub mod evaluator;

/// Full training loop with validation and early stopping
pub mod trainer;

/// Prediction on image files
pub mod inferencer;
