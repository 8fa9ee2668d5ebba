// ============================================================
// Layer 4 — Data Pipeline
// ============================================================
// Everything from a directory of slide images to GPU-ready
// tensor batches:
//
//   benign/ malignant/ folders
//       │
//       ▼
//   ImageFolderScanner → labelled samples, integrity pre-pass
//       │
//       ▼
//   PatientIdExtractor → patient id per file name
//       │
//       ▼
//   split_by_patient   → patient-disjoint train / val / test
//       │
//       ▼
//   ClassWeights       → inverse-frequency weights, epoch sampler
//       │
//       ▼
//   ImageDataset       → Burn Dataset over an index list
//       │
//       ▼
//   ImageBatcher       → decode + augment + stack into tensors
//
// Each module does exactly one step and is tested on its own.

/// Walks class folders and validates images
pub mod loader;

/// Patient id from BreakHis-style file names
pub mod patient;

/// Patient-level stratified train/val/test split
pub mod splitter;

/// Class weights and the per-epoch sampler
pub mod balance;

/// Training and evaluation transform pipelines
pub mod augmentation;

/// Implements Burn's Dataset trait for image items
pub mod dataset;

/// Implements Burn's Batcher trait to create tensor batches
pub mod batcher;
