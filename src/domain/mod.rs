// ============================================================
// Layer 3 — Domain Layer
// ============================================================
// Plain Rust types for the concepts the pipeline reasons about:
// labelled samples, patient split assignments and the errors
// that must stop a run.
//
// Rules for this layer:
//   - NO Burn framework types
//   - NO file I/O
//   - Only structs, enums, traits and small pure helpers

/// Label, Sample and per-class counts
pub mod sample;

/// Train/val/test partition of patients
pub mod split;

/// Typed fatal errors (dataset, split)
pub mod error;

/// SampleSource and PatientKey abstractions
pub mod traits;
