// ============================================================
// Layer 6 — Infrastructure Layer
// ============================================================
// Things that touch the disk on behalf of a run:
//
//   checkpoint.rs — the run artifact
//                   Burn NamedMpkGzFileRecorder file holding the
//                   best-restored model plus a JSON manifest
//                   (config, provenance, test metrics), so
//                   `evaluate` and `predict` can rebuild the
//                   model without any other file.
//
//   metrics.rs    — per-epoch history
//                   One CSV row per epoch for plotting learning
//                   curves after the run.

/// Run artifact saving and loading
pub mod checkpoint;

/// Training history CSV logger
pub mod metrics;
