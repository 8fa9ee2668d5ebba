// ============================================================
// Layer 2 — Application / Use Cases
// ============================================================
// This layer orchestrates the other layers to accomplish one
// goal per subcommand (train, evaluate, predict).
//
// Rules for this layer:
//   - No ML math or model code here
//   - No printing here (that's Layer 1); use cases return
//     reports and the CLI decides how to show them
//   - Only workflow coordination and run configuration

/// TrainConfig, presets and config-file merging
pub mod config;

/// The training workflow
pub mod train_use_case;

/// Re-evaluate a saved run on its test patients
pub mod evaluate_use_case;

/// Classify image files with a saved run
pub mod predict_use_case;
