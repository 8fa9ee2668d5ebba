// ============================================================
// Layer 1 — CLI / Presentation Layer
// ============================================================
// The entry point for all user interaction. Parses arguments
// with clap, delegates to one use case per subcommand, and
// prints the reports they return:
//
//   1. `train`    — full training run, prints test metrics
//   2. `evaluate` — recorded vs recomputed test metrics
//   3. `predict`  — label and malignant probability per image

pub mod commands;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, EvaluateArgs, PredictArgs, TrainArgs};

use crate::application::config::TrainConfig;
use crate::ml::metrics::ClassificationReport;

#[derive(Parser, Debug)]
#[command(
    name = "histo-classifier",
    version,
    about = "Train a benign/malignant histopathology classifier with a leakage-free patient split."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Route to the subcommand; the CLI layer never computes.
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Train(args) => run_train(args),
            Commands::Evaluate(args) => run_evaluate(args),
            Commands::Predict(args) => run_predict(args),
        }
    }
}

fn run_train(args: TrainArgs) -> Result<()> {
    use crate::application::train_use_case::TrainUseCase;

    let dump = args.dump_config;
    let config = TrainConfig::try_from(args)?;
    if dump {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let report = TrainUseCase::new(config).execute()?;
    let m = &report.manifest;

    println!("\nTraining {} at epoch {}", m.stop_reason, m.stopped_epoch);
    match m.best_epoch {
        Some(epoch) => println!("Best validation AUC {:.4} at epoch {}", m.best_val_auc, epoch),
        None => println!("Validation AUC never improved; final weights kept"),
    }
    println!("\nTest metrics:\n{}", m.test_metrics);
    println!("\n{}", ClassificationReport(&m.test_metrics.confusion));
    println!("Artifact: {}", report.artifact_path.display());
    println!("History:  {}", report.history_path.display());
    Ok(())
}

fn run_evaluate(args: EvaluateArgs) -> Result<()> {
    use crate::application::evaluate_use_case::EvaluateUseCase;

    let report = EvaluateUseCase::new(args.artifact, args.data_root).execute()?;
    let (recorded, fresh) = (&report.manifest.test_metrics, &report.recomputed.metrics);

    println!("Run '{}': {} test images\n", report.manifest.config.run_name, report.test_images);
    println!("{:<13}{:>10}{:>12}", "", "recorded", "recomputed");
    for (name, a, b) in [
        ("Accuracy", recorded.accuracy, fresh.accuracy),
        ("Precision", recorded.precision, fresh.precision),
        ("Recall", recorded.recall, fresh.recall),
        ("F1", recorded.f1, fresh.f1),
        ("ROC-AUC", recorded.auc, fresh.auc),
        ("Sensitivity", recorded.sensitivity, fresh.sensitivity),
        ("Specificity", recorded.specificity, fresh.specificity),
    ] {
        println!("{:<13}{:>10.4}{:>12.4}", name, a, b);
    }
    println!("\n{}", ClassificationReport(&fresh.confusion));
    if !report.matches_recorded(1e-6) {
        println!("Warning: recomputed metrics differ from the recorded ones.");
    }
    Ok(())
}

fn run_predict(args: PredictArgs) -> Result<()> {
    use crate::application::predict_use_case::PredictUseCase;

    let predictions = PredictUseCase::new(args.artifact, args.images).execute()?;
    for p in predictions {
        println!("{}\t{}\t{:.4}", p.path.display(), p.label, p.malignant_probability);
    }
    Ok(())
}
