// ============================================================
// Layer 6 — Training History Logger
// ============================================================
// Writes one CSV row per epoch so learning curves can be
// plotted after the run:
//
//   epoch,train_loss,train_acc,val_loss,val_acc,val_f1,val_auc,lr
//   1,0.412300,0.712000,0.398100,0.744000,0.781200,0.823400,1.000000e-4
//
// How to read it:
//   - val_auc drives early stopping; the best row is the one
//     whose weights end up in the artifact
//   - train_acc climbing while val_auc stalls → overfitting
//   - lr jumps back up at every warm restart

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

/// One row of the history file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_acc: f64,
    pub val_loss: f64,
    pub val_acc: f64,
    pub val_f1: f64,
    pub val_auc: f64,
    /// Learning rate used for this epoch.
    pub lr: f64,
}

const HEADER: &str = "epoch,train_loss,train_acc,val_loss,val_acc,val_f1,val_auc,lr";

/// Appends epoch rows to a per-run CSV file.
pub struct HistoryLogger {
    csv_path: PathBuf,
    writer: BufWriter<File>,
}

impl HistoryLogger {
    /// Create (or truncate) the history file and write its header.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let csv_path = path.as_ref().to_path_buf();
        if let Some(dir) = csv_path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Cannot create directory '{}'", dir.display()))?;
        }
        let file = File::create(&csv_path)
            .with_context(|| format!("Cannot create history file '{}'", csv_path.display()))?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{HEADER}")?;
        writer.flush()?;
        tracing::debug!("Created history CSV '{}'", csv_path.display());
        Ok(Self { csv_path, writer })
    }

    /// Append one row and flush, so a crashed run keeps its history.
    pub fn log(&mut self, m: &EpochMetrics) -> Result<()> {
        writeln!(
            self.writer,
            "{},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6e}",
            m.epoch, m.train_loss, m.train_acc, m.val_loss, m.val_acc, m.val_f1, m.val_auc, m.lr,
        )?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_rows_follow_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runs/demo_history.csv");
        let mut logger = HistoryLogger::create(&path).unwrap();
        for epoch in 1..=2 {
            logger
                .log(&EpochMetrics {
                    epoch,
                    train_loss: 0.5,
                    train_acc: 0.75,
                    val_loss: 0.4,
                    val_acc: 0.8,
                    val_f1: 0.7,
                    val_auc: 0.9,
                    lr: 1e-4,
                })
                .unwrap();
        }

        let text = fs::read_to_string(logger.csv_path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], HEADER);
        assert!(lines[2].starts_with("2,0.500000,0.750000"));
        assert_eq!(lines[1].split(',').count(), HEADER.split(',').count());
    }

    #[test]
    fn test_create_truncates_previous_run() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("h.csv");
        fs::write(&path, "stale\n").unwrap();
        HistoryLogger::create(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), format!("{HEADER}\n"));
    }
}
