// ============================================================
// Layer 5 — AUC Early Stopping
// ============================================================
// Watches validation ROC-AUC (higher is better) and keeps a
// snapshot of the model from the best epoch.
//
//   best = 0, counter = 0
//   auc > best + min_delta  → best = auc, counter = 0, snapshot
//   otherwise               → counter += 1
//   counter ≥ patience      → StoppedByPatience
//   epoch = max_epochs      → StoppedByMaxEpochs
//
// AUC is used instead of loss because label smoothing and focal
// weighting make the loss a poor proxy for ranking quality.
//
// The snapshot type is generic; the trainer stores a full model
// record, tests store plain numbers.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingState {
    Running,
    StoppedByPatience,
    StoppedByMaxEpochs,
}

impl fmt::Display for TrainingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingState::Running => write!(f, "running"),
            TrainingState::StoppedByPatience => write!(f, "stopped by patience"),
            TrainingState::StoppedByMaxEpochs => write!(f, "stopped at max epochs"),
        }
    }
}

/// The best epoch seen so far and what was captured there.
#[derive(Debug, Clone)]
pub struct BestSnapshot<S> {
    pub epoch: usize,
    pub auc: f64,
    pub snapshot: S,
}

#[derive(Debug)]
pub struct EarlyStopping<S> {
    patience: usize,
    min_delta: f64,
    max_epochs: usize,
    best_auc: f64,
    counter: usize,
    best: Option<BestSnapshot<S>>,
}

impl<S> EarlyStopping<S> {
    pub fn new(patience: usize, min_delta: f64, max_epochs: usize) -> Self {
        Self {
            patience,
            min_delta,
            max_epochs,
            best_auc: 0.0,
            counter: 0,
            best: None,
        }
    }

    /// Record one epoch (1-based). `snapshot` runs only on improvement.
    pub fn observe(&mut self, epoch: usize, val_auc: f64, snapshot: impl FnOnce() -> S) -> TrainingState {
        if val_auc > self.best_auc + self.min_delta {
            self.best_auc = val_auc;
            self.counter = 0;
            self.best = Some(BestSnapshot { epoch, auc: val_auc, snapshot: snapshot() });
            tracing::debug!("New best val AUC {:.4} at epoch {}", val_auc, epoch);
        } else {
            self.counter += 1;
            tracing::debug!(
                "No AUC improvement ({}/{} epochs, best {:.4})",
                self.counter,
                self.patience,
                self.best_auc
            );
            if self.counter >= self.patience {
                return TrainingState::StoppedByPatience;
            }
        }

        if epoch >= self.max_epochs {
            TrainingState::StoppedByMaxEpochs
        } else {
            TrainingState::Running
        }
    }

    pub fn best_auc(&self) -> f64 {
        self.best_auc
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best.as_ref().map(|b| b.epoch)
    }

    /// Consume the tracker, yielding the best snapshot if any epoch improved.
    pub fn into_best(self) -> Option<BestSnapshot<S>> {
        self.best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(aucs: &[f64], patience: usize, min_delta: f64) -> (usize, TrainingState, EarlyStopping<f64>) {
        let mut es = EarlyStopping::new(patience, min_delta, aucs.len());
        for (i, &auc) in aucs.iter().enumerate() {
            let state = es.observe(i + 1, auc, || auc);
            if state != TrainingState::Running {
                return (i + 1, state, es);
            }
        }
        unreachable!("max epochs always stops")
    }

    #[test]
    fn test_plateau_stops_by_patience() {
        let (epoch, state, es) = run(&[0.70, 0.705, 0.706, 0.706, 0.706], 3, 0.01);
        assert_eq!(epoch, 4);
        assert_eq!(state, TrainingState::StoppedByPatience);
        let best = es.into_best().unwrap();
        assert_eq!(best.epoch, 1);
        assert_eq!(best.snapshot, 0.70);
    }

    #[test]
    fn test_improvement_resets_counter() {
        let (epoch, state, es) = run(&[0.6, 0.6, 0.7, 0.7, 0.7, 0.9], 2, 0.001);
        assert_eq!(state, TrainingState::StoppedByPatience);
        assert_eq!(epoch, 5);
        assert_eq!(es.best_epoch(), Some(3));
    }

    #[test]
    fn test_max_epochs_reached_first() {
        let (epoch, state, es) = run(&[0.6, 0.7, 0.8], 5, 0.001);
        assert_eq!(epoch, 3);
        assert_eq!(state, TrainingState::StoppedByMaxEpochs);
        assert!((es.best_auc() - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_never_improving_has_no_snapshot() {
        let (_, state, es) = run(&[0.0, 0.0], 2, 0.0);
        assert_eq!(state, TrainingState::StoppedByPatience);
        assert!(es.into_best().is_none());
    }

    #[test]
    fn test_snapshot_closure_runs_only_on_improvement() {
        let mut calls = 0;
        let mut es = EarlyStopping::new(10, 0.0, 10);
        for (i, auc) in [0.5, 0.4, 0.6, 0.6].into_iter().enumerate() {
            es.observe(i + 1, auc, || {
                calls += 1;
            });
        }
        assert_eq!(calls, 2);
    }
}
