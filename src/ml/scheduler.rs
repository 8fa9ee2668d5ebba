// ============================================================
// Layer 5 — Learning-Rate Schedule
// ============================================================
// Optional linear warmup, then cosine annealing with warm
// restarts (Loshchilov & Hutter, SGDR). Stepped once per epoch.
//
//   warmup:  lr_e = base · (e + 1) / warmup            e < warmup
//   cycles:  T_0, T_0·mult, T_0·mult², …
//            lr = min + ½ (base − min) (1 + cos(π · t / T_i))
//
// where t is the position inside the current cycle.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LrSchedule {
    pub base_lr: f64,
    pub min_lr: f64,
    pub warmup_epochs: usize,
    /// Length of the first cosine cycle in epochs.
    pub restart_period: usize,
    /// Growth factor of each following cycle.
    pub restart_mult: usize,
}

impl LrSchedule {
    /// Learning rate for the 0-based epoch index `epoch`.
    pub fn lr_at(&self, epoch: usize) -> f64 {
        if epoch < self.warmup_epochs {
            return self.base_lr * (epoch + 1) as f64 / self.warmup_epochs as f64;
        }

        let mut t = epoch - self.warmup_epochs;
        let mut period = self.restart_period.max(1);
        while t >= period {
            t -= period;
            period *= self.restart_mult.max(1);
        }

        let cosine = 0.5 * (1.0 + (PI * t as f64 / period as f64).cos());
        self.min_lr + (self.base_lr - self.min_lr) * cosine
    }
}
