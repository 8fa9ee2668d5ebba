// ============================================================
// Layer 4 — Class-Balance Weighting
// ============================================================
// Malignant slides outnumber benign ones roughly 2:1 in BreakHis.
// Two independent levers counter that imbalance:
//
//   (a) Weighted sampler — each epoch draws len(train) indices
//       WITH replacement, with probability ∝ weight[label], so
//       batches are approximately class-balanced.
//   (b) Weighted loss   — the same per-class weights are passed
//       to the loss as alpha, scaling each sample's term.
//
// Using both at once is allowed; it compounds the correction.
//
//   weight[c] = (1 / count[c]) / Σ_k (1 / count[k]) × norm

use anyhow::{bail, Result};
use rand::{distributions::WeightedIndex, prelude::Distribution, rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::domain::sample::{ClassCounts, Label, NUM_CLASSES};

/// Inverse-frequency class weights, indexed by `Label::index()`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassWeights(pub [f64; NUM_CLASSES]);

impl ClassWeights {
    /// Compute weights from training-split counts, normalised to sum to `norm`.
    pub fn inverse_frequency(counts: &ClassCounts, norm: f64) -> Result<Self> {
        if norm <= 0.0 || !norm.is_finite() {
            bail!("Class weight normalisation constant must be positive, got {norm}");
        }
        let mut weights = [0.0f64; NUM_CLASSES];
        for label in Label::ALL {
            let count = counts.get(label);
            if count == 0 {
                bail!("Training split contains no {label} samples; cannot compute class weights");
            }
            weights[label.index()] = 1.0 / count as f64;
        }
        let sum: f64 = weights.iter().sum();
        for w in &mut weights {
            *w = *w / sum * norm;
        }
        Ok(Self(weights))
    }

    pub fn get(&self, label: Label) -> f64 {
        self.0[label.index()]
    }

    pub fn as_f32(&self) -> Vec<f32> {
        self.0.iter().map(|&w| w as f32).collect()
    }

    /// One resampling weight per training sample.
    pub fn per_sample(&self, labels: &[Label]) -> Vec<f64> {
        labels.iter().map(|&l| self.get(l)).collect()
    }
}

/// Draws an epoch's worth of training positions.
///
/// Positions index the training split, not the full dataset.
#[derive(Debug, Clone)]
pub enum EpochSampler {
    /// Draw with replacement ∝ per-sample weight.
    Weighted { weights: Vec<f64>, seed: u64 },
    /// Every position exactly once, shuffled.
    Shuffled { len: usize, seed: u64 },
}

impl EpochSampler {
    /// Positions for `epoch` (1-based). Same epoch and seed give the same draw.
    pub fn draw(&self, epoch: usize) -> Result<Vec<usize>> {
        match self {
            EpochSampler::Weighted { weights, seed } => {
                let dist = WeightedIndex::new(weights)
                    .map_err(|e| anyhow::anyhow!("Invalid sampling weights: {e}"))?;
                let mut rng = StdRng::seed_from_u64(epoch_seed(*seed, epoch));
                Ok((0..weights.len()).map(|_| dist.sample(&mut rng)).collect())
            }
            EpochSampler::Shuffled { len, seed } => {
                use rand::seq::SliceRandom;
                let mut positions: Vec<usize> = (0..*len).collect();
                let mut rng = StdRng::seed_from_u64(epoch_seed(*seed, epoch));
                positions.shuffle(&mut rng);
                Ok(positions)
            }
        }
    }
}

/// Mix a run seed and an epoch number into a per-epoch seed.
pub fn epoch_seed(seed: u64, epoch: usize) -> u64 {
    seed ^ (epoch as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(benign: usize, malignant: usize) -> ClassCounts {
        ClassCounts([benign, malignant])
    }

    #[test]
    fn test_weights_sum_to_norm() {
        for norm in [1.0, 2.0] {
            let w = ClassWeights::inverse_frequency(&counts(600, 1300), norm).unwrap();
            assert!((w.0.iter().sum::<f64>() - norm).abs() < 1e-12);
        }
    }

    #[test]
    fn test_minority_gets_larger_weight() {
        let w = ClassWeights::inverse_frequency(&counts(200, 800), 1.0).unwrap();
        assert!(w.get(Label::Benign) > w.get(Label::Malignant));
        assert!((w.get(Label::Benign) - 0.8).abs() < 1e-12);
        assert!((w.get(Label::Malignant) - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_balanced_counts_give_equal_weights() {
        let w = ClassWeights::inverse_frequency(&counts(50, 50), 2.0).unwrap();
        assert_eq!(w.get(Label::Benign), w.get(Label::Malignant));
        assert!((w.get(Label::Benign) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_empty_class_is_an_error() {
        assert!(ClassWeights::inverse_frequency(&counts(0, 10), 1.0).is_err());
        assert!(ClassWeights::inverse_frequency(&counts(5, 10), 0.0).is_err());
    }

    #[test]
    fn test_weighted_sampler_balances_stream() {
        let labels: Vec<Label> = std::iter::repeat(Label::Benign)
            .take(200)
            .chain(std::iter::repeat(Label::Malignant).take(800))
            .collect();
        let w = ClassWeights::inverse_frequency(&ClassCounts::from_labels(labels.clone()), 1.0)
            .unwrap();
        let sampler = EpochSampler::Weighted { weights: w.per_sample(&labels), seed: 42 };

        let draw = sampler.draw(1).unwrap();
        assert_eq!(draw.len(), labels.len());
        let benign = draw.iter().filter(|&&i| labels[i] == Label::Benign).count();
        let frac = benign as f64 / draw.len() as f64;
        assert!((frac - 0.5).abs() < 0.06, "benign fraction {frac}");
    }

    #[test]
    fn test_sampler_is_reproducible_per_epoch() {
        let sampler = EpochSampler::Shuffled { len: 50, seed: 3 };
        assert_eq!(sampler.draw(2).unwrap(), sampler.draw(2).unwrap());
        assert_ne!(sampler.draw(1).unwrap(), sampler.draw(2).unwrap());

        let mut all = sampler.draw(1).unwrap();
        all.sort_unstable();
        assert_eq!(all, (0..50).collect::<Vec<_>>());
    }
}
