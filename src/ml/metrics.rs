// ============================================================
// Layer 5 — Binary Classification Metrics
// ============================================================
// Host-side metrics over predicted classes, malignant
// probabilities and ground-truth labels. Positive class is
// always Malignant (1):
//
//   sensitivity = recall(malignant) = tp / (tp + fn)
//   specificity = recall(benign)    = tn / (tn + fp)
//
// Any ratio with a zero denominator is 0.
//
// ROC-AUC is the Mann–Whitney rank statistic: the probability
// that a random malignant image scores above a random benign
// one, with tied scores given their average rank.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::sample::{Label, NUM_CLASSES};

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// 2×2 confusion matrix, rows = truth, columns = prediction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix(pub [[usize; NUM_CLASSES]; NUM_CLASSES]);

impl ConfusionMatrix {
    pub fn from_predictions(predictions: &[Label], truth: &[Label]) -> Self {
        let mut m = [[0usize; NUM_CLASSES]; NUM_CLASSES];
        for (&p, &t) in predictions.iter().zip(truth) {
            m[t.index()][p.index()] += 1;
        }
        Self(m)
    }

    pub fn tn(&self) -> usize {
        self.0[0][0]
    }
    pub fn fp(&self) -> usize {
        self.0[0][1]
    }
    pub fn fn_count(&self) -> usize {
        self.0[1][0]
    }
    pub fn tp(&self) -> usize {
        self.0[1][1]
    }

    pub fn total(&self) -> usize {
        self.0.iter().flatten().sum()
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.tp() + self.tn(), self.total())
    }

    pub fn precision(&self) -> f64 {
        ratio(self.tp(), self.tp() + self.fp())
    }

    pub fn sensitivity(&self) -> f64 {
        ratio(self.tp(), self.tp() + self.fn_count())
    }

    pub fn specificity(&self) -> f64 {
        ratio(self.tn(), self.tn() + self.fp())
    }

    pub fn f1(&self) -> f64 {
        let (p, r) = (self.precision(), self.sensitivity());
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * p * r / (p + r)
        }
    }

    /// Precision, recall, F1 and support of one class treated as positive.
    pub fn class_stats(&self, label: Label) -> ClassStats {
        let i = label.index();
        let j = 1 - i;
        let hit = self.0[i][i];
        let precision = ratio(hit, hit + self.0[j][i]);
        let recall = ratio(hit, hit + self.0[i][j]);
        let f1 = if precision + recall == 0.0 {
            0.0
        } else {
            2.0 * precision * recall / (precision + recall)
        };
        ClassStats { precision, recall, f1, support: self.0[i].iter().sum() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassStats {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// Area under the ROC curve, or `None` when only one class is present.
pub fn roc_auc(scores: &[f64], truth: &[Label]) -> Option<f64> {
    let n_pos = truth.iter().filter(|&&l| l == Label::Malignant).count();
    let n_neg = truth.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    // 1-based average ranks over runs of equal scores.
    let mut ranks = vec![0.0f64; scores.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && scores[order[end]] == scores[order[start]] {
            end += 1;
        }
        let avg = (start + end + 1) as f64 / 2.0;
        for &i in &order[start..end] {
            ranks[i] = avg;
        }
        start = end;
    }

    let pos_rank_sum: f64 = truth
        .iter()
        .zip(&ranks)
        .filter(|&(&l, _)| l == Label::Malignant)
        .map(|(_, &r)| r)
        .sum();
    let u = pos_rank_sum - (n_pos * (n_pos + 1)) as f64 / 2.0;
    Some(u / (n_pos * n_neg) as f64)
}

/// Headline metrics of one evaluation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub auc: f64,
    pub sensitivity: f64,
    pub specificity: f64,
    pub confusion: ConfusionMatrix,
}

impl BinaryMetrics {
    /// `scores` are malignant probabilities aligned with `truth`.
    pub fn compute(predictions: &[Label], scores: &[f64], truth: &[Label]) -> Self {
        let confusion = ConfusionMatrix::from_predictions(predictions, truth);
        let auc = roc_auc(scores, truth).unwrap_or_else(|| {
            tracing::warn!("Only one class present in {} labels; AUC undefined, reporting 0.5", truth.len());
            0.5
        });
        Self {
            accuracy: confusion.accuracy(),
            precision: confusion.precision(),
            recall: confusion.sensitivity(),
            f1: confusion.f1(),
            auc,
            sensitivity: confusion.sensitivity(),
            specificity: confusion.specificity(),
            confusion,
        }
    }
}

impl fmt::Display for BinaryMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  Accuracy:    {:.4}", self.accuracy)?;
        writeln!(f, "  Precision:   {:.4}", self.precision)?;
        writeln!(f, "  Recall:      {:.4}", self.recall)?;
        writeln!(f, "  F1:          {:.4}", self.f1)?;
        writeln!(f, "  ROC-AUC:     {:.4}", self.auc)?;
        writeln!(f, "  Sensitivity: {:.4}", self.sensitivity)?;
        write!(f, "  Specificity: {:.4}", self.specificity)
    }
}

/// Per-class breakdown printed after test evaluation.
pub struct ClassificationReport<'a>(pub &'a ConfusionMatrix);

impl fmt::Display for ClassificationReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        writeln!(f, "{:<12}{:>10}{:>10}{:>10}{:>10}", "", "precision", "recall", "f1", "support")?;
        for label in Label::ALL {
            let s = m.class_stats(label);
            writeln!(
                f,
                "{:<12}{:>10.4}{:>10.4}{:>10.4}{:>10}",
                label.to_string(),
                s.precision,
                s.recall,
                s.f1,
                s.support
            )?;
        }
        writeln!(f)?;
        writeln!(f, "Confusion matrix (rows = truth, cols = predicted):")?;
        writeln!(f, "{:<12}{:>10}{:>10}", "", "Benign", "Malignant")?;
        for label in Label::ALL {
            let row = m.0[label.index()];
            writeln!(f, "{:<12}{:>10}{:>10}", label.to_string(), row[0], row[1])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::sample::Label::{Benign as B, Malignant as M};

    /// Expand a confusion matrix into (predictions, truth).
    fn expand(m: [[usize; 2]; 2]) -> (Vec<Label>, Vec<Label>) {
        let mut preds = Vec::new();
        let mut truth = Vec::new();
        for (t, row) in m.iter().enumerate() {
            for (p, &n) in row.iter().enumerate() {
                for _ in 0..n {
                    truth.push(Label::ALL[t]);
                    preds.push(Label::ALL[p]);
                }
            }
        }
        (preds, truth)
    }

    #[test]
    fn test_sensitivity_and_specificity() {
        let (preds, truth) = expand([[50, 5], [3, 42]]);
        let m = ConfusionMatrix::from_predictions(&preds, &truth);
        assert_eq!(m, ConfusionMatrix([[50, 5], [3, 42]]));
        assert!((m.sensitivity() - 42.0 / 45.0).abs() < 1e-12);
        assert!((m.specificity() - 50.0 / 55.0).abs() < 1e-12);
        assert!((m.accuracy() - 0.92).abs() < 1e-12);
        assert!((m.precision() - 42.0 / 47.0).abs() < 1e-12);
    }

    #[test]
    fn test_zero_denominators_are_zero() {
        let m = ConfusionMatrix::from_predictions(&[B, B], &[B, B]);
        assert_eq!(m.precision(), 0.0);
        assert_eq!(m.sensitivity(), 0.0);
        assert_eq!(m.f1(), 0.0);
        assert_eq!(m.specificity(), 1.0);
        assert_eq!(ConfusionMatrix::default().accuracy(), 0.0);
    }

    #[test]
    fn test_auc_perfect_and_inverted() {
        let truth = [B, B, M, M];
        assert_eq!(roc_auc(&[0.1, 0.2, 0.8, 0.9], &truth), Some(1.0));
        assert_eq!(roc_auc(&[0.9, 0.8, 0.2, 0.1], &truth), Some(0.0));
    }

    #[test]
    fn test_auc_ties_count_half() {
        assert_eq!(roc_auc(&[0.5, 0.5, 0.5, 0.5], &[B, M, B, M]), Some(0.5));
        // One positive above both negatives, one tied with a negative.
        let auc = roc_auc(&[0.3, 0.6, 0.6, 0.9], &[B, B, M, M]).unwrap();
        assert!((auc - 0.875).abs() < 1e-12);
    }

    #[test]
    fn test_single_class_auc_is_half() {
        assert_eq!(roc_auc(&[0.2, 0.7], &[M, M]), None);
        let metrics = BinaryMetrics::compute(&[M, M], &[0.2, 0.7], &[M, M]);
        assert_eq!(metrics.auc, 0.5);
    }

    #[test]
    fn test_class_stats_match_headline() {
        let m = ConfusionMatrix([[50, 5], [3, 42]]);
        let mal = m.class_stats(M);
        assert!((mal.recall - m.sensitivity()).abs() < 1e-12);
        assert!((mal.f1 - m.f1()).abs() < 1e-12);
        let ben = m.class_stats(B);
        assert!((ben.recall - m.specificity()).abs() < 1e-12);
        assert_eq!(ben.support, 55);
        let report = ClassificationReport(&m).to_string();
        assert!(report.contains("Malignant"));
    }
}
