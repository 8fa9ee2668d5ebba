// ============================================================
// Layer 5 — Focal Loss
// ============================================================
// Cross-entropy that down-weights easy examples (Lin et al. 2017):
//
//   ce   = (1 − ε) · nll + ε · mean_c(−log p_c)     label smoothing ε
//   p_t  = exp(−ce)
//   loss = alpha[target] · (1 − p_t)^γ · ce
//
// averaged over the batch. With γ = 0 this is exactly the
// smoothed (optionally class-weighted) cross-entropy, which is
// how the weighted-CE preset is expressed.

use burn::{prelude::*, tensor::activation::log_softmax};

#[derive(Config, Debug)]
pub struct FocalLossConfig {
    #[config(default = 2.0)]
    pub gamma: f64,
    #[config(default = 0.0)]
    pub label_smoothing: f64,
    /// Per-class alpha, indexed by class.
    #[config(default = "None")]
    pub class_weights: Option<Vec<f32>>,
}

impl FocalLossConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> FocalLoss<B> {
        let alpha = self
            .class_weights
            .as_ref()
            .map(|w| Tensor::<B, 1>::from_floats(w.as_slice(), device));
        FocalLoss {
            gamma: self.gamma,
            smoothing: self.label_smoothing,
            alpha,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FocalLoss<B: Backend> {
    gamma: f64,
    smoothing: f64,
    alpha: Option<Tensor<B, 1>>,
}

impl<B: Backend> FocalLoss<B> {
    /// logits: [batch, classes], targets: [batch] → scalar mean loss
    pub fn forward(&self, logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        self.forward_per_sample(logits, targets).mean()
    }

    /// Unreduced loss, one value per sample.
    pub fn forward_per_sample(&self, logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        let [batch, _] = logits.dims();
        let log_p = log_softmax(logits, 1);

        let nll = log_p
            .clone()
            .gather(1, targets.clone().reshape([batch, 1]))
            .reshape([batch])
            .neg();

        let ce = if self.smoothing > 0.0 {
            let uniform = log_p.mean_dim(1).reshape([batch]).neg();
            nll * (1.0 - self.smoothing) + uniform * self.smoothing
        } else {
            nll
        };

        let loss = if self.gamma > 0.0 {
            let p_t = ce.clone().neg().exp();
            p_t.neg().add_scalar(1.0).powf_scalar(self.gamma) * ce
        } else {
            ce
        };

        match &self.alpha {
            Some(alpha) => loss * alpha.clone().select(0, targets),
            None => loss,
        }
    }
}
