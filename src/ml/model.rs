// ============================================================
// Layer 5 — Pathology Classifier (backbone + head)
// ============================================================
// Builds the trainable model in a fixed order:
//
//   1. ResNet backbone, random init
//   2. Pretrained weights, if configured     → WeightSource
//   3. Freeze every ParamGroup not listed as trainable
//   4. Attach a fresh classifier head
//
// The frozen/trainable partition is decided once here and never
// changes during a run. Frozen parameters carry no gradient, so
// the optimiser never touches them.

use burn::{
    nn::{BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig},
    prelude::*,
    tensor::activation::relu,
};
use serde::{Deserialize, Serialize};
use std::{fmt, path::{Path, PathBuf}};

use crate::domain::sample::NUM_CLASSES;
use crate::ml::backbone::{ResNet, ResNetConfig, WeightCount};

/// Named slice of the network that is frozen or trained as a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParamGroup {
    /// conv1 + bn1
    Stem,
    Layer1,
    Layer2,
    Layer3,
    /// Only the last block of layer3.
    Layer3Tail,
    Layer4,
    Head,
}

impl ParamGroup {
    pub fn name(self) -> &'static str {
        match self {
            ParamGroup::Stem => "stem",
            ParamGroup::Layer1 => "layer1",
            ParamGroup::Layer2 => "layer2",
            ParamGroup::Layer3 => "layer3",
            ParamGroup::Layer3Tail => "layer3-tail",
            ParamGroup::Layer4 => "layer4",
            ParamGroup::Head => "head",
        }
    }
}

impl fmt::Display for ParamGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where the backbone weights came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WeightSource {
    Pretrained { path: PathBuf },
    /// No pretrained weights were requested.
    RandomInit,
    /// Pretrained weights were requested but could not be used.
    FallbackRandomInit { reason: String },
}

impl fmt::Display for WeightSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeightSource::Pretrained { path } => write!(f, "pretrained ({})", path.display()),
            WeightSource::RandomInit => write!(f, "random init"),
            WeightSource::FallbackRandomInit { reason } => {
                write!(f, "random init (pretrained load failed: {reason})")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamCounts {
    pub total: usize,
    pub trainable: usize,
}

impl ParamCounts {
    pub fn trainable_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.trainable as f64 / self.total as f64
        }
    }
}

// ─── Head ─────────────────────────────────────────────────────────────────────

#[derive(Module, Debug)]
pub struct HiddenBlock<B: Backend> {
    pub dropout: Dropout,
    pub linear: Linear<B>,
    pub norm: BatchNorm<B, 1>,
}

impl<B: Backend> HiddenBlock<B> {
    /// dropout → linear → ReLU → batch norm
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = relu(self.linear.forward(self.dropout.forward(x)));
        // BatchNorm wants a channel axis plus one spatial axis.
        self.norm.forward(x.unsqueeze_dim::<3>(2)).squeeze::<2>(2)
    }
}

impl<B: Backend> WeightCount for HiddenBlock<B> {
    fn weight_count(&self) -> usize {
        self.linear.num_params() + self.norm.weight_count()
    }
}

#[derive(Module, Debug)]
pub struct ClassifierHead<B: Backend> {
    pub hidden: Vec<HiddenBlock<B>>,
    pub dropout: Dropout,
    pub output: Linear<B>,
}

impl<B: Backend> ClassifierHead<B> {
    pub fn forward(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        let mut x = features;
        for block in &self.hidden {
            x = block.forward(x);
        }
        self.output.forward(self.dropout.forward(x))
    }
}

impl<B: Backend> WeightCount for ClassifierHead<B> {
    fn weight_count(&self) -> usize {
        self.hidden.weight_count() + self.output.num_params()
    }
}

// ─── Full model ───────────────────────────────────────────────────────────────

#[derive(Config, Debug)]
pub struct ClassifierConfig {
    pub backbone: ResNetConfig,
    #[config(default = "vec![1024, 512]")]
    pub head_hidden: Vec<usize>,
    /// One rate per hidden layer plus one before the output layer.
    #[config(default = "vec![0.7, 0.6, 0.5]")]
    pub head_dropout: Vec<f64>,
    #[config(default = "vec![ParamGroup::Layer4, ParamGroup::Head]")]
    pub trainable_groups: Vec<ParamGroup>,
}

/// A freshly built model with its provenance.
pub struct BuiltModel<B: Backend> {
    pub model: PathologyClassifier<B>,
    pub weight_source: WeightSource,
    pub params: ParamCounts,
}

impl ClassifierConfig {
    /// Random-initialised model with every parameter trainable.
    /// Used as the skeleton when loading a saved record.
    pub fn init<B: Backend>(&self, device: &B::Device) -> PathologyClassifier<B> {
        PathologyClassifier {
            backbone: self.backbone.init(device),
            head: self.init_head(device),
        }
    }

    fn init_head<B: Backend>(&self, device: &B::Device) -> ClassifierHead<B> {
        let rate = |i: usize| self.head_dropout.get(i).copied().unwrap_or(0.0);
        let mut in_features = self.backbone.feature_dim();
        let hidden = self
            .head_hidden
            .iter()
            .enumerate()
            .map(|(i, &width)| {
                let block = HiddenBlock {
                    dropout: DropoutConfig::new(rate(i)).init(),
                    linear: LinearConfig::new(in_features, width).init(device),
                    norm: BatchNormConfig::new(width)
                        .with_momentum(self.backbone.bn_momentum)
                        .init(device),
                };
                in_features = width;
                block
            })
            .collect();
        ClassifierHead {
            hidden,
            dropout: DropoutConfig::new(rate(self.head_hidden.len())).init(),
            output: LinearConfig::new(in_features, NUM_CLASSES).init(device),
        }
    }

    /// Build the training model: backbone, optional pretrained
    /// weights, frozen groups, then a new head.
    pub fn build<B: Backend>(&self, pretrained: Option<&Path>, device: &B::Device) -> BuiltModel<B> {
        let backbone = self.backbone.init::<B>(device);

        let (backbone, weight_source) = match pretrained {
            None => (backbone, WeightSource::RandomInit),
            Some(path) => match backbone.clone().load_torchvision(path, device) {
                Ok(loaded) => {
                    tracing::info!("Loaded pretrained backbone from '{}'", path.display());
                    (loaded, WeightSource::Pretrained { path: path.to_path_buf() })
                }
                Err(e) => {
                    tracing::warn!("Pretrained weights unavailable, using random init: {:#}", e);
                    (backbone, WeightSource::FallbackRandomInit { reason: format!("{:#}", e) })
                }
            },
        };

        let mut model = PathologyClassifier {
            backbone: freeze_backbone(backbone, &self.trainable_groups),
            head: self.init_head(device),
        };
        if !self.trainable_groups.contains(&ParamGroup::Head) {
            model.head = model.head.no_grad();
        }

        let params = model.param_counts(&self.trainable_groups);
        tracing::info!(
            "Model: {} parameters, {} trainable ({:.1}%) in [{}]",
            params.total,
            params.trainable,
            params.trainable_ratio() * 100.0,
            self.trainable_groups
                .iter()
                .map(|g| g.name())
                .collect::<Vec<_>>()
                .join(", ")
        );

        BuiltModel { model, weight_source, params }
    }
}

fn freeze_backbone<B: Backend>(mut net: ResNet<B>, trainable: &[ParamGroup]) -> ResNet<B> {
    let keep = |g: ParamGroup| trainable.contains(&g);

    if !keep(ParamGroup::Stem) {
        net.conv1 = net.conv1.no_grad();
        net.bn1 = net.bn1.no_grad();
    }
    if !keep(ParamGroup::Layer1) {
        net.layer1 = net.layer1.no_grad();
    }
    if !keep(ParamGroup::Layer2) {
        net.layer2 = net.layer2.no_grad();
    }
    if !keep(ParamGroup::Layer3) {
        let tail = keep(ParamGroup::Layer3Tail);
        let last = net.layer3.len().saturating_sub(1);
        net.layer3 = net
            .layer3
            .into_iter()
            .enumerate()
            .map(|(i, block)| if tail && i == last { block } else { block.no_grad() })
            .collect();
    }
    if !keep(ParamGroup::Layer4) {
        net.layer4 = net.layer4.no_grad();
    }
    net
}

#[derive(Module, Debug)]
pub struct PathologyClassifier<B: Backend> {
    pub backbone: ResNet<B>,
    pub head: ClassifierHead<B>,
}

impl<B: Backend> PathologyClassifier<B> {
    /// images: [batch, 3, H, W] → logits: [batch, 2]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.head.forward(self.backbone.forward(images))
    }

    /// Total weights, and how many fall in the trainable groups.
    /// BatchNorm running statistics are not counted.
    pub fn param_counts(&self, trainable: &[ParamGroup]) -> ParamCounts {
        let keep = |g: ParamGroup| trainable.contains(&g);
        let net = &self.backbone;
        let (layer3_body, layer3_last) = match net.layer3.split_last() {
            Some((last, body)) => (body.weight_count(), last.weight_count()),
            None => (0, 0),
        };

        let mut count = 0;
        if keep(ParamGroup::Stem) {
            count += net.conv1.num_params() + net.bn1.weight_count();
        }
        if keep(ParamGroup::Layer1) {
            count += net.layer1.weight_count();
        }
        if keep(ParamGroup::Layer2) {
            count += net.layer2.weight_count();
        }
        if keep(ParamGroup::Layer3) {
            count += layer3_body + layer3_last;
        } else if keep(ParamGroup::Layer3Tail) {
            count += layer3_last;
        }
        if keep(ParamGroup::Layer4) {
            count += net.layer4.weight_count();
        }
        if keep(ParamGroup::Head) {
            count += self.head.weight_count();
        }

        ParamCounts { total: self.weight_count(), trainable: count }
    }
}

impl<B: Backend> WeightCount for PathologyClassifier<B> {
    fn weight_count(&self) -> usize {
        self.backbone.weight_count() + self.head.weight_count()
    }
}
