// ============================================================
// Layer 5 — ResNet Backbone
// ============================================================
// Bottleneck ResNet in the torchvision v1.5 layout (stride on
// the 3×3 conv). Field names mirror torchvision's state-dict
// keys so a `.pth` file loads with only one remap:
//
//   layerN.i.downsample.0.* → layerN.i.downsample.conv.*
//   layerN.i.downsample.1.* → layerN.i.downsample.bn.*
//
// BatchNorm weight/bias → gamma/beta is handled by the PyTorch
// adapter in burn-import. torchvision's `fc.*` keys have no
// counterpart here and are ignored.
//
//   input [B, 3, H, W]
//     conv1 7×7/2 → bn1 → relu → maxpool 3×3/2
//     layer1 (stride 1) → layer2 (/2) → layer3 (/2) → layer4 (/2)
//     global average pool → [B, width × 8 × 4]

use anyhow::Result;
use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d,
    },
    prelude::*,
    record::{FullPrecisionSettings, Recorder},
    tensor::activation::relu,
};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use std::path::Path;

/// Output channels of a bottleneck block relative to its width.
const EXPANSION: usize = 4;

#[derive(Config, Debug)]
pub struct ResNetConfig {
    /// Bottleneck blocks per stage.
    #[config(default = "vec![3, 4, 6, 3]")]
    pub blocks: Vec<usize>,
    /// Channels of the stem and the first stage's 3×3 convs.
    #[config(default = 64)]
    pub width: usize,
    #[config(default = 0.1)]
    pub bn_momentum: f64,
}

impl ResNetConfig {
    /// Dimension of the pooled feature vector.
    pub fn feature_dim(&self) -> usize {
        self.width * 8 * EXPANSION
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> ResNet<B> {
        let conv1 = Conv2dConfig::new([3, self.width], [7, 7])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(3, 3))
            .with_bias(false)
            .init(device);
        let bn1 = self.batch_norm(self.width, device);
        let maxpool = MaxPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init();

        let mut in_channels = self.width;
        let mut stages = Vec::with_capacity(4);
        for (stage, &count) in self.blocks.iter().enumerate() {
            let planes = self.width << stage;
            let stride = if stage == 0 { 1 } else { 2 };
            let blocks: Vec<Bottleneck<B>> = (0..count)
                .map(|i| {
                    let block = self.bottleneck(in_channels, planes, if i == 0 { stride } else { 1 }, device);
                    in_channels = planes * EXPANSION;
                    block
                })
                .collect();
            stages.push(blocks);
        }
        let mut stages = stages.into_iter();

        ResNet {
            conv1,
            bn1,
            maxpool,
            layer1: stages.next().unwrap_or_default(),
            layer2: stages.next().unwrap_or_default(),
            layer3: stages.next().unwrap_or_default(),
            layer4: stages.next().unwrap_or_default(),
            avgpool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
        }
    }

    fn bottleneck<B: Backend>(
        &self,
        in_channels: usize,
        planes: usize,
        stride: usize,
        device: &B::Device,
    ) -> Bottleneck<B> {
        let out_channels = planes * EXPANSION;
        let downsample = (stride != 1 || in_channels != out_channels).then(|| Downsample {
            conv: Conv2dConfig::new([in_channels, out_channels], [1, 1])
                .with_stride([stride, stride])
                .with_bias(false)
                .init(device),
            bn: self.batch_norm(out_channels, device),
        });
        Bottleneck {
            conv1: Conv2dConfig::new([in_channels, planes], [1, 1])
                .with_bias(false)
                .init(device),
            bn1: self.batch_norm(planes, device),
            conv2: Conv2dConfig::new([planes, planes], [3, 3])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .init(device),
            bn2: self.batch_norm(planes, device),
            conv3: Conv2dConfig::new([planes, out_channels], [1, 1])
                .with_bias(false)
                .init(device),
            bn3: self.batch_norm(out_channels, device),
            downsample,
        }
    }

    fn batch_norm<B: Backend>(&self, channels: usize, device: &B::Device) -> BatchNorm<B, 2> {
        BatchNormConfig::new(channels)
            .with_momentum(self.bn_momentum)
            .init(device)
    }
}

/// Learnable weight count. `Module::num_params` also counts the
/// BatchNorm running mean and variance, which are not trained.
pub trait WeightCount {
    fn weight_count(&self) -> usize;
}

impl<B: Backend, const D: usize> WeightCount for BatchNorm<B, D> {
    fn weight_count(&self) -> usize {
        self.gamma.num_params() + self.beta.num_params()
    }
}

impl<M: WeightCount> WeightCount for [M] {
    fn weight_count(&self) -> usize {
        self.iter().map(WeightCount::weight_count).sum()
    }
}

#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B, 2>,
}

#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    pub conv1: Conv2d<B>,
    pub bn1: BatchNorm<B, 2>,
    pub conv2: Conv2d<B>,
    pub bn2: BatchNorm<B, 2>,
    pub conv3: Conv2d<B>,
    pub bn3: BatchNorm<B, 2>,
    pub downsample: Option<Downsample<B>>,
}

impl<B: Backend> WeightCount for Bottleneck<B> {
    fn weight_count(&self) -> usize {
        let shortcut = self
            .downsample
            .as_ref()
            .map_or(0, |ds| ds.conv.num_params() + ds.bn.weight_count());
        self.conv1.num_params()
            + self.bn1.weight_count()
            + self.conv2.num_params()
            + self.bn2.weight_count()
            + self.conv3.num_params()
            + self.bn3.weight_count()
            + shortcut
    }
}

impl<B: Backend> Bottleneck<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(ds) => ds.bn.forward(ds.conv.forward(x.clone())),
            None => x.clone(),
        };
        let out = relu(self.bn1.forward(self.conv1.forward(x)));
        let out = relu(self.bn2.forward(self.conv2.forward(out)));
        let out = self.bn3.forward(self.conv3.forward(out));
        relu(out + identity)
    }
}

#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    pub conv1: Conv2d<B>,
    pub bn1: BatchNorm<B, 2>,
    pub maxpool: MaxPool2d,
    pub layer1: Vec<Bottleneck<B>>,
    pub layer2: Vec<Bottleneck<B>>,
    pub layer3: Vec<Bottleneck<B>>,
    pub layer4: Vec<Bottleneck<B>>,
    pub avgpool: AdaptiveAvgPool2d,
}

impl<B: Backend> WeightCount for ResNet<B> {
    fn weight_count(&self) -> usize {
        self.conv1.num_params()
            + self.bn1.weight_count()
            + self.layer1.weight_count()
            + self.layer2.weight_count()
            + self.layer3.weight_count()
            + self.layer4.weight_count()
    }
}

impl<B: Backend> ResNet<B> {
    /// images: [batch, 3, H, W] → features: [batch, feature_dim]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = relu(self.bn1.forward(self.conv1.forward(images)));
        let mut x = self.maxpool.forward(x);
        for block in self
            .layer1
            .iter()
            .chain(&self.layer2)
            .chain(&self.layer3)
            .chain(&self.layer4)
        {
            x = block.forward(x);
        }
        self.avgpool.forward(x).flatten::<2>(1, 3)
    }

    /// Replace the weights with a torchvision state dict.
    ///
    /// Fails if the file cannot be read or does not fit this
    /// architecture; the model is left untouched in that case.
    pub fn load_torchvision(self, path: &Path, device: &B::Device) -> Result<Self> {
        if !path.is_file() {
            anyhow::bail!("Pretrained weights file '{}' not found", path.display());
        }
        let args = LoadArgs::new(path.to_path_buf())
            .with_key_remap("downsample\\.0", "downsample.conv")
            .with_key_remap("downsample\\.1", "downsample.bn");
        let record: ResNetRecord<B> = PyTorchFileRecorder::<FullPrecisionSettings>::default()
            .load(args, device)
            .map_err(|e| anyhow::anyhow!("Cannot read PyTorch weights '{}': {:?}", path.display(), e))?;

        let expected = self.num_params();
        let conv1_dims = self.conv1.weight.dims();
        let loaded = self.load_record(record);
        if loaded.num_params() != expected || loaded.conv1.weight.dims() != conv1_dims {
            anyhow::bail!(
                "Weights in '{}' do not match the configured backbone ({} vs {} parameters)",
                path.display(),
                loaded.num_params(),
                expected
            );
        }
        Ok(loaded)
    }
}
