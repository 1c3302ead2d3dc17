//! Segmentation network with a contrastive embedding head
//!
//! A small encoder/decoder with skip connections. The decoder produces
//! per-pixel class logits; the embedding head pools the bottleneck features of
//! an input (typically a patch) into a unit-length vector. Which head runs is
//! chosen per call through [`ForwardMode`]; the network holds no mode state.

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{activation::softmax, backend::Backend, Tensor},
};

/// Configuration for the segmentation network
#[derive(Config, Debug)]
pub struct SegmentationNetConfig {
    /// Number of segmentation classes, background included
    #[config(default = "2")]
    pub num_classes: usize,

    /// Length of the contrastive embedding
    #[config(default = "128")]
    pub embedding_size: usize,

    /// Number of input channels (3 for RGB)
    #[config(default = "3")]
    pub in_channels: usize,

    /// Filters of the first encoder level; doubled at each level
    #[config(default = "16")]
    pub base_filters: usize,
}

impl SegmentationNetConfig {
    /// Initialize a new network
    pub fn init<B: Backend>(&self, device: &B::Device) -> SegmentationNet<B> {
        SegmentationNet::new(self, device)
    }
}

/// Which head a forward call evaluates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    /// Per-pixel class logits `[N, C, H, W]`
    Segmentation,
    /// L2-normalised embeddings `[N, D]`
    Embedding,
}

/// Output of [`SegmentationNet::forward`]
#[derive(Debug, Clone)]
pub enum NetworkOutput<B: Backend> {
    Segmentation(Tensor<B, 4>),
    Embedding(Tensor<B, 2>),
}

impl<B: Backend> NetworkOutput<B> {
    pub fn segmentation(self) -> Option<Tensor<B, 4>> {
        match self {
            NetworkOutput::Segmentation(t) => Some(t),
            NetworkOutput::Embedding(_) => None,
        }
    }

    pub fn embedding(self) -> Option<Tensor<B, 2>> {
        match self {
            NetworkOutput::Embedding(t) => Some(t),
            NetworkOutput::Segmentation(_) => None,
        }
    }
}

/// Conv2d, BatchNorm, ReLU
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B>,
    pub relu: Relu,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Same)
            .init(device);

        Self {
            conv,
            bn: BatchNormConfig::new(out_channels).init(device),
            relu: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        self.relu.forward(x)
    }
}

/// Encoder/decoder segmentation network
///
/// Architecture (f = base filters):
/// - enc1: f, pool, enc2: 2f, pool, bottleneck: 4f
/// - up2 + skip(enc2) -> dec2: 2f, up1 + skip(enc1) -> dec1: f
/// - 1x1 classifier
/// - embedding head on the bottleneck: global pool, linear, ReLU, linear, L2 norm
#[derive(Module, Debug)]
pub struct SegmentationNet<B: Backend> {
    pub enc1: ConvBlock<B>,
    pub enc2: ConvBlock<B>,
    pub bottleneck: ConvBlock<B>,
    pub pool: MaxPool2d,

    pub up2: ConvTranspose2d<B>,
    pub dec2: ConvBlock<B>,
    pub up1: ConvTranspose2d<B>,
    pub dec1: ConvBlock<B>,
    pub classifier: Conv2d<B>,

    pub global_pool: AdaptiveAvgPool2d,
    pub proj1: Linear<B>,
    pub proj_relu: Relu,
    pub proj2: Linear<B>,

    num_classes: usize,
    embedding_size: usize,
}

impl<B: Backend> SegmentationNet<B> {
    pub fn new(config: &SegmentationNetConfig, device: &B::Device) -> Self {
        let f = config.base_filters;

        Self {
            enc1: ConvBlock::new(config.in_channels, f, device),
            enc2: ConvBlock::new(f, f * 2, device),
            bottleneck: ConvBlock::new(f * 2, f * 4, device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),

            up2: ConvTranspose2dConfig::new([f * 4, f * 2], [2, 2])
                .with_stride([2, 2])
                .init(device),
            dec2: ConvBlock::new(f * 4, f * 2, device),
            up1: ConvTranspose2dConfig::new([f * 2, f], [2, 2])
                .with_stride([2, 2])
                .init(device),
            dec1: ConvBlock::new(f * 2, f, device),
            classifier: Conv2dConfig::new([f, config.num_classes], [1, 1]).init(device),

            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            proj1: LinearConfig::new(f * 4, f * 4).init(device),
            proj_relu: Relu::new(),
            proj2: LinearConfig::new(f * 4, config.embedding_size).init(device),

            num_classes: config.num_classes,
            embedding_size: config.embedding_size,
        }
    }

    /// Evaluate the head selected by `mode`
    pub fn forward(&self, x: Tensor<B, 4>, mode: ForwardMode) -> NetworkOutput<B> {
        match mode {
            ForwardMode::Segmentation => NetworkOutput::Segmentation(self.forward_segmentation(x)),
            ForwardMode::Embedding => NetworkOutput::Embedding(self.forward_embedding(x)),
        }
    }

    /// Class logits `[N, C, H, W]`; H and W must be divisible by 4
    pub fn forward_segmentation(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let e1 = self.enc1.forward(x);
        let e2 = self.enc2.forward(self.pool.forward(e1.clone()));
        let b = self.bottleneck.forward(self.pool.forward(e2.clone()));

        let d2 = self.up2.forward(b);
        let d2 = self.dec2.forward(Tensor::cat(vec![d2, e2], 1));
        let d1 = self.up1.forward(d2);
        let d1 = self.dec1.forward(Tensor::cat(vec![d1, e1], 1));

        self.classifier.forward(d1)
    }

    /// Per-pixel class probabilities (softmax over the class dimension)
    pub fn forward_probabilities(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        softmax(self.forward_segmentation(x), 1)
    }

    /// Unit-length embeddings `[N, D]`
    pub fn forward_embedding(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let e1 = self.enc1.forward(x);
        let e2 = self.enc2.forward(self.pool.forward(e1));
        let b = self.bottleneck.forward(self.pool.forward(e2));

        let [n, c, _, _] = b.dims();
        let pooled = self.global_pool.forward(b).reshape([n, c]);
        let z = self.proj1.forward(pooled);
        let z = self.proj_relu.forward(z);
        let z = self.proj2.forward(z);

        let norm = z.clone().powf_scalar(2.0).sum_dim(1).sqrt().clamp_min(1e-12);
        z / norm
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn embedding_size(&self) -> usize {
        self.embedding_size
    }
}
