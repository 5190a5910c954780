// ============================================================
// Layer 5 — CNN Architectures
// ============================================================
// Two classifiers, both mapping [batch, C, H, W] images to
// [batch, num_classes] logits:
//
//   SimpleCnn
//     3 x ( conv3x3 pad1 → batch-norm → ReLU → maxpool 2x2 )
//         channels 32 → 64 → 128, spatial s → s/2 → s/4 → s/8
//     flatten → fc(128·(s/8)² → 256) → ReLU → dropout → fc(256 → K)
//
//   ResNet
//     stem conv3x3(64) → BN → ReLU
//     stage 1: 2 residual blocks,  64 channels, stride 1
//     stage 2: 2 residual blocks, 128 channels, stride 2
//     stage 3: 2 residual blocks, 256 channels, stride 2
//     global average pool → fc(256 → K)
//
//   ResidualBlock
//     out = ReLU( BN(conv3x3(ReLU(BN(conv3x3_stride(x))))) + shortcut(x) )
//     shortcut = identity, or conv1x1(stride) → BN when the
//     stride or channel count changes.
//
// Convolutions followed by batch-norm carry no bias: BN's beta
// already provides the offset.
//
// Reference: Burn Book §3 (Building Blocks)
//            He et al. (2016) Deep Residual Learning

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig,
        Dropout, DropoutConfig,
        Linear, LinearConfig,
        PaddingConfig2d,
    },
    prelude::*,
    tensor::activation::relu,
};

use crate::config::{AppConfig, ModelName};

/// Common interface of every architecture: images in, logits out.
pub trait ImageClassifier<B: Backend> {
    /// images: [batch, C, H, W] → logits: [batch, num_classes]
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;
}

fn conv3x3<B: Backend>(in_ch: usize, out_ch: usize, stride: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([in_ch, out_ch], [3, 3])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_bias(false)
        .init(device)
}

// ─── SimpleCnn ────────────────────────────────────────────────────────────────

// NOTE: #[derive(Config)] already generates Clone and Serialize/Deserialize.
#[derive(Config, Debug)]
pub struct SimpleCnnConfig {
    pub num_classes: usize,
    #[config(default = 3)]
    pub input_channels: usize,
    #[config(default = 32)]
    pub image_size: usize,
    #[config(default = 0.5)]
    pub dropout: f64,
}

pub const SIMPLE_CNN_CHANNELS: [usize; 3] = [32, 64, 128];
const HIDDEN_UNITS: usize = 256;

impl SimpleCnnConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> SimpleCnn<B> {
        let mut in_ch  = self.input_channels;
        let mut blocks = Vec::with_capacity(SIMPLE_CNN_CHANNELS.len());
        for &out_ch in SIMPLE_CNN_CHANNELS.iter() {
            blocks.push(ConvBlock {
                conv: conv3x3(in_ch, out_ch, 1, device),
                norm: BatchNormConfig::new(out_ch).init(device),
                pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            });
            in_ch = out_ch;
        }

        let spatial  = self.image_size / 8;
        let features = in_ch * spatial * spatial;

        SimpleCnn {
            blocks,
            fc1:     LinearConfig::new(features, HIDDEN_UNITS).init(device),
            fc2:     LinearConfig::new(HIDDEN_UNITS, self.num_classes).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
        }
    }
}

#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv: Conv2d<B>,
    pub norm: BatchNorm<B, 2>,
    pub pool: MaxPool2d,
}

impl<B: Backend> ConvBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.pool.forward(relu(self.norm.forward(self.conv.forward(x))))
    }
}

#[derive(Module, Debug)]
pub struct SimpleCnn<B: Backend> {
    pub blocks:  Vec<ConvBlock<B>>,
    pub fc1:     Linear<B>,
    pub fc2:     Linear<B>,
    pub dropout: Dropout,
}

impl<B: Backend> ImageClassifier<B> for SimpleCnn<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = images;
        for block in &self.blocks {
            x = block.forward(x);
        }
        let x = x.flatten::<2>(1, 3); // [batch, 128·(s/8)²]
        let x = self.dropout.forward(relu(self.fc1.forward(x)));
        self.fc2.forward(x)
    }
}

// ─── ResidualBlock ────────────────────────────────────────────────────────────

#[derive(Module, Debug)]
pub struct Shortcut<B: Backend> {
    pub conv: Conv2d<B>,
    pub norm: BatchNorm<B, 2>,
}

#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    pub conv1:    Conv2d<B>,
    pub bn1:      BatchNorm<B, 2>,
    pub conv2:    Conv2d<B>,
    pub bn2:      BatchNorm<B, 2>,
    pub shortcut: Option<Shortcut<B>>,
}

impl<B: Backend> ResidualBlock<B> {
    pub fn new(in_ch: usize, out_ch: usize, stride: usize, device: &B::Device) -> Self {
        let shortcut = (stride != 1 || in_ch != out_ch).then(|| Shortcut {
            conv: Conv2dConfig::new([in_ch, out_ch], [1, 1])
                .with_stride([stride, stride])
                .with_bias(false)
                .init(device),
            norm: BatchNormConfig::new(out_ch).init(device),
        });

        Self {
            conv1: conv3x3(in_ch, out_ch, stride, device),
            bn1:   BatchNormConfig::new(out_ch).init(device),
            conv2: conv3x3(out_ch, out_ch, 1, device),
            bn2:   BatchNormConfig::new(out_ch).init(device),
            shortcut,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.shortcut {
            Some(s) => s.norm.forward(s.conv.forward(x.clone())),
            None    => x.clone(),
        };
        let out = relu(self.bn1.forward(self.conv1.forward(x)));
        let out = self.bn2.forward(self.conv2.forward(out));
        relu(out + identity)
    }
}

// ─── ResNet ───────────────────────────────────────────────────────────────────

#[derive(Config, Debug)]
pub struct ResNetConfig {
    pub num_classes: usize,
    #[config(default = 3)]
    pub input_channels: usize,
    #[config(default = 2)]
    pub blocks_per_stage: usize,
}

/// (channels, stride) of each stage
pub const RESNET_STAGES: [(usize, usize); 3] = [(64, 1), (128, 2), (256, 2)];

impl ResNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ResNet<B> {
        let stem_ch    = RESNET_STAGES[0].0;
        let mut in_ch  = stem_ch;
        let mut blocks = Vec::new();

        for &(out_ch, stride) in RESNET_STAGES.iter() {
            for i in 0..self.blocks_per_stage {
                // only the first block of a stage downsamples
                let s = if i == 0 { stride } else { 1 };
                blocks.push(ResidualBlock::new(in_ch, out_ch, s, device));
                in_ch = out_ch;
            }
        }

        ResNet {
            stem_conv: conv3x3(self.input_channels, stem_ch, 1, device),
            stem_bn:   BatchNormConfig::new(stem_ch).init(device),
            blocks,
            pool:      AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc:        LinearConfig::new(in_ch, self.num_classes).init(device),
        }
    }
}

#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    pub stem_conv: Conv2d<B>,
    pub stem_bn:   BatchNorm<B, 2>,
    pub blocks:    Vec<ResidualBlock<B>>,
    pub pool:      AdaptiveAvgPool2d,
    pub fc:        Linear<B>,
}

impl<B: Backend> ImageClassifier<B> for ResNet<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = relu(self.stem_bn.forward(self.stem_conv.forward(images)));
        for block in &self.blocks {
            x = block.forward(x);
        }
        let x = self.pool.forward(x).flatten::<2>(1, 3); // [batch, 256]
        self.fc.forward(x)
    }
}

// ─── Factory ──────────────────────────────────────────────────────────────────

pub fn simple_cnn_config(cfg: &AppConfig, num_classes: usize) -> SimpleCnnConfig {
    SimpleCnnConfig::new(num_classes)
        .with_input_channels(cfg.data.input_channels)
        .with_image_size(cfg.data.image_size)
        .with_dropout(cfg.hyperparameters.dropout)
}

pub fn resnet_config(cfg: &AppConfig, num_classes: usize) -> ResNetConfig {
    ResNetConfig::new(num_classes).with_input_channels(cfg.data.input_channels)
}

/// A classifier of either architecture, chosen at runtime.
///
/// Training is generic over the concrete type; this wrapper
/// serves the code paths (prediction, serving) that only learn
/// the architecture from a checkpoint.
#[derive(Debug)]
pub enum AnyClassifier<B: Backend> {
    SimpleCnn(SimpleCnn<B>),
    ResNet(ResNet<B>),
}

impl<B: Backend> AnyClassifier<B> {
    /// Build a freshly initialised model of the configured architecture.
    pub fn build(cfg: &AppConfig, num_classes: usize, device: &B::Device) -> Self {
        match cfg.model.name {
            ModelName::SimpleCnn => Self::SimpleCnn(simple_cnn_config(cfg, num_classes).init(device)),
            ModelName::Resnet    => Self::ResNet(resnet_config(cfg, num_classes).init(device)),
        }
    }

    pub fn name(&self) -> ModelName {
        match self {
            Self::SimpleCnn(_) => ModelName::SimpleCnn,
            Self::ResNet(_)    => ModelName::Resnet,
        }
    }

    pub fn num_params(&self) -> usize {
        match self {
            Self::SimpleCnn(m) => m.num_params(),
            Self::ResNet(m)    => m.num_params(),
        }
    }
}

impl<B: Backend> ImageClassifier<B> for AnyClassifier<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        match self {
            Self::SimpleCnn(m) => m.forward(images),
            Self::ResNet(m)    => m.forward(images),
        }
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use burn::{
        backend::{Autodiff, NdArray},
        nn::loss::CrossEntropyLossConfig,
        optim::{AdamConfig, GradientsParams, Optimizer},
    };

    type TestBackend = NdArray;
    type TrainBackend = Autodiff<NdArray>;

    fn all_finite<B: Backend, const D: usize>(t: Tensor<B, D>) -> bool {
        t.into_data()
            .to_vec::<f32>()
            .map(|v| v.iter().all(|x| x.is_finite()))
            .unwrap_or(false)
    }

    #[test]
    fn test_simple_cnn_output_shape() {
        let device = Default::default();
        let model: SimpleCnn<TestBackend> = SimpleCnnConfig::new(10).init(&device);
        let out = model.forward(Tensor::random([2, 3, 32, 32], burn::tensor::Distribution::Default, &device));
        assert_eq!(out.dims(), [2, 10]);
        assert!(all_finite(out));
    }

    #[test]
    fn test_simple_cnn_grayscale_many_classes() {
        // 28 / 8 = 3 after three floor-halvings
        let device = Default::default();
        let model: SimpleCnn<TestBackend> = SimpleCnnConfig::new(100)
            .with_input_channels(1)
            .with_image_size(28)
            .init(&device);
        let out = model.forward(Tensor::zeros([2, 1, 28, 28], &device));
        assert_eq!(out.dims(), [2, 100]);
    }

    #[test]
    fn test_resnet_output_shape() {
        let device = Default::default();
        let model: ResNet<TestBackend> = ResNetConfig::new(10).init(&device);
        let out = model.forward(Tensor::random([2, 3, 16, 16], burn::tensor::Distribution::Default, &device));
        assert_eq!(out.dims(), [2, 10]);
        assert!(all_finite(out));
    }

    #[test]
    fn test_resnet_shortcuts_only_where_shape_changes() {
        let device = Default::default();
        let model: ResNet<TestBackend> = ResNetConfig::new(10).init(&device);
        let with_shortcut: Vec<bool> = model.blocks.iter().map(|b| b.shortcut.is_some()).collect();
        assert_eq!(with_shortcut, vec![false, false, true, false, true, false]);
    }

    #[test]
    fn test_factory_follows_config() {
        let device = Default::default();
        let mut cfg = AppConfig::default();
        let m = AnyClassifier::<TestBackend>::build(&cfg, 10, &device);
        assert_eq!(m.name(), ModelName::SimpleCnn);

        cfg.model.name = ModelName::Resnet;
        let m = AnyClassifier::<TestBackend>::build(&cfg, 10, &device);
        assert_eq!(m.name(), ModelName::Resnet);
        assert!(m.num_params() > 0);
    }

    #[test]
    fn test_gradients_exist_and_are_finite() {
        let device = Default::default();
        let model: SimpleCnn<TrainBackend> = SimpleCnnConfig::new(4)
            .with_input_channels(1)
            .with_image_size(8)
            .init(&device);

        let images  = Tensor::random([4, 1, 8, 8], burn::tensor::Distribution::Default, &device);
        let targets = Tensor::<TrainBackend, 1, Int>::from_ints([0, 1, 2, 3], &device);
        let loss    = CrossEntropyLossConfig::new().init(&device).forward(model.forward(images), targets);
        let grads   = loss.backward();

        let fc2_grad = model.fc2.weight.val().grad(&grads).expect("fc2 weight has a gradient");
        let conv_grad = model.blocks[0].conv.weight.val().grad(&grads).expect("conv weight has a gradient");
        assert!(all_finite(fc2_grad));
        assert!(all_finite(conv_grad));
    }

    #[test]
    fn test_loss_decreases_on_fixed_batch() {
        TrainBackend::seed(7);
        let device = Default::default();
        let mut model: SimpleCnn<TrainBackend> = SimpleCnnConfig::new(2)
            .with_input_channels(1)
            .with_image_size(8)
            .with_dropout(0.0)
            .init(&device);
        let mut optim = AdamConfig::new().init();
        let ce = CrossEntropyLossConfig::new().init(&device);

        let images  = Tensor::<TrainBackend, 4>::random([8, 1, 8, 8], burn::tensor::Distribution::Default, &device);
        let targets = Tensor::<TrainBackend, 1, Int>::from_ints([0, 1, 0, 1, 0, 1, 0, 1], &device);

        let loss_of = |m: &SimpleCnn<TrainBackend>| -> f64 {
            ce.forward(m.forward(images.clone()), targets.clone()).into_scalar().elem::<f64>()
        };

        let initial = loss_of(&model);
        for _ in 0..40 {
            let loss  = ce.forward(model.forward(images.clone()), targets.clone());
            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(1e-2, model, grads);
        }
        let last = loss_of(&model);
        assert!(last < initial, "loss did not decrease: {initial} → {last}");
    }
}
