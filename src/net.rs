//! MobileNetV2 with the potato disease classification head. Variable names
//! follow the PyTorch state dict layout (`features.N...`, `classifier.N...`)
//! so checkpoints saved from torchvision load name for name.

use tch::nn::{self, ModuleT};
use tch::Tensor;

/// Width of the pooled backbone features
pub const FEATURE_WIDTH: i64 = 1280;

/// Width of the hidden layer of the classification head
pub const HIDDEN_WIDTH: i64 = 256;

pub const DROPOUT: f64 = 0.2;

/// Inverted residual stages: (expand ratio, output channels, repeats, stride)
const STAGES: [(i64, i64, i64, i64); 7] = [
    (1, 16, 1, 1),
    (6, 24, 2, 2),
    (6, 32, 3, 2),
    (6, 64, 4, 2),
    (6, 96, 3, 1),
    (6, 160, 3, 2),
    (6, 320, 1, 1),
];

const STEM_WIDTH: i64 = 32;

/// Convolution, batch norm and an optional ReLU6
#[derive(Debug)]
struct ConvBn {
    conv: nn::Conv2D,
    bn: nn::BatchNorm,
    relu6: bool,
}

impl ConvBn {
    #[allow(clippy::too_many_arguments)]
    fn new(
        conv: nn::Path,
        bn: nn::Path,
        c_in: i64,
        c_out: i64,
        ksize: i64,
        stride: i64,
        groups: i64,
        relu6: bool,
    ) -> Self {
        let config = nn::ConvConfig {
            stride,
            padding: (ksize - 1) / 2,
            groups,
            bias: false,
            ..Default::default()
        };
        ConvBn {
            conv: nn::conv2d(conv, c_in, c_out, ksize, config),
            bn: nn::batch_norm2d(bn, c_out, Default::default()),
            relu6,
        }
    }

    /// The torchvision `Conv2dNormActivation` layout: conv at `p.0`, norm at `p.1`
    fn nested(p: nn::Path, c_in: i64, c_out: i64, ksize: i64, stride: i64, groups: i64) -> Self {
        Self::new(&p / 0, &p / 1, c_in, c_out, ksize, stride, groups, true)
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let ys = xs.apply(&self.conv).apply_t(&self.bn, train);
        if self.relu6 {
            ys.relu().clamp_max(6.)
        } else {
            ys
        }
    }
}

#[derive(Debug)]
struct InvertedResidual {
    expand: Option<ConvBn>,
    depthwise: ConvBn,
    project: ConvBn,
    residual: bool,
}

impl InvertedResidual {
    fn new(p: nn::Path, c_in: i64, c_out: i64, stride: i64, expand_ratio: i64) -> Self {
        let hidden = c_in * expand_ratio;
        let conv = &p / "conv";

        // Without expansion the depthwise conv is `conv.0`, otherwise `conv.1`
        let (expand, next) = if expand_ratio == 1 {
            (None, 0)
        } else {
            (Some(ConvBn::nested(&conv / 0, c_in, hidden, 1, 1, 1)), 1)
        };
        let depthwise = ConvBn::nested(&conv / next, hidden, hidden, 3, stride, hidden);
        let project = ConvBn::new(
            &conv / (next + 1),
            &conv / (next + 2),
            hidden,
            c_out,
            1,
            1,
            1,
            false,
        );

        InvertedResidual {
            expand,
            depthwise,
            project,
            residual: stride == 1 && c_in == c_out,
        }
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let ys = match &self.expand {
            Some(expand) => expand.forward_t(xs, train),
            None => xs.shallow_clone(),
        };
        let ys = self.depthwise.forward_t(&ys, train);
        let ys = self.project.forward_t(&ys, train);
        if self.residual {
            ys + xs
        } else {
            ys
        }
    }
}

/// The potato disease network: a MobileNetV2 backbone followed by
/// dropout, linear(1280, 256), ReLU, linear(256, classes)
#[derive(Debug)]
pub struct PotatoNet {
    stem: ConvBn,
    blocks: Vec<InvertedResidual>,
    last: ConvBn,
    hidden: nn::Linear,
    output: nn::Linear,
}

impl PotatoNet {
    pub fn new(p: &nn::Path, num_classes: i64) -> Self {
        let features = p / "features";
        let stem = ConvBn::nested(&features / 0, 3, STEM_WIDTH, 3, 2, 1);

        let mut blocks = vec![];
        let mut c_in = STEM_WIDTH;
        for (expand_ratio, c_out, repeats, stride) in STAGES {
            for i in 0..repeats {
                let stride = if i == 0 { stride } else { 1 };
                let index = blocks.len() + 1;
                blocks.push(InvertedResidual::new(
                    &features / index,
                    c_in,
                    c_out,
                    stride,
                    expand_ratio,
                ));
                c_in = c_out;
            }
        }
        let last = ConvBn::nested(&features / (blocks.len() + 1), c_in, FEATURE_WIDTH, 1, 1, 1);

        let classifier = p / "classifier";
        PotatoNet {
            stem,
            blocks,
            last,
            hidden: nn::linear(&classifier / 1, FEATURE_WIDTH, HIDDEN_WIDTH, Default::default()),
            output: nn::linear(&classifier / 3, HIDDEN_WIDTH, num_classes, Default::default()),
        }
    }
}

impl ModuleT for PotatoNet {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let mut ys = self.stem.forward_t(xs, train);
        for block in &self.blocks {
            ys = block.forward_t(&ys, train);
        }
        self.last
            .forward_t(&ys, train)
            .adaptive_avg_pool2d([1, 1])
            .flat_view()
            .dropout(DROPOUT, train)
            .apply(&self.hidden)
            .relu()
            .apply(&self.output)
    }
}
