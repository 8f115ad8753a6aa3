//! The YOLOv3 network built on tch.

use crate::common::*;

/// Anchors per detection scale.
pub const NUM_ANCHORS_PER_SCALE: usize = 3;
/// Detection scales, coarse to fine.
pub const NUM_SCALES: usize = 3;
/// Grid strides per scale, matching the output order of
/// [`YoloV3::forward_t`].
pub const STRIDES: [i64; NUM_SCALES] = [32, 16, 8];

fn leaky(xs: &Tensor) -> Tensor {
    xs.maximum(&(xs * 0.1))
}

#[derive(Debug, Clone)]
struct ConvBlockInit {
    in_c: i64,
    out_c: i64,
    k: i64,
    s: i64,
}

impl ConvBlockInit {
    fn new(in_c: i64, out_c: i64, k: i64) -> Self {
        Self {
            in_c,
            out_c,
            k,
            s: 1,
        }
    }

    fn build<'p, P>(self, path: P) -> ConvBlock
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self { in_c, out_c, k, s } = self;

        let conv = nn::conv2d(
            path / "conv",
            in_c,
            out_c,
            k,
            nn::ConvConfig {
                stride: s,
                padding: k / 2,
                bias: false,
                ..Default::default()
            },
        );
        let bn = nn::batch_norm2d(path / "bn", out_c, Default::default());

        ConvBlock { conv, bn }
    }
}

/// Convolution + batch norm + leaky ReLU.
#[derive(Debug)]
struct ConvBlock {
    conv: nn::Conv2D,
    bn: nn::BatchNorm,
}

impl ConvBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        leaky(&xs.apply(&self.conv).apply_t(&self.bn, train))
    }
}

#[derive(Debug)]
struct ResidualBlock {
    conv1: ConvBlock,
    conv2: ConvBlock,
}

impl ResidualBlock {
    fn new<'p, P>(path: P, channels: i64) -> Self
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        Self {
            conv1: ConvBlockInit::new(channels, channels / 2, 1).build(path / "conv1"),
            conv2: ConvBlockInit::new(channels / 2, channels, 3).build(path / "conv2"),
        }
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        xs + self.conv2.forward_t(&self.conv1.forward_t(xs, train), train)
    }
}

/// One downsampling stage of the Darknet-53 backbone.
#[derive(Debug)]
struct Stage {
    down: ConvBlock,
    blocks: Vec<ResidualBlock>,
}

impl Stage {
    fn new<'p, P>(path: P, in_c: i64, out_c: i64, num_blocks: usize) -> Self
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let down = ConvBlockInit {
            s: 2,
            ..ConvBlockInit::new(in_c, out_c, 3)
        }
        .build(path / "down");
        let blocks = (0..num_blocks)
            .map(|index| ResidualBlock::new(path / format!("block_{}", index), out_c))
            .collect();
        Self { down, blocks }
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        self.blocks
            .iter()
            .fold(self.down.forward_t(xs, train), |xs, block| {
                block.forward_t(&xs, train)
            })
    }
}

/// Darknet-53 feature extractor. Produces feature maps at strides 8, 16
/// and 32.
#[derive(Debug)]
struct Darknet53 {
    stem: ConvBlock,
    stage1: Stage,
    stage2: Stage,
    stage3: Stage,
    stage4: Stage,
    stage5: Stage,
}

impl Darknet53 {
    fn new<'p, P>(path: P) -> Self
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        Self {
            stem: ConvBlockInit::new(3, 32, 3).build(path / "stem"),
            stage1: Stage::new(path / "stage1", 32, 64, 1),
            stage2: Stage::new(path / "stage2", 64, 128, 2),
            stage3: Stage::new(path / "stage3", 128, 256, 8),
            stage4: Stage::new(path / "stage4", 256, 512, 8),
            stage5: Stage::new(path / "stage5", 512, 1024, 4),
        }
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> (Tensor, Tensor, Tensor) {
        let xs = self.stem.forward_t(xs, train);
        let xs = self.stage1.forward_t(&xs, train);
        let xs = self.stage2.forward_t(&xs, train);
        let c3 = self.stage3.forward_t(&xs, train);
        let c4 = self.stage4.forward_t(&c3, train);
        let c5 = self.stage5.forward_t(&c4, train);
        (c3, c4, c5)
    }
}

/// The five-convolution detection branch of one scale plus its output
/// convolution.
#[derive(Debug)]
struct DetectionHead {
    convs: Vec<ConvBlock>,
    out_conv: ConvBlock,
    detect: nn::Conv2D,
}

impl DetectionHead {
    fn new<'p, P>(path: P, in_c: i64, mid_c: i64, out_c: i64) -> Self
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let convs = vec![
            ConvBlockInit::new(in_c, mid_c, 1).build(path / "conv0"),
            ConvBlockInit::new(mid_c, mid_c * 2, 3).build(path / "conv1"),
            ConvBlockInit::new(mid_c * 2, mid_c, 1).build(path / "conv2"),
            ConvBlockInit::new(mid_c, mid_c * 2, 3).build(path / "conv3"),
            ConvBlockInit::new(mid_c * 2, mid_c, 1).build(path / "conv4"),
        ];
        let out_conv = ConvBlockInit::new(mid_c, mid_c * 2, 3).build(path / "out_conv");
        let detect = nn::conv2d(path / "detect", mid_c * 2, out_c, 1, Default::default());
        Self {
            convs,
            out_conv,
            detect,
        }
    }

    /// Returns the branch features (input of the upsample route) and the
    /// raw detection map.
    fn forward_t(&self, xs: &Tensor, train: bool) -> (Tensor, Tensor) {
        let branch = self
            .convs
            .iter()
            .fold(xs.shallow_clone(), |xs, conv| conv.forward_t(&xs, train));
        let detection = self
            .out_conv
            .forward_t(&branch, train)
            .apply(&self.detect);
        (branch, detection)
    }
}

#[derive(Debug, Clone)]
pub struct YoloV3Init {
    pub num_classes: usize,
}

impl YoloV3Init {
    pub fn build<'p, P>(self, path: P) -> Result<YoloV3>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self { num_classes } = self;
        ensure!(num_classes > 0, "num_classes must be positive");

        let out_c = (NUM_ANCHORS_PER_SCALE * (5 + num_classes)) as i64;

        let backbone = Darknet53::new(path / "backbone");
        let head5 = DetectionHead::new(path / "head5", 1024, 512, out_c);
        let route5 = ConvBlockInit::new(512, 256, 1).build(path / "route5");
        let head4 = DetectionHead::new(path / "head4", 512 + 256, 256, out_c);
        let route4 = ConvBlockInit::new(256, 128, 1).build(path / "route4");
        let head3 = DetectionHead::new(path / "head3", 256 + 128, 128, out_c);

        Ok(YoloV3 {
            num_classes,
            backbone,
            head5,
            route5,
            head4,
            route4,
            head3,
        })
    }
}

/// The YOLOv3 detector. The raw output maps feed the training loss; decoded
/// outputs feed non-max suppression at inference time.
#[derive(Debug)]
pub struct YoloV3 {
    num_classes: usize,
    backbone: Darknet53,
    head5: DetectionHead,
    route5: ConvBlock,
    head4: DetectionHead,
    route4: ConvBlock,
    head3: DetectionHead,
}

impl YoloV3 {
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Runs the network and returns the raw detection maps ordered by
    /// stride 32, 16, 8. Each map has shape
    /// `[batch, 3 * (5 + num_classes), grid, grid]`.
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<[Tensor; NUM_SCALES]> {
        let (_b, channels, height, width) = xs.size4()?;
        ensure!(
            channels == 3 && height % STRIDES[0] == 0 && width % STRIDES[0] == 0,
            "invalid input shape {:?}, the input size must be a multiple of {}",
            xs.size(),
            STRIDES[0]
        );

        let (c3, c4, c5) = self.backbone.forward_t(xs, train);

        let (branch5, detection5) = self.head5.forward_t(&c5, train);

        let route = {
            let route = self.route5.forward_t(&branch5, train);
            let (_b, _c, h, w) = route.size4()?;
            route.upsample_nearest2d(&[h * 2, w * 2], None, None)
        };
        let (branch4, detection4) = self
            .head4
            .forward_t(&Tensor::cat(&[route, c4], 1), train);

        let route = {
            let route = self.route4.forward_t(&branch4, train);
            let (_b, _c, h, w) = route.size4()?;
            route.upsample_nearest2d(&[h * 2, w * 2], None, None)
        };
        let (_branch3, detection3) = self
            .head3
            .forward_t(&Tensor::cat(&[route, c3], 1), train);

        Ok([detection5, detection4, detection3])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_output_shapes() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = YoloV3Init { num_classes: 2 }.build(&vs.root())?;

        let input = Tensor::zeros(&[1, 3, 224, 224], (Kind::Float, Device::Cpu));
        let outputs = model.forward_t(&input, false)?;

        let out_c = (NUM_ANCHORS_PER_SCALE * (5 + 2)) as i64;
        for (output, stride) in outputs.iter().zip(STRIDES) {
            let grid = 224 / stride;
            assert_eq!(output.size(), vec![1, out_c, grid, grid]);
        }
        Ok(())
    }

    #[test]
    fn forward_rejects_unaligned_input() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = YoloV3Init { num_classes: 1 }.build(&vs.root())?;

        let input = Tensor::zeros(&[1, 3, 100, 100], (Kind::Float, Device::Cpu));
        assert!(model.forward_t(&input, false).is_err());
        Ok(())
    }
}
