//! Xception-style encoder stages built from separable residual blocks.

use burn::module::Module;
use burn::nn::PaddingConfig2d;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, activation};

use super::layers::{BatchNorm2d, Mode, SeparableConv2d, add_checked};
use crate::error::{DfaNetError, DfaNetResult};

/// Number of residual blocks in encoder stage `stage`.
pub fn stage_repeats(stage: usize) -> DfaNetResult<usize> {
    match stage {
        2 | 4 => Ok(4),
        3 => Ok(6),
        other => Err(DfaNetError::InvalidStage(other)),
    }
}

/// Output channel count of encoder stage `stage`.
pub fn stage_channels(stage: usize) -> DfaNetResult<usize> {
    match stage {
        2 => Ok(48),
        3 => Ok(96),
        4 => Ok(192),
        other => Err(DfaNetError::InvalidStage(other)),
    }
}

/// 1x1 projection shortcut used when a block changes width or resolution.
#[derive(Module, Debug)]
pub struct Shortcut<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm2d<B>,
}

impl<B: Backend> Shortcut<B> {
    fn new(c1: usize, c2: usize, stride: usize, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([c1, c2], [1, 1])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Valid)
            .with_bias(false)
            .init(device);
        let bn = BatchNorm2d::new(c2, device);
        Self { conv, bn }
    }

    fn forward(&self, xs: Tensor<B, 4>, mode: Mode) -> DfaNetResult<Tensor<B, 4>> {
        self.bn.forward(self.conv.forward(xs), mode)
    }
}

/// Residual unit with a bottleneck of `c2 / 4` separable channels.
///
/// The entry path always ends in ReLU; `start_with_relu` adds one more in
/// front of the first convolution. The shortcut is the raw input unless the
/// block changes width or stride.
#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    entry_conv: SeparableConv2d<B>,
    entry_bn: BatchNorm2d<B>,
    mid_conv: SeparableConv2d<B>,
    mid_bn: BatchNorm2d<B>,
    exit_conv: SeparableConv2d<B>,
    exit_bn: BatchNorm2d<B>,
    shortcut: Option<Shortcut<B>>,
    start_with_relu: bool,
}

impl<B: Backend> ResidualBlock<B> {
    pub fn new(
        c1: usize,
        c2: usize,
        stride: usize,
        dilation: usize,
        start_with_relu: bool,
        device: &B::Device,
    ) -> Self {
        let c_ = c2 / 4;

        let shortcut = (c1 != c2 || stride != 1).then(|| Shortcut::new(c1, c2, stride, device));

        Self {
            entry_conv: SeparableConv2d::new(c1, c_, 3, 1, dilation, device),
            entry_bn: BatchNorm2d::new(c_, device),
            mid_conv: SeparableConv2d::new(c_, c_, 3, 1, dilation, device),
            mid_bn: BatchNorm2d::new(c_, device),
            // The widening convolution carries the stride and never dilates.
            exit_conv: SeparableConv2d::new(c_, c2, 3, stride, 1, device),
            exit_bn: BatchNorm2d::new(c2, device),
            shortcut,
            start_with_relu,
        }
    }

    pub fn forward(&self, xs: Tensor<B, 4>, mode: Mode) -> DfaNetResult<Tensor<B, 4>> {
        let ys = if self.start_with_relu {
            activation::relu(xs.clone())
        } else {
            xs.clone()
        };
        let ys = self.entry_bn.forward(self.entry_conv.forward(ys, mode)?, mode)?;
        let ys = activation::relu(ys);

        let ys = self.mid_bn.forward(self.mid_conv.forward(ys, mode)?, mode)?;
        let ys = activation::relu(ys);
        let ys = self.exit_bn.forward(self.exit_conv.forward(ys, mode)?, mode)?;

        let skip = match &self.shortcut {
            Some(shortcut) => shortcut.forward(xs, mode)?,
            None => xs,
        };
        add_checked("residual sum", ys, skip)
    }
}

/// One encoder stage: a downsampling block followed by shape-preserving ones.
#[derive(Module, Debug)]
pub struct EncoderStage<B: Backend> {
    blocks: Vec<ResidualBlock<B>>,
}

impl<B: Backend> EncoderStage<B> {
    pub fn new(c1: usize, c2: usize, stage: usize, device: &B::Device) -> DfaNetResult<Self> {
        let repeats = stage_repeats(stage)?;

        let mut blocks = Vec::with_capacity(repeats);
        blocks.push(ResidualBlock::new(c1, c2, 2, 1, false, device));
        for _ in 1..repeats {
            blocks.push(ResidualBlock::new(c2, c2, 1, 1, true, device));
        }

        Ok(Self { blocks })
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn forward(&self, xs: Tensor<B, 4>, mode: Mode) -> DfaNetResult<Tensor<B, 4>> {
        self.blocks
            .iter()
            .try_fold(xs, |xs, block| block.forward(xs, mode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::TestBackend;
    use burn::tensor::{Distribution, ElementConversion};

    type B = TestBackend;

    #[test]
    fn repeat_table_is_fixed_per_stage() {
        assert_eq!(stage_repeats(2).unwrap(), 4);
        assert_eq!(stage_repeats(3).unwrap(), 6);
        assert_eq!(stage_repeats(4).unwrap(), 4);
        assert_eq!(stage_channels(2).unwrap(), 48);
        assert_eq!(stage_channels(3).unwrap(), 96);
        assert_eq!(stage_channels(4).unwrap(), 192);
    }

    #[test]
    fn unknown_stage_is_rejected() {
        let device = Default::default();
        for stage in [0, 1, 5] {
            let err = EncoderStage::<B>::new(8, 48, stage, &device).unwrap_err();
            assert!(matches!(err, DfaNetError::InvalidStage(s) if s == stage));
        }
    }

    #[test]
    fn identity_block_keeps_arbitrary_shape() {
        let device = Default::default();
        let block = ResidualBlock::<B>::new(16, 16, 1, 1, true, &device);
        assert!(block.shortcut.is_none());

        let xs = Tensor::<B, 4>::random([2, 16, 7, 11], Distribution::Default, &device);
        assert_eq!(block.forward(xs, Mode::Eval).unwrap().dims(), [2, 16, 7, 11]);
    }

    #[test]
    fn dilated_identity_block_keeps_shape() {
        let device = Default::default();
        let block = ResidualBlock::<B>::new(8, 8, 1, 2, false, &device);
        let xs = Tensor::<B, 4>::random([1, 8, 10, 10], Distribution::Default, &device);
        assert_eq!(block.forward(xs, Mode::Eval).unwrap().dims(), [1, 8, 10, 10]);
    }

    #[test]
    fn widening_block_projects_shortcut() {
        let device = Default::default();
        let block = ResidualBlock::<B>::new(8, 16, 1, 1, false, &device);
        assert!(block.shortcut.is_some());

        let xs = Tensor::<B, 4>::random([1, 8, 6, 6], Distribution::Default, &device);
        assert_eq!(block.forward(xs, Mode::Eval).unwrap().dims(), [1, 16, 6, 6]);
    }

    #[test]
    fn leading_relu_ignores_negative_input_on_residual_path() {
        let device = Default::default();
        let block = ResidualBlock::<B>::new(4, 4, 1, 1, true, &device);
        let xs = Tensor::<B, 4>::random([1, 4, 5, 5], Distribution::Uniform(-2.0, -1.0), &device);

        // All-negative input is zeroed before the residual path, which then
        // only sees constants; the raw input must still come through the skip.
        let ys = block.forward(xs.clone(), Mode::Eval).unwrap();
        let offset = ys - xs;
        let spread = (offset.clone().max() - offset.min()).into_scalar().elem::<f32>();
        assert!(spread.abs() < 1e-4, "spread={spread}");
    }

    #[test]
    fn stage_halves_resolution_and_sets_width() {
        let device = Default::default();
        for (stage, c1, c2) in [(2, 8, 48), (3, 48, 96), (4, 96, 192)] {
            let encoder = EncoderStage::<B>::new(c1, c2, stage, &device).unwrap();
            assert_eq!(encoder.num_blocks(), stage_repeats(stage).unwrap());

            let xs = Tensor::<B, 4>::random([1, c1, 16, 12], Distribution::Default, &device);
            assert_eq!(encoder.forward(xs, Mode::Eval).unwrap().dims(), [1, c2, 8, 6]);
        }
    }

    #[test]
    fn stage_rounds_odd_resolution_up() {
        let device = Default::default();
        let encoder = EncoderStage::<B>::new(8, 48, 2, &device).unwrap();
        let xs = Tensor::<B, 4>::random([1, 8, 15, 9], Distribution::Default, &device);
        assert_eq!(encoder.forward(xs, Mode::Eval).unwrap().dims(), [1, 48, 8, 5]);
    }
}
