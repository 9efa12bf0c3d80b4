//! Fully-connected channel attention heads.

use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::Tensor;
use burn::tensor::backend::Backend;
use burn::tensor::module::adaptive_avg_pool2d;

use super::layers::{ConvBlock, Mode};
use crate::error::{DfaNetError, DfaNetResult};

/// Fully-connected channel attention.
///
/// Pools the feature map to one vector per sample, lifts it through a wide
/// bias-free linear layer, and maps it back to a non-negative per-channel gate
/// with a 1x1 conv block. The gate rescales the input it was computed from.
#[derive(Module, Debug)]
pub struct FcAttention<B: Backend> {
    fc: Linear<B>,
    conv: ConvBlock<B>,
    in_channels: usize,
    out_channels: usize,
    width: usize,
}

impl<B: Backend> FcAttention<B> {
    pub fn new(in_channels: usize, out_channels: usize, width: usize, device: &B::Device) -> Self {
        let fc = LinearConfig::new(in_channels, width)
            .with_bias(false)
            .init(device);
        let conv = ConvBlock::pointwise(width, out_channels, device);

        Self {
            fc,
            conv,
            in_channels,
            out_channels,
            width,
        }
    }

    /// Per-sample, per-channel gate of shape `[batch, out_channels, 1, 1]`.
    pub fn gate(&self, xs: Tensor<B, 4>, mode: Mode) -> DfaNetResult<Tensor<B, 4>> {
        let [batch, channels, _, _] = xs.dims();
        if channels != self.in_channels {
            return Err(DfaNetError::ShapeMismatch {
                op: "attention pooling",
                lhs: xs.dims().to_vec(),
                rhs: vec![batch, self.in_channels],
            });
        }

        let ys = adaptive_avg_pool2d(xs, [1, 1]).reshape([batch, channels]);
        let ys = self.fc.forward(ys).reshape([batch, self.width, 1, 1]);
        self.conv.forward(ys, mode)
    }

    pub fn forward(&self, xs: Tensor<B, 4>, mode: Mode) -> DfaNetResult<Tensor<B, 4>> {
        if self.in_channels != self.out_channels {
            return Err(DfaNetError::AttentionChannels {
                input: self.in_channels,
                output: self.out_channels,
            });
        }
        let gate = self.gate(xs.clone(), mode)?;
        Ok(xs * gate)
    }
}
