//! Leaf building blocks for DFANet.
//!
//! Normalization here takes the evaluation [`Mode`] explicitly instead of
//! inferring it from the backend, and bilinear resizing uses half-pixel
//! sampling (PyTorch `align_corners = false`) on every backend.

use burn::config::Config;
use burn::module::{Module, Param, RunningState};
use burn::nn::PaddingConfig2d;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData, activation};

use crate::error::{DfaNetError, DfaNetResult};

/// Whether a forward pass updates normalization statistics.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Mode {
    /// Normalize with batch statistics and fold them into the running pair.
    Train,
    /// Normalize with the running pair, leaving it untouched.
    #[default]
    Eval,
}

#[derive(Config, Debug)]
pub struct BatchNorm2dConfig {
    pub num_features: usize,
    #[config(default = "1e-5")]
    pub epsilon: f64,
    #[config(default = "0.1")]
    pub momentum: f64,
}

impl BatchNorm2dConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> BatchNorm2d<B> {
        let c = self.num_features;
        BatchNorm2d {
            gamma: Param::from_tensor(Tensor::ones([c], device)),
            beta: Param::from_tensor(Tensor::zeros([c], device)),
            running_mean: RunningState::new(Tensor::zeros([c], device)),
            running_var: RunningState::new(Tensor::ones([c], device)),
            momentum: self.momentum,
            epsilon: self.epsilon,
        }
    }
}

/// Per-channel batch normalization over `[batch, channels, height, width]`.
#[derive(Module, Debug)]
pub struct BatchNorm2d<B: Backend> {
    pub gamma: Param<Tensor<B, 1>>,
    pub beta: Param<Tensor<B, 1>>,
    pub running_mean: RunningState<Tensor<B, 1>>,
    pub running_var: RunningState<Tensor<B, 1>>,
    momentum: f64,
    epsilon: f64,
}

impl<B: Backend> BatchNorm2d<B> {
    pub fn new(num_features: usize, device: &B::Device) -> Self {
        BatchNorm2dConfig::new(num_features).init(device)
    }

    pub fn forward(&self, xs: Tensor<B, 4>, mode: Mode) -> DfaNetResult<Tensor<B, 4>> {
        let [batch, channels, height, width] = xs.dims();

        let (mean, var) = match mode {
            Mode::Eval => (self.running_mean.value(), self.running_var.value()),
            Mode::Train => {
                let count = batch * height * width;
                if count < 2 {
                    return Err(DfaNetError::SingleValueStatistics {
                        shape: xs.dims().to_vec(),
                    });
                }
                let flat = xs.clone().swap_dims(0, 1).reshape([channels, count]);
                let mean = flat.clone().mean_dim(1);
                let var = flat.sub(mean.clone()).powf_scalar(2.0).mean_dim(1);
                let mean: Tensor<B, 1> = mean.reshape([channels]);
                let var: Tensor<B, 1> = var.reshape([channels]);
                self.track(mean.clone().detach(), var.clone().detach(), count);
                (mean, var)
            }
        };

        let shape = [1, channels, 1, 1];
        let std = var.add_scalar(self.epsilon).sqrt().reshape(shape);
        Ok(xs
            .sub(mean.reshape(shape))
            .div(std)
            .mul(self.gamma.val().reshape(shape))
            .add(self.beta.val().reshape(shape)))
    }

    fn track(&self, mean: Tensor<B, 1>, var: Tensor<B, 1>, count: usize) {
        // Running variance is unbiased.
        let var = var.mul_scalar(count as f64 / (count - 1) as f64);
        let keep = 1.0 - self.momentum;
        let running_mean = self.running_mean.value().mul_scalar(keep);
        let running_var = self.running_var.value().mul_scalar(keep);
        self.running_mean
            .update(running_mean.add(mean.mul_scalar(self.momentum)));
        self.running_var
            .update(running_var.add(var.mul_scalar(self.momentum)));
    }
}

/// Split of the total padding a dilated kernel needs to keep stride-1 outputs
/// the same size as the input. Returns `(before, after)`.
pub fn fixed_padding_amount(kernel_size: usize, dilation: usize) -> (usize, usize) {
    let effective = kernel_size + (kernel_size - 1) * (dilation - 1);
    let total = effective - 1;
    let before = total / 2;
    (before, total - before)
}

/// Zero-pads height and width by the [`fixed_padding_amount`] of the kernel.
pub fn fixed_padding<B: Backend>(
    xs: Tensor<B, 4>,
    kernel_size: usize,
    dilation: usize,
) -> Tensor<B, 4> {
    let (before, after) = fixed_padding_amount(kernel_size, dilation);
    let xs = pad_axis(xs, 2, before, after);
    pad_axis(xs, 3, before, after)
}

fn pad_axis<B: Backend>(xs: Tensor<B, 4>, dim: usize, before: usize, after: usize) -> Tensor<B, 4> {
    if before == 0 && after == 0 {
        return xs;
    }
    let device = xs.device();
    let dims = xs.dims();
    let zeros = |len: usize| {
        let mut shape = dims;
        shape[dim] = len;
        Tensor::<B, 4>::zeros(shape, &device)
    };

    let mut parts = Vec::with_capacity(3);
    if before > 0 {
        parts.push(zeros(before));
    }
    parts.push(xs);
    if after > 0 {
        parts.push(zeros(after));
    }
    Tensor::cat(parts, dim)
}

/// Depthwise-separable convolution: fixed padding, per-channel spatial
/// convolution, normalization, then a 1x1 channel mix. No activation.
#[derive(Module, Debug)]
pub struct SeparableConv2d<B: Backend> {
    depthwise: Conv2d<B>,
    bn: BatchNorm2d<B>,
    pointwise: Conv2d<B>,
    kernel_size: usize,
    dilation: usize,
}

impl<B: Backend> SeparableConv2d<B> {
    pub fn new(
        c1: usize,
        c2: usize,
        kernel_size: usize,
        stride: usize,
        dilation: usize,
        device: &B::Device,
    ) -> Self {
        let depthwise = Conv2dConfig::new([c1, c1], [kernel_size, kernel_size])
            .with_stride([stride, stride])
            .with_dilation([dilation, dilation])
            .with_groups(c1)
            .with_padding(PaddingConfig2d::Valid)
            .with_bias(false)
            .init(device);

        let bn = BatchNorm2d::new(c1, device);

        let pointwise = Conv2dConfig::new([c1, c2], [1, 1])
            .with_bias(false)
            .init(device);

        Self {
            depthwise,
            bn,
            pointwise,
            kernel_size,
            dilation,
        }
    }

    pub fn forward(&self, xs: Tensor<B, 4>, mode: Mode) -> DfaNetResult<Tensor<B, 4>> {
        let xs = fixed_padding(xs, self.kernel_size, self.dilation);
        let xs = self.depthwise.forward(xs);
        let xs = self.bn.forward(xs, mode)?;
        Ok(self.pointwise.forward(xs))
    }
}

/// Convolutional block: Conv2d + BatchNorm + ReLU
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm2d<B>,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(
        c1: usize,
        c2: usize,
        k: usize,
        stride: usize,
        padding: Option<usize>,
        device: &B::Device,
    ) -> Self {
        let padding = padding.unwrap_or(k / 2);

        let conv = Conv2dConfig::new([c1, c2], [k, k])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_bias(false)
            .init(device);

        let bn = BatchNorm2d::new(c2, device);

        Self { conv, bn }
    }

    /// 1x1 projection block, used for every decoder-side channel reduction.
    pub fn pointwise(c1: usize, c2: usize, device: &B::Device) -> Self {
        Self::new(c1, c2, 1, 1, Some(0), device)
    }

    pub fn forward(&self, xs: Tensor<B, 4>, mode: Mode) -> DfaNetResult<Tensor<B, 4>> {
        let xs = self.conv.forward(xs);
        let xs = self.bn.forward(xs, mode)?;
        Ok(activation::relu(xs))
    }
}

/// Bilinear resize of the two spatial axes with half-pixel sampling.
pub fn resize_bilinear<B: Backend>(xs: Tensor<B, 4>, size: [usize; 2]) -> Tensor<B, 4> {
    let xs = lerp_axis(xs, 2, size[0]);
    lerp_axis(xs, 3, size[1])
}

fn lerp_axis<B: Backend>(xs: Tensor<B, 4>, dim: usize, out_len: usize) -> Tensor<B, 4> {
    let len = xs.dims()[dim];
    if len == out_len {
        return xs;
    }
    let device = xs.device();
    let (lo, hi, frac) = source_taps(len, out_len);

    let lo = Tensor::<B, 1, Int>::from_data(TensorData::new(lo, [out_len]), &device);
    let hi = Tensor::<B, 1, Int>::from_data(TensorData::new(hi, [out_len]), &device);
    let mut shape = [1; 4];
    shape[dim] = out_len;
    let frac = Tensor::<B, 1>::from_data(TensorData::new(frac, [out_len]), &device).reshape(shape);

    let near = xs.clone().select(dim, lo);
    let far = xs.select(dim, hi);
    near.clone() + (far - near) * frac
}

/// For every output index: the two source indices it blends and the weight of
/// the second one.
fn source_taps(len: usize, out_len: usize) -> (Vec<i64>, Vec<i64>, Vec<f32>) {
    let scale = len as f32 / out_len as f32;
    let mut lo = Vec::with_capacity(out_len);
    let mut hi = Vec::with_capacity(out_len);
    let mut frac = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src = ((i as f32 + 0.5) * scale - 0.5).max(0.0);
        let i0 = (src.floor() as usize).min(len - 1);
        let i1 = (i0 + 1).min(len - 1);
        lo.push(i0 as i64);
        hi.push(i1 as i64);
        frac.push(src - i0 as f32);
    }
    (lo, hi, frac)
}

pub(crate) fn ensure_same_shape<B: Backend, const D: usize>(
    op: &'static str,
    lhs: &Tensor<B, D>,
    rhs: &Tensor<B, D>,
) -> DfaNetResult<()> {
    let (l, r) = (lhs.dims(), rhs.dims());
    if l != r {
        return Err(DfaNetError::ShapeMismatch {
            op,
            lhs: l.to_vec(),
            rhs: r.to_vec(),
        });
    }
    Ok(())
}

/// Elementwise sum that reports a shape mismatch instead of panicking.
pub(crate) fn add_checked<B: Backend>(
    op: &'static str,
    lhs: Tensor<B, 4>,
    rhs: Tensor<B, 4>,
) -> DfaNetResult<Tensor<B, 4>> {
    ensure_same_shape(op, &lhs, &rhs)?;
    Ok(lhs + rhs)
}

/// Concatenates along the channel axis after checking batch and spatial sizes.
pub(crate) fn concat_channels<B: Backend>(
    op: &'static str,
    tensors: Vec<Tensor<B, 4>>,
) -> DfaNetResult<Tensor<B, 4>> {
    if let Some(first) = tensors.first() {
        let [b, _, h, w] = first.dims();
        for other in &tensors[1..] {
            let [ob, _, oh, ow] = other.dims();
            if (ob, oh, ow) != (b, h, w) {
                return Err(DfaNetError::ShapeMismatch {
                    op,
                    lhs: first.dims().to_vec(),
                    rhs: other.dims().to_vec(),
                });
            }
        }
    }
    Ok(Tensor::cat(tensors, 1))
}
