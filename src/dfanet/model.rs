//! DFANet segmentation network implemented with Burn.
//!
//! Three encoder cascades share features stage by stage: every cascade after
//! the first consumes the previous cascade's attention output (upsampled) and
//! its per-stage features. The decoder fuses the first stage of each cascade
//! with all three attention outputs at the first stage's resolution.

use burn::config::Config;
use burn::module::Module;
use burn::nn::PaddingConfig2d;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::tensor::{Int, Tensor};
use burn::tensor::backend::Backend;

use super::attention::FcAttention;
use super::encoder::{EncoderStage, stage_channels};
use super::layers::{ConvBlock, Mode, add_checked, concat_channels, resize_bilinear};
use super::postprocess::class_map;
use crate::error::{DfaNetError, DfaNetResult};

const STEM_CHANNELS: usize = 8;

/// Construction parameters for [`DfaNet`].
#[derive(Config, Debug)]
pub struct DfaNetConfig {
    /// Number of output classes.
    pub num_classes: usize,
    /// Hidden width of the fully-connected attention heads.
    #[config(default = "1000")]
    pub attention_width: usize,
    /// Common channel width all decoder inputs are projected to.
    #[config(default = "32")]
    pub decoder_width: usize,
}

impl DfaNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> DfaNetResult<DfaNet<B>> {
        if self.num_classes == 0 {
            return Err(DfaNetError::InvalidConfig(
                "num_classes must be positive".to_string(),
            ));
        }
        if self.attention_width == 0 || self.decoder_width == 0 {
            return Err(DfaNetError::InvalidConfig(format!(
                "attention_width ({}) and decoder_width ({}) must be positive",
                self.attention_width, self.decoder_width
            )));
        }

        let stem = ConvBlock::new(3, STEM_CHANNELS, 3, 2, Some(1), device);
        let cascade_a = Cascade::new(false, self.attention_width, device)?;
        let cascade_b = Cascade::new(true, self.attention_width, device)?;
        let cascade_c = Cascade::new(true, self.attention_width, device)?;
        let decoder = Decoder::new(self.decoder_width, self.num_classes, device)?;

        Ok(DfaNet {
            stem,
            cascade_a,
            cascade_b,
            cascade_c,
            decoder,
            num_classes: self.num_classes,
        })
    }
}

/// Intermediate outputs of one cascade, consumed by the next cascade and the
/// decoder.
#[derive(Debug, Clone)]
pub struct CascadeFeatures<B: Backend> {
    pub enc2: Tensor<B, 4>,
    pub enc3: Tensor<B, 4>,
    pub enc4: Tensor<B, 4>,
    pub attention: Tensor<B, 4>,
}

impl<B: Backend> CascadeFeatures<B> {
    /// Attention output resized to this cascade's first stage, the input the
    /// next cascade starts from.
    pub fn upsampled_attention(&self) -> Tensor<B, 4> {
        let [_, _, h, w] = self.enc2.dims();
        resize_bilinear(self.attention.clone(), [h, w])
    }
}

/// One pass through encoder stages 2, 3, 4 followed by an attention head.
#[derive(Module, Debug)]
pub struct Cascade<B: Backend> {
    enc2: EncoderStage<B>,
    enc3: EncoderStage<B>,
    enc4: EncoderStage<B>,
    fca: FcAttention<B>,
    lateral: bool,
}

impl<B: Backend> Cascade<B> {
    /// Builds a cascade. A `lateral` cascade widens every stage input by the
    /// channels concatenated from the previous cascade.
    pub fn new(lateral: bool, attention_width: usize, device: &B::Device) -> DfaNetResult<Self> {
        let (c2, c3, c4) = (stage_channels(2)?, stage_channels(3)?, stage_channels(4)?);

        let (in2, in3, in4) = if lateral {
            (c4 + c2, c2 + c3, c3 + c4)
        } else {
            (STEM_CHANNELS, c2, c3)
        };

        Ok(Self {
            enc2: EncoderStage::new(in2, c2, 2, device)?,
            enc3: EncoderStage::new(in3, c3, 3, device)?,
            enc4: EncoderStage::new(in4, c4, 4, device)?,
            fca: FcAttention::new(c4, c4, attention_width, device),
            lateral,
        })
    }

    pub fn forward(
        &self,
        xs: Tensor<B, 4>,
        previous: Option<&CascadeFeatures<B>>,
        mode: Mode,
    ) -> DfaNetResult<CascadeFeatures<B>> {
        if self.lateral != previous.is_some() {
            return Err(DfaNetError::InvalidInput(format!(
                "cascade built {} lateral inputs was called {} them",
                if self.lateral { "with" } else { "without" },
                if previous.is_some() { "with" } else { "without" },
            )));
        }

        let fuse = |op: &'static str, xs: Tensor<B, 4>, lateral: Option<&Tensor<B, 4>>| {
            match lateral {
                Some(lateral) => concat_channels(op, vec![xs, lateral.clone()]),
                None => Ok(xs),
            }
        };

        let enc2 = self
            .enc2
            .forward(fuse("stage 2 fusion", xs, previous.map(|p| &p.enc2))?, mode)?;
        let enc3 = self.enc3.forward(
            fuse("stage 3 fusion", enc2.clone(), previous.map(|p| &p.enc3))?,
            mode,
        )?;
        let enc4 = self.enc4.forward(
            fuse("stage 4 fusion", enc3.clone(), previous.map(|p| &p.enc4))?,
            mode,
        )?;
        let attention = self.fca.forward(enc4.clone(), mode)?;

        Ok(CascadeFeatures {
            enc2,
            enc3,
            enc4,
            attention,
        })
    }
}

/// Multi-resolution fusion head.
#[derive(Module, Debug)]
pub struct Decoder<B: Backend> {
    enc2_reduce: [ConvBlock<B>; 3],
    fca_reduce: [ConvBlock<B>; 3],
    merge: ConvBlock<B>,
    classifier: Conv2d<B>,
}

impl<B: Backend> Decoder<B> {
    pub fn new(width: usize, num_classes: usize, device: &B::Device) -> DfaNetResult<Self> {
        let (c2, c4) = (stage_channels(2)?, stage_channels(4)?);

        let enc2_reduce = [0, 1, 2].map(|_| ConvBlock::pointwise(c2, width, device));
        let fca_reduce = [0, 1, 2].map(|_| ConvBlock::pointwise(c4, width, device));
        let merge = ConvBlock::pointwise(width, width, device);
        let classifier = Conv2dConfig::new([width, num_classes], [1, 1])
            .with_padding(PaddingConfig2d::Valid)
            .with_bias(false)
            .init(device);

        Ok(Self {
            enc2_reduce,
            fca_reduce,
            merge,
            classifier,
        })
    }

    /// Class scores at the resolution of the first cascade's stage 2.
    pub fn forward(
        &self,
        cascades: [&CascadeFeatures<B>; 3],
        mode: Mode,
    ) -> DfaNetResult<Tensor<B, 4>> {
        let mut low = self.enc2_reduce[0].forward(cascades[0].enc2.clone(), mode)?;
        let [_, _, h, w] = low.dims();

        for (reduce, features) in self.enc2_reduce.iter().zip(cascades).skip(1) {
            let ys = resize_bilinear(reduce.forward(features.enc2.clone(), mode)?, [h, w]);
            low = add_checked("decoder low-level sum", low, ys)?;
        }

        let mut fused = self.merge.forward(low, mode)?;
        for (reduce, features) in self.fca_reduce.iter().zip(cascades) {
            let ys = resize_bilinear(reduce.forward(features.attention.clone(), mode)?, [h, w]);
            fused = add_checked("decoder attention sum", fused, ys)?;
        }

        Ok(self.classifier.forward(fused))
    }
}

/// Complete DFANet model
#[derive(Module, Debug)]
pub struct DfaNet<B: Backend> {
    stem: ConvBlock<B>,
    cascade_a: Cascade<B>,
    cascade_b: Cascade<B>,
    cascade_c: Cascade<B>,
    decoder: Decoder<B>,
    num_classes: usize,
}

impl<B: Backend> DfaNet<B> {
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Unnormalized per-pixel class scores, `[batch, num_classes, height, width]`.
    pub fn forward(&self, xs: Tensor<B, 4>, mode: Mode) -> DfaNetResult<Tensor<B, 4>> {
        let [_, channels, height, width] = xs.dims();
        if channels != 3 {
            return Err(DfaNetError::InvalidInput(format!(
                "expected a 3-channel image tensor, got {channels} channels"
            )));
        }

        let stem = self.stem.forward(xs, mode)?;
        let a = self.cascade_a.forward(stem, None, mode)?;
        let b = self
            .cascade_b
            .forward(a.upsampled_attention(), Some(&a), mode)?;
        let c = self
            .cascade_c
            .forward(b.upsampled_attention(), Some(&b), mode)?;

        let scores = self.decoder.forward([&a, &b, &c], mode)?;
        Ok(resize_bilinear(scores, [height, width]))
    }

    /// Inference-mode forward reduced to a `[batch, height, width]` label map.
    pub fn segment(&self, xs: Tensor<B, 4>) -> DfaNetResult<Tensor<B, 3, Int>> {
        Ok(class_map(self.forward(xs, Mode::Eval)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::TestBackend;
    use burn::tensor::Distribution;

    type B = TestBackend;

    #[test]
    fn zero_classes_is_a_construction_error() {
        let device = Default::default();
        let err = DfaNetConfig::new(0).init::<B>(&device).unwrap_err();
        assert!(matches!(err, DfaNetError::InvalidConfig(_)));
    }

    #[test]
    fn cascade_widths_follow_concatenation() {
        let device = Default::default();
        let first = Cascade::<B>::new(false, 16, &device).unwrap();
        let second = Cascade::<B>::new(true, 16, &device).unwrap();

        let xs = Tensor::<B, 4>::random([1, STEM_CHANNELS, 64, 64], Distribution::Default, &device);
        let a = first.forward(xs, None, Mode::Eval).unwrap();
        assert_eq!(a.enc2.dims(), [1, 48, 32, 32]);
        assert_eq!(a.enc3.dims(), [1, 96, 16, 16]);
        assert_eq!(a.enc4.dims(), [1, 192, 8, 8]);
        assert_eq!(a.attention.dims(), [1, 192, 8, 8]);

        let up = a.upsampled_attention();
        assert_eq!(up.dims(), [1, 192, 32, 32]);

        let b = second.forward(up, Some(&a), Mode::Eval).unwrap();
        assert_eq!(b.enc2.dims(), [1, 48, 16, 16]);
        assert_eq!(b.enc3.dims(), [1, 96, 8, 8]);
        assert_eq!(b.enc4.dims(), [1, 192, 4, 4]);
    }

    #[test]
    fn cascade_rejects_missing_lateral_features() {
        let device = Default::default();
        let second = Cascade::<B>::new(true, 16, &device).unwrap();
        let xs = Tensor::<B, 4>::random([1, 240, 16, 16], Distribution::Default, &device);
        assert!(matches!(
            second.forward(xs, None, Mode::Eval),
            Err(DfaNetError::InvalidInput(_))
        ));
    }

    #[test]
    fn non_rgb_input_is_rejected() {
        let device = Default::default();
        let model = DfaNetConfig::new(4)
            .with_attention_width(16)
            .init::<B>(&device)
            .unwrap();
        let xs = Tensor::<B, 4>::random([1, 1, 64, 64], Distribution::Default, &device);
        assert!(matches!(
            model.forward(xs, Mode::Eval),
            Err(DfaNetError::InvalidInput(_))
        ));
    }

    #[test]
    fn train_mode_forward_keeps_output_shape() {
        let device = Default::default();
        let model = DfaNetConfig::new(5)
            .with_attention_width(16)
            .init::<B>(&device)
            .unwrap();
        let xs = Tensor::<B, 4>::random([2, 3, 64, 64], Distribution::Default, &device);
        let ys = model.forward(xs, Mode::Train).unwrap();
        assert_eq!(ys.dims(), [2, 5, 64, 64]);

        // A single image leaves the attention gates one value per channel.
        let xs = Tensor::<B, 4>::random([1, 3, 64, 64], Distribution::Default, &device);
        assert!(matches!(
            model.forward(xs, Mode::Train),
            Err(DfaNetError::SingleValueStatistics { .. })
        ));
    }

    #[test]
    fn default_widths_match_reference_layout() {
        let config = DfaNetConfig::new(19);
        assert_eq!(config.attention_width, 1000);
        assert_eq!(config.decoder_width, 32);
    }
}
