//! DFANet semantic segmentation Copper task with Burn backend

use crate::dfanet::{
    ChannelOrder, DfaNet, DfaNetConfig, class_histogram, image_to_tensor, labels_to_vec,
};
use crate::payloads::CuSegmentation;
use burn::module::Module;
use burn::tensor::backend::Backend;
use cu_sensor_payloads::CuImage;
use cu29::prelude::*;
use std::marker::PhantomData;

/// Cityscapes-style label set.
const DEFAULT_NUM_CLASSES: u32 = 19;

/// Total downsampling from the input to the deepest encoder output.
const OUTPUT_STRIDE: usize = 16;

fn is_stride_aligned(width: usize, height: usize) -> bool {
    width % OUTPUT_STRIDE == 0 && height % OUTPUT_STRIDE == 0
}

/// Semantic segmentation task using Burn framework
///
/// Runs each incoming camera image through DFANet in inference mode and
/// emits the per-pixel label map at the image's resolution.
/// Supports multiple backends: WGPU, CPU (NdArray), CUDA
pub struct DfaNetSegment<B: Backend> {
    model: DfaNet<B>,
    device: B::Device,
    num_classes: usize,
    _phantom: PhantomData<B>,
}

impl<B: Backend> Freezable for DfaNetSegment<B> {}

impl<B: Backend> CuTask for DfaNetSegment<B> {
    type Resources<'r> = ();
    type Input<'m> = input_msg!(CuImage<Vec<u8>>);
    type Output<'m> = output_msg!(CuSegmentation);

    fn new(config: Option<&ComponentConfig>, _resources: Self::Resources<'_>) -> CuResult<Self>
    where
        Self: Sized,
    {
        let num_classes = match config {
            Some(config) => config
                .get::<u32>("num_classes")?
                .unwrap_or(DEFAULT_NUM_CLASSES),
            None => DEFAULT_NUM_CLASSES,
        };
        if num_classes > u16::MAX as u32 + 1 {
            return Err(CuError::from(format!(
                "num_classes {} does not fit the u16 label payload",
                num_classes
            )));
        }

        let device = B::Device::default();

        info!("Initializing DFANet with {} classes", num_classes);

        let model = DfaNetConfig::new(num_classes as usize)
            .init::<B>(&device)
            .map_err(|e| CuError::new_with_cause("Failed to build DFANet", e))?;

        info!("DFANet ready: {} parameters", model.num_params());

        Ok(Self {
            model,
            device,
            num_classes: num_classes as usize,
            _phantom: PhantomData,
        })
    }

    fn process(
        &mut self,
        _clock: &RobotClock,
        input: &Self::Input<'_>,
        output: &mut Self::Output<'_>,
    ) -> CuResult<()> {
        let Some(image) = input.payload() else {
            output.clear_payload();
            return Ok(());
        };

        let width = image.format.width as usize;
        let height = image.format.height as usize;
        let stride = image.format.stride as usize;
        let order = ChannelOrder::from_fourcc(image.format.pixel_format);
        if !is_stride_aligned(width, height) {
            warning!(
                "DfaNetSegment: {}x{} frame is not a multiple of {}, borders are resampled",
                width,
                height,
                OUTPUT_STRIDE
            );
        }

        let tensor = image
            .buffer_handle
            .with_inner(|pixels| {
                image_to_tensor::<B>(&pixels[..], width, height, stride, order, &self.device)
            })
            .map_err(|e| CuError::new_with_cause("Failed to preprocess image", e))?;

        let labels = self
            .model
            .segment(tensor)
            .and_then(labels_to_vec)
            .map_err(|e| CuError::new_with_cause("DFANet inference failed", e))?;

        let histogram = class_histogram(&labels, self.num_classes);
        let dominant = histogram
            .iter()
            .enumerate()
            .max_by_key(|(_, count)| **count)
            .map(|(class, _)| class)
            .unwrap_or_default();
        debug!(
            "DfaNetSegment: {}x{} frame, dominant class {}",
            width, height, dominant
        );

        output.set_payload(CuSegmentation {
            width: image.format.width,
            height: image.format.height,
            num_classes: self.num_classes as u32,
            labels: labels.into_iter().map(|label| label as u16).collect(),
        });
        output.tov = input.tov;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::TestBackend;

    #[test]
    fn builds_with_default_classes_without_config() {
        let task = DfaNetSegment::<TestBackend>::new(None, ()).unwrap();
        assert_eq!(task.num_classes, DEFAULT_NUM_CLASSES as usize);
        assert_eq!(task.model.num_classes(), DEFAULT_NUM_CLASSES as usize);
    }

    #[test]
    fn frames_off_the_output_stride_are_flagged() {
        assert!(is_stride_aligned(640, 480));
        assert!(is_stride_aligned(2048, 1024));
        assert!(!is_stride_aligned(641, 480));
        assert!(!is_stride_aligned(640, 360));
    }
}
