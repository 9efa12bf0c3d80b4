//! Packed 8-bit image buffers to network input tensors.

use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};

use crate::error::{DfaNetError, DfaNetResult};

/// Byte order of the three colour channels in a packed pixel.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

impl ChannelOrder {
    /// Reads the order from a V4L2-style fourcc such as `RGB3` or `BGR3`.
    pub fn from_fourcc(fourcc: [u8; 4]) -> Self {
        if fourcc.starts_with(b"BGR") {
            ChannelOrder::Bgr
        } else {
            ChannelOrder::Rgb
        }
    }

    fn source_offsets(self) -> [usize; 3] {
        match self {
            ChannelOrder::Rgb => [0, 1, 2],
            ChannelOrder::Bgr => [2, 1, 0],
        }
    }
}

/// Converts packed 3-byte pixels into a `[1, 3, height, width]` RGB tensor in
/// `[0, 1]`. `stride` is the length of one row in bytes.
pub fn image_to_tensor<B: Backend>(
    pixels: &[u8],
    width: usize,
    height: usize,
    stride: usize,
    order: ChannelOrder,
    device: &B::Device,
) -> DfaNetResult<Tensor<B, 4>> {
    if width == 0 || height == 0 {
        return Err(DfaNetError::InvalidInput(format!(
            "empty image {width}x{height}"
        )));
    }
    if stride < width * 3 {
        return Err(DfaNetError::InvalidInput(format!(
            "row stride {stride} is shorter than {width} packed pixels"
        )));
    }
    let needed = stride * (height - 1) + width * 3;
    if pixels.len() < needed {
        return Err(DfaNetError::InvalidInput(format!(
            "buffer holds {} bytes, {width}x{height} with stride {stride} needs {needed}",
            pixels.len()
        )));
    }

    let plane = width * height;
    let mut data = vec![0.0f32; 3 * plane];
    for (channel, offset) in order.source_offsets().into_iter().enumerate() {
        let out = &mut data[channel * plane..(channel + 1) * plane];
        for y in 0..height {
            let row = &pixels[y * stride..];
            for x in 0..width {
                out[y * width + x] = row[x * 3 + offset] as f32 / 255.0;
            }
        }
    }

    Ok(Tensor::from_data(
        TensorData::new(data, [1, 3, height, width]),
        device,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::TestBackend;

    type B = TestBackend;

    #[test]
    fn fourcc_selects_channel_order() {
        assert_eq!(ChannelOrder::from_fourcc(*b"BGR3"), ChannelOrder::Bgr);
        assert_eq!(ChannelOrder::from_fourcc(*b"RGB3"), ChannelOrder::Rgb);
    }

    #[test]
    fn planes_are_rgb_and_scaled() {
        let device = Default::default();
        // 2x1 image, BGR, one padding byte per row.
        let pixels = [255, 0, 51, 0, 102, 0, 9];
        let xs = image_to_tensor::<B>(&pixels, 2, 1, 7, ChannelOrder::Bgr, &device).unwrap();
        assert_eq!(xs.dims(), [1, 3, 1, 2]);

        let values = xs.into_data().to_vec::<f32>().unwrap();
        let expected = [0.2, 0.0, 0.0, 0.4, 1.0, 0.0];
        for (got, want) in values.iter().zip(expected) {
            assert!((got - want).abs() < 1e-6, "{values:?}");
        }
    }

    #[test]
    fn short_buffers_and_strides_are_rejected() {
        let device = Default::default();
        let pixels = [0u8; 10];
        assert!(image_to_tensor::<B>(&pixels, 2, 2, 5, ChannelOrder::Rgb, &device).is_err());
        assert!(image_to_tensor::<B>(&pixels, 2, 2, 6, ChannelOrder::Rgb, &device).is_err());
        assert!(image_to_tensor::<B>(&pixels, 0, 2, 6, ChannelOrder::Rgb, &device).is_err());
    }
}
