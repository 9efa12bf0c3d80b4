//! Score tensors to label maps.

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

use crate::error::{DfaNetError, DfaNetResult};

/// Highest-scoring class per pixel: `[b, k, h, w]` scores to `[b, h, w]` labels.
pub fn class_map<B: Backend>(scores: Tensor<B, 4>) -> Tensor<B, 3, Int> {
    let [batch, _, height, width] = scores.dims();
    scores.argmax(1).reshape([batch, height, width])
}

/// Copies a label tensor to the host in row-major order.
pub fn labels_to_vec<B: Backend, const D: usize>(labels: Tensor<B, D, Int>) -> DfaNetResult<Vec<i64>> {
    labels
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|e| DfaNetError::TensorData(format!("{e:?}")))
}

/// Pixel count per class. Labels outside `0..num_classes` are not counted.
pub fn class_histogram(labels: &[i64], num_classes: usize) -> Vec<usize> {
    let mut counts = vec![0; num_classes];
    for &label in labels {
        if let Ok(index) = usize::try_from(label) {
            if index < num_classes {
                counts[index] += 1;
            }
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::TestBackend;
    use burn::tensor::TensorData;

    type B = TestBackend;

    #[test]
    fn argmax_over_class_axis() {
        let device = Default::default();
        // Two classes over a 1x3 image.
        let scores = Tensor::<B, 4>::from_data(
            TensorData::new(vec![0.1f32, 0.9, -1.0, 0.5, 0.2, 3.0], [1, 2, 1, 3]),
            &device,
        );
        let labels = class_map(scores);
        assert_eq!(labels.dims(), [1, 1, 3]);
        assert_eq!(labels_to_vec(labels).unwrap(), vec![1, 0, 1]);
    }

    #[test]
    fn histogram_skips_out_of_range_labels() {
        assert_eq!(class_histogram(&[0, 2, 2, 5, -1, 1], 3), vec![1, 1, 2]);
        assert_eq!(class_histogram(&[], 2), vec![0, 0]);
    }
}
