use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Per-pixel class labels for one frame, row-major.
#[derive(Default, Debug, Clone, PartialEq, Encode, Decode, Serialize, Deserialize)]
pub struct CuSegmentation {
    pub width: u32,
    pub height: u32,
    pub num_classes: u32,
    pub labels: Vec<u16>,
}

impl CuSegmentation {
    pub fn label_at(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.labels
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_lookup_is_row_major() {
        let seg = CuSegmentation {
            width: 3,
            height: 2,
            num_classes: 4,
            labels: vec![0, 1, 2, 3, 0, 1],
        };
        assert_eq!(seg.label_at(2, 0), Some(2));
        assert_eq!(seg.label_at(0, 1), Some(3));
        assert_eq!(seg.label_at(3, 0), None);
    }
}
