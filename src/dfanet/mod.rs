pub mod attention;
pub mod encoder;
pub mod layers;
pub mod model;
pub mod postprocess;
pub mod preprocess;

pub use layers::Mode;
pub use model::{DfaNet, DfaNetConfig};
pub use postprocess::{class_histogram, class_map, labels_to_vec};
pub use preprocess::{ChannelOrder, image_to_tensor};
