//! DFANet semantic segmentation on the Burn framework.
//!
//! The network maps a `[batch, 3, height, width]` image tensor to unnormalized
//! per-pixel class scores of shape `[batch, num_classes, height, width]`.
//! Build it from a [`DfaNetConfig`] and pick the normalization [`Mode`] on
//! every forward call.
//!
//! With the `copper` feature the model is also available as a Copper task
//! that turns camera frames into label maps.

pub mod dfanet;
mod error;

#[cfg(feature = "copper")]
pub mod payloads;
#[cfg(feature = "copper")]
pub mod tasks;

pub use dfanet::{DfaNet, DfaNetConfig, Mode};
pub use error::{DfaNetError, DfaNetResult};

#[cfg(test)]
mod tests {
    pub type TestBackend = burn::backend::ndarray::NdArray;
}
