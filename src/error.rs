//! Error types shared by the network modules and the runtime task.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type DfaNetResult<T> = Result<T, DfaNetError>;

#[derive(Debug, Error)]
pub enum DfaNetError {
    /// Two tensors meeting at a sum or concatenation disagree in shape.
    #[error("shape mismatch in {op}: {lhs:?} vs {rhs:?}")]
    ShapeMismatch {
        op: &'static str,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },

    #[error("invalid encoder stage {0}, expected 2, 3 or 4")]
    InvalidStage(usize),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The attention gate rescales the pooled tensor itself, so widths must agree.
    #[error("attention head maps {input} channels to {output}, gate cannot be applied")]
    AttentionChannels { input: usize, output: usize },

    /// Train-mode normalization needs more than one value per channel.
    #[error("expected more than 1 value per channel when training, got input {shape:?}")]
    SingleValueStatistics { shape: Vec<usize> },

    #[error("failed to read tensor data: {0}")]
    TensorData(String),
}
