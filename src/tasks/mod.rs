pub mod dfanet_segment;

#[cfg(feature = "wgpu")]
pub type DfaNetSegment = dfanet_segment::DfaNetSegment<burn::backend::wgpu::Wgpu>;

#[cfg(all(feature = "cuda", not(feature = "wgpu")))]
pub type DfaNetSegment = dfanet_segment::DfaNetSegment<burn::backend::Cuda>;

#[cfg(all(feature = "cpu", not(any(feature = "wgpu", feature = "cuda"))))]
pub type DfaNetSegment = dfanet_segment::DfaNetSegment<burn::backend::ndarray::NdArray>;
