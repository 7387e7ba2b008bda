pub mod init_config;
pub mod plan;

#[cfg(feature = "wgpu")]
pub type Backend = burn::backend::Wgpu;

#[cfg(all(feature = "torch", not(feature = "wgpu")))]
pub type Backend = burn::backend::LibTorch<f32>;

#[cfg(all(feature = "ndarray", not(any(feature = "torch", feature = "wgpu"))))]
pub type Backend = burn::backend::NdArray<f32>;
