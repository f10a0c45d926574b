// strata-cuda: GPU transformer backend
//
// Lowered execution units become CUDA kernels. Runs of elementwise and
// reduction steps are generated as one fused kernel each and compiled
// with NVRTC; dot, convolution and pooling go to a small native library
// compiled once per device. Buffers are untyped device bytes, so views
// of any dtype can share one planned buffer exactly as they do on the
// host.
//
// Code generation and launch planning (codegen, kernel, kernels, memory)
// need no GPU and are always built. The backend itself sits behind the
// `cuda` feature:
//
//   let backend = GpuBackend::new(GpuConfig::default())?;
//   let mut t = Transformer::new(graph, backend, TransformerConfig::default());

pub mod codegen;
pub mod kernel;
pub mod kernels;
pub mod memory;

#[cfg(feature = "cuda")]
pub mod device;

pub use codegen::{Generated, KernelCache, Schedule, Slot, View};
pub use kernel::{launch_dims, Arg, Bound, GpuKernel, Launch, LaunchShape, Task};

#[cfg(feature = "cuda")]
pub use device::{GpuBackend, GpuProgram};

/// Device selection and launch settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuConfig {
    /// CUDA device ordinal.
    pub ordinal: usize,
    /// Threads per block for grid-stride launches.
    pub block_size: u32,
}

impl Default for GpuConfig {
    fn default() -> Self {
        GpuConfig {
            ordinal: 0,
            block_size: 256,
        }
    }
}

impl GpuConfig {
    pub fn with_ordinal(mut self, ordinal: usize) -> Self {
        self.ordinal = ordinal;
        self
    }

    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }
}
