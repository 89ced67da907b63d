//! Differentiable 2D convolution.
//!
//! [`ConvolutionOperator`] runs one convolution forward and, later, the
//! backward pass for it. Forward routes to an accelerated backend when it
//! accepts the input, otherwise to the im2col fallback; backward reuses the
//! same route and only computes the gradients asked for.

pub mod config;
pub mod dtype;
pub mod error;
pub mod shape;
pub mod tensor;
pub mod backend;
pub mod conv;
pub mod gemm;
pub mod mm;
// Multi-threaded direct kernels, feature-gated
#[cfg(feature = "accelerated")]
pub mod direct;
pub mod nn;

pub use backend::{BackendKind, BackendSet, FallbackBackend, SpecializedBackend};
pub use config::{is_accelerated_available, set_accelerated, should_use_accelerated, EmberConfig};
pub use conv::{
    output_size, ConvGradients, ConvParams, ConvolutionOperator, GradSlot, NeedsGrad, Workspaces,
};
pub use dtype::DType;
pub use error::EmberError as Error;
pub use error::{EmberError, Result};
pub use nn::{Conv2d, Conv2dConfig};
pub use shape::Shape;
pub use tensor::{Tensor, TensorId};

/// Initialize EMBER from the environment.
/// Called automatically when EMBER is loaded.
pub fn init() {
    // EMBER_DISABLE_ACCEL=1 routes every convolution to the im2col fallback.
    EmberConfig::from_env().apply();
}

// Automatically initialize on load
#[ctor::ctor]
fn auto_init() {
    init();
}
