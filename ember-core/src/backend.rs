//! Convolution backend contracts
//!
//! The operator in [`crate::conv`] drives two kinds of kernels:
//!
//! - a **specialized** backend that owns its scratch memory, supports grouped
//!   convolution, and only accepts some tensors;
//! - a **fallback** backend, always available, formulated as matrix products
//!   over an unfolded input. It needs two caller-owned workspaces that are
//!   written in the forward pass and read again in the backward pass.
//!
//! Fallback entry points take kernel size, stride and padding as separate
//! scalars, **width before height**, the same order as the classic
//! `SpatialConvolutionMM` kernels.

use crate::conv::ConvParams;
use crate::{Result, Tensor};
use std::sync::Arc;

/// Accelerated backend with device or dtype preconditions.
pub trait SpecializedBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this backend can run a convolution whose input is `tensor`.
    fn accepts(&self, tensor: &Tensor) -> bool;

    /// Write the convolution of `input` with `weight` (plus `bias`) into
    /// `output`, which is already allocated with the resolved output shape.
    fn forward(
        &self,
        params: &ConvParams,
        input: &Tensor,
        weight: &Tensor,
        bias: Option<&Tensor>,
        output: &mut Tensor,
    ) -> Result<()>;

    /// Gradient with respect to the input.
    fn backward_data(
        &self,
        params: &ConvParams,
        grad_output: &Tensor,
        input: &Tensor,
        weight: &Tensor,
    ) -> Result<Tensor>;

    /// Gradient with respect to the weight (filter).
    fn backward_filter(
        &self,
        params: &ConvParams,
        grad_output: &Tensor,
        input: &Tensor,
        weight: &Tensor,
    ) -> Result<Tensor>;

    /// Gradient with respect to the bias; `bias` only provides the shape.
    fn backward_bias(
        &self,
        params: &ConvParams,
        grad_output: &Tensor,
        bias: &Tensor,
    ) -> Result<Tensor>;
}

/// Always-available backend; ungrouped convolution only.
#[allow(clippy::too_many_arguments)]
pub trait FallbackBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn update_output(
        &self,
        input: &Tensor,
        output: &mut Tensor,
        weight: &Tensor,
        bias: Option<&Tensor>,
        finput: &mut Tensor,
        fgrad_input: &mut Tensor,
        kernel_w: usize,
        kernel_h: usize,
        stride_w: usize,
        stride_h: usize,
        pad_w: usize,
        pad_h: usize,
    ) -> Result<()>;

    /// Accumulate the input gradient into `grad_input` (zeroed by the caller).
    fn update_grad_input(
        &self,
        input: &Tensor,
        grad_output: &Tensor,
        grad_input: &mut Tensor,
        weight: &Tensor,
        finput: &mut Tensor,
        fgrad_input: &mut Tensor,
        kernel_w: usize,
        kernel_h: usize,
        stride_w: usize,
        stride_h: usize,
        pad_w: usize,
        pad_h: usize,
    ) -> Result<()>;

    /// Accumulate `scale` times the weight gradient, and the bias gradient
    /// when `grad_bias` is given, in a single pass.
    fn acc_grad_parameters(
        &self,
        input: &Tensor,
        grad_output: &Tensor,
        grad_weight: &mut Tensor,
        grad_bias: Option<&mut Tensor>,
        finput: &mut Tensor,
        fgrad_input: &mut Tensor,
        kernel_w: usize,
        kernel_h: usize,
        stride_w: usize,
        stride_h: usize,
        pad_w: usize,
        pad_h: usize,
        scale: f32,
    ) -> Result<()>;
}

/// Which backend ran a forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Specialized,
    Fallback,
}

/// One backend of each kind, shared between operators.
#[derive(Clone)]
pub struct BackendSet {
    pub specialized: Arc<dyn SpecializedBackend>,
    pub fallback: Arc<dyn FallbackBackend>,
}

impl BackendSet {
    pub fn new(
        specialized: Arc<dyn SpecializedBackend>,
        fallback: Arc<dyn FallbackBackend>,
    ) -> Self {
        Self { specialized, fallback }
    }

    /// Reference backends; the specialized one follows the global switch in
    /// [`crate::config`] at the time of each `accepts` call.
    pub fn reference() -> Self {
        Self::new(default_specialized(), Arc::new(crate::mm::MmBackend))
    }

    /// Reference backends with the specialized one forced on or off,
    /// independent of the global switch.
    pub fn reference_with_accelerated(enabled: bool) -> Self {
        Self::new(fixed_specialized(enabled), Arc::new(crate::mm::MmBackend))
    }

    /// Route everything to the fallback.
    pub fn fallback_only() -> Self {
        Self::reference_with_accelerated(false)
    }
}

impl Default for BackendSet {
    fn default() -> Self {
        Self::reference()
    }
}

impl std::fmt::Debug for BackendSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSet")
            .field("specialized", &self.specialized.name())
            .field("fallback", &self.fallback.name())
            .finish()
    }
}

#[cfg(feature = "accelerated")]
fn default_specialized() -> Arc<dyn SpecializedBackend> {
    Arc::new(crate::direct::DirectBackend::new())
}

#[cfg(feature = "accelerated")]
fn fixed_specialized(enabled: bool) -> Arc<dyn SpecializedBackend> {
    Arc::new(crate::direct::DirectBackend::with_enabled(enabled))
}

#[cfg(not(feature = "accelerated"))]
fn default_specialized() -> Arc<dyn SpecializedBackend> {
    Arc::new(Unavailable)
}

#[cfg(not(feature = "accelerated"))]
fn fixed_specialized(_enabled: bool) -> Arc<dyn SpecializedBackend> {
    Arc::new(Unavailable)
}

/// Stand-in when the accelerated kernels are not compiled in; never accepts.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unavailable;

impl SpecializedBackend for Unavailable {
    fn name(&self) -> &'static str {
        "unavailable"
    }

    fn accepts(&self, _tensor: &Tensor) -> bool {
        false
    }

    fn forward(
        &self,
        _: &ConvParams,
        _: &Tensor,
        _: &Tensor,
        _: Option<&Tensor>,
        _: &mut Tensor,
    ) -> Result<()> {
        Err(unavailable())
    }

    fn backward_data(&self, _: &ConvParams, _: &Tensor, _: &Tensor, _: &Tensor) -> Result<Tensor> {
        Err(unavailable())
    }

    fn backward_filter(
        &self,
        _: &ConvParams,
        _: &Tensor,
        _: &Tensor,
        _: &Tensor,
    ) -> Result<Tensor> {
        Err(unavailable())
    }

    fn backward_bias(&self, _: &ConvParams, _: &Tensor, _: &Tensor) -> Result<Tensor> {
        Err(unavailable())
    }
}

fn unavailable() -> crate::EmberError {
    crate::EmberError::Backend("accelerated kernels are not compiled in".into())
}
