//! 2D convolution operator node
//!
//! A [`ConvolutionOperator`] is created for one application of a convolution:
//! `forward` once, then at most one `backward`. Forward picks a backend from
//! the input tensor and remembers the choice; backward dispatches on that
//! remembered choice and computes only the gradients the caller asks for.

use crate::backend::{BackendKind, BackendSet, FallbackBackend, SpecializedBackend};
use crate::{EmberError, Result, Shape, Tensor};

/// Stride, padding and group count of a convolution. Pairs are (height, width).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvParams {
    pub stride: (usize, usize),
    pub padding: (usize, usize),
    pub groups: usize,
}

impl ConvParams {
    pub fn new(stride: (usize, usize), padding: (usize, usize), groups: usize) -> Result<Self> {
        if stride.0 == 0 || stride.1 == 0 {
            return Err(EmberError::UnsupportedConfiguration(format!(
                "stride must be positive, got {:?}",
                stride
            )));
        }
        if groups == 0 {
            return Err(EmberError::UnsupportedConfiguration(
                "groups must be positive".into(),
            ));
        }
        Ok(Self { stride, padding, groups })
    }
}

impl Default for ConvParams {
    fn default() -> Self {
        Self {
            stride: (1, 1),
            padding: (0, 0),
            groups: 1,
        }
    }
}

/// `size + 2 * pad`, erroring instead of overflowing.
pub(crate) fn padded_extent(size: usize, pad: usize) -> Result<usize> {
    pad.checked_mul(2)
        .and_then(|p| p.checked_add(size))
        .ok_or_else(|| {
            EmberError::UnsupportedConfiguration(format!(
                "padding {} overflows the padded extent of size {}",
                pad, size
            ))
        })
}

/// Output shape `(N, C_out, H_out, W_out)` of a strided, padded convolution.
///
/// `H_out = floor((H + 2*pad_h - KH) / stride_h) + 1`, likewise for width.
/// A kernel larger than the padded input gives a zero extent rather than
/// wrapping; rejecting such shapes is left to the backend.
pub fn output_size(
    input: &Shape,
    weight: &Shape,
    stride: (usize, usize),
    padding: (usize, usize),
) -> Result<(usize, usize, usize, usize)> {
    let (n, _, h, w) = input.dims4()?;
    let (c_out, _, kh, kw) = weight.dims4()?;
    if stride.0 == 0 || stride.1 == 0 {
        return Err(EmberError::UnsupportedConfiguration(format!(
            "stride must be positive, got {:?}",
            stride
        )));
    }
    let extent = |size: usize, pad: usize, k: usize, s: usize| -> Result<usize> {
        let padded = padded_extent(size, pad)?;
        Ok(if padded < k { 0 } else { (padded - k) / s + 1 })
    };
    Ok((
        n,
        c_out,
        extent(h, padding.0, kh, stride.0)?,
        extent(w, padding.1, kw, stride.1)?,
    ))
}

/// Which gradients the caller wants from `backward`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NeedsGrad {
    pub input: bool,
    pub weight: bool,
    pub bias: bool,
}

impl NeedsGrad {
    pub const fn all() -> Self {
        Self { input: true, weight: true, bias: true }
    }

    pub const fn none() -> Self {
        Self { input: false, weight: false, bias: false }
    }

    /// Derive the request from the `requires_grad` flags of the forward arguments.
    pub fn from_inputs(input: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> Self {
        Self {
            input: input.requires_grad(),
            weight: weight.requires_grad(),
            bias: bias.map(|b| b.requires_grad()).unwrap_or(false),
        }
    }
}

impl From<[bool; 3]> for NeedsGrad {
    fn from(flags: [bool; 3]) -> Self {
        Self { input: flags[0], weight: flags[1], bias: flags[2] }
    }
}

/// Outcome of one gradient slot.
///
/// `NotRequested` means no gradient was produced; it is not the same as a
/// computed gradient that happens to be zero.
#[derive(Debug, Clone)]
pub enum GradSlot {
    NotRequested,
    Computed(Tensor),
    Failed(EmberError),
}

impl GradSlot {
    fn from_result(result: Result<Tensor>) -> Self {
        match result {
            Ok(t) => GradSlot::Computed(t),
            Err(e) => GradSlot::Failed(e),
        }
    }

    pub fn tensor(&self) -> Option<&Tensor> {
        match self {
            GradSlot::Computed(t) => Some(t),
            _ => None,
        }
    }

    pub fn into_tensor(self) -> Option<Tensor> {
        match self {
            GradSlot::Computed(t) => Some(t),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&EmberError> {
        match self {
            GradSlot::Failed(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_computed(&self) -> bool {
        matches!(self, GradSlot::Computed(_))
    }

    pub fn is_requested(&self) -> bool {
        !matches!(self, GradSlot::NotRequested)
    }

    /// `Ok(None)` when not requested, the tensor when computed, the error otherwise.
    pub fn into_result(self) -> Result<Option<Tensor>> {
        match self {
            GradSlot::NotRequested => Ok(None),
            GradSlot::Computed(t) => Ok(Some(t)),
            GradSlot::Failed(e) => Err(e),
        }
    }
}

/// Gradients in argument order. `grad_bias` is `None` when forward ran
/// without a bias, so there is no slot for it at all.
#[derive(Debug, Clone)]
pub struct ConvGradients {
    pub grad_input: GradSlot,
    pub grad_weight: GradSlot,
    pub grad_bias: Option<GradSlot>,
}

impl ConvGradients {
    /// 2 without a bias slot, 3 with one.
    pub fn arity(&self) -> usize {
        if self.grad_bias.is_some() {
            3
        } else {
            2
        }
    }

    pub fn first_error(&self) -> Option<&EmberError> {
        self.grad_input
            .error()
            .or_else(|| self.grad_weight.error())
            .or_else(|| self.grad_bias.as_ref().and_then(GradSlot::error))
    }
}

/// Scratch buffers of the fallback backend, kept from forward to backward.
#[derive(Debug)]
pub struct Workspaces {
    /// Unfolded input columns.
    pub finput: Tensor,
    /// Column gradient buffer.
    pub fgrad_input: Tensor,
}

enum Route {
    Specialized,
    Fallback(Workspaces),
}

impl Route {
    fn kind(&self) -> BackendKind {
        match self {
            Route::Specialized => BackendKind::Specialized,
            Route::Fallback(_) => BackendKind::Fallback,
        }
    }
}

struct Saved {
    input: Tensor,
    weight: Tensor,
    bias: Option<Tensor>,
    route: Route,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Created,
    Forwarded,
    Finished,
}

/// One convolution application: forward, then at most one backward.
pub struct ConvolutionOperator {
    params: ConvParams,
    backends: BackendSet,
    stage: Stage,
    saved: Option<Saved>,
}

impl std::fmt::Debug for ConvolutionOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvolutionOperator")
            .field("params", &self.params)
            .field("backends", &self.backends)
            .field("stage", &self.stage)
            .field("backend", &self.backend_kind())
            .finish()
    }
}

impl ConvolutionOperator {
    /// Operator using the reference backends.
    pub fn new(stride: (usize, usize), padding: (usize, usize), groups: usize) -> Result<Self> {
        Ok(Self::with_backends(
            ConvParams::new(stride, padding, groups)?,
            BackendSet::default(),
        ))
    }

    pub fn with_backends(params: ConvParams, backends: BackendSet) -> Self {
        Self {
            params,
            backends,
            stage: Stage::Created,
            saved: None,
        }
    }

    pub fn params(&self) -> &ConvParams {
        &self.params
    }

    pub fn stride(&self) -> (usize, usize) {
        self.params.stride
    }

    pub fn padding(&self) -> (usize, usize) {
        self.params.padding
    }

    pub fn groups(&self) -> usize {
        self.params.groups
    }

    /// Backend chosen by forward, if forward has run.
    pub fn backend_kind(&self) -> Option<BackendKind> {
        self.saved.as_ref().map(|s| s.route.kind())
    }

    /// Fallback workspaces; `None` unless forward ran on the fallback.
    pub fn workspaces(&self) -> Option<&Workspaces> {
        match self.saved.as_ref().map(|s| &s.route) {
            Some(Route::Fallback(ws)) => Some(ws),
            _ => None,
        }
    }

    pub fn saved_input(&self) -> Option<&Tensor> {
        self.saved.as_ref().map(|s| &s.input)
    }

    pub fn saved_weight(&self) -> Option<&Tensor> {
        self.saved.as_ref().map(|s| &s.weight)
    }

    pub fn saved_bias(&self) -> Option<&Tensor> {
        self.saved.as_ref().and_then(|s| s.bias.as_ref())
    }

    /// Output shape this operator produces for `input` and `weight`.
    pub fn output_size(
        &self,
        input: &Tensor,
        weight: &Tensor,
    ) -> Result<(usize, usize, usize, usize)> {
        output_size(input.shape(), weight.shape(), self.params.stride, self.params.padding)
    }

    /// Run the convolution and keep what backward needs.
    pub fn forward(
        &mut self,
        input: &Tensor,
        weight: &Tensor,
        bias: Option<&Tensor>,
    ) -> Result<Tensor> {
        if self.stage != Stage::Created {
            return Err(EmberError::InvalidState(
                "forward called twice on one convolution operator".into(),
            ));
        }

        let specialized = self.backends.specialized.accepts(input);
        if !specialized && self.params.groups != 1 {
            return Err(EmberError::UnsupportedConfiguration(format!(
                "{} backend does not support grouped convolution (groups = {})",
                self.backends.fallback.name(),
                self.params.groups
            )));
        }

        let (n, c_out, h_out, w_out) = self.output_size(input, weight)?;
        let mut output = Tensor::zeros_dtype(Shape::from([n, c_out, h_out, w_out]), input.dtype());

        let result = if specialized {
            log::debug!(
                "conv2d forward on {} backend: input {} weight {} -> {}",
                self.backends.specialized.name(),
                input.shape(),
                weight.shape(),
                output.shape()
            );
            self.backends
                .specialized
                .forward(&self.params, input, weight, bias, &mut output)
                .map(|_| Route::Specialized)
        } else {
            log::debug!(
                "conv2d forward on {} backend: input {} weight {} -> {}",
                self.backends.fallback.name(),
                input.shape(),
                weight.shape(),
                output.shape()
            );
            let mut finput = input.new_like();
            let mut fgrad_input = input.new_like();
            let (kw, kh, dw, dh, pw, ph) = mm_geometry(&self.params, weight)?;
            self.backends
                .fallback
                .update_output(
                    input,
                    &mut output,
                    weight,
                    bias,
                    &mut finput,
                    &mut fgrad_input,
                    kw,
                    kh,
                    dw,
                    dh,
                    pw,
                    ph,
                )
                .map(|_| Route::Fallback(Workspaces { finput, fgrad_input }))
        };

        let route = match result {
            Ok(route) => route,
            Err(e) => {
                self.stage = Stage::Finished;
                return Err(e);
            }
        };

        self.saved = Some(Saved {
            input: input.clone(),
            weight: weight.clone(),
            bias: bias.cloned(),
            route,
        });
        self.stage = Stage::Forwarded;
        Ok(output)
    }

    /// Compute the requested gradients. Each slot succeeds or fails on its own.
    pub fn backward(&mut self, grad_output: &Tensor, needs: NeedsGrad) -> Result<ConvGradients> {
        match self.stage {
            Stage::Forwarded => {}
            Stage::Created => {
                return Err(EmberError::InvalidState(
                    "backward called before forward".into(),
                ))
            }
            Stage::Finished => {
                return Err(EmberError::InvalidState(
                    "backward called on a finished convolution operator".into(),
                ))
            }
        }
        self.stage = Stage::Finished;

        let saved = self
            .saved
            .as_mut()
            .ok_or_else(|| EmberError::InvalidState("forward state missing".into()))?;
        let Saved { input, weight, bias, route } = saved;

        let grads = match route {
            Route::Specialized => specialized_backward(
                self.backends.specialized.as_ref(),
                &self.params,
                grad_output,
                input,
                weight,
                bias.as_ref(),
                needs,
            ),
            Route::Fallback(ws) => fallback_backward(
                self.backends.fallback.as_ref(),
                &self.params,
                grad_output,
                input,
                weight,
                bias.as_ref(),
                ws,
                needs,
            )?,
        };

        if let Some(e) = grads.first_error() {
            log::warn!("conv2d backward finished with a failed gradient slot: {}", e);
        }
        Ok(grads)
    }
}

/// Kernel size, stride and padding in fallback argument order:
/// `(kW, kH, dW, dH, padW, padH)`.
fn mm_geometry(
    params: &ConvParams,
    weight: &Tensor,
) -> Result<(usize, usize, usize, usize, usize, usize)> {
    let kw = weight.size(3)?;
    let kh = weight.size(2)?;
    Ok((
        kw,
        kh,
        params.stride.1,
        params.stride.0,
        params.padding.1,
        params.padding.0,
    ))
}

fn specialized_backward(
    backend: &dyn SpecializedBackend,
    params: &ConvParams,
    grad_output: &Tensor,
    input: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    needs: NeedsGrad,
) -> ConvGradients {
    let grad_input = if needs.input {
        GradSlot::from_result(backend.backward_data(params, grad_output, input, weight))
    } else {
        GradSlot::NotRequested
    };
    let grad_weight = if needs.weight {
        GradSlot::from_result(backend.backward_filter(params, grad_output, input, weight))
    } else {
        GradSlot::NotRequested
    };
    let grad_bias = bias.map(|b| {
        if needs.bias {
            GradSlot::from_result(backend.backward_bias(params, grad_output, b))
        } else {
            GradSlot::NotRequested
        }
    });
    ConvGradients { grad_input, grad_weight, grad_bias }
}

#[allow(clippy::too_many_arguments)]
fn fallback_backward(
    backend: &dyn FallbackBackend,
    params: &ConvParams,
    grad_output: &Tensor,
    input: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    ws: &mut Workspaces,
    needs: NeedsGrad,
) -> Result<ConvGradients> {
    let (kw, kh, dw, dh, pw, ph) = mm_geometry(params, weight)?;
    log::trace!(
        "conv2d fallback backward: kernel {}x{} stride {}x{} pad {}x{} (w x h)",
        kw, kh, dw, dh, pw, ph
    );

    let grad_input = if needs.input {
        let mut grad_input = input.new_like();
        grad_input.resize_as_(input).zero_();
        GradSlot::from_result(
            backend
                .update_grad_input(
                    input,
                    grad_output,
                    &mut grad_input,
                    weight,
                    &mut ws.finput,
                    &mut ws.fgrad_input,
                    kw,
                    kh,
                    dw,
                    dh,
                    pw,
                    ph,
                )
                .map(|_| grad_input),
        )
    } else {
        GradSlot::NotRequested
    };

    let bias_wanted = bias.is_some() && needs.bias;
    let (grad_weight, bias_slot) = if needs.weight || bias_wanted {
        let mut grad_weight = weight.new_like();
        grad_weight.resize_as_(weight).zero_();
        let mut grad_bias = match bias {
            Some(b) if bias_wanted => {
                let mut g = b.new_like();
                g.resize_as_(b).zero_();
                Some(g)
            }
            _ => None,
        };
        // Weight and bias gradients come out of one kernel call.
        match backend.acc_grad_parameters(
            input,
            grad_output,
            &mut grad_weight,
            grad_bias.as_mut(),
            &mut ws.finput,
            &mut ws.fgrad_input,
            kw,
            kh,
            dw,
            dh,
            pw,
            ph,
            1.0,
        ) {
            Ok(()) => (
                GradSlot::Computed(grad_weight),
                grad_bias.map_or(GradSlot::NotRequested, GradSlot::Computed),
            ),
            Err(e) => {
                let bias_slot = if bias_wanted {
                    GradSlot::Failed(e.clone())
                } else {
                    GradSlot::NotRequested
                };
                (GradSlot::Failed(e), bias_slot)
            }
        }
    } else {
        (GradSlot::NotRequested, GradSlot::NotRequested)
    };

    Ok(ConvGradients {
        grad_input,
        grad_weight,
        grad_bias: bias.map(|_| bias_slot),
    })
}
