#![allow(dead_code)]

use ember_core::backend::{FallbackBackend, SpecializedBackend};
use ember_core::mm::MmBackend;
use ember_core::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::{Arc, Mutex};

pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

pub fn randn(dims: &[usize], rng: &mut StdRng) -> Tensor {
    Tensor::randn(Shape::from_dims(dims), 0.0, 1.0, rng).unwrap()
}

pub fn assert_close(a: &Tensor, b: &Tensor, tol: f32, what: &str) {
    let diff = a.max_abs_diff(b).unwrap();
    assert!(diff <= tol, "{}: max |diff| {} > {}", what, diff, tol);
}

/// `sum(a * b)`, the loss whose output gradient is `b`.
pub fn dot(a: &Tensor, b: &Tensor) -> f32 {
    a.data().iter().zip(b.data()).map(|(x, y)| x * y).sum()
}

/// Kernel size, stride and padding as the fallback received them:
/// `[kW, kH, dW, dH, padW, padH]`.
pub type Geometry = [usize; 6];

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    UpdateOutput {
        finput: TensorId,
        fgrad_input: TensorId,
        geometry: Geometry,
    },
    UpdateGradInput {
        finput: TensorId,
        fgrad_input: TensorId,
        geometry: Geometry,
    },
    AccGradParameters {
        finput: TensorId,
        fgrad_input: TensorId,
        geometry: Geometry,
        with_bias: bool,
        scale: f32,
    },
}

/// im2col backend that logs every call and can be told to fail the
/// parameter kernel.
#[derive(Clone, Default)]
pub struct RecordingFallback {
    pub calls: Arc<Mutex<Vec<Call>>>,
    pub fail_parameters: bool,
}

impl RecordingFallback {
    pub fn failing_parameters() -> Self {
        Self { fail_parameters: true, ..Default::default() }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn push(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl FallbackBackend for RecordingFallback {
    fn name(&self) -> &'static str {
        "recording-im2col"
    }

    fn update_output(
        &self,
        input: &Tensor,
        output: &mut Tensor,
        weight: &Tensor,
        bias: Option<&Tensor>,
        finput: &mut Tensor,
        fgrad_input: &mut Tensor,
        kw: usize,
        kh: usize,
        dw: usize,
        dh: usize,
        pw: usize,
        ph: usize,
    ) -> Result<()> {
        self.push(Call::UpdateOutput {
            finput: finput.id(),
            fgrad_input: fgrad_input.id(),
            geometry: [kw, kh, dw, dh, pw, ph],
        });
        MmBackend.update_output(
            input,
            output,
            weight,
            bias,
            finput,
            fgrad_input,
            kw,
            kh,
            dw,
            dh,
            pw,
            ph,
        )
    }

    fn update_grad_input(
        &self,
        input: &Tensor,
        grad_output: &Tensor,
        grad_input: &mut Tensor,
        weight: &Tensor,
        finput: &mut Tensor,
        fgrad_input: &mut Tensor,
        kw: usize,
        kh: usize,
        dw: usize,
        dh: usize,
        pw: usize,
        ph: usize,
    ) -> Result<()> {
        self.push(Call::UpdateGradInput {
            finput: finput.id(),
            fgrad_input: fgrad_input.id(),
            geometry: [kw, kh, dw, dh, pw, ph],
        });
        MmBackend.update_grad_input(
            input,
            grad_output,
            grad_input,
            weight,
            finput,
            fgrad_input,
            kw,
            kh,
            dw,
            dh,
            pw,
            ph,
        )
    }

    fn acc_grad_parameters(
        &self,
        input: &Tensor,
        grad_output: &Tensor,
        grad_weight: &mut Tensor,
        grad_bias: Option<&mut Tensor>,
        finput: &mut Tensor,
        fgrad_input: &mut Tensor,
        kw: usize,
        kh: usize,
        dw: usize,
        dh: usize,
        pw: usize,
        ph: usize,
        scale: f32,
    ) -> Result<()> {
        self.push(Call::AccGradParameters {
            finput: finput.id(),
            fgrad_input: fgrad_input.id(),
            geometry: [kw, kh, dw, dh, pw, ph],
            with_bias: grad_bias.is_some(),
            scale,
        });
        if self.fail_parameters {
            return Err(EmberError::Backend("parameter kernel failed".into()));
        }
        MmBackend.acc_grad_parameters(
            input,
            grad_output,
            grad_weight,
            grad_bias,
            finput,
            fgrad_input,
            kw,
            kh,
            dw,
            dh,
            pw,
            ph,
            scale,
        )
    }
}

/// Specialized backend that never accepts anything.
pub struct Refusing;

impl SpecializedBackend for Refusing {
    fn name(&self) -> &'static str {
        "refusing"
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
        panic!("refusing backend must not run")
    }

    fn backward_data(&self, _: &ConvParams, _: &Tensor, _: &Tensor, _: &Tensor) -> Result<Tensor> {
        panic!("refusing backend must not run")
    }

    fn backward_filter(
        &self,
        _: &ConvParams,
        _: &Tensor,
        _: &Tensor,
        _: &Tensor,
    ) -> Result<Tensor> {
        panic!("refusing backend must not run")
    }

    fn backward_bias(&self, _: &ConvParams, _: &Tensor, _: &Tensor) -> Result<Tensor> {
        panic!("refusing backend must not run")
    }
}

/// Backends that always route to `fallback`.
pub fn fallback_set(fallback: RecordingFallback) -> BackendSet {
    BackendSet::new(Arc::new(Refusing), Arc::new(fallback))
}

/// Specialized kernels with per-entry-point call counts; the filter kernel
/// can be told to fail.
#[cfg(feature = "accelerated")]
#[derive(Default)]
pub struct CountingSpecialized {
    pub data_calls: std::sync::atomic::AtomicUsize,
    pub filter_calls: std::sync::atomic::AtomicUsize,
    pub bias_calls: std::sync::atomic::AtomicUsize,
    pub fail_filter: bool,
}

#[cfg(feature = "accelerated")]
fn direct() -> ember_core::direct::DirectBackend {
    ember_core::direct::DirectBackend::with_enabled(true)
}

#[cfg(feature = "accelerated")]
impl SpecializedBackend for CountingSpecialized {
    fn name(&self) -> &'static str {
        "counting-direct"
    }

    fn accepts(&self, tensor: &Tensor) -> bool {
        direct().accepts(tensor)
    }

    fn forward(
        &self,
        params: &ConvParams,
        input: &Tensor,
        weight: &Tensor,
        bias: Option<&Tensor>,
        output: &mut Tensor,
    ) -> Result<()> {
        direct().forward(params, input, weight, bias, output)
    }

    fn backward_data(
        &self,
        params: &ConvParams,
        grad_output: &Tensor,
        input: &Tensor,
        weight: &Tensor,
    ) -> Result<Tensor> {
        self.data_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        direct().backward_data(params, grad_output, input, weight)
    }

    fn backward_filter(
        &self,
        params: &ConvParams,
        grad_output: &Tensor,
        input: &Tensor,
        weight: &Tensor,
    ) -> Result<Tensor> {
        self.filter_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if self.fail_filter {
            return Err(EmberError::Backend("filter kernel failed".into()));
        }
        direct().backward_filter(params, grad_output, input, weight)
    }

    fn backward_bias(
        &self,
        params: &ConvParams,
        grad_output: &Tensor,
        bias: &Tensor,
    ) -> Result<Tensor> {
        self.bias_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        direct().backward_bias(params, grad_output, bias)
    }
}
