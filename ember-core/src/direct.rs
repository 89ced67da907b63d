//! Direct convolution kernels on the rayon pool.
//!
//! Each output plane `(batch, out_channel)` is computed by one task, so
//! writes never overlap. Grouped convolution is supported: out channel `oc`
//! belongs to group `oc / (C_out / groups)` and only sees that group's slice
//! of input channels.

use crate::backend::SpecializedBackend;
use crate::config;
use crate::conv::{output_size, padded_extent, ConvParams};
use crate::{DType, EmberError, Result, Shape, Tensor};
use rayon::prelude::*;

/// Rayon-parallel direct convolution. Accepts F32 tensors only.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectBackend {
    enabled: Option<bool>,
}

impl DirectBackend {
    /// Backend that follows [`config::should_use_accelerated`] on every call.
    pub fn new() -> Self {
        Self { enabled: None }
    }

    /// Backend forced on or off regardless of the global switch.
    pub fn with_enabled(enabled: bool) -> Self {
        Self { enabled: Some(enabled) }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or_else(config::should_use_accelerated)
    }
}

#[derive(Debug, Clone, Copy)]
struct Geometry {
    batch: usize,
    c_in: usize,
    h: usize,
    w: usize,
    c_out: usize,
    kh: usize,
    kw: usize,
    sh: usize,
    sw: usize,
    ph: usize,
    pw: usize,
    oh: usize,
    ow: usize,
    /// Input channels per group
    cin_g: usize,
    /// Output channels per group
    cout_g: usize,
}

impl Geometry {
    fn resolve(params: &ConvParams, input: &Shape, weight: &Shape) -> Result<Self> {
        let (batch, c_in, h, w) = input
            .dims4()
            .map_err(|_| EmberError::rank("conv2d input", 4, input))?;
        let (c_out, cin_g, kh, kw) = weight
            .dims4()
            .map_err(|_| EmberError::rank("conv2d weight", 4, weight))?;
        let groups = params.groups;
        if groups == 0 || params.stride.0 == 0 || params.stride.1 == 0 {
            return Err(EmberError::UnsupportedConfiguration(format!(
                "stride {:?} and groups {} must be positive",
                params.stride, groups
            )));
        }
        if c_in % groups != 0 || c_out % groups != 0 {
            return Err(EmberError::InvalidShape(format!(
                "channels {} -> {} not divisible by groups {}",
                c_in, c_out, groups
            )));
        }
        if cin_g * groups != c_in {
            return Err(EmberError::ShapeMismatch {
                expected: Shape::from([c_out, c_in / groups, kh, kw]),
                got: weight.clone(),
            });
        }
        let (ph, pw) = params.padding;
        let (hp, wp) = (padded_extent(h, ph)?, padded_extent(w, pw)?);
        if kh == 0 || kw == 0 || hp < kh || wp < kw {
            return Err(EmberError::InvalidShape(format!(
                "kernel {}x{} does not fit padded input {}x{}",
                kh, kw, hp, wp
            )));
        }
        let (_, _, oh, ow) = output_size(input, weight, params.stride, params.padding)?;
        Ok(Self {
            batch,
            c_in,
            h,
            w,
            c_out,
            kh,
            kw,
            sh: params.stride.0,
            sw: params.stride.1,
            ph,
            pw,
            oh,
            ow,
            cin_g,
            cout_g: c_out / groups,
        })
    }

    fn output_shape(&self) -> Shape {
        Shape::from([self.batch, self.c_out, self.oh, self.ow])
    }

    /// Input row/column under kernel tap `k` at output position `o`, if inside.
    #[inline]
    fn src(o: usize, k: usize, stride: usize, pad: usize, size: usize) -> Option<usize> {
        let i = (o * stride + k) as isize - pad as isize;
        (i >= 0 && (i as usize) < size).then_some(i as usize)
    }
}

fn expect_shape(tensor: &Tensor, expected: Shape) -> Result<()> {
    if tensor.shape() != &expected {
        return Err(EmberError::ShapeMismatch {
            expected,
            got: tensor.shape().clone(),
        });
    }
    Ok(())
}

/// The direct kernels run in f32 only.
fn require_f32(tensor: &Tensor) -> Result<()> {
    if tensor.dtype() != DType::F32 {
        return Err(EmberError::UnsupportedDType(format!(
            "direct convolution kernels need f32, got {}",
            tensor.dtype()
        )));
    }
    Ok(())
}

impl SpecializedBackend for DirectBackend {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn accepts(&self, tensor: &Tensor) -> bool {
        self.is_enabled() && tensor.dtype() == DType::F32
    }

    fn forward(
        &self,
        params: &ConvParams,
        input: &Tensor,
        weight: &Tensor,
        bias: Option<&Tensor>,
        output: &mut Tensor,
    ) -> Result<()> {
        require_f32(input)?;
        let g = Geometry::resolve(params, input.shape(), weight.shape())?;
        if let Some(b) = bias {
            expect_shape(b, Shape::from([g.c_out]))?;
        }
        expect_shape(output, g.output_shape())?;

        let x = input.data();
        let wt = weight.data();
        let bias = bias.map(|b| b.data());
        let plane = g.oh * g.ow;
        if plane == 0 {
            return Ok(());
        }

        output.data_mut().par_chunks_mut(plane).enumerate().for_each(|(p, out)| {
            let (b, oc) = (p / g.c_out, p % g.c_out);
            let ic0 = (oc / g.cout_g) * g.cin_g;
            let init = bias.map_or(0.0, |bias| bias[oc]);
            for y in 0..g.oh {
                for xo in 0..g.ow {
                    let mut acc = init;
                    for icg in 0..g.cin_g {
                        let x_plane = &x[(b * g.c_in + ic0 + icg) * g.h * g.w..][..g.h * g.w];
                        let w_plane = &wt[(oc * g.cin_g + icg) * g.kh * g.kw..][..g.kh * g.kw];
                        for ki in 0..g.kh {
                            let Some(iy) = Geometry::src(y, ki, g.sh, g.ph, g.h) else { continue };
                            for kj in 0..g.kw {
                                if let Some(ix) = Geometry::src(xo, kj, g.sw, g.pw, g.w) {
                                    acc += x_plane[iy * g.w + ix] * w_plane[ki * g.kw + kj];
                                }
                            }
                        }
                    }
                    out[y * g.ow + xo] = acc;
                }
            }
        });
        output.round_to_dtype();
        Ok(())
    }

    fn backward_data(
        &self,
        params: &ConvParams,
        grad_output: &Tensor,
        input: &Tensor,
        weight: &Tensor,
    ) -> Result<Tensor> {
        require_f32(input)?;
        let g = Geometry::resolve(params, input.shape(), weight.shape())?;
        expect_shape(grad_output, g.output_shape())?;

        let go = grad_output.data();
        let wt = weight.data();
        let mut grad_input = Tensor::zeros_dtype(input.shape().clone(), input.dtype());
        let plane = g.h * g.w;
        if plane == 0 {
            return Ok(grad_input);
        }

        grad_input.data_mut().par_chunks_mut(plane).enumerate().for_each(|(p, gi)| {
            let (b, ic) = (p / g.c_in, p % g.c_in);
            let (group, icg) = (ic / g.cin_g, ic % g.cin_g);
            for ocg in 0..g.cout_g {
                let oc = group * g.cout_g + ocg;
                let go_plane = &go[(b * g.c_out + oc) * g.oh * g.ow..][..g.oh * g.ow];
                let w_plane = &wt[(oc * g.cin_g + icg) * g.kh * g.kw..][..g.kh * g.kw];
                for y in 0..g.oh {
                    for xo in 0..g.ow {
                        let d = go_plane[y * g.ow + xo];
                        for ki in 0..g.kh {
                            let Some(iy) = Geometry::src(y, ki, g.sh, g.ph, g.h) else { continue };
                            for kj in 0..g.kw {
                                if let Some(ix) = Geometry::src(xo, kj, g.sw, g.pw, g.w) {
                                    gi[iy * g.w + ix] += d * w_plane[ki * g.kw + kj];
                                }
                            }
                        }
                    }
                }
            }
        });
        grad_input.round_to_dtype();
        Ok(grad_input)
    }

    fn backward_filter(
        &self,
        params: &ConvParams,
        grad_output: &Tensor,
        input: &Tensor,
        weight: &Tensor,
    ) -> Result<Tensor> {
        require_f32(input)?;
        let g = Geometry::resolve(params, input.shape(), weight.shape())?;
        expect_shape(grad_output, g.output_shape())?;

        let go = grad_output.data();
        let x = input.data();
        let mut grad_weight = Tensor::zeros_dtype(weight.shape().clone(), weight.dtype());
        let per_oc = g.cin_g * g.kh * g.kw;
        if per_oc == 0 {
            return Ok(grad_weight);
        }

        grad_weight.data_mut().par_chunks_mut(per_oc).enumerate().for_each(|(oc, gw)| {
            let ic0 = (oc / g.cout_g) * g.cin_g;
            for b in 0..g.batch {
                let go_plane = &go[(b * g.c_out + oc) * g.oh * g.ow..][..g.oh * g.ow];
                for icg in 0..g.cin_g {
                    let x_plane = &x[(b * g.c_in + ic0 + icg) * g.h * g.w..][..g.h * g.w];
                    for ki in 0..g.kh {
                        for kj in 0..g.kw {
                            let mut acc = 0.0f32;
                            for y in 0..g.oh {
                                let Some(iy) = Geometry::src(y, ki, g.sh, g.ph, g.h) else {
                                    continue;
                                };
                                for xo in 0..g.ow {
                                    if let Some(ix) = Geometry::src(xo, kj, g.sw, g.pw, g.w) {
                                        acc += go_plane[y * g.ow + xo] * x_plane[iy * g.w + ix];
                                    }
                                }
                            }
                            gw[(icg * g.kh + ki) * g.kw + kj] += acc;
                        }
                    }
                }
            }
        });
        grad_weight.round_to_dtype();
        Ok(grad_weight)
    }

    fn backward_bias(
        &self,
        _params: &ConvParams,
        grad_output: &Tensor,
        bias: &Tensor,
    ) -> Result<Tensor> {
        let (n, c_out, oh, ow) = grad_output
            .shape()
            .dims4()
            .map_err(|_| EmberError::rank("conv2d grad_output", 4, grad_output.shape()))?;
        expect_shape(bias, Shape::from([c_out]))?;

        let go = grad_output.data();
        let plane = oh * ow;
        let sums: Vec<f32> = (0..c_out)
            .into_par_iter()
            .map(|oc| {
                (0..n)
                    .map(|b| go[(b * c_out + oc) * plane..][..plane].iter().sum::<f32>())
                    .sum()
            })
            .collect();
        Tensor::from_vec_dtype(sums, bias.shape().clone(), bias.dtype())
    }
}
