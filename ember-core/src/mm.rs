//! im2col + GEMM convolution ("SpatialConvolutionMM")
//!
//! Forward unfolds every input frame into a `(C_in*kH*kW) x (H_out*W_out)`
//! column matrix stored in `finput` and multiplies it by the weight viewed as
//! `C_out x (C_in*kH*kW)`. Backward multiplies by the transposed weight into
//! `fgrad_input` and folds the columns back onto the input grid; the weight
//! gradient is read straight from the `finput` columns left by forward.

use crate::backend::FallbackBackend;
use crate::conv::padded_extent;
use crate::gemm::{sgemm, Transpose};
use crate::{EmberError, Result, Shape, Tensor};

/// Always-available im2col backend. Ungrouped convolution only.
#[derive(Debug, Default, Clone, Copy)]
pub struct MmBackend;

/// Geometry shared by the three kernels.
#[derive(Debug, Clone, Copy)]
struct Frame {
    batch: usize,
    c_in: usize,
    h: usize,
    w: usize,
    c_out: usize,
    kh: usize,
    kw: usize,
    dh: usize,
    dw: usize,
    ph: usize,
    pw: usize,
    oh: usize,
    ow: usize,
}

impl Frame {
    /// Rows of one column matrix.
    fn k(&self) -> usize {
        self.c_in * self.kh * self.kw
    }

    /// Columns of one column matrix.
    fn l(&self) -> usize {
        self.oh * self.ow
    }

    fn columns_shape(&self) -> Shape {
        Shape::from([self.batch, self.k(), self.l()])
    }

    fn output_shape(&self) -> Shape {
        Shape::from([self.batch, self.c_out, self.oh, self.ow])
    }
}

#[allow(clippy::too_many_arguments)]
fn frame(
    input: &Shape,
    c_out: usize,
    kw: usize,
    kh: usize,
    dw: usize,
    dh: usize,
    pw: usize,
    ph: usize,
) -> Result<Frame> {
    let (batch, c_in, h, w) = input
        .dims4()
        .map_err(|_| EmberError::rank("conv2d input", 4, input))?;
    if dw == 0 || dh == 0 {
        return Err(EmberError::UnsupportedConfiguration(format!(
            "stride must be positive, got {}x{} (w x h)",
            dw, dh
        )));
    }
    if kw == 0 || kh == 0 {
        return Err(EmberError::InvalidShape("kernel size must be positive".into()));
    }
    let (hp, wp) = (padded_extent(h, ph)?, padded_extent(w, pw)?);
    if hp < kh || wp < kw {
        return Err(EmberError::InvalidShape(format!(
            "kernel {}x{} larger than padded input {}x{}",
            kh, kw, hp, wp
        )));
    }
    Ok(Frame {
        batch,
        c_in,
        h,
        w,
        c_out,
        kh,
        kw,
        dh,
        dw,
        ph,
        pw,
        oh: (hp - kh) / dh + 1,
        ow: (wp - kw) / dw + 1,
    })
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

/// Weight must be `C_out x C_in x kH x kW` for this frame.
fn check_weight(f: &Frame, weight: &Tensor) -> Result<()> {
    expect_shape(weight, Shape::from([f.c_out, f.c_in, f.kh, f.kw]))
}

fn check_bias(f: &Frame, bias: Option<&Tensor>) -> Result<()> {
    match bias {
        Some(b) => expect_shape(b, Shape::from([f.c_out])),
        None => Ok(()),
    }
}

/// Copy one input frame (`C x H x W`) into its column matrix.
fn unfold(f: &Frame, src: &[f32], cols: &mut [f32]) {
    let l = f.l();
    for c in 0..f.c_in {
        let plane = &src[c * f.h * f.w..(c + 1) * f.h * f.w];
        for ki in 0..f.kh {
            for kj in 0..f.kw {
                let row = (c * f.kh + ki) * f.kw + kj;
                let dst = &mut cols[row * l..(row + 1) * l];
                for y in 0..f.oh {
                    let iy = (y * f.dh + ki) as isize - f.ph as isize;
                    for x in 0..f.ow {
                        let ix = (x * f.dw + kj) as isize - f.pw as isize;
                        let outside = iy < 0 || ix < 0 || iy >= f.h as isize || ix >= f.w as isize;
                        dst[y * f.ow + x] = if outside {
                            0.0
                        } else {
                            plane[iy as usize * f.w + ix as usize]
                        };
                    }
                }
            }
        }
    }
}

/// Add a column matrix back onto one input frame (inverse of `unfold`).
fn fold(f: &Frame, cols: &[f32], dst: &mut [f32]) {
    let l = f.l();
    for c in 0..f.c_in {
        let plane = &mut dst[c * f.h * f.w..(c + 1) * f.h * f.w];
        for ki in 0..f.kh {
            for kj in 0..f.kw {
                let row = (c * f.kh + ki) * f.kw + kj;
                let src = &cols[row * l..(row + 1) * l];
                for y in 0..f.oh {
                    let iy = (y * f.dh + ki) as isize - f.ph as isize;
                    if iy < 0 || iy >= f.h as isize {
                        continue;
                    }
                    for x in 0..f.ow {
                        let ix = (x * f.dw + kj) as isize - f.pw as isize;
                        if ix < 0 || ix >= f.w as isize {
                            continue;
                        }
                        plane[iy as usize * f.w + ix as usize] += src[y * f.ow + x];
                    }
                }
            }
        }
    }
}

impl FallbackBackend for MmBackend {
    fn name(&self) -> &'static str {
        "im2col"
    }

    fn update_output(
        &self,
        input: &Tensor,
        output: &mut Tensor,
        weight: &Tensor,
        bias: Option<&Tensor>,
        finput: &mut Tensor,
        _fgrad_input: &mut Tensor,
        kernel_w: usize,
        kernel_h: usize,
        stride_w: usize,
        stride_h: usize,
        pad_w: usize,
        pad_h: usize,
    ) -> Result<()> {
        let c_out = weight.size(0)?;
        let f = frame(input.shape(), c_out, kernel_w, kernel_h, stride_w, stride_h, pad_w, pad_h)?;
        check_weight(&f, weight)?;
        check_bias(&f, bias)?;
        expect_shape(output, f.output_shape())?;

        let (k, l) = (f.k(), f.l());
        let in_frame = f.c_in * f.h * f.w;
        let out_frame = f.c_out * l;

        finput.resize_(f.columns_shape());
        let cols = finput.data_mut();
        let out = output.data_mut();
        for b in 0..f.batch {
            let cols_b = &mut cols[b * k * l..(b + 1) * k * l];
            unfold(&f, &input.data()[b * in_frame..(b + 1) * in_frame], cols_b);

            let out_b = &mut out[b * out_frame..(b + 1) * out_frame];
            match bias {
                Some(bias) => {
                    for (o, plane) in out_b.chunks_mut(l).enumerate() {
                        plane.fill(bias.data()[o]);
                    }
                }
                None => out_b.fill(0.0),
            }
            sgemm(
                Transpose::No,
                Transpose::No,
                f.c_out,
                l,
                k,
                1.0,
                weight.data(),
                k,
                cols_b,
                l,
                1.0,
                out_b,
                l,
            )?;
        }
        finput.round_to_dtype();
        output.round_to_dtype();
        Ok(())
    }

    fn update_grad_input(
        &self,
        input: &Tensor,
        grad_output: &Tensor,
        grad_input: &mut Tensor,
        weight: &Tensor,
        _finput: &mut Tensor,
        fgrad_input: &mut Tensor,
        kernel_w: usize,
        kernel_h: usize,
        stride_w: usize,
        stride_h: usize,
        pad_w: usize,
        pad_h: usize,
    ) -> Result<()> {
        let c_out = weight.size(0)?;
        let f = frame(input.shape(), c_out, kernel_w, kernel_h, stride_w, stride_h, pad_w, pad_h)?;
        check_weight(&f, weight)?;
        expect_shape(grad_output, f.output_shape())?;
        expect_shape(grad_input, input.shape().clone())?;

        let (k, l) = (f.k(), f.l());
        let in_frame = f.c_in * f.h * f.w;
        let out_frame = f.c_out * l;

        fgrad_input.resize_(f.columns_shape());
        let cols = fgrad_input.data_mut();
        let gi = grad_input.data_mut();
        for b in 0..f.batch {
            let cols_b = &mut cols[b * k * l..(b + 1) * k * l];
            // columns = W^T * dY
            sgemm(
                Transpose::Yes,
                Transpose::No,
                k,
                l,
                f.c_out,
                1.0,
                weight.data(),
                k,
                &grad_output.data()[b * out_frame..(b + 1) * out_frame],
                l,
                0.0,
                cols_b,
                l,
            )?;
            fold(&f, cols_b, &mut gi[b * in_frame..(b + 1) * in_frame]);
        }
        grad_input.round_to_dtype();
        Ok(())
    }

    fn acc_grad_parameters(
        &self,
        input: &Tensor,
        grad_output: &Tensor,
        grad_weight: &mut Tensor,
        grad_bias: Option<&mut Tensor>,
        finput: &mut Tensor,
        _fgrad_input: &mut Tensor,
        kernel_w: usize,
        kernel_h: usize,
        stride_w: usize,
        stride_h: usize,
        pad_w: usize,
        pad_h: usize,
        scale: f32,
    ) -> Result<()> {
        let c_out = grad_weight.size(0)?;
        let f = frame(input.shape(), c_out, kernel_w, kernel_h, stride_w, stride_h, pad_w, pad_h)?;
        check_weight(&f, grad_weight)?;
        check_bias(&f, grad_bias.as_deref())?;
        expect_shape(grad_output, f.output_shape())?;
        if finput.shape() != &f.columns_shape() {
            return Err(EmberError::InvalidState(format!(
                "finput workspace is {}, expected unfolded input {}; update_output must run first",
                finput.shape(),
                f.columns_shape()
            )));
        }

        let (k, l) = (f.k(), f.l());
        let out_frame = f.c_out * l;
        let cols = finput.data();
        let go = grad_output.data();
        let gw = grad_weight.data_mut();
        for b in 0..f.batch {
            // dW += scale * dY * columns^T
            sgemm(
                Transpose::No,
                Transpose::Yes,
                f.c_out,
                k,
                l,
                scale,
                &go[b * out_frame..(b + 1) * out_frame],
                l,
                &cols[b * k * l..(b + 1) * k * l],
                l,
                1.0,
                gw,
                k,
            )?;
        }
        grad_weight.round_to_dtype();

        if let Some(grad_bias) = grad_bias {
            let gb = grad_bias.data_mut();
            for b in 0..f.batch {
                let go_b = &go[b * out_frame..(b + 1) * out_frame];
                for (o, plane) in go_b.chunks(l).enumerate() {
                    gb[o] += scale * plane.iter().sum::<f32>();
                }
            }
            grad_bias.round_to_dtype();
        }
        Ok(())
    }
}
