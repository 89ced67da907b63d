//! Row-major single precision GEMM used by the im2col backend.

use crate::{EmberError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transpose {
    No,
    Yes,
}

/// Minimum slice length for a `rows x cols` matrix with leading dimension `ld`.
fn required_len(rows: usize, cols: usize, ld: usize) -> usize {
    if rows == 0 || cols == 0 {
        0
    } else {
        (rows - 1) * ld + cols
    }
}

fn check(name: &str, len: usize, rows: usize, cols: usize, ld: usize) -> Result<()> {
    if ld < cols && rows > 1 {
        return Err(EmberError::InvalidOperation(format!(
            "gemm: leading dimension of {} ({}) smaller than its row length ({})",
            name, ld, cols
        )));
    }
    let need = required_len(rows, cols, ld);
    if len < need {
        return Err(EmberError::InvalidOperation(format!(
            "gemm: {} holds {} elements, needs {}",
            name, len, need
        )));
    }
    Ok(())
}

/// `C = alpha * op(A) * op(B) + beta * C` with `op(A)` m x k and `op(B)` k x n.
///
/// Matrices are row-major; `lda`, `ldb`, `ldc` are row strides of the stored
/// (untransposed) buffers. `beta == 0` overwrites `C` without reading it.
#[allow(clippy::too_many_arguments)]
pub fn sgemm(
    op_a: Transpose,
    op_b: Transpose,
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &[f32],
    lda: usize,
    b: &[f32],
    ldb: usize,
    beta: f32,
    c: &mut [f32],
    ldc: usize,
) -> Result<()> {
    let (a_rows, a_cols) = match op_a {
        Transpose::No => (m, k),
        Transpose::Yes => (k, m),
    };
    let (b_rows, b_cols) = match op_b {
        Transpose::No => (k, n),
        Transpose::Yes => (n, k),
    };
    check("A", a.len(), a_rows, a_cols, lda)?;
    check("B", b.len(), b_rows, b_cols, ldb)?;
    check("C", c.len(), m, n, ldc)?;

    for i in 0..m {
        let c_row = &mut c[i * ldc..i * ldc + n];
        if beta == 0.0 {
            c_row.fill(0.0);
        } else if beta != 1.0 {
            c_row.iter_mut().for_each(|v| *v *= beta);
        }
        for p in 0..k {
            let a_ip = match op_a {
                Transpose::No => a[i * lda + p],
                Transpose::Yes => a[p * lda + i],
            } * alpha;
            match op_b {
                Transpose::No => {
                    let b_row = &b[p * ldb..p * ldb + n];
                    for (c_ij, b_pj) in c_row.iter_mut().zip(b_row) {
                        *c_ij += a_ip * b_pj;
                    }
                }
                Transpose::Yes => {
                    for (j, c_ij) in c_row.iter_mut().enumerate() {
                        *c_ij += a_ip * b[j * ldb + p];
                    }
                }
            }
        }
    }
    Ok(())
}
