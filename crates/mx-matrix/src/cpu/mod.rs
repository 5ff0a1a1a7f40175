pub mod matmul;
pub mod simd;
pub mod threaded;
pub mod unary;

pub use matmul::matmul_kernel;
pub use simd::LANES;
pub use threaded::SimdBackend;
pub use unary::scalar_multiply_kernel;

use crate::backend::ComputeBackend;
use crate::error::{MatrixError, Result};
use crate::matrix::Matrix;

/// Checks shared by every backend: `dest` is [a.height x b.width] and the
/// inner dimensions agree.
pub fn validate_conformable(a: &Matrix, b: &Matrix, dest: &Matrix) -> Result<()> {
    if a.width() != b.height() {
        return Err(MatrixError::MatmulMismatch {
            m: a.height(),
            k: a.width(),
            k2: b.height(),
            n: b.width(),
        });
    }
    if dest.height() != a.height() || dest.width() != b.width() {
        return Err(MatrixError::ShapeMismatch {
            expected_h: a.height(),
            expected_w: b.width(),
            got_h: dest.height(),
            got_w: dest.width(),
        });
    }
    Ok(())
}

/// Single-threaded reference backend.
///
/// Implements both operations with straightforward loops, optimized for
/// correctness rather than peak performance. Has no divisibility
/// requirements, so it accepts every conformable shape.
#[derive(Debug, Clone)]
pub struct SequentialBackend;

impl SequentialBackend {
    /// Stateless reference backend.
    pub fn new() -> Self {
        SequentialBackend
    }
}

impl Default for SequentialBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeBackend for SequentialBackend {
    fn name(&self) -> &str {
        "sequential"
    }

    fn scalar_multiply(&mut self, scalar: f32, matrix: &mut Matrix) -> Result<()> {
        for x in matrix.as_mut_slice() {
            *x *= scalar;
        }
        Ok(())
    }

    fn matrix_multiply(&mut self, a: &Matrix, b: &Matrix, dest: &mut Matrix) -> Result<()> {
        validate_conformable(a, b, dest)?;

        let (k, n) = (a.width(), b.width());
        let a_data = a.as_slice();
        let b_data = b.as_slice();

        for (i, c_row) in dest.as_mut_slice().chunks_exact_mut(n).enumerate() {
            let a_row = &a_data[i * k..(i + 1) * k];
            for (j, &aij) in a_row.iter().enumerate() {
                let b_row = &b_data[j * n..(j + 1) * n];
                for (c, &bv) in c_row.iter_mut().zip(b_row) {
                    if j == 0 {
                        *c = 0.0;
                    }
                    *c += aij * bv;
                }
            }
        }
        Ok(())
    }
}
