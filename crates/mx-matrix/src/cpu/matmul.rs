// Broadcast-and-accumulate matmul kernel.
//
// For every output row, each element A[row, j] is broadcast into a vector and
// multiplied against the eight-wide groups of B's row j, accumulating into the
// matching groups of C's row. The j == 0 pass assigns instead of accumulating,
// so C does not need a separate zero-fill.

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;

#[cfg(target_arch = "x86_64")]
use super::simd::has_avx2_fma;
use super::simd::LANES;
use crate::error::{MatrixError, Result};

/// Compute `row_count` rows of `C = A @ B`.
///
/// - `a_rows`: `row_count` rows of A, each `a_width` long
/// - `b`: all of B, `a_width` rows of `b_width`
/// - `c_rows`: `row_count` rows of C, each `b_width` long (overwritten)
///
/// # Errors
/// `Indivisible` if `b_width` is not a multiple of [`LANES`], and
/// `LengthMismatch` if any slice length disagrees with the dimensions.
pub fn matmul_kernel(
    a_rows: &[f32],
    a_width: usize,
    b: &[f32],
    b_width: usize,
    c_rows: &mut [f32],
    row_count: usize,
) -> Result<()> {
    if a_width == 0 || b_width == 0 {
        return Err(MatrixError::EmptyMatrix {
            height: a_width,
            width: b_width,
        });
    }
    if b_width % LANES != 0 {
        return Err(MatrixError::Indivisible {
            what: "width of B",
            value: b_width,
            divisor: LANES,
        });
    }
    check_len(a_rows.len(), row_count * a_width)?;
    check_len(b.len(), a_width * b_width)?;
    check_len(c_rows.len(), row_count * b_width)?;

    #[cfg(target_arch = "x86_64")]
    {
        if has_avx2_fma() {
            // Safety: guarded by runtime AVX2/FMA check above.
            unsafe { matmul_avx2(a_rows, a_width, b, b_width, c_rows) };
            return Ok(());
        }
    }

    matmul_portable(a_rows, a_width, b, b_width, c_rows);
    Ok(())
}

fn check_len(got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(MatrixError::LengthMismatch { expected, got });
    }
    Ok(())
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn matmul_avx2(a_rows: &[f32], a_width: usize, b: &[f32], b_width: usize, c_rows: &mut [f32]) {
    for (a_row, c_row) in a_rows.chunks_exact(a_width).zip(c_rows.chunks_exact_mut(b_width)) {
        for (j, &aij) in a_row.iter().enumerate() {
            let va = _mm256_set1_ps(aij);
            let b_row = &b[j * b_width..(j + 1) * b_width];
            for (bg, cg) in b_row.chunks_exact(LANES).zip(c_row.chunks_exact_mut(LANES)) {
                let vb = _mm256_loadu_ps(bg.as_ptr());
                let vc = if j == 0 {
                    _mm256_mul_ps(va, vb)
                } else {
                    _mm256_fmadd_ps(va, vb, _mm256_loadu_ps(cg.as_ptr()))
                };
                _mm256_storeu_ps(cg.as_mut_ptr(), vc);
            }
        }
    }
}

fn matmul_portable(a_rows: &[f32], a_width: usize, b: &[f32], b_width: usize, c_rows: &mut [f32]) {
    for (a_row, c_row) in a_rows.chunks_exact(a_width).zip(c_rows.chunks_exact_mut(b_width)) {
        for (j, &aij) in a_row.iter().enumerate() {
            let b_row = &b[j * b_width..(j + 1) * b_width];
            for (bg, cg) in b_row.chunks_exact(LANES).zip(c_row.chunks_exact_mut(LANES)) {
                for (c, &bv) in cg.iter_mut().zip(bg) {
                    if j == 0 {
                        *c = aij * bv;
                    } else {
                        *c += aij * bv;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn naive(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
        let mut c = vec![0.0f32; m * n];
        for i in 0..m {
            for j in 0..n {
                let mut sum = 0.0f32;
                for p in 0..k {
                    sum += a[i * k + p] * b[p * n + j];
                }
                c[i * n + j] = sum;
            }
        }
        c
    }

    #[test]
    fn test_matches_naive() {
        let (m, k, n) = (3, 5, 16);
        let a: Vec<f32> = (0..m * k).map(|i| (i as f32 * 0.37).sin()).collect();
        let b: Vec<f32> = (0..k * n).map(|i| (i as f32 * 0.11).cos()).collect();
        let mut c = vec![f32::NAN; m * n];
        matmul_kernel(&a, k, &b, n, &mut c, m).unwrap();
        for (got, want) in c.iter().zip(naive(&a, &b, m, k, n)) {
            assert_relative_eq!(*got, want, epsilon = 1e-5, max_relative = 1e-5);
        }
    }

    #[test]
    fn test_first_pass_overwrites_garbage() {
        // 1x1 A means only the j == 0 pass runs.
        let a = vec![2.0];
        let b: Vec<f32> = (0..8).map(|i| i as f32).collect();
        let mut c = vec![99.0f32; 8];
        matmul_kernel(&a, 1, &b, 8, &mut c, 1).unwrap();
        assert_eq!(c, vec![0.0, 2.0, 4.0, 6.0, 8.0, 10.0, 12.0, 14.0]);
    }

    #[test]
    fn test_portable_matches_dispatch() {
        let (m, k, n) = (2, 4, 8);
        let a: Vec<f32> = (0..m * k).map(|i| i as f32 - 3.0).collect();
        let b: Vec<f32> = (0..k * n).map(|i| 0.5 * i as f32).collect();
        let mut c1 = vec![0.0; m * n];
        let mut c2 = vec![0.0; m * n];
        matmul_kernel(&a, k, &b, n, &mut c1, m).unwrap();
        matmul_portable(&a, k, &b, n, &mut c2);
        for (x, y) in c1.iter().zip(&c2) {
            assert_relative_eq!(*x, *y, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_rejects_ragged_width() {
        let a = vec![1.0; 4];
        let b = vec![1.0; 4 * 6];
        let mut c = vec![0.0; 6];
        assert!(matches!(
            matmul_kernel(&a, 4, &b, 6, &mut c, 1),
            Err(MatrixError::Indivisible { divisor: 8, .. })
        ));
    }

    #[test]
    fn test_rejects_short_slices() {
        let a = vec![1.0; 3];
        let b = vec![1.0; 4 * 8];
        let mut c = vec![0.0; 8];
        assert!(matches!(
            matmul_kernel(&a, 4, &b, 8, &mut c, 1),
            Err(MatrixError::LengthMismatch { expected: 4, got: 3 })
        ));
    }
}
