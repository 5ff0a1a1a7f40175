// Element-wise kernels over flat buffers.
#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;

#[cfg(target_arch = "x86_64")]
use super::simd::has_avx2_fma;
use super::simd::LANES;
use crate::error::{MatrixError, Result};

/// Multiply every element of `buf` by `scalar`, eight lanes at a time.
///
/// # Errors
/// `Indivisible` if `buf.len()` is not a multiple of [`LANES`].
pub fn scalar_multiply_kernel(buf: &mut [f32], scalar: f32) -> Result<()> {
    if buf.len() % LANES != 0 {
        return Err(MatrixError::Indivisible {
            what: "buffer length",
            value: buf.len(),
            divisor: LANES,
        });
    }

    #[cfg(target_arch = "x86_64")]
    {
        if has_avx2_fma() {
            // Safety: guarded by runtime AVX2 check above.
            unsafe { scale_avx2(buf, scalar) };
            return Ok(());
        }
    }

    scale_portable(buf, scalar);
    Ok(())
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn scale_avx2(buf: &mut [f32], scalar: f32) {
    let vs = _mm256_set1_ps(scalar);
    for group in buf.chunks_exact_mut(LANES) {
        let p = group.as_mut_ptr();
        let v = _mm256_loadu_ps(p);
        _mm256_storeu_ps(p, _mm256_mul_ps(v, vs));
    }
}

fn scale_portable(buf: &mut [f32], scalar: f32) {
    for group in buf.chunks_exact_mut(LANES) {
        for x in group {
            *x *= scalar;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale() {
        let mut buf: Vec<f32> = (0..16).map(|i| i as f32).collect();
        scalar_multiply_kernel(&mut buf, 2.0).unwrap();
        let expected: Vec<f32> = (0..16).map(|i| 2.0 * i as f32).collect();
        assert_eq!(buf, expected);
    }

    #[test]
    fn test_scale_portable_matches() {
        let mut a: Vec<f32> = (0..24).map(|i| i as f32 * 0.25 - 3.0).collect();
        let mut b = a.clone();
        scalar_multiply_kernel(&mut a, -1.5).unwrap();
        scale_portable(&mut b, -1.5);
        assert_eq!(a, b);
    }

    #[test]
    fn test_scale_rejects_ragged_length() {
        let mut buf = vec![1.0f32; 12];
        assert!(scalar_multiply_kernel(&mut buf, 2.0).is_err());
        assert_eq!(buf, vec![1.0f32; 12]);
    }

    #[test]
    fn test_scale_empty_is_noop() {
        let mut buf: Vec<f32> = Vec::new();
        scalar_multiply_kernel(&mut buf, 2.0).unwrap();
    }
}
