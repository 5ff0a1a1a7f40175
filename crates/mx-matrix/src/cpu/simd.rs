//! Runtime SIMD capability detection shared by the CPU kernels.

/// Floats per 256-bit vector group.
pub const LANES: usize = 8;

/// Returns `true` when the AVX2 + FMA fast paths may be used.
///
/// `is_x86_feature_detected!` caches its CPUID probe, so this is cheap to
/// call once per kernel invocation.
#[inline]
pub fn has_avx2_fma() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma")
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        false
    }
}

/// Human-readable name of the kernel path that will be taken.
pub fn kernel_path() -> &'static str {
    if has_avx2_fma() {
        "avx2+fma"
    } else {
        "portable"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_path_consistent() {
        let path = kernel_path();
        assert_eq!(path == "avx2+fma", has_avx2_fma());
    }
}
