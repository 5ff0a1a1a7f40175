use std::fmt::{self, Debug};
use std::str::FromStr;

use crate::error::Result;
use crate::matrix::Matrix;

/// Trait for pluggable compute backends (sequential, threaded SIMD,
/// accelerator offload).
///
/// Both operations mutate in place: `scalar_multiply` rewrites its operand,
/// `matrix_multiply` overwrites `dest`. Validation happens before any element
/// is touched, so a failed call leaves every matrix unmodified.
pub trait ComputeBackend: Send + Debug {
    /// Returns the name of this backend (e.g., "sequential", "simd").
    fn name(&self) -> &str;

    /// Scalar multiplication: m[i] = m[i] * scalar.
    fn scalar_multiply(&mut self, scalar: f32, matrix: &mut Matrix) -> Result<()>;

    /// Matrix multiplication: dest = a @ b.
    ///
    /// - `a`: shape [m, k]
    /// - `b`: shape [k, n]
    /// - `dest`: shape [m, n], distinct from both operands
    fn matrix_multiply(&mut self, a: &Matrix, b: &Matrix, dest: &mut Matrix) -> Result<()>;
}

/// Selector for the three execution strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackendKind {
    /// Single-threaded reference loops.
    Sequential,
    /// Scoped worker threads running 256-bit vector kernels.
    #[default]
    ThreadedSimd,
    /// Kernels executed by a remote accelerator process on mirrored data.
    AcceleratorOffload,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Sequential => write!(f, "sequential"),
            BackendKind::ThreadedSimd => write!(f, "simd"),
            BackendKind::AcceleratorOffload => write!(f, "accelerator"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sequential" | "seq" | "reference" => Ok(BackendKind::Sequential),
            "simd" | "threaded" | "cpu" => Ok(BackendKind::ThreadedSimd),
            "accelerator" | "accel" | "offload" | "ve" => Ok(BackendKind::AcceleratorOffload),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip_through_display() {
        for kind in [
            BackendKind::Sequential,
            BackendKind::ThreadedSimd,
            BackendKind::AcceleratorOffload,
        ] {
            assert_eq!(kind.to_string().parse::<BackendKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_kind_aliases() {
        assert_eq!("  Offload ".parse::<BackendKind>().unwrap(), BackendKind::AcceleratorOffload);
        assert_eq!("cpu".parse::<BackendKind>().unwrap(), BackendKind::ThreadedSimd);
        assert!("gpu".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_default_kind() {
        assert_eq!(BackendKind::default(), BackendKind::ThreadedSimd);
    }
}
