//! `mx-matrix` - Dense f32 matrices and CPU compute backends for matmul-engine.
//!
//! This crate provides:
//! - A `Matrix` type backed by 32-byte aligned host storage
//! - A `ComputeBackend` trait for pluggable compute (sequential, SIMD, offload)
//! - A sequential reference backend and a threaded AVX2 backend
//! - The work partitioner shared with the accelerator kernels
//! - Raw binary file load/dump helpers

pub mod backend;
pub mod cpu;
pub mod error;
pub mod io;
pub mod matrix;
pub mod partition;
pub mod storage;

// Re-export primary types at the crate root for convenience.
pub use backend::{BackendKind, ComputeBackend};
pub use cpu::{SequentialBackend, SimdBackend, LANES};
pub use error::{ErrorKind, MatrixError, Result};
pub use io::{dump_binfile, read_binfile};
pub use matrix::{DeviceBuffer, Matrix};
pub use partition::{partition, partition_even, Partition};
pub use storage::{AlignedBuffer, SIMD_ALIGN};
