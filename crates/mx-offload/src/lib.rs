//! Accelerator offload for matmul-engine.
//!
//! An [`AcceleratorContext`] drives one accelerator process through its
//! lifecycle, keeps device mirrors of host matrices and runs the
//! `scalar_matrix_mult` and `matrix_matrix_mult` kernels remotely. The
//! device itself sits behind the [`DeviceRuntime`] trait; [`EmulatedRuntime`]
//! provides one backed by in-process device threads.

pub mod args;
pub mod context;
pub mod emulated;
pub mod error;
pub mod heap;
pub mod kernels;
pub mod mirror;
pub mod remote;
pub mod runtime;

pub use args::{ArgBuffer, KernelArg};
pub use context::{AcceleratorContext, ContextState, MAX_NODE, MAX_THREADS};
pub use emulated::{EmulatedRuntime, EmulatorProbe, FaultPoint, EMULATED_NODES};
pub use error::{OffloadError, Result};
pub use kernels::{KERNEL_MODULE, MATMUL_KERNEL, SCALAR_KERNEL};
pub use runtime::{
    DeviceAddress, DeviceRuntime, ExecContextHandle, ModuleHandle, ProcessHandle, SyncDirection,
};
