//! The boundary between the host and an accelerator runtime.
//!
//! Everything the context does on the device goes through [`DeviceRuntime`]:
//! process lifecycle, module loading, execution contexts, device memory and
//! remote calls. The trait is object safe so a context can hold any runtime
//! behind a `Box<dyn DeviceRuntime>`.

use std::fmt;

use crate::args::ArgBuffer;
use crate::error::Result;

/// Address of a buffer in accelerator memory.
pub type DeviceAddress = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecContextHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    HostToDevice,
    DeviceToHost,
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncDirection::HostToDevice => write!(f, "host-to-device"),
            SyncDirection::DeviceToHost => write!(f, "device-to-host"),
        }
    }
}

pub trait DeviceRuntime: Send + fmt::Debug {
    /// Number of accelerator nodes a process can be created on.
    fn node_count(&self) -> u32;

    fn create_process(&mut self, node: u32) -> Result<ProcessHandle>;
    fn destroy_process(&mut self, process: ProcessHandle) -> Result<()>;

    fn load_module(&mut self, process: ProcessHandle, path: &str) -> Result<ModuleHandle>;
    fn unload_module(&mut self, process: ProcessHandle, module: ModuleHandle) -> Result<()>;

    fn open_context(&mut self, process: ProcessHandle) -> Result<ExecContextHandle>;
    fn close_context(&mut self, process: ProcessHandle, ctx: ExecContextHandle) -> Result<()>;

    fn alloc(&mut self, process: ProcessHandle, bytes: usize) -> Result<DeviceAddress>;
    fn free(&mut self, process: ProcessHandle, address: DeviceAddress) -> Result<()>;

    /// Copy `src` into device memory starting at `dst`.
    fn write(&mut self, process: ProcessHandle, dst: DeviceAddress, src: &[f32]) -> Result<()>;
    /// Fill `dst` from device memory starting at `src`.
    fn read(&mut self, process: ProcessHandle, src: DeviceAddress, dst: &mut [f32]) -> Result<()>;

    /// Run `symbol` from `module` synchronously and return its result word.
    fn call(
        &mut self,
        process: ProcessHandle,
        ctx: ExecContextHandle,
        module: ModuleHandle,
        symbol: &str,
        args: &ArgBuffer,
    ) -> Result<u64>;
}
