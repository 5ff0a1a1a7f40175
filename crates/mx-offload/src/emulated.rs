//! In-process accelerator emulation.
//!
//! Each created process is a dedicated OS thread that owns a [`DeviceHeap`]
//! and the modules loaded into it. The host side talks to it only through
//! request/reply messages, so device memory is never touched directly from
//! the caller's thread. An [`EmulatorProbe`] shared with the runtime lets
//! callers inject failures at named points and observe traffic.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crate::args::ArgBuffer;
use crate::error::{OffloadError, Result};
use crate::heap::{DeviceHeap, HEAP_BASE};
use crate::kernels::{find_module, KernelModule};
use crate::runtime::{
    DeviceAddress, DeviceRuntime, ExecContextHandle, ModuleHandle, ProcessHandle, SyncDirection,
};

pub const EMULATED_NODES: u32 = 4;
pub const DEFAULT_DEVICE_CAPACITY: usize = 256 << 20;

const INJECTED: &str = "injected fault";
// Each process gets its own address window so handles from a destroyed
// process never match buffers of a later one.
const PROCESS_WINDOW_SHIFT: u32 = 36;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    CreateProcess,
    LoadModule,
    OpenContext,
    Alloc,
    Free,
    CopyToDevice,
    CopyToHost,
    Call,
    CloseContext,
    UnloadModule,
    DestroyProcess,
}

/// Shared handle for fault injection and traffic accounting.
#[derive(Debug, Clone, Default)]
pub struct EmulatorProbe {
    faults: Arc<Mutex<HashSet<FaultPoint>>>,
    requests: Arc<AtomicU64>,
    device_buffers: Arc<AtomicUsize>,
}

impl EmulatorProbe {
    /// Make every following operation at `point` fail until disarmed.
    pub fn arm(&self, point: FaultPoint) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(point);
    }

    pub fn disarm(&self, point: FaultPoint) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&point);
    }

    pub fn clear_faults(&self) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn is_armed(&self, point: FaultPoint) -> bool {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&point)
    }

    /// Requests that reached a device process or the process manager.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    /// Device buffers currently allocated across all live processes.
    pub fn device_buffers(&self) -> usize {
        self.device_buffers.load(Ordering::SeqCst)
    }
}

type Reply<T> = Sender<Result<T>>;

#[derive(Debug)]
enum Request {
    LoadModule {
        path: String,
        reply: Reply<ModuleHandle>,
    },
    UnloadModule {
        module: ModuleHandle,
        reply: Reply<()>,
    },
    OpenContext {
        reply: Reply<ExecContextHandle>,
    },
    CloseContext {
        ctx: ExecContextHandle,
        reply: Reply<()>,
    },
    Alloc {
        bytes: usize,
        reply: Reply<DeviceAddress>,
    },
    Free {
        address: DeviceAddress,
        reply: Reply<()>,
    },
    Write {
        address: DeviceAddress,
        data: Vec<f32>,
        reply: Reply<()>,
    },
    Read {
        address: DeviceAddress,
        len: usize,
        reply: Reply<Vec<f32>>,
    },
    Call {
        ctx: ExecContextHandle,
        module: ModuleHandle,
        symbol: String,
        args: ArgBuffer,
        reply: Reply<u64>,
    },
    Shutdown,
}

#[derive(Debug)]
struct DeviceProcess {
    node: u32,
    requests: Sender<Request>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceProcess {
    fn shutdown(&mut self) -> Result<()> {
        let _ = self.requests.send(Request::Shutdown);
        match self.thread.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| OffloadError::ProcessDestroy("device thread panicked".into())),
            None => Ok(()),
        }
    }
}

/// State owned by the device thread.
struct DeviceState {
    node: u32,
    heap: DeviceHeap,
    modules: HashMap<u64, &'static KernelModule>,
    contexts: HashSet<u64>,
    next_id: u64,
    buffers: Arc<AtomicUsize>,
}

impl DeviceState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn handle(&mut self, request: Request) {
        // A dropped reply channel means the host gave up; nothing to report to.
        match request {
            Request::LoadModule { path, reply } => {
                let _ = reply.send(self.load_module(&path));
            }
            Request::UnloadModule { module, reply } => {
                let outcome = match self.modules.remove(&module.0) {
                    Some(_) => Ok(()),
                    None => Err(OffloadError::ModuleUnload(format!(
                        "module {} not loaded",
                        module.0
                    ))),
                };
                let _ = reply.send(outcome);
            }
            Request::OpenContext { reply } => {
                let id = self.next_id();
                self.contexts.insert(id);
                let _ = reply.send(Ok(ExecContextHandle(id)));
            }
            Request::CloseContext { ctx, reply } => {
                let outcome = if self.contexts.remove(&ctx.0) {
                    Ok(())
                } else {
                    Err(OffloadError::ContextClose(format!("context {} not open", ctx.0)))
                };
                let _ = reply.send(outcome);
            }
            Request::Alloc { bytes, reply } => {
                let outcome = self.heap.alloc(bytes);
                if outcome.is_ok() {
                    self.buffers.fetch_add(1, Ordering::SeqCst);
                }
                let _ = reply.send(outcome);
            }
            Request::Free { address, reply } => {
                let outcome = self.heap.free(address);
                if outcome.is_ok() {
                    self.buffers.fetch_sub(1, Ordering::SeqCst);
                }
                let _ = reply.send(outcome);
            }
            Request::Write {
                address,
                data,
                reply,
            } => {
                let _ = reply.send(self.write(address, &data));
            }
            Request::Read {
                address,
                len,
                reply,
            } => {
                let _ = reply.send(self.read(address, len));
            }
            Request::Call {
                ctx,
                module,
                symbol,
                args,
                reply,
            } => {
                let _ = reply.send(self.call(ctx, module, &symbol, &args));
            }
            Request::Shutdown => {}
        }
    }

    fn load_module(&mut self, path: &str) -> Result<ModuleHandle> {
        let module = find_module(path).ok_or_else(|| OffloadError::ModuleLoad {
            path: path.to_string(),
            reason: "no such module".into(),
        })?;
        let id = self.next_id();
        self.modules.insert(id, module);
        tracing::debug!(node = self.node, module = module.name, "module loaded");
        Ok(ModuleHandle(id))
    }

    fn write(&mut self, address: DeviceAddress, data: &[f32]) -> Result<()> {
        let block = self
            .heap
            .block_mut(address)
            .map_err(|e| sync_error(SyncDirection::HostToDevice, e))?;
        if block.len() < data.len() {
            return Err(OffloadError::Sync {
                direction: SyncDirection::HostToDevice,
                reason: format!("{} floats into a {}-float buffer", data.len(), block.len()),
            });
        }
        block[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, address: DeviceAddress, len: usize) -> Result<Vec<f32>> {
        let block = self
            .heap
            .block(address)
            .map_err(|e| sync_error(SyncDirection::DeviceToHost, e))?;
        if block.len() < len {
            return Err(OffloadError::Sync {
                direction: SyncDirection::DeviceToHost,
                reason: format!("{len} floats from a {}-float buffer", block.len()),
            });
        }
        Ok(block[..len].to_vec())
    }

    fn call(
        &mut self,
        ctx: ExecContextHandle,
        module: ModuleHandle,
        symbol: &str,
        args: &ArgBuffer,
    ) -> Result<u64> {
        let dispatch = |reason: String| OffloadError::Dispatch {
            symbol: symbol.to_string(),
            reason,
        };
        if !self.contexts.contains(&ctx.0) {
            return Err(dispatch(format!("context {} not open", ctx.0)));
        }
        let kernel = self
            .modules
            .get(&module.0)
            .ok_or_else(|| dispatch(format!("module {} not loaded", module.0)))?
            .symbol(symbol)
            .ok_or_else(|| dispatch("symbol not found".into()))?;

        match kernel(args, &mut self.heap) {
            Ok(word) => Ok(word),
            Err(e) => {
                tracing::warn!(node = self.node, symbol, "kernel failed: {}", e);
                Ok(0)
            }
        }
    }
}

fn sync_error(direction: SyncDirection, source: OffloadError) -> OffloadError {
    OffloadError::Sync {
        direction,
        reason: source.to_string(),
    }
}

fn device_main(mut state: DeviceState, requests: Receiver<Request>) {
    tracing::debug!(node = state.node, "device process started");
    while let Ok(request) = requests.recv() {
        if matches!(request, Request::Shutdown) {
            break;
        }
        state.handle(request);
    }
    let leaked = state.heap.live_blocks();
    if leaked > 0 {
        tracing::debug!(node = state.node, leaked, "reclaiming device buffers at exit");
    }
    state.buffers.fetch_sub(leaked, Ordering::SeqCst);
    tracing::debug!(node = state.node, "device process exited");
}

/// [`DeviceRuntime`] backed by device threads in the current process.
#[derive(Debug)]
pub struct EmulatedRuntime {
    processes: HashMap<ProcessHandle, DeviceProcess>,
    next_process: u64,
    capacity: usize,
    probe: EmulatorProbe,
}

impl EmulatedRuntime {
    pub fn new() -> Self {
        EmulatedRuntime {
            processes: HashMap::new(),
            next_process: 0,
            capacity: DEFAULT_DEVICE_CAPACITY,
            probe: EmulatorProbe::default(),
        }
    }

    /// Limit the device memory of each process to `bytes`.
    pub fn with_capacity(mut self, bytes: usize) -> Self {
        self.capacity = bytes;
        self
    }

    pub fn with_fault(self, point: FaultPoint) -> Self {
        self.probe.arm(point);
        self
    }

    pub fn probe(&self) -> EmulatorProbe {
        self.probe.clone()
    }

    pub fn live_processes(&self) -> usize {
        self.processes.len()
    }

    fn injected(&self, point: FaultPoint) -> bool {
        let armed = self.probe.is_armed(point);
        if armed {
            tracing::debug!(?point, "injecting fault");
        }
        armed
    }

    fn request<T>(
        &self,
        process: ProcessHandle,
        build: impl FnOnce(Reply<T>) -> Request,
    ) -> Result<T> {
        let target = self
            .processes
            .get(&process)
            .ok_or(OffloadError::Disconnected)?;
        self.probe.requests.fetch_add(1, Ordering::SeqCst);
        let (reply, response) = mpsc::channel();
        target
            .requests
            .send(build(reply))
            .map_err(|_| OffloadError::Disconnected)?;
        response.recv().map_err(|_| OffloadError::Disconnected)?
    }
}

impl Default for EmulatedRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EmulatedRuntime {
    fn drop(&mut self) {
        for (handle, mut process) in self.processes.drain() {
            tracing::debug!(process = handle.0, node = process.node, "stopping device process");
            if let Err(e) = process.shutdown() {
                tracing::warn!(process = handle.0, "device process shutdown failed: {}", e);
            }
        }
    }
}

impl DeviceRuntime for EmulatedRuntime {
    fn node_count(&self) -> u32 {
        EMULATED_NODES
    }

    fn create_process(&mut self, node: u32) -> Result<ProcessHandle> {
        if node >= EMULATED_NODES {
            return Err(OffloadError::ProcessCreate {
                node,
                reason: format!("only {EMULATED_NODES} nodes available"),
            });
        }
        if self.injected(FaultPoint::CreateProcess) {
            return Err(OffloadError::ProcessCreate {
                node,
                reason: INJECTED.into(),
            });
        }
        self.probe.requests.fetch_add(1, Ordering::SeqCst);

        self.next_process += 1;
        let handle = ProcessHandle(self.next_process);
        let base = HEAP_BASE + (self.next_process << PROCESS_WINDOW_SHIFT);

        let (tx, rx) = mpsc::channel();
        let state = DeviceState {
            node,
            heap: DeviceHeap::with_base(self.capacity, base),
            modules: HashMap::new(),
            contexts: HashSet::new(),
            next_id: 0,
            buffers: Arc::clone(&self.probe.device_buffers),
        };
        let thread = thread::Builder::new()
            .name(format!("mx-device-{node}"))
            .spawn(move || device_main(state, rx))
            .map_err(|e| OffloadError::ProcessCreate {
                node,
                reason: e.to_string(),
            })?;

        self.processes.insert(
            handle,
            DeviceProcess {
                node,
                requests: tx,
                thread: Some(thread),
            },
        );
        Ok(handle)
    }

    fn destroy_process(&mut self, process: ProcessHandle) -> Result<()> {
        if self.injected(FaultPoint::DestroyProcess) {
            return Err(OffloadError::ProcessDestroy(INJECTED.into()));
        }
        let mut target = self
            .processes
            .remove(&process)
            .ok_or_else(|| OffloadError::ProcessDestroy(format!("unknown process {}", process.0)))?;
        self.probe.requests.fetch_add(1, Ordering::SeqCst);
        target.shutdown()
    }

    fn load_module(&mut self, process: ProcessHandle, path: &str) -> Result<ModuleHandle> {
        if self.injected(FaultPoint::LoadModule) {
            return Err(OffloadError::ModuleLoad {
                path: path.to_string(),
                reason: INJECTED.into(),
            });
        }
        let path = path.to_string();
        self.request(process, |reply| Request::LoadModule { path, reply })
    }

    fn unload_module(&mut self, process: ProcessHandle, module: ModuleHandle) -> Result<()> {
        if self.injected(FaultPoint::UnloadModule) {
            return Err(OffloadError::ModuleUnload(INJECTED.into()));
        }
        self.request(process, |reply| Request::UnloadModule { module, reply })
    }

    fn open_context(&mut self, process: ProcessHandle) -> Result<ExecContextHandle> {
        if self.injected(FaultPoint::OpenContext) {
            return Err(OffloadError::ContextOpen(INJECTED.into()));
        }
        self.request(process, |reply| Request::OpenContext { reply })
    }

    fn close_context(&mut self, process: ProcessHandle, ctx: ExecContextHandle) -> Result<()> {
        if self.injected(FaultPoint::CloseContext) {
            return Err(OffloadError::ContextClose(INJECTED.into()));
        }
        self.request(process, |reply| Request::CloseContext { ctx, reply })
    }

    fn alloc(&mut self, process: ProcessHandle, bytes: usize) -> Result<DeviceAddress> {
        if self.injected(FaultPoint::Alloc) {
            return Err(OffloadError::DeviceAlloc {
                bytes,
                reason: INJECTED.into(),
            });
        }
        self.request(process, |reply| Request::Alloc { bytes, reply })
    }

    fn free(&mut self, process: ProcessHandle, address: DeviceAddress) -> Result<()> {
        if self.injected(FaultPoint::Free) {
            return Err(OffloadError::DeviceFree {
                address,
                reason: INJECTED.into(),
            });
        }
        self.request(process, |reply| Request::Free { address, reply })
    }

    fn write(&mut self, process: ProcessHandle, dst: DeviceAddress, src: &[f32]) -> Result<()> {
        if self.injected(FaultPoint::CopyToDevice) {
            return Err(OffloadError::Sync {
                direction: SyncDirection::HostToDevice,
                reason: INJECTED.into(),
            });
        }
        let data = src.to_vec();
        self.request(process, |reply| Request::Write {
            address: dst,
            data,
            reply,
        })
    }

    fn read(&mut self, process: ProcessHandle, src: DeviceAddress, dst: &mut [f32]) -> Result<()> {
        if self.injected(FaultPoint::CopyToHost) {
            return Err(OffloadError::Sync {
                direction: SyncDirection::DeviceToHost,
                reason: INJECTED.into(),
            });
        }
        let len = dst.len();
        let data = self.request(process, |reply| Request::Read {
            address: src,
            len,
            reply,
        })?;
        dst.copy_from_slice(&data);
        Ok(())
    }

    fn call(
        &mut self,
        process: ProcessHandle,
        ctx: ExecContextHandle,
        module: ModuleHandle,
        symbol: &str,
        args: &ArgBuffer,
    ) -> Result<u64> {
        if self.injected(FaultPoint::Call) {
            return Err(OffloadError::Dispatch {
                symbol: symbol.to_string(),
                reason: INJECTED.into(),
            });
        }
        let symbol = symbol.to_string();
        let args = args.clone();
        self.request(process, |reply| Request::Call {
            ctx,
            module,
            symbol,
            args,
            reply,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::{KERNEL_MODULE, SCALAR_KERNEL};

    #[test]
    fn test_process_roundtrip() {
        let mut rt = EmulatedRuntime::new();
        let probe = rt.probe();
        let p = rt.create_process(1).unwrap();
        let addr = rt.alloc(p, 16).unwrap();
        rt.write(p, addr, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let mut back = [0.0; 4];
        rt.read(p, addr, &mut back).unwrap();
        assert_eq!(back, [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(probe.device_buffers(), 1);
        rt.free(p, addr).unwrap();
        assert_eq!(probe.device_buffers(), 0);
        rt.destroy_process(p).unwrap();
        assert_eq!(rt.live_processes(), 0);
    }

    #[test]
    fn test_invalid_node() {
        let mut rt = EmulatedRuntime::new();
        assert!(matches!(
            rt.create_process(EMULATED_NODES),
            Err(OffloadError::ProcessCreate { node: 4, .. })
        ));
    }

    #[test]
    fn test_call_scalar_kernel() {
        let mut rt = EmulatedRuntime::new();
        let p = rt.create_process(0).unwrap();
        let module = rt.load_module(p, KERNEL_MODULE).unwrap();
        let ctx = rt.open_context(p).unwrap();
        let addr = rt.alloc(p, 8).unwrap();
        rt.write(p, addr, &[1.5, -2.0]).unwrap();

        let mut args = ArgBuffer::new();
        args.push_u32(2).push_u64(1).push_u64(2).push_address(addr).push_f32(2.0);
        assert_eq!(rt.call(p, ctx, module, SCALAR_KERNEL, &args).unwrap(), 1);

        let mut back = [0.0; 2];
        rt.read(p, addr, &mut back).unwrap();
        assert_eq!(back, [3.0, -4.0]);
    }

    #[test]
    fn test_kernel_error_is_zero_word() {
        let mut rt = EmulatedRuntime::new();
        let p = rt.create_process(0).unwrap();
        let module = rt.load_module(p, KERNEL_MODULE).unwrap();
        let ctx = rt.open_context(p).unwrap();
        let args = ArgBuffer::new();
        assert_eq!(rt.call(p, ctx, module, SCALAR_KERNEL, &args).unwrap(), 0);
    }

    #[test]
    fn test_unknown_symbol_and_module() {
        let mut rt = EmulatedRuntime::new();
        let p = rt.create_process(0).unwrap();
        assert!(matches!(
            rt.load_module(p, "libnothing.so"),
            Err(OffloadError::ModuleLoad { .. })
        ));
        let module = rt.load_module(p, KERNEL_MODULE).unwrap();
        let ctx = rt.open_context(p).unwrap();
        assert!(matches!(
            rt.call(p, ctx, module, "nope", &ArgBuffer::new()),
            Err(OffloadError::Dispatch { .. })
        ));
    }

    #[test]
    fn test_capacity_limit() {
        let mut rt = EmulatedRuntime::new().with_capacity(64);
        let p = rt.create_process(0).unwrap();
        rt.alloc(p, 64).unwrap();
        assert!(matches!(rt.alloc(p, 4), Err(OffloadError::DeviceAlloc { .. })));
    }

    #[test]
    fn test_fault_injection() {
        let mut rt = EmulatedRuntime::new().with_fault(FaultPoint::OpenContext);
        let probe = rt.probe();
        let p = rt.create_process(0).unwrap();
        assert!(rt.open_context(p).is_err());
        probe.disarm(FaultPoint::OpenContext);
        assert!(rt.open_context(p).is_ok());

        probe.arm(FaultPoint::CopyToHost);
        let addr = rt.alloc(p, 4).unwrap();
        let mut dst = [0.0];
        assert!(matches!(
            rt.read(p, addr, &mut dst),
            Err(OffloadError::Sync {
                direction: SyncDirection::DeviceToHost,
                ..
            })
        ));
    }

    #[test]
    fn test_exit_reclaims_buffers() {
        let mut rt = EmulatedRuntime::new();
        let probe = rt.probe();
        let p = rt.create_process(2).unwrap();
        rt.alloc(p, 4).unwrap();
        rt.alloc(p, 4).unwrap();
        assert_eq!(probe.device_buffers(), 2);
        rt.destroy_process(p).unwrap();
        assert_eq!(probe.device_buffers(), 0);
    }

    #[test]
    fn test_requests_to_dead_process() {
        let mut rt = EmulatedRuntime::new();
        let p = rt.create_process(0).unwrap();
        rt.destroy_process(p).unwrap();
        assert!(matches!(rt.alloc(p, 4), Err(OffloadError::Disconnected)));
    }
}
