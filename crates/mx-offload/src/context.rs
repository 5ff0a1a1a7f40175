use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::args::ArgBuffer;
use crate::emulated::EmulatedRuntime;
use crate::error::{OffloadError, Result};
use crate::kernels::KERNEL_MODULE;
use crate::runtime::{DeviceAddress, DeviceRuntime, ExecContextHandle, ModuleHandle, ProcessHandle};

pub const MAX_NODE: u32 = 3;
pub const MAX_THREADS: u32 = 8;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);
// Sessions whose device buffers may still be allocated.
static LIVE_SESSIONS: Mutex<BTreeSet<u64>> = Mutex::new(BTreeSet::new());

fn open_session() -> u64 {
    let id = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);
    LIVE_SESSIONS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(id);
    id
}

fn close_session(id: u64) {
    LIVE_SESSIONS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&id);
}

/// True while the context session `id` may still own device memory.
pub(crate) fn session_is_live(id: u64) -> bool {
    LIVE_SESSIONS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .contains(&id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Uninitialized,
    ProcessCreated,
    LibraryLoaded,
    Ready,
    /// A teardown step failed; the context cannot be used again.
    Closed,
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContextState::Uninitialized => "uninitialized",
            ContextState::ProcessCreated => "process-created",
            ContextState::LibraryLoaded => "library-loaded",
            ContextState::Ready => "ready",
            ContextState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Host-side handle on one accelerator process.
///
/// Owns the process, the loaded kernel module, the execution context, the
/// reusable argument buffer and every device buffer created through
/// [`AcceleratorContext::load`]. All remote state is reachable from here, so
/// several contexts can coexist without sharing anything.
///
/// Lifecycle: `Uninitialized -> ProcessCreated -> LibraryLoaded -> Ready`
/// during [`initialize`](Self::initialize), back to `Uninitialized` after a
/// clean [`teardown`](Self::teardown), or to `Closed` if teardown fails.
#[derive(Debug)]
pub struct AcceleratorContext {
    pub(crate) runtime: Box<dyn DeviceRuntime>,
    state: ContextState,
    node_selector: u32,
    thread_count: u32,
    module_path: String,
    pub(crate) process: Option<ProcessHandle>,
    pub(crate) module: Option<ModuleHandle>,
    pub(crate) exec_ctx: Option<ExecContextHandle>,
    pub(crate) args: Option<ArgBuffer>,
    pub(crate) buffers: HashSet<DeviceAddress>,
    /// Id stamped on every mirror of the current session; 0 when not ready.
    pub(crate) session: u64,
}

impl AcceleratorContext {
    /// Uninitialized context over `runtime`, node 0, one thread.
    pub fn new(runtime: Box<dyn DeviceRuntime>) -> Self {
        AcceleratorContext {
            runtime,
            state: ContextState::Uninitialized,
            node_selector: 0,
            thread_count: 1,
            module_path: KERNEL_MODULE.to_string(),
            process: None,
            module: None,
            exec_ctx: None,
            args: None,
            buffers: HashSet::new(),
            session: 0,
        }
    }

    /// Context over a fresh in-process emulated runtime.
    pub fn emulated() -> Self {
        Self::new(Box::new(EmulatedRuntime::new()))
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ContextState {
        self.state
    }

    /// True once [`initialize`](Self::initialize) has completed.
    pub fn is_ready(&self) -> bool {
        self.state == ContextState::Ready
    }

    /// Node the process is (or will be) created on.
    pub fn node_selector(&self) -> u32 {
        self.node_selector
    }

    /// Worker count passed to remote kernels.
    pub fn thread_count(&self) -> u32 {
        self.thread_count
    }

    /// Kernel module loaded by the next initialization.
    pub fn module_path(&self) -> &str {
        &self.module_path
    }

    /// Number of device buffers this context currently owns.
    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    fn require_unlocked(&self) -> Result<()> {
        match self.state {
            ContextState::Uninitialized => Ok(()),
            ContextState::Closed => Err(OffloadError::InvalidState {
                expected: ContextState::Uninitialized,
                actual: ContextState::Closed,
            }),
            _ => Err(OffloadError::ConfigLocked),
        }
    }

    /// Choose the node for the next [`initialize`](Self::initialize).
    /// Selectors above [`MAX_NODE`] fall back to node 0. Returns the value
    /// actually stored.
    pub fn set_node_selector(&mut self, node: u32) -> Result<u32> {
        self.require_unlocked()?;
        self.node_selector = if node > MAX_NODE {
            tracing::warn!(node, "node selector out of range, using node 0");
            0
        } else {
            node
        };
        Ok(self.node_selector)
    }

    /// Worker count passed to remote kernels, clamped to `1..=MAX_THREADS`.
    pub fn set_thread_count(&mut self, threads: u32) -> Result<u32> {
        self.require_unlocked()?;
        let clamped = threads.clamp(1, MAX_THREADS);
        if clamped != threads {
            tracing::warn!(requested = threads, using = clamped, "thread count clamped");
        }
        self.thread_count = clamped;
        Ok(clamped)
    }

    /// Kernel module for the next [`initialize`](Self::initialize).
    pub fn set_module_path(&mut self, path: impl Into<String>) -> Result<()> {
        self.require_unlocked()?;
        self.module_path = path.into();
        Ok(())
    }

    /// Create the process, load the kernel module and open an execution
    /// context. On failure every completed step is undone and the context
    /// is back in `Uninitialized`.
    pub fn initialize(&mut self) -> Result<()> {
        if self.state != ContextState::Uninitialized {
            return Err(OffloadError::InvalidState {
                expected: ContextState::Uninitialized,
                actual: self.state,
            });
        }

        if let Err(e) = self.bring_up() {
            tracing::warn!(state = %self.state, "accelerator init failed: {}", e);
            self.unwind();
            return Err(e);
        }
        tracing::info!(
            node = self.node_selector,
            threads = self.thread_count,
            module = %self.module_path,
            "accelerator ready"
        );
        Ok(())
    }

    fn bring_up(&mut self) -> Result<()> {
        let process = self.runtime.create_process(self.node_selector)?;
        self.process = Some(process);
        self.state = ContextState::ProcessCreated;

        let module = self.runtime.load_module(process, &self.module_path)?;
        self.module = Some(module);
        self.state = ContextState::LibraryLoaded;

        let ctx = self.runtime.open_context(process)?;
        self.exec_ctx = Some(ctx);
        self.args = Some(ArgBuffer::with_capacity(8));
        self.session = open_session();
        self.state = ContextState::Ready;
        Ok(())
    }

    /// Best-effort reverse of a partial [`bring_up`](Self::bring_up).
    fn unwind(&mut self) {
        self.args = None;
        if let Some(process) = self.process {
            if let Some(ctx) = self.exec_ctx.take() {
                if let Err(e) = self.runtime.close_context(process, ctx) {
                    tracing::warn!("unwind: closing execution context failed: {}", e);
                }
            }
            if let Some(module) = self.module.take() {
                if let Err(e) = self.runtime.unload_module(process, module) {
                    tracing::warn!("unwind: unloading module failed: {}", e);
                }
            }
        }
        if let Some(process) = self.process.take() {
            if let Err(e) = self.runtime.destroy_process(process) {
                tracing::warn!("unwind: destroying process failed: {}", e);
            }
        }
        self.state = ContextState::Uninitialized;
    }

    /// Free every device buffer still owned, then close the execution
    /// context, unload the module and destroy the process.
    ///
    /// Every step is attempted even if an earlier one fails. On full success
    /// the context returns to `Uninitialized` and may be initialized again;
    /// otherwise it ends in `Closed` and the first error is returned.
    /// Matrices that were still mirrored keep a stale mirror handle, which
    /// [`AcceleratorContext::release`] on any context clears.
    pub fn teardown(&mut self) -> Result<()> {
        let process = self.require_ready()?;
        let mut first_error: Option<OffloadError> = None;

        if !self.buffers.is_empty() {
            tracing::warn!(count = self.buffers.len(), "freeing device buffers still mirrored");
        }
        for address in std::mem::take(&mut self.buffers) {
            if let Err(e) = self.runtime.free(process, address) {
                tracing::warn!(address, "teardown: free failed: {}", e);
                first_error.get_or_insert(e);
            }
        }

        self.args = None;
        if let Some(ctx) = self.exec_ctx.take() {
            if let Err(e) = self.runtime.close_context(process, ctx) {
                tracing::warn!("teardown: closing execution context failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        if let Some(module) = self.module.take() {
            if let Err(e) = self.runtime.unload_module(process, module) {
                tracing::warn!("teardown: unloading module failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        self.process = None;
        if let Err(e) = self.runtime.destroy_process(process) {
            tracing::warn!("teardown: destroying process failed: {}", e);
            first_error.get_or_insert(e);
        }
        // Nothing can reach this session's buffers any more, freed or not.
        close_session(std::mem::take(&mut self.session));

        match first_error {
            Some(e) => {
                self.state = ContextState::Closed;
                Err(e)
            }
            None => {
                self.state = ContextState::Uninitialized;
                tracing::info!("accelerator closed");
                Ok(())
            }
        }
    }

    /// Process handle if the context is `Ready`. Fails without any remote
    /// communication otherwise.
    pub(crate) fn require_ready(&self) -> Result<ProcessHandle> {
        match (self.state, self.process) {
            (ContextState::Ready, Some(process)) => Ok(process),
            (actual, _) => Err(OffloadError::InvalidState {
                expected: ContextState::Ready,
                actual,
            }),
        }
    }
}

impl Drop for AcceleratorContext {
    fn drop(&mut self) {
        if self.state == ContextState::Ready {
            if let Err(e) = self.teardown() {
                tracing::warn!("accelerator teardown on drop failed: {}", e);
            }
        }
    }
}
