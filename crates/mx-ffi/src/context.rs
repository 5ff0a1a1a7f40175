use mx_matrix::{BackendKind, ComputeBackend, Matrix, SequentialBackend, SimdBackend};
use mx_offload::{AcceleratorContext, ContextState, DeviceRuntime, OffloadError};

use crate::config::EngineConfig;
use crate::error::Result;

/// Opaque context handle that owns every backend and the accelerator
/// session. Operations go to the backend selected in its [`EngineConfig`].
#[derive(Debug)]
pub struct MxContext {
    config: EngineConfig,
    sequential: SequentialBackend,
    simd: SimdBackend,
    accelerator: AcceleratorContext,
}

impl MxContext {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_accelerator(config, AcceleratorContext::emulated())
    }

    pub fn with_runtime(config: EngineConfig, runtime: Box<dyn DeviceRuntime>) -> Self {
        Self::with_accelerator(config, AcceleratorContext::new(runtime))
    }

    fn with_accelerator(config: EngineConfig, accelerator: AcceleratorContext) -> Self {
        tracing::debug!(backend = %config.backend, threads = config.thread_count, "context created");
        Self {
            simd: SimdBackend::new(config.thread_count),
            sequential: SequentialBackend::new(),
            accelerator,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn accelerator(&self) -> &AcceleratorContext {
        &self.accelerator
    }

    fn accelerator_live(&self) -> bool {
        self.accelerator.state() != ContextState::Uninitialized
    }

    pub fn backend_mut(&mut self) -> &mut dyn ComputeBackend {
        match self.config.backend {
            BackendKind::Sequential => &mut self.sequential,
            BackendKind::ThreadedSimd => &mut self.simd,
            BackendKind::AcceleratorOffload => &mut self.accelerator,
        }
    }

    pub fn scalar_multiply(&mut self, scalar: f32, matrix: &mut Matrix) -> Result<()> {
        Ok(self.backend_mut().scalar_multiply(scalar, matrix)?)
    }

    pub fn matrix_multiply(&mut self, a: &Matrix, b: &Matrix, dest: &mut Matrix) -> Result<()> {
        Ok(self.backend_mut().matrix_multiply(a, b, dest)?)
    }

    /// Worker count for the SIMD backend and for the next accelerator
    /// initialization. Rejected while the accelerator backend is live.
    pub fn set_thread_count(&mut self, threads: u32) -> Result<()> {
        if self.config.backend == BackendKind::AcceleratorOffload && self.accelerator_live() {
            return Err(OffloadError::ConfigLocked.into());
        }
        self.simd.set_thread_count(threads);
        self.config.thread_count = self.simd.thread_count();
        Ok(())
    }

    pub fn set_accelerator_node(&mut self, node: u32) -> Result<()> {
        if self.accelerator_live() {
            return Err(OffloadError::ConfigLocked.into());
        }
        self.config.accelerator_node = node;
        Ok(())
    }

    pub fn init_accelerator(&mut self) -> Result<()> {
        self.accelerator.set_thread_count(self.config.thread_count)?;
        self.accelerator.set_node_selector(self.config.accelerator_node)?;
        self.accelerator.set_module_path(self.config.module_path.clone())?;
        Ok(self.accelerator.initialize()?)
    }

    pub fn close_accelerator(&mut self) -> Result<()> {
        Ok(self.accelerator.teardown()?)
    }

    pub fn load_mirror(&mut self, matrix: &mut Matrix) -> Result<()> {
        Ok(self.accelerator.load(matrix)?)
    }

    pub fn unload_mirror(&mut self, matrix: &mut Matrix) -> Result<()> {
        Ok(self.accelerator.unload(matrix)?)
    }

    pub fn sync_to_device(&mut self, matrix: &Matrix) -> Result<()> {
        Ok(self.accelerator.sync_to_device(matrix)?)
    }

    pub fn sync_to_host(&mut self, matrix: &mut Matrix) -> Result<()> {
        Ok(self.accelerator.sync_to_host(matrix)?)
    }

    /// Make `matrix` safe to free: unload a live mirror or drop a stale one.
    pub fn drain_mirror(&mut self, matrix: &mut Matrix) -> Result<()> {
        Ok(self.accelerator.drain(matrix)?)
    }
}
