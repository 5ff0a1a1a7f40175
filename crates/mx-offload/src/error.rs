use mx_matrix::{ErrorKind, MatrixError};
use thiserror::Error;

use crate::context::ContextState;
use crate::runtime::SyncDirection;

#[derive(Error, Debug)]
pub enum OffloadError {
    #[error("invalid accelerator state: expected {expected}, found {actual}")]
    InvalidState {
        expected: ContextState,
        actual: ContextState,
    },
    #[error("accelerator configuration is locked while the process is live")]
    ConfigLocked,
    #[error("matrix has no device mirror")]
    NotMirrored,
    #[error("matrix already mirrored at device address {0:#x}")]
    AlreadyMirrored(u64),
    #[error("device buffer {0:#x} is not owned by this context")]
    UnknownAddress(u64),
    #[error("failed to create accelerator process on node {node}: {reason}")]
    ProcessCreate { node: u32, reason: String },
    #[error("failed to destroy accelerator process: {0}")]
    ProcessDestroy(String),
    #[error("failed to load module '{path}': {reason}")]
    ModuleLoad { path: String, reason: String },
    #[error("failed to unload module: {0}")]
    ModuleUnload(String),
    #[error("failed to open execution context: {0}")]
    ContextOpen(String),
    #[error("failed to close execution context: {0}")]
    ContextClose(String),
    #[error("remote call to '{symbol}' failed: {reason}")]
    Dispatch { symbol: String, reason: String },
    #[error("remote kernel '{symbol}' reported failure")]
    KernelFailed { symbol: String },
    #[error("bad kernel argument {index}: {reason}")]
    BadArgument { index: usize, reason: String },
    #[error("device allocation of {bytes} bytes failed: {reason}")]
    DeviceAlloc { bytes: usize, reason: String },
    #[error("device free of {address:#x} failed: {reason}")]
    DeviceFree { address: u64, reason: String },
    #[error("{direction} copy failed: {reason}")]
    Sync {
        direction: SyncDirection,
        reason: String,
    },
    #[error("accelerator process is not reachable")]
    Disconnected,
    #[error(transparent)]
    Matrix(#[from] MatrixError),
}

impl OffloadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OffloadError::InvalidState { .. }
            | OffloadError::ConfigLocked
            | OffloadError::NotMirrored
            | OffloadError::AlreadyMirrored(_)
            | OffloadError::UnknownAddress(_)
            | OffloadError::BadArgument { .. } => ErrorKind::Validation,
            OffloadError::DeviceAlloc { .. } | OffloadError::DeviceFree { .. } => {
                ErrorKind::Resource
            }
            OffloadError::ProcessCreate { .. }
            | OffloadError::ProcessDestroy(_)
            | OffloadError::ModuleLoad { .. }
            | OffloadError::ModuleUnload(_)
            | OffloadError::ContextOpen(_)
            | OffloadError::ContextClose(_)
            | OffloadError::Dispatch { .. }
            | OffloadError::KernelFailed { .. }
            | OffloadError::Disconnected => ErrorKind::RemoteCommunication,
            OffloadError::Sync { .. } => ErrorKind::Synchronization,
            OffloadError::Matrix(e) => e.kind(),
        }
    }
}

impl From<OffloadError> for MatrixError {
    fn from(e: OffloadError) -> Self {
        match e {
            OffloadError::Matrix(inner) => inner,
            other => MatrixError::Backend {
                backend: "accelerator",
                kind: other.kind(),
                source: Box::new(other),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, OffloadError>;
