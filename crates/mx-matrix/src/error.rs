use thiserror::Error;

/// Coarse classification of a failure, independent of which layer raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input detected before any work started. Nothing was mutated.
    Validation,
    /// Host allocation, device allocation or thread launch failed.
    Resource,
    /// Talking to the accelerator process failed.
    RemoteCommunication,
    /// A host/device copy failed; the two copies may now disagree.
    Synchronization,
    /// Reading or writing a matrix file failed.
    Io,
}

#[derive(Error, Debug)]
pub enum MatrixError {
    #[error("matrix dimensions must be non-zero, got {height}x{width}")]
    EmptyMatrix { height: usize, width: usize },
    #[error("matrix of {height}x{width} elements overflows the address space")]
    TooLarge { height: usize, width: usize },
    #[error("buffer length mismatch: expected {expected} elements, got {got}")]
    LengthMismatch { expected: usize, got: usize },
    #[error("destination shape mismatch: expected [{expected_h}x{expected_w}], got [{got_h}x{got_w}]")]
    ShapeMismatch {
        expected_h: usize,
        expected_w: usize,
        got_h: usize,
        got_w: usize,
    },
    #[error("matmul dimension mismatch: [{m}x{k}] @ [{k2}x{n}]")]
    MatmulMismatch {
        m: usize,
        k: usize,
        k2: usize,
        n: usize,
    },
    #[error("{what} of {value} is not divisible by {divisor}")]
    Indivisible {
        what: &'static str,
        value: usize,
        divisor: usize,
    },
    #[error("thread count must be at least 1")]
    ZeroThreads,
    #[error("nothing to partition: total work units is zero")]
    NoWork,
    #[error("index ({row}, {col}) out of bounds for [{height}x{width}] matrix")]
    OutOfBounds {
        row: usize,
        col: usize,
        height: usize,
        width: usize,
    },
    #[error("matrix still has a device mirror; unload it before release")]
    StillMirrored,
    #[error("host allocation of {bytes} bytes failed")]
    AllocationFailed { bytes: usize },
    #[error("failed to launch worker thread {thread_id}: {source}")]
    ThreadLaunch {
        thread_id: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("worker thread {thread_id} panicked")]
    WorkerPanicked { thread_id: u32 },
    #[error("short read from {path}: expected {expected} bytes, file has {got}")]
    ShortRead {
        path: String,
        expected: usize,
        got: usize,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{backend} backend: {source}")]
    Backend {
        backend: &'static str,
        kind: ErrorKind,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl MatrixError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MatrixError::EmptyMatrix { .. }
            | MatrixError::LengthMismatch { .. }
            | MatrixError::ShapeMismatch { .. }
            | MatrixError::MatmulMismatch { .. }
            | MatrixError::Indivisible { .. }
            | MatrixError::ZeroThreads
            | MatrixError::NoWork
            | MatrixError::OutOfBounds { .. }
            | MatrixError::StillMirrored => ErrorKind::Validation,
            MatrixError::TooLarge { .. }
            | MatrixError::AllocationFailed { .. }
            | MatrixError::ThreadLaunch { .. }
            | MatrixError::WorkerPanicked { .. } => ErrorKind::Resource,
            MatrixError::ShortRead { .. } | MatrixError::Io(_) => ErrorKind::Io,
            MatrixError::Backend { kind, .. } => *kind,
        }
    }
}

pub type Result<T> = std::result::Result<T, MatrixError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            MatrixError::MatmulMismatch { m: 1, k: 2, k2: 3, n: 4 }.kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            MatrixError::AllocationFailed { bytes: 64 }.kind(),
            ErrorKind::Resource
        );
        let backend = MatrixError::Backend {
            backend: "accelerator",
            kind: ErrorKind::Synchronization,
            source: "copy failed".into(),
        };
        assert_eq!(backend.kind(), ErrorKind::Synchronization);
    }

    #[test]
    fn test_display() {
        let e = MatrixError::Indivisible {
            what: "width",
            value: 12,
            divisor: 8,
        };
        assert_eq!(e.to_string(), "width of 12 is not divisible by 8");
    }
}
