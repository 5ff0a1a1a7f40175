use std::cell::RefCell;
use std::ffi::CString;
use std::fmt::Display;

use mx_matrix::{ErrorKind, MatrixError};
use mx_offload::OffloadError;
use thiserror::Error;

use crate::logging::LoggingError;

#[derive(Debug, Error)]
pub enum FfiError {
    #[error("null pointer passed for `{0}`")]
    NullPointer(&'static str),
    #[error("`{0}` is not valid UTF-8")]
    InvalidUtf8(&'static str),
    #[error("destination matrix aliases an operand")]
    Aliased,
    #[error("invalid value '{value}' for {key}: {reason}")]
    Config {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error(transparent)]
    Matrix(#[from] MatrixError),
    #[error(transparent)]
    Offload(#[from] OffloadError),
    #[error(transparent)]
    Logging(#[from] LoggingError),
}

impl FfiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FfiError::Matrix(e) => e.kind(),
            FfiError::Offload(e) => e.kind(),
            FfiError::Logging(_)
            | FfiError::NullPointer(_)
            | FfiError::InvalidUtf8(_)
            | FfiError::Aliased
            | FfiError::Config { .. } => ErrorKind::Validation,
        }
    }
}

pub type Result<T> = std::result::Result<T, FfiError>;

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

/// Store an error message for later retrieval via `mx_last_error`.
pub fn set_last_error(msg: impl Display) {
    let msg = msg.to_string().replace('\0', " ");
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

/// Take the last error message, leaving `None` in its place.
pub fn take_last_error() -> Option<CString> {
    LAST_ERROR.with(|e| e.borrow_mut().take())
}
