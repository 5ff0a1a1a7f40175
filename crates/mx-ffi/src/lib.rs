//! C ABI for matmul-engine.
//!
//! Every entry point returns `true` on success and `false` on failure; the
//! reason for the most recent failure on the calling thread is available
//! from [`mx_last_error`]. Panics never cross the boundary.

pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod types;

pub use config::EngineConfig;
pub use context::MxContext;
pub use error::{set_last_error, take_last_error, FfiError};
pub use types::{MxBackendType, MxMatrix};

use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use mx_matrix::{dump_binfile, read_binfile, Matrix};

use crate::error::Result;

/// Run `f`, converting errors and panics into `false` plus a stored message.
fn ffi_call<F: FnOnce() -> Result<()>>(f: F) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::debug!(kind = ?e.kind(), "ffi call failed: {}", e);
            set_last_error(e);
            false
        }
        Err(_) => {
            set_last_error("internal panic");
            false
        }
    }
}

unsafe fn context_mut<'a>(ctx: *mut MxContext) -> Result<&'a mut MxContext> {
    ctx.as_mut().ok_or(FfiError::NullPointer("ctx"))
}

unsafe fn matrix_ref<'a>(m: *const MxMatrix, name: &'static str) -> Result<&'a Matrix> {
    m.as_ref().map(MxMatrix::inner).ok_or(FfiError::NullPointer(name))
}

unsafe fn matrix_mut<'a>(m: *mut MxMatrix, name: &'static str) -> Result<&'a mut Matrix> {
    m.as_mut()
        .map(MxMatrix::inner_mut)
        .ok_or(FfiError::NullPointer(name))
}

unsafe fn path_arg<'a>(path: *const c_char) -> Result<&'a Path> {
    if path.is_null() {
        return Err(FfiError::NullPointer("path"));
    }
    let s = CStr::from_ptr(path)
        .to_str()
        .map_err(|_| FfiError::InvalidUtf8("path"))?;
    Ok(Path::new(s))
}

unsafe fn store_matrix(out: *mut *mut MxMatrix, matrix: Matrix) {
    *out = Box::into_raw(Box::new(MxMatrix(matrix)));
}

/// Install a tracing subscriber configured from `MX_LOG_LEVEL`,
/// `MX_LOG_FORMAT` or `RUST_LOG`. Safe to call more than once.
#[no_mangle]
pub extern "C" fn mx_init_logging() -> bool {
    ffi_call(|| Ok(logging::init_logging_from_env()?))
}

/// Create a context using `backend` and the `MX_*` environment settings.
///
/// On success writes a heap-allocated context into `*ctx_out`; release it
/// with [`mx_context_destroy`].
#[no_mangle]
pub unsafe extern "C" fn mx_context_create(
    backend: MxBackendType,
    ctx_out: *mut *mut MxContext,
) -> bool {
    ffi_call(|| {
        if ctx_out.is_null() {
            return Err(FfiError::NullPointer("ctx_out"));
        }
        let config = EngineConfig::from_env()?.with_backend(backend.into());
        *ctx_out = Box::into_raw(Box::new(MxContext::new(config)));
        Ok(())
    })
}

/// Destroy a context, tearing down an open accelerator session. Null is a
/// no-op.
#[no_mangle]
pub unsafe extern "C" fn mx_context_destroy(ctx: *mut MxContext) -> bool {
    ffi_call(|| {
        if !ctx.is_null() {
            drop(Box::from_raw(ctx));
        }
        Ok(())
    })
}

/// Allocate a `height x width` matrix copied from `data`
/// (`height * width` floats, row-major).
#[no_mangle]
pub unsafe extern "C" fn mx_matrix_new(
    height: usize,
    width: usize,
    data: *const f32,
    out: *mut *mut MxMatrix,
) -> bool {
    ffi_call(|| {
        if data.is_null() {
            return Err(FfiError::NullPointer("data"));
        }
        if out.is_null() {
            return Err(FfiError::NullPointer("out"));
        }
        let len = height
            .checked_mul(width)
            .ok_or(mx_matrix::MatrixError::TooLarge { height, width })?;
        let src = std::slice::from_raw_parts(data, len);
        store_matrix(out, Matrix::from_buffer(height, width, src)?);
        Ok(())
    })
}

#[no_mangle]
pub unsafe extern "C" fn mx_matrix_zeros(
    height: usize,
    width: usize,
    out: *mut *mut MxMatrix,
) -> bool {
    ffi_call(|| {
        if out.is_null() {
            return Err(FfiError::NullPointer("out"));
        }
        store_matrix(out, Matrix::zeros(height, width)?);
        Ok(())
    })
}

/// Free a matrix. A live mirror is unloaded through `ctx` first; if that
/// fails the matrix stays valid. `ctx` may be null for unmirrored matrices.
#[no_mangle]
pub unsafe extern "C" fn mx_matrix_release(ctx: *mut MxContext, matrix: *mut MxMatrix) -> bool {
    ffi_call(|| {
        if matrix.is_null() {
            return Ok(());
        }
        let m = matrix_mut(matrix, "matrix")?;
        if m.is_mirrored() {
            context_mut(ctx)?.drain_mirror(m)?;
        }
        let boxed = Box::from_raw(matrix);
        Ok(boxed.0.release()?)
    })
}

/// Pointer to the row-major host buffer, or null.
#[no_mangle]
pub unsafe extern "C" fn mx_matrix_data(matrix: *mut MxMatrix) -> *mut f32 {
    match matrix.as_mut() {
        Some(m) => m.inner_mut().as_mut_slice().as_mut_ptr(),
        None => std::ptr::null_mut(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn mx_matrix_height(matrix: *const MxMatrix) -> usize {
    matrix.as_ref().map_or(0, |m| m.inner().height())
}

#[no_mangle]
pub unsafe extern "C" fn mx_matrix_width(matrix: *const MxMatrix) -> usize {
    matrix.as_ref().map_or(0, |m| m.inner().width())
}

/// Load a raw little-endian f32 file. The file must hold at least
/// `height * width` floats.
#[no_mangle]
pub unsafe extern "C" fn mx_matrix_read_file(
    path: *const c_char,
    height: usize,
    width: usize,
    out: *mut *mut MxMatrix,
) -> bool {
    ffi_call(|| {
        if out.is_null() {
            return Err(FfiError::NullPointer("out"));
        }
        let matrix = read_binfile(path_arg(path)?, height, width)?;
        store_matrix(out, matrix);
        Ok(())
    })
}

#[no_mangle]
pub unsafe extern "C" fn mx_matrix_dump_file(matrix: *const MxMatrix, path: *const c_char) -> bool {
    ffi_call(|| Ok(dump_binfile(path_arg(path)?, matrix_ref(matrix, "matrix")?)?))
}

/// `matrix[i] *= scalar` on the selected backend.
#[no_mangle]
pub unsafe extern "C" fn mx_scalar_multiply(
    ctx: *mut MxContext,
    scalar: f32,
    matrix: *mut MxMatrix,
) -> bool {
    ffi_call(|| context_mut(ctx)?.scalar_multiply(scalar, matrix_mut(matrix, "matrix")?))
}

/// `dest = a @ b` on the selected backend. `dest` must differ from both
/// operands.
#[no_mangle]
pub unsafe extern "C" fn mx_matrix_multiply(
    ctx: *mut MxContext,
    a: *const MxMatrix,
    b: *const MxMatrix,
    dest: *mut MxMatrix,
) -> bool {
    ffi_call(|| {
        if std::ptr::eq(dest, a) || std::ptr::eq(dest, b) {
            return Err(FfiError::Aliased);
        }
        let ctx = context_mut(ctx)?;
        let a = matrix_ref(a, "a")?;
        let b = matrix_ref(b, "b")?;
        ctx.matrix_multiply(a, b, matrix_mut(dest, "dest")?)
    })
}

#[no_mangle]
pub unsafe extern "C" fn mx_set_thread_count(ctx: *mut MxContext, threads: u32) -> bool {
    ffi_call(|| context_mut(ctx)?.set_thread_count(threads))
}

#[no_mangle]
pub unsafe extern "C" fn mx_set_accelerator_node(ctx: *mut MxContext, node: u32) -> bool {
    ffi_call(|| context_mut(ctx)?.set_accelerator_node(node))
}

#[no_mangle]
pub unsafe extern "C" fn mx_init_accelerator(ctx: *mut MxContext) -> bool {
    ffi_call(|| context_mut(ctx)?.init_accelerator())
}

#[no_mangle]
pub unsafe extern "C" fn mx_close_accelerator(ctx: *mut MxContext) -> bool {
    ffi_call(|| context_mut(ctx)?.close_accelerator())
}

#[no_mangle]
pub unsafe extern "C" fn mx_load_mirror(ctx: *mut MxContext, matrix: *mut MxMatrix) -> bool {
    ffi_call(|| context_mut(ctx)?.load_mirror(matrix_mut(matrix, "matrix")?))
}

/// Copy the mirror back and free it. On failure the mirror is kept.
#[no_mangle]
pub unsafe extern "C" fn mx_unload_mirror(ctx: *mut MxContext, matrix: *mut MxMatrix) -> bool {
    ffi_call(|| context_mut(ctx)?.unload_mirror(matrix_mut(matrix, "matrix")?))
}

#[no_mangle]
pub unsafe extern "C" fn mx_sync_to_device(ctx: *mut MxContext, matrix: *const MxMatrix) -> bool {
    ffi_call(|| context_mut(ctx)?.sync_to_device(matrix_ref(matrix, "matrix")?))
}

#[no_mangle]
pub unsafe extern "C" fn mx_sync_to_host(ctx: *mut MxContext, matrix: *mut MxMatrix) -> bool {
    ffi_call(|| context_mut(ctx)?.sync_to_host(matrix_mut(matrix, "matrix")?))
}

/// Take the last error message on this thread, or null if there is none.
/// Free the result with [`mx_free_string`].
#[no_mangle]
pub extern "C" fn mx_last_error() -> *mut c_char {
    match take_last_error() {
        Some(e) => e.into_raw(),
        None => std::ptr::null_mut(),
    }
}

/// Free a string returned by [`mx_last_error`].
#[no_mangle]
pub unsafe extern "C" fn mx_free_string(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}
