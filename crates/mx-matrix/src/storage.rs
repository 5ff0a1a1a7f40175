use std::alloc::{self, Layout};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use crate::error::{MatrixError, Result};

/// Base-address alignment of every host buffer, in bytes (one 256-bit vector).
pub const SIMD_ALIGN: usize = 32;

/// Owned, zero-initialised f32 storage whose base address is aligned to
/// [`SIMD_ALIGN`] bytes.
///
/// Allocation goes through `std::alloc` directly so that the alignment holds
/// for every buffer, not only the ones that happen to land on a suitable
/// boundary. Allocation failure is reported instead of aborting.
pub struct AlignedBuffer {
    ptr: NonNull<f32>,
    len: usize,
    layout: Layout,
}

// SAFETY: the buffer exclusively owns its allocation; shared access only hands
// out `&[f32]` and mutable access requires `&mut self`.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocate `len` zeroed floats.
    ///
    /// # Errors
    /// `AllocationFailed` if `len` is zero or the allocator returns null,
    /// `TooLarge` if the byte size does not fit a `Layout`.
    pub fn zeros(len: usize) -> Result<Self> {
        let bytes = len
            .checked_mul(std::mem::size_of::<f32>())
            .ok_or(MatrixError::TooLarge {
                height: len,
                width: std::mem::size_of::<f32>(),
            })?;
        if bytes == 0 {
            return Err(MatrixError::AllocationFailed { bytes });
        }
        let layout = Layout::from_size_align(bytes, SIMD_ALIGN).map_err(|_| {
            MatrixError::TooLarge {
                height: len,
                width: std::mem::size_of::<f32>(),
            }
        })?;

        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw.cast::<f32>()).ok_or(MatrixError::AllocationFailed { bytes })?;

        tracing::trace!(len, bytes, "allocated aligned host buffer");
        Ok(AlignedBuffer { ptr, len, layout })
    }

    /// Allocate and copy `src` into fresh aligned storage.
    pub fn from_slice(src: &[f32]) -> Result<Self> {
        let mut buf = Self::zeros(src.len())?;
        buf.as_mut_slice().copy_from_slice(src);
        Ok(buf)
    }

    /// Number of f32 elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false: zero-length buffers cannot be constructed.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the buffer in bytes.
    pub fn byte_len(&self) -> usize {
        self.layout.size()
    }

    /// The whole buffer as a slice.
    pub fn as_slice(&self) -> &[f32] {
        // SAFETY: ptr is valid for `len` initialised floats for the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// The whole buffer as a mutable slice.
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        // SAFETY: as above, and `&mut self` guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Returns true if the base address honours [`SIMD_ALIGN`].
    pub fn is_aligned(&self) -> bool {
        (self.ptr.as_ptr() as usize) % SIMD_ALIGN == 0
    }
}

impl Deref for AlignedBuffer {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        self.as_slice()
    }
}

impl DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [f32] {
        self.as_mut_slice()
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr was returned by `alloc_zeroed` with exactly this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr().cast::<u8>(), self.layout) }
    }
}

impl fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("len", &self.len)
            .field("ptr", &self.ptr)
            .finish()
    }
}
