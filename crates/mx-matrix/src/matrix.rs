use std::fmt;
use std::ops::{Index, IndexMut};

use crate::error::{MatrixError, Result};
use crate::storage::AlignedBuffer;

/// Handle to a device-resident copy of a matrix buffer.
///
/// The handle is plain data: the accelerator context that allocated it owns
/// the memory behind `device_address`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceBuffer {
    pub device_address: u64,
    pub byte_length: usize,
    /// Session id of the accelerator context that allocated the buffer.
    pub owner: u64,
}

/// A dense, row-major, single-precision matrix.
///
/// The host buffer is always `height * width` floats, aligned to 32 bytes.
/// A device mirror can be attached by an accelerator context; while one is
/// attached the matrix cannot be released.
#[derive(Debug)]
pub struct Matrix {
    height: usize,
    width: usize,
    storage: AlignedBuffer,
    mirror: Option<DeviceBuffer>,
}

fn element_count(height: usize, width: usize) -> Result<usize> {
    if height == 0 || width == 0 {
        return Err(MatrixError::EmptyMatrix { height, width });
    }
    height
        .checked_mul(width)
        .ok_or(MatrixError::TooLarge { height, width })
}

impl Matrix {
    /// Allocate a zero-filled `height x width` matrix.
    ///
    /// # Errors
    /// `EmptyMatrix` for a zero dimension, `TooLarge`/`AllocationFailed` if
    /// the host buffer cannot be obtained.
    pub fn allocate(height: usize, width: usize) -> Result<Self> {
        let n = element_count(height, width)?;
        Ok(Matrix {
            height,
            width,
            storage: AlignedBuffer::zeros(n)?,
            mirror: None,
        })
    }

    /// Same as [`Matrix::allocate`].
    pub fn zeros(height: usize, width: usize) -> Result<Self> {
        Self::allocate(height, width)
    }

    /// Allocate a matrix with every element set to `value`.
    pub fn filled(height: usize, width: usize, value: f32) -> Result<Self> {
        let mut m = Self::allocate(height, width)?;
        m.as_mut_slice().fill(value);
        Ok(m)
    }

    /// Copy caller-supplied row-major data into a new aligned matrix.
    pub fn from_buffer(height: usize, width: usize, src: &[f32]) -> Result<Self> {
        let n = element_count(height, width)?;
        if src.len() != n {
            return Err(MatrixError::LengthMismatch {
                expected: n,
                got: src.len(),
            });
        }
        Ok(Matrix {
            height,
            width,
            storage: AlignedBuffer::from_slice(src)?,
            mirror: None,
        })
    }

    /// Copy of the host data. The device mirror is not duplicated.
    pub fn try_clone(&self) -> Result<Self> {
        Self::from_buffer(self.height, self.width, self.as_slice())
    }

    /// Free the host buffer.
    ///
    /// # Errors
    /// `StillMirrored` if a device mirror is attached. The device memory stays
    /// owned by its accelerator context and is reclaimed on teardown.
    pub fn release(self) -> Result<()> {
        if self.mirror.is_some() {
            return Err(MatrixError::StillMirrored);
        }
        drop(self);
        Ok(())
    }

    /// Number of rows.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Number of columns.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Number of elements (`height * width`).
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// Always false; kept for API symmetry with slices.
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Size of the host buffer in bytes.
    pub fn byte_len(&self) -> usize {
        self.len() * std::mem::size_of::<f32>()
    }

    /// Row-major view of the host buffer.
    pub fn as_slice(&self) -> &[f32] {
        self.storage.as_slice()
    }

    /// Mutable row-major view of the host buffer.
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        self.storage.as_mut_slice()
    }

    /// True if the host buffer starts on a 32-byte boundary.
    pub fn is_aligned(&self) -> bool {
        self.storage.is_aligned()
    }

    /// Row `r` as a slice.
    ///
    /// # Panics
    /// Panics if `r >= height`.
    pub fn row(&self, r: usize) -> &[f32] {
        assert!(r < self.height, "row {} out of bounds ({})", r, self.height);
        &self.as_slice()[r * self.width..(r + 1) * self.width]
    }

    /// Row `r` as a mutable slice.
    ///
    /// # Panics
    /// Panics if `r >= height`.
    pub fn row_mut(&mut self, r: usize) -> &mut [f32] {
        assert!(r < self.height, "row {} out of bounds ({})", r, self.height);
        let w = self.width;
        &mut self.as_mut_slice()[r * w..(r + 1) * w]
    }

    /// Element at `(row, col)`, or `None` outside the matrix.
    pub fn get(&self, row: usize, col: usize) -> Option<f32> {
        if row < self.height && col < self.width {
            Some(self.as_slice()[row * self.width + col])
        } else {
            None
        }
    }

    /// Overwrite the element at `(row, col)`.
    pub fn set(&mut self, row: usize, col: usize, value: f32) -> Result<()> {
        if row >= self.height || col >= self.width {
            return Err(MatrixError::OutOfBounds {
                row,
                col,
                height: self.height,
                width: self.width,
            });
        }
        let w = self.width;
        self.as_mut_slice()[row * w + col] = value;
        Ok(())
    }

    /// Largest absolute element-wise difference to `other`.
    pub fn max_abs_diff(&self, other: &Matrix) -> Result<f32> {
        if self.height != other.height || self.width != other.width {
            return Err(MatrixError::ShapeMismatch {
                expected_h: self.height,
                expected_w: self.width,
                got_h: other.height,
                got_w: other.width,
            });
        }
        Ok(self
            .as_slice()
            .iter()
            .zip(other.as_slice())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max))
    }

    /// The attached device mirror, if any.
    pub fn mirror(&self) -> Option<DeviceBuffer> {
        self.mirror
    }

    /// True while a device mirror is attached.
    pub fn is_mirrored(&self) -> bool {
        self.mirror.is_some()
    }

    /// Record a freshly allocated device mirror.
    ///
    /// Intended for accelerator runtimes; the caller owns the device memory.
    pub fn attach_mirror(&mut self, buffer: DeviceBuffer) -> Result<()> {
        if self.mirror.is_some() {
            return Err(MatrixError::StillMirrored);
        }
        self.mirror = Some(buffer);
        Ok(())
    }

    /// Forget the device mirror, returning it so the owner can free it.
    pub fn detach_mirror(&mut self) -> Option<DeviceBuffer> {
        self.mirror.take()
    }
}

impl Drop for Matrix {
    fn drop(&mut self) {
        if let Some(mirror) = self.mirror {
            tracing::warn!(
                device_address = mirror.device_address,
                owner = mirror.owner,
                "matrix dropped while mirrored; device buffer held until teardown"
            );
        }
    }
}

impl Index<(usize, usize)> for Matrix {
    type Output = f32;

    fn index(&self, (row, col): (usize, usize)) -> &f32 {
        assert!(
            row < self.height && col < self.width,
            "index ({}, {}) out of bounds for [{}x{}]",
            row,
            col,
            self.height,
            self.width
        );
        &self.as_slice()[row * self.width + col]
    }
}

impl IndexMut<(usize, usize)> for Matrix {
    fn index_mut(&mut self, (row, col): (usize, usize)) -> &mut f32 {
        assert!(
            row < self.height && col < self.width,
            "index ({}, {}) out of bounds for [{}x{}]",
            row,
            col,
            self.height,
            self.width
        );
        let w = self.width;
        &mut self.as_mut_slice()[row * w + col]
    }
}

impl fmt::Display for Matrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for r in 0..self.height {
            for (c, v) in self.row(r).iter().enumerate() {
                if c > 0 {
                    write!(f, "\t")?;
                }
                write!(f, "{:5.2}", v)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
