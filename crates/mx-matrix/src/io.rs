//! Raw binary matrix files: little-endian f32, row-major, no header.
//!
//! Dimensions are never stored in the file; the caller supplies them. A file
//! holding fewer than `height * width` floats is rejected instead of yielding
//! a matrix with undefined trailing contents. Extra trailing bytes are
//! ignored.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use memmap2::Mmap;

use crate::error::{MatrixError, Result};
use crate::matrix::Matrix;

const F32_SIZE: usize = std::mem::size_of::<f32>();

/// Load a `height x width` matrix from a raw binary file.
pub fn read_binfile(path: &Path, height: usize, width: usize) -> Result<Matrix> {
    let mut matrix = Matrix::allocate(height, width)?;
    let expected = matrix.byte_len();

    let file = File::open(path)?;
    let file_len = file.metadata()?.len() as usize;
    if file_len < expected {
        return Err(MatrixError::ShortRead {
            path: path.display().to_string(),
            expected,
            got: file_len,
        });
    }
    if file_len > expected {
        tracing::debug!(
            path = %path.display(),
            extra = file_len - expected,
            "ignoring trailing bytes in matrix file"
        );
    }

    // Safety: the mapping is read-only and dropped before returning; the file
    // is not expected to be truncated concurrently.
    let mmap = unsafe { Mmap::map(&file)? };
    for (dst, bytes) in matrix
        .as_mut_slice()
        .iter_mut()
        .zip(mmap[..expected].chunks_exact(F32_SIZE))
    {
        *dst = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    }

    tracing::debug!(path = %path.display(), height, width, "loaded matrix file");
    Ok(matrix)
}

/// Write the host buffer of `matrix` to `path`, replacing any existing file.
pub fn dump_binfile(path: &Path, matrix: &Matrix) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for v in matrix.as_slice() {
        writer.write_all(&v.to_le_bytes())?;
    }
    writer.flush()?;
    tracing::debug!(
        path = %path.display(),
        height = matrix.height(),
        width = matrix.width(),
        "dumped matrix file"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.bin");
        let m = Matrix::from_buffer(2, 3, &[1.0, -2.0, 3.5, 0.0, 1e-3, 42.0]).unwrap();
        dump_binfile(&path, &m).unwrap();

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 24);
        let back = read_binfile(&path, 2, 3).unwrap();
        assert_eq!(back.as_slice(), m.as_slice());
        assert!(back.is_aligned());
    }

    #[test]
    fn test_little_endian_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("le.bin");
        let m = Matrix::from_buffer(1, 1, &[1.0]).unwrap();
        dump_binfile(&path, &m).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![0x00, 0x00, 0x80, 0x3f]);
    }

    #[test]
    fn test_short_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::write(&path, [0u8; 12]).unwrap();
        let err = read_binfile(&path, 2, 2).unwrap_err();
        assert!(matches!(
            err,
            MatrixError::ShortRead { expected: 16, got: 12, .. }
        ));
    }

    #[test]
    fn test_empty_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        std::fs::write(&path, b"").unwrap();
        assert!(matches!(
            read_binfile(&path, 1, 1),
            Err(MatrixError::ShortRead { got: 0, .. })
        ));
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("long.bin");
        let mut bytes = Vec::new();
        for v in [1.0f32, 2.0, 3.0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        std::fs::write(&path, &bytes).unwrap();
        let m = read_binfile(&path, 1, 2).unwrap();
        assert_eq!(m.as_slice(), &[1.0, 2.0]);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            read_binfile(&dir.path().join("nope.bin"), 1, 1),
            Err(MatrixError::Io(_))
        ));
    }
}
