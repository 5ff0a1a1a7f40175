//! Device-side kernels of the `libmx_kernels.so` module.
//!
//! These run inside the accelerator process against its own heap. Work is
//! split with the remainder-tolerant partitioner, so unlike the host SIMD
//! backend there are no divisibility requirements. A kernel returns 1 on
//! success; any error is reported to the host only as a 0 result word.

use std::fmt;
use std::path::Path;
use std::thread;

use mx_matrix::{partition, Partition};

use crate::args::ArgBuffer;
use crate::error::{OffloadError, Result};
use crate::heap::DeviceHeap;

pub const KERNEL_MODULE: &str = "libmx_kernels.so";
pub const SCALAR_KERNEL: &str = "scalar_matrix_mult";
pub const MATMUL_KERNEL: &str = "matrix_matrix_mult";

pub type KernelFn = fn(&ArgBuffer, &mut DeviceHeap) -> Result<u64>;

pub struct KernelModule {
    pub name: &'static str,
    symbols: &'static [(&'static str, KernelFn)],
}

impl fmt::Debug for KernelModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.symbols.iter().map(|(name, _)| *name).collect();
        f.debug_struct("KernelModule")
            .field("name", &self.name)
            .field("symbols", &names)
            .finish()
    }
}

impl KernelModule {
    pub fn symbol(&self, name: &str) -> Option<KernelFn> {
        self.symbols
            .iter()
            .find(|(symbol, _)| *symbol == name)
            .map(|(_, f)| *f)
    }
}

static MX_KERNELS: KernelModule = KernelModule {
    name: KERNEL_MODULE,
    symbols: &[
        (SCALAR_KERNEL, scalar_matrix_mult as KernelFn),
        (MATMUL_KERNEL, matrix_matrix_mult as KernelFn),
    ],
};

/// Resolve a module by the file name at the end of `path`.
pub fn find_module(path: &str) -> Option<&'static KernelModule> {
    let file_name = Path::new(path).file_name()?.to_str()?;
    (file_name == MX_KERNELS.name).then_some(&MX_KERNELS)
}

fn dimension(args: &ArgBuffer, index: usize) -> Result<usize> {
    let v = args.u64_at(index)?;
    usize::try_from(v).map_err(|_| OffloadError::BadArgument {
        index,
        reason: format!("dimension {v} does not fit in usize"),
    })
}

fn checked_area(rows: usize, cols: usize) -> Result<usize> {
    rows.checked_mul(cols).ok_or_else(|| OffloadError::BadArgument {
        index: 1,
        reason: format!("{rows}x{cols} overflows"),
    })
}

fn require_len(block: &[f32], needed: usize, index: usize) -> Result<()> {
    if block.len() < needed {
        return Err(OffloadError::BadArgument {
            index,
            reason: format!("buffer holds {} floats, need {}", block.len(), needed),
        });
    }
    Ok(())
}

/// Split `data` into consecutive slices matching `parts`, `stride` floats per
/// work unit.
fn split_by<'a>(mut data: &'a mut [f32], parts: &[Partition], stride: usize) -> Vec<&'a mut [f32]> {
    let mut out = Vec::with_capacity(parts.len());
    for part in parts {
        let (head, tail) = std::mem::take(&mut data).split_at_mut(part.len() as usize * stride);
        out.push(head);
        data = tail;
    }
    out
}

/// args: threads u32, height u64, width u64, rows address, scalar f32
fn scalar_matrix_mult(args: &ArgBuffer, heap: &mut DeviceHeap) -> Result<u64> {
    let threads = args.u32_at(0)?;
    let height = dimension(args, 1)?;
    let width = dimension(args, 2)?;
    let address = args.address_at(3)?;
    let scalar = args.f32_at(4)?;

    let total = checked_area(height, width)?;
    let rows = heap.block_mut(address)?;
    require_len(rows, total, 3)?;

    let parts = partition(total as u64, threads)?;
    let slices = split_by(&mut rows[..total], &parts, 1);
    thread::scope(|s| {
        for slice in slices {
            s.spawn(move || {
                for x in slice {
                    *x *= scalar;
                }
            });
        }
    });
    Ok(1)
}

/// args: threads u32, m u64, k u64, n u64, a address, b address, c address
///
/// C must be a different buffer from A and B.
fn matrix_matrix_mult(args: &ArgBuffer, heap: &mut DeviceHeap) -> Result<u64> {
    let threads = args.u32_at(0)?;
    let m = dimension(args, 1)?;
    let k = dimension(args, 2)?;
    let n = dimension(args, 3)?;
    let a_addr = args.address_at(4)?;
    let b_addr = args.address_at(5)?;
    let c_addr = args.address_at(6)?;

    if c_addr == a_addr || c_addr == b_addr {
        return Err(OffloadError::BadArgument {
            index: 6,
            reason: "destination aliases an input".into(),
        });
    }

    let mut c = heap.take(c_addr)?;
    let outcome = matmul_into(heap, threads, (m, k, n), a_addr, b_addr, &mut c);
    heap.restore(c_addr, c);
    outcome.map(|_| 1)
}

fn matmul_into(
    heap: &DeviceHeap,
    threads: u32,
    (m, k, n): (usize, usize, usize),
    a_addr: u64,
    b_addr: u64,
    c: &mut [f32],
) -> Result<()> {
    let a = heap.block(a_addr)?;
    let b = heap.block(b_addr)?;
    require_len(a, checked_area(m, k)?, 4)?;
    require_len(b, checked_area(k, n)?, 5)?;
    require_len(c, checked_area(m, n)?, 6)?;

    let parts = partition(m as u64, threads)?;
    let slices = split_by(&mut c[..m * n], &parts, n);
    thread::scope(|s| {
        for (part, c_rows) in parts.iter().zip(slices) {
            let first_row = part.first_unit as usize;
            s.spawn(move || {
                for (r, c_row) in c_rows.chunks_exact_mut(n).enumerate() {
                    let a_row = &a[(first_row + r) * k..(first_row + r + 1) * k];
                    for (col, out) in c_row.iter_mut().enumerate() {
                        for (j, &aij) in a_row.iter().enumerate() {
                            if j == 0 {
                                *out = aij * b[col];
                            } else {
                                *out += aij * b[j * n + col];
                            }
                        }
                    }
                }
            });
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn upload(heap: &mut DeviceHeap, data: &[f32]) -> u64 {
        let addr = heap.alloc(data.len() * 4).unwrap();
        heap.block_mut(addr).unwrap().copy_from_slice(data);
        addr
    }

    fn scalar_args(threads: u32, h: u64, w: u64, addr: u64, s: f32) -> ArgBuffer {
        let mut args = ArgBuffer::new();
        args.push_u32(threads).push_u64(h).push_u64(w).push_address(addr).push_f32(s);
        args
    }

    fn matmul_args(threads: u32, m: u64, k: u64, n: u64, a: u64, b: u64, c: u64) -> ArgBuffer {
        let mut args = ArgBuffer::new();
        args.push_u32(threads)
            .push_u64(m)
            .push_u64(k)
            .push_u64(n)
            .push_address(a)
            .push_address(b)
            .push_address(c);
        args
    }

    #[test]
    fn test_find_module() {
        assert!(find_module("libmx_kernels.so").is_some());
        assert!(find_module("/opt/mx/lib/libmx_kernels.so").is_some());
        assert!(find_module("libother.so").is_none());
        let module = find_module(KERNEL_MODULE).unwrap();
        assert!(module.symbol(SCALAR_KERNEL).is_some());
        assert!(module.symbol("missing").is_none());
    }

    #[test]
    fn test_scalar_with_remainder() {
        let mut heap = DeviceHeap::new(1 << 16);
        let data: Vec<f32> = (0..15).map(|i| i as f32).collect();
        let addr = upload(&mut heap, &data);
        let ret = scalar_matrix_mult(&scalar_args(4, 3, 5, addr, 2.0), &mut heap).unwrap();
        assert_eq!(ret, 1);
        let expected: Vec<f32> = data.iter().map(|v| v * 2.0).collect();
        assert_eq!(heap.block(addr).unwrap(), expected.as_slice());
    }

    #[test]
    fn test_matmul_uneven_rows() {
        // [1,2;3,4;5,6] @ [1,0;0,1] over 2 threads
        let mut heap = DeviceHeap::new(1 << 16);
        let a = upload(&mut heap, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = upload(&mut heap, &[1.0, 0.0, 0.0, 1.0]);
        let c = upload(&mut heap, &[f32::NAN; 6]);
        let ret = matrix_matrix_mult(&matmul_args(2, 3, 2, 2, a, b, c), &mut heap).unwrap();
        assert_eq!(ret, 1);
        assert_eq!(heap.block(c).unwrap(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_matmul_more_threads_than_rows() {
        let mut heap = DeviceHeap::new(1 << 16);
        let a = upload(&mut heap, &[1.0, 2.0]);
        let b = upload(&mut heap, &[3.0, 4.0]);
        let c = upload(&mut heap, &[0.0]);
        matrix_matrix_mult(&matmul_args(8, 1, 2, 1, a, b, c), &mut heap).unwrap();
        assert_relative_eq!(heap.block(c).unwrap()[0], 11.0);
    }

    #[test]
    fn test_matmul_rejects_aliasing() {
        let mut heap = DeviceHeap::new(1 << 16);
        let a = upload(&mut heap, &[1.0; 4]);
        let b = upload(&mut heap, &[1.0; 4]);
        let err = matrix_matrix_mult(&matmul_args(1, 2, 2, 2, a, b, a), &mut heap).unwrap_err();
        assert!(matches!(err, OffloadError::BadArgument { index: 6, .. }));
    }

    #[test]
    fn test_matmul_restores_dest_on_error() {
        let mut heap = DeviceHeap::new(1 << 16);
        let a = upload(&mut heap, &[1.0; 2]);
        let b = upload(&mut heap, &[1.0; 4]);
        let c = upload(&mut heap, &[7.0; 4]);
        // A is too small for 2x2
        assert!(matrix_matrix_mult(&matmul_args(1, 2, 2, 2, a, b, c), &mut heap).is_err());
        assert_eq!(heap.block(c).unwrap(), &[7.0; 4]);
    }

    #[test]
    fn test_scalar_zero_threads() {
        let mut heap = DeviceHeap::new(1 << 16);
        let addr = upload(&mut heap, &[1.0; 4]);
        assert!(scalar_matrix_mult(&scalar_args(0, 2, 2, addr, 2.0), &mut heap).is_err());
    }
}
