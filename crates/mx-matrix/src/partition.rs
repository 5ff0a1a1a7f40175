//! Splitting a range of work units across worker threads.
//!
//! Two policies are offered:
//!
//! - [`partition`] tolerates remainders: the first `total % threads` workers
//!   receive one extra unit. The accelerator kernels use this one.
//! - [`partition_even`] requires `total % threads == 0`. The threaded SIMD
//!   backend uses this one so that no worker ever starts mid-vector.
//!
//! Both return exactly `thread_count` contiguous, pairwise disjoint ranges
//! whose union is `[0, total_units)`, ordered by `thread_id`.

use std::ops::Range;

use crate::error::{MatrixError, Result};

/// The contiguous slice of work assigned to one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub thread_id: u32,
    pub first_unit: u64,
    pub last_unit_exclusive: u64,
}

impl Partition {
    /// Number of units in this partition (may be zero when there are more
    /// threads than units).
    pub fn len(&self) -> u64 {
        self.last_unit_exclusive - self.first_unit
    }

    /// True when this worker has nothing to do.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The partition as a `usize` range, for slicing host buffers.
    pub fn range(&self) -> Range<usize> {
        self.first_unit as usize..self.last_unit_exclusive as usize
    }
}

fn check_inputs(total_units: u64, thread_count: u32) -> Result<()> {
    if thread_count == 0 {
        return Err(MatrixError::ZeroThreads);
    }
    if total_units == 0 {
        return Err(MatrixError::NoWork);
    }
    Ok(())
}

/// Remainder-tolerant partitioning.
///
/// With `n = total / threads` and `rest = total % threads`, thread `t < rest`
/// covers `[t*(n+1), t*(n+1) + n+1)` and thread `t >= rest` covers
/// `[t*n + rest, t*n + rest + n)`.
pub fn partition(total_units: u64, thread_count: u32) -> Result<Vec<Partition>> {
    check_inputs(total_units, thread_count)?;

    let threads = thread_count as u64;
    let n = total_units / threads;
    let rest = total_units % threads;

    Ok((0..thread_count)
        .map(|tid| {
            let t = tid as u64;
            let (first, len) = if t < rest {
                (t * (n + 1), n + 1)
            } else {
                (t * n + rest, n)
            };
            Partition {
                thread_id: tid,
                first_unit: first,
                last_unit_exclusive: first + len,
            }
        })
        .collect())
}

/// Strict partitioning into `thread_count` equal ranges.
///
/// # Errors
/// `Indivisible` if `total_units % thread_count != 0`.
pub fn partition_even(total_units: u64, thread_count: u32) -> Result<Vec<Partition>> {
    check_inputs(total_units, thread_count)?;
    if total_units % thread_count as u64 != 0 {
        return Err(MatrixError::Indivisible {
            what: "work units",
            value: total_units as usize,
            divisor: thread_count as usize,
        });
    }
    partition(total_units, thread_count)
}
