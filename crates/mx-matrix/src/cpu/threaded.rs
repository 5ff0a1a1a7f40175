use std::thread;

use super::matmul::matmul_kernel;
use super::simd::{kernel_path, LANES};
use super::unary::scalar_multiply_kernel;
use super::validate_conformable;
use crate::backend::ComputeBackend;
use crate::error::{MatrixError, Result};
use crate::matrix::Matrix;
use crate::partition::{partition_even, Partition};

/// Multi-threaded CPU backend running the 256-bit vector kernels.
///
/// Every operation spawns `thread_count` scoped workers, one per partition,
/// and joins all of them before returning. Rows must divide evenly by the
/// thread count and columns by [`LANES`]; other shapes are rejected rather
/// than split mid-vector.
#[derive(Debug, Clone)]
pub struct SimdBackend {
    thread_count: u32,
}

impl SimdBackend {
    /// Backend with `thread_count` workers; zero is treated as one.
    pub fn new(thread_count: u32) -> Self {
        let mut backend = SimdBackend { thread_count: 1 };
        backend.set_thread_count(thread_count);
        backend
    }

    /// Set the worker count used by the next operation. Zero is ignored.
    pub fn set_thread_count(&mut self, thread_count: u32) {
        if thread_count < 1 {
            tracing::warn!("ignoring thread count of 0, keeping {}", self.thread_count);
            return;
        }
        self.thread_count = thread_count;
    }

    /// Worker count for the next operation.
    pub fn thread_count(&self) -> u32 {
        self.thread_count
    }

    fn check_divisibility(&self, rows: usize, cols: usize) -> Result<()> {
        if rows % self.thread_count as usize != 0 {
            return Err(MatrixError::Indivisible {
                what: "row count",
                value: rows,
                divisor: self.thread_count as usize,
            });
        }
        if cols % LANES != 0 {
            return Err(MatrixError::Indivisible {
                what: "column count",
                value: cols,
                divisor: LANES,
            });
        }
        Ok(())
    }
}

impl Default for SimdBackend {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Run `job` once per work item on its own scoped thread and join them all.
///
/// If a launch fails, the workers already started are still joined before the
/// launch error is returned. The first failure (launch, worker error or
/// panic) wins.
fn fan_out<T, F>(work: Vec<(Partition, T)>, job: F) -> Result<()>
where
    T: Send,
    F: Fn(T) -> Result<()> + Sync,
{
    let job = &job;
    thread::scope(|s| {
        let mut handles = Vec::with_capacity(work.len());
        let mut first_error = None;

        for (part, item) in work {
            tracing::trace!(thread_id = part.thread_id, units = part.len(), "spawning worker");
            let spawned = thread::Builder::new()
                .name(format!("mx-worker-{}", part.thread_id))
                .spawn_scoped(s, move || job(item));
            match spawned {
                Ok(handle) => handles.push((part.thread_id, handle)),
                Err(source) => {
                    tracing::warn!(thread_id = part.thread_id, "worker launch failed: {}", source);
                    first_error = Some(MatrixError::ThreadLaunch {
                        thread_id: part.thread_id,
                        source,
                    });
                    break;
                }
            }
        }

        for (thread_id, handle) in handles {
            let outcome = handle
                .join()
                .unwrap_or_else(|_| Err(MatrixError::WorkerPanicked { thread_id }));
            if let Err(e) = outcome {
                tracing::warn!(thread_id, "worker failed: {}", e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    })
}

impl ComputeBackend for SimdBackend {
    fn name(&self) -> &str {
        "simd"
    }

    fn scalar_multiply(&mut self, scalar: f32, matrix: &mut Matrix) -> Result<()> {
        self.check_divisibility(matrix.height(), matrix.width())?;

        let parts = partition_even(matrix.len() as u64, self.thread_count)?;
        let chunk = parts[0].len() as usize;
        tracing::debug!(
            threads = self.thread_count,
            chunk,
            path = kernel_path(),
            "scalar_multiply"
        );

        let work: Vec<_> = parts
            .into_iter()
            .zip(matrix.as_mut_slice().chunks_mut(chunk))
            .collect();
        fan_out(work, |slice| scalar_multiply_kernel(slice, scalar))
    }

    fn matrix_multiply(&mut self, a: &Matrix, b: &Matrix, dest: &mut Matrix) -> Result<()> {
        validate_conformable(a, b, dest)?;
        self.check_divisibility(a.height(), b.width())?;

        let parts = partition_even(a.height() as u64, self.thread_count)?;
        let rows = parts[0].len() as usize;
        let (k, n) = (a.width(), b.width());
        tracing::debug!(
            threads = self.thread_count,
            rows_per_thread = rows,
            m = a.height(),
            k,
            n,
            path = kernel_path(),
            "matrix_multiply"
        );

        let b_data = b.as_slice();
        let work: Vec<_> = parts
            .into_iter()
            .zip(a.as_slice().chunks(rows * k).zip(dest.as_mut_slice().chunks_mut(rows * n)))
            .collect();
        fan_out(work, |(a_rows, c_rows)| {
            matmul_kernel(a_rows, k, b_data, n, c_rows, rows)
        })
    }
}
