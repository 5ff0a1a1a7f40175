use mx_matrix::cpu::validate_conformable;
use mx_matrix::{ComputeBackend, Matrix, Result as MatrixResult};

use crate::context::AcceleratorContext;
use crate::error::{OffloadError, Result};
use crate::kernels::{MATMUL_KERNEL, SCALAR_KERNEL};

impl AcceleratorContext {
    /// Scale the device mirror of `matrix` in place.
    ///
    /// Only device memory changes; call
    /// [`sync_to_host`](Self::sync_to_host) or [`unload`](Self::unload) to
    /// see the result on the host.
    pub fn remote_scalar_multiply(&mut self, scalar: f32, matrix: &Matrix) -> Result<()> {
        self.require_ready()?;
        let rows = self.owned_mirror(matrix)?;
        let threads = self.thread_count();

        let args = self.args.as_mut().ok_or(OffloadError::Disconnected)?;
        args.clear();
        args.push_u32(threads)
            .push_u64(matrix.height() as u64)
            .push_u64(matrix.width() as u64)
            .push_address(rows.device_address)
            .push_f32(scalar);
        self.invoke(SCALAR_KERNEL)
    }

    /// Compute `dest = a @ b` entirely on device mirrors.
    pub fn remote_matrix_multiply(&mut self, a: &Matrix, b: &Matrix, dest: &Matrix) -> Result<()> {
        self.require_ready()?;
        validate_conformable(a, b, dest)?;
        let a_mirror = self.owned_mirror(a)?;
        let b_mirror = self.owned_mirror(b)?;
        let c_mirror = self.owned_mirror(dest)?;
        if c_mirror.device_address == a_mirror.device_address
            || c_mirror.device_address == b_mirror.device_address
        {
            return Err(OffloadError::BadArgument {
                index: 6,
                reason: "destination mirror aliases an input".into(),
            });
        }
        let threads = self.thread_count();

        let args = self.args.as_mut().ok_or(OffloadError::Disconnected)?;
        args.clear();
        args.push_u32(threads)
            .push_u64(a.height() as u64)
            .push_u64(a.width() as u64)
            .push_u64(b.width() as u64)
            .push_address(a_mirror.device_address)
            .push_address(b_mirror.device_address)
            .push_address(c_mirror.device_address);
        self.invoke(MATMUL_KERNEL)
    }

    fn invoke(&mut self, symbol: &str) -> Result<()> {
        let process = self.require_ready()?;
        let (Some(ctx), Some(module), Some(args)) = (self.exec_ctx, self.module, self.args.as_ref())
        else {
            return Err(OffloadError::Disconnected);
        };

        let word = self.runtime.call(process, ctx, module, symbol, args)?;
        tracing::debug!(symbol, word, args = args.len(), "remote call returned");
        if word != 1 {
            return Err(OffloadError::KernelFailed {
                symbol: symbol.to_string(),
            });
        }
        Ok(())
    }
}

/// Runs both operations on existing device mirrors. Host buffers are not
/// read or written.
impl ComputeBackend for AcceleratorContext {
    fn name(&self) -> &str {
        "accelerator"
    }

    fn scalar_multiply(&mut self, scalar: f32, matrix: &mut Matrix) -> MatrixResult<()> {
        Ok(self.remote_scalar_multiply(scalar, matrix)?)
    }

    fn matrix_multiply(&mut self, a: &Matrix, b: &Matrix, dest: &mut Matrix) -> MatrixResult<()> {
        Ok(self.remote_matrix_multiply(a, b, dest)?)
    }
}

#[cfg(test)]
mod tests {
    use crate::context::AcceleratorContext;
    use crate::emulated::{EmulatedRuntime, FaultPoint};
    use crate::error::OffloadError;
    use approx::assert_relative_eq;
    use mx_matrix::{ComputeBackend, ErrorKind, Matrix, SequentialBackend};

    fn ready(threads: u32) -> AcceleratorContext {
        let mut ctx = AcceleratorContext::emulated();
        ctx.set_thread_count(threads).unwrap();
        ctx.initialize().unwrap();
        ctx
    }

    #[test]
    fn test_remote_scalar() {
        let mut ctx = ready(4);
        let mut m = Matrix::filled(8, 8, 2.0).unwrap();
        ctx.load(&mut m).unwrap();
        ctx.remote_scalar_multiply(3.0, &m).unwrap();
        // host copy untouched until synced
        assert_eq!(m.as_slice(), &[2.0; 64]);
        ctx.unload(&mut m).unwrap();
        assert_eq!(m.as_slice(), &[6.0; 64]);
    }

    #[test]
    fn test_remote_matmul_matches_sequential() {
        let a = Matrix::from_buffer(3, 5, &(0..15).map(|i| i as f32 * 0.5).collect::<Vec<_>>())
            .unwrap();
        let b = Matrix::from_buffer(5, 7, &(0..35).map(|i| 1.0 - i as f32 * 0.1).collect::<Vec<_>>())
            .unwrap();
        let mut expected = Matrix::zeros(3, 7).unwrap();
        SequentialBackend::new()
            .matrix_multiply(&a, &b, &mut expected)
            .unwrap();

        for threads in [1, 2, 3, 8] {
            let mut ctx = ready(threads);
            let (mut a, mut b) = (a.try_clone().unwrap(), b.try_clone().unwrap());
            let mut c = Matrix::zeros(3, 7).unwrap();
            ctx.load(&mut a).unwrap();
            ctx.load(&mut b).unwrap();
            ctx.load(&mut c).unwrap();
            ctx.remote_matrix_multiply(&a, &b, &c).unwrap();
            ctx.unload(&mut c).unwrap();
            for (x, y) in c.as_slice().iter().zip(expected.as_slice()) {
                assert_relative_eq!(*x, *y, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn test_unmirrored_operand_rejected() {
        let mut ctx = ready(1);
        let mut a = Matrix::filled(2, 2, 1.0).unwrap();
        let b = Matrix::filled(2, 2, 1.0).unwrap();
        let mut c = Matrix::zeros(2, 2).unwrap();
        ctx.load(&mut a).unwrap();
        ctx.load(&mut c).unwrap();
        assert!(matches!(
            ctx.remote_matrix_multiply(&a, &b, &c),
            Err(OffloadError::NotMirrored)
        ));
    }

    #[test]
    fn test_nonconformable_rejected_before_remote() {
        let rt = EmulatedRuntime::new();
        let probe = rt.probe();
        let mut ctx = AcceleratorContext::new(Box::new(rt));
        ctx.initialize().unwrap();
        let a = Matrix::zeros(2, 3).unwrap();
        let b = Matrix::zeros(2, 3).unwrap();
        let c = Matrix::zeros(2, 3).unwrap();
        let before = probe.requests();
        assert!(matches!(
            ctx.remote_matrix_multiply(&a, &b, &c),
            Err(OffloadError::Matrix(_))
        ));
        assert_eq!(probe.requests(), before);
    }

    #[test]
    fn test_dispatch_failure() {
        let rt = EmulatedRuntime::new();
        let probe = rt.probe();
        let mut ctx = AcceleratorContext::new(Box::new(rt));
        ctx.initialize().unwrap();
        let mut m = Matrix::filled(1, 4, 1.0).unwrap();
        ctx.load(&mut m).unwrap();
        probe.arm(FaultPoint::Call);
        assert!(matches!(
            ctx.remote_scalar_multiply(2.0, &m),
            Err(OffloadError::Dispatch { .. })
        ));
    }

    #[test]
    fn test_backend_trait_maps_errors() {
        let mut ctx = AcceleratorContext::emulated();
        let mut m = Matrix::zeros(1, 1).unwrap();
        let backend: &mut dyn ComputeBackend = &mut ctx;
        assert_eq!(backend.name(), "accelerator");
        let err = backend.scalar_multiply(2.0, &mut m).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
