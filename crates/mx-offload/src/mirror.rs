//! Device mirrors of host matrices.
//!
//! A mirror is a device buffer of the same byte length as the host buffer.
//! Nothing keeps the two in step implicitly: callers move data explicitly
//! with [`sync_to_device`](AcceleratorContext::sync_to_device) and
//! [`sync_to_host`](AcceleratorContext::sync_to_host).

use mx_matrix::{DeviceBuffer, Matrix};

use crate::context::{session_is_live, AcceleratorContext};
use crate::error::{OffloadError, Result};

impl AcceleratorContext {
    /// Allocate a device buffer for `matrix` and copy the host data into it.
    ///
    /// If the copy fails the buffer is freed again and the matrix stays
    /// unmirrored.
    pub fn load(&mut self, matrix: &mut Matrix) -> Result<()> {
        let process = self.require_ready()?;
        if let Some(existing) = matrix.mirror() {
            return Err(OffloadError::AlreadyMirrored(existing.device_address));
        }

        let bytes = matrix.byte_len();
        let address = self.runtime.alloc(process, bytes)?;
        if let Err(e) = self.runtime.write(process, address, matrix.as_slice()) {
            if let Err(free_err) = self.runtime.free(process, address) {
                tracing::warn!(address, "freeing buffer after failed load: {}", free_err);
                self.buffers.insert(address);
            }
            return Err(e);
        }

        self.buffers.insert(address);
        matrix.attach_mirror(DeviceBuffer {
            device_address: address,
            byte_length: bytes,
            owner: self.session,
        })?;
        tracing::debug!(
            address,
            bytes,
            height = matrix.height(),
            width = matrix.width(),
            "matrix loaded"
        );
        Ok(())
    }

    /// Copy the device buffer back, then free it and detach the mirror.
    ///
    /// If the copy fails the mirror stays attached and the device buffer
    /// stays allocated, so the device-side result is not lost.
    pub fn unload(&mut self, matrix: &mut Matrix) -> Result<()> {
        self.sync_to_host(matrix)?;
        self.discard(matrix)
    }

    /// Free the device buffer without copying it back.
    pub fn discard(&mut self, matrix: &mut Matrix) -> Result<()> {
        let process = self.require_ready()?;
        let mirror = self.owned_mirror(matrix)?;
        matrix.detach_mirror();

        // The host copy is authoritative once detached; on a failed free the
        // address stays tracked so teardown retries it.
        self.runtime.free(process, mirror.device_address)?;
        self.buffers.remove(&mirror.device_address);
        tracing::debug!(address = mirror.device_address, "matrix unloaded");
        Ok(())
    }

    pub fn sync_to_device(&mut self, matrix: &Matrix) -> Result<()> {
        let process = self.require_ready()?;
        let mirror = self.owned_mirror(matrix)?;
        tracing::trace!(address = mirror.device_address, bytes = mirror.byte_length, "sync to device");
        self.runtime
            .write(process, mirror.device_address, matrix.as_slice())
    }

    pub fn sync_to_host(&mut self, matrix: &mut Matrix) -> Result<()> {
        let process = self.require_ready()?;
        let mirror = self.owned_mirror(matrix)?;
        tracing::trace!(address = mirror.device_address, bytes = mirror.byte_length, "sync to host");
        self.runtime
            .read(process, mirror.device_address, matrix.as_mut_slice())
    }

    /// Leave `matrix` unmirrored.
    ///
    /// A mirror owned by this context is unloaded. A mirror whose session
    /// has been torn down no longer refers to device memory and is simply
    /// dropped, whichever context it came from.
    ///
    /// # Errors
    /// `UnknownAddress` if the mirror belongs to another live context; the
    /// mirror stays attached so its owner can still unload it.
    pub fn drain(&mut self, matrix: &mut Matrix) -> Result<()> {
        let Some(mirror) = matrix.mirror() else {
            return Ok(());
        };
        if self.owns(&mirror) {
            return self.unload(matrix);
        }
        if session_is_live(mirror.owner) {
            tracing::warn!(
                address = mirror.device_address,
                owner = mirror.owner,
                "refusing to drain a mirror owned by a live context"
            );
            return Err(OffloadError::UnknownAddress(mirror.device_address));
        }
        tracing::debug!(address = mirror.device_address, "dropping stale mirror");
        matrix.detach_mirror();
        Ok(())
    }

    /// [`drain`](Self::drain) then free the host buffer. If draining fails
    /// the matrix is dropped and its device buffer stays with its owner
    /// until that context tears down.
    pub fn release(&mut self, mut matrix: Matrix) -> Result<()> {
        self.drain(&mut matrix)?;
        Ok(matrix.release()?)
    }

    /// Mirror of `matrix` if it belongs to this context and still matches
    /// the host buffer size.
    pub(crate) fn owned_mirror(&self, matrix: &Matrix) -> Result<DeviceBuffer> {
        let mirror = matrix.mirror().ok_or(OffloadError::NotMirrored)?;
        if !self.owns(&mirror) {
            return Err(OffloadError::UnknownAddress(mirror.device_address));
        }
        if mirror.byte_length != matrix.byte_len() {
            return Err(OffloadError::Matrix(mx_matrix::MatrixError::LengthMismatch {
                expected: matrix.byte_len(),
                got: mirror.byte_length,
            }));
        }
        Ok(mirror)
    }

    fn owns(&self, mirror: &DeviceBuffer) -> bool {
        self.session != 0
            && mirror.owner == self.session
            && self.buffers.contains(&mirror.device_address)
    }
}

#[cfg(test)]
mod tests {
    use crate::context::AcceleratorContext;
    use crate::emulated::{EmulatedRuntime, FaultPoint};
    use crate::error::OffloadError;
    use mx_matrix::Matrix;

    fn ready() -> AcceleratorContext {
        let mut ctx = AcceleratorContext::emulated();
        ctx.initialize().unwrap();
        ctx
    }

    #[test]
    fn test_load_unload_roundtrip() {
        let mut ctx = ready();
        let mut m = Matrix::from_buffer(2, 2, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        ctx.load(&mut m).unwrap();
        assert!(m.is_mirrored());
        assert_eq!(m.mirror().unwrap().byte_length, 16);
        assert_eq!(ctx.live_buffers(), 1);

        m.as_mut_slice().fill(0.0);
        ctx.unload(&mut m).unwrap();
        assert!(!m.is_mirrored());
        assert_eq!(m.as_slice(), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(ctx.live_buffers(), 0);
    }

    #[test]
    fn test_double_load_rejected() {
        let mut ctx = ready();
        let mut m = Matrix::zeros(1, 1).unwrap();
        ctx.load(&mut m).unwrap();
        assert!(matches!(
            ctx.load(&mut m),
            Err(OffloadError::AlreadyMirrored(_))
        ));
        assert_eq!(ctx.live_buffers(), 1);
    }

    #[test]
    fn test_sync_requires_mirror() {
        let mut ctx = ready();
        let mut m = Matrix::zeros(1, 1).unwrap();
        assert!(matches!(
            ctx.sync_to_device(&m),
            Err(OffloadError::NotMirrored)
        ));
        assert!(matches!(
            ctx.sync_to_host(&mut m),
            Err(OffloadError::NotMirrored)
        ));
        assert!(matches!(ctx.unload(&mut m), Err(OffloadError::NotMirrored)));
    }

    #[test]
    fn test_sync_directions() {
        let mut ctx = ready();
        let mut m = Matrix::filled(2, 3, 1.0).unwrap();
        ctx.load(&mut m).unwrap();

        m.as_mut_slice().fill(5.0);
        ctx.sync_to_device(&m).unwrap();
        m.as_mut_slice().fill(0.0);
        ctx.sync_to_host(&mut m).unwrap();
        assert_eq!(m.as_slice(), &[5.0; 6]);
    }

    #[test]
    fn test_failed_copy_frees_buffer() {
        let rt = EmulatedRuntime::new().with_fault(FaultPoint::CopyToDevice);
        let probe = rt.probe();
        let mut ctx = AcceleratorContext::new(Box::new(rt));
        ctx.initialize().unwrap();

        let mut m = Matrix::zeros(4, 4).unwrap();
        assert!(ctx.load(&mut m).is_err());
        assert!(!m.is_mirrored());
        assert_eq!(ctx.live_buffers(), 0);
        assert_eq!(probe.device_buffers(), 0);
    }

    #[test]
    fn test_failed_unload_keeps_mirror() {
        let rt = EmulatedRuntime::new();
        let probe = rt.probe();
        let mut ctx = AcceleratorContext::new(Box::new(rt));
        ctx.initialize().unwrap();

        let mut m = Matrix::filled(2, 2, 3.0).unwrap();
        ctx.load(&mut m).unwrap();
        probe.arm(FaultPoint::CopyToHost);
        assert!(ctx.unload(&mut m).is_err());
        assert!(m.is_mirrored());
        assert_eq!(probe.device_buffers(), 1);

        probe.disarm(FaultPoint::CopyToHost);
        ctx.unload(&mut m).unwrap();
        assert_eq!(probe.device_buffers(), 0);
    }

    #[test]
    fn test_discard_skips_copy() {
        let mut ctx = ready();
        let mut m = Matrix::filled(1, 2, 9.0).unwrap();
        ctx.load(&mut m).unwrap();
        m.as_mut_slice().fill(1.0);
        ctx.discard(&mut m).unwrap();
        assert_eq!(m.as_slice(), &[1.0, 1.0]);
        assert!(!m.is_mirrored());
    }

    #[test]
    fn test_release_unloads_first() {
        let mut ctx = ready();
        let mut m = Matrix::zeros(2, 2).unwrap();
        ctx.load(&mut m).unwrap();
        ctx.release(m).unwrap();
        assert_eq!(ctx.live_buffers(), 0);
    }

    #[test]
    fn test_release_after_teardown_drops_stale_mirror() {
        let mut ctx = ready();
        let mut m = Matrix::zeros(2, 2).unwrap();
        ctx.load(&mut m).unwrap();
        ctx.teardown().unwrap();
        assert!(m.is_mirrored());
        ctx.release(m).unwrap();
    }

    #[test]
    fn test_foreign_mirror_rejected() {
        let mut a = ready();
        let mut b = ready();
        let mut m = Matrix::zeros(1, 1).unwrap();
        a.load(&mut m).unwrap();
        assert!(matches!(
            b.sync_to_host(&mut m),
            Err(OffloadError::UnknownAddress(_))
        ));
        a.unload(&mut m).unwrap();
    }

    #[test]
    fn test_drain_of_foreign_live_mirror_rejected() {
        let mut a = ready();
        let mut b = ready();
        let mut m = Matrix::filled(2, 2, 1.5).unwrap();
        a.load(&mut m).unwrap();
        a.remote_scalar_multiply(10.0, &m).unwrap();

        assert!(matches!(
            b.drain(&mut m),
            Err(OffloadError::UnknownAddress(_))
        ));
        assert!(m.is_mirrored());
        assert_eq!(a.live_buffers(), 1);

        // The owner still gets the device-side result back.
        a.unload(&mut m).unwrap();
        assert_eq!(m.as_slice(), &[15.0; 4]);
        assert_eq!(a.live_buffers(), 0);
    }

    #[test]
    fn test_foreign_mirror_with_colliding_address_rejected() {
        // Both runtimes hand out the same first address.
        let mut a = ready();
        let mut b = ready();
        let mut ma = Matrix::zeros(1, 8).unwrap();
        let mut mb = Matrix::zeros(1, 8).unwrap();
        a.load(&mut ma).unwrap();
        b.load(&mut mb).unwrap();
        assert_eq!(
            ma.mirror().unwrap().device_address,
            mb.mirror().unwrap().device_address
        );

        assert!(matches!(
            b.sync_to_host(&mut ma),
            Err(OffloadError::UnknownAddress(_))
        ));
        assert!(b.release(ma).is_err());
        assert_eq!(a.live_buffers(), 1);
        assert_eq!(b.live_buffers(), 1);
        b.unload(&mut mb).unwrap();
    }

    #[test]
    fn test_release_of_mirror_from_dropped_context() {
        let mut m = Matrix::zeros(2, 8).unwrap();
        {
            let mut gone = ready();
            gone.load(&mut m).unwrap();
        }
        let mut ctx = ready();
        ctx.release(m).unwrap();
        assert_eq!(ctx.live_buffers(), 0);
    }
}
