use std::collections::HashMap;

use crate::error::{OffloadError, Result};
use crate::runtime::DeviceAddress;

pub const HEAP_BASE: DeviceAddress = 0x6000_0000;
const BLOCK_ALIGN: u64 = 64;
const F32_SIZE: usize = std::mem::size_of::<f32>();

/// Device memory of one accelerator process.
///
/// Blocks live at disjoint addresses handed out by a bump pointer and are
/// never reused within a process, so a stale address can never alias a newer
/// buffer.
#[derive(Debug)]
pub struct DeviceHeap {
    blocks: HashMap<DeviceAddress, Vec<f32>>,
    next_address: DeviceAddress,
    used: usize,
    capacity: usize,
}

impl DeviceHeap {
    pub fn new(capacity: usize) -> Self {
        Self::with_base(capacity, HEAP_BASE)
    }

    /// Heap whose first block is placed at `base`.
    pub fn with_base(capacity: usize, base: DeviceAddress) -> Self {
        DeviceHeap {
            blocks: HashMap::new(),
            next_address: base,
            used: 0,
            capacity,
        }
    }

    pub fn alloc(&mut self, bytes: usize) -> Result<DeviceAddress> {
        if bytes == 0 {
            return Err(OffloadError::DeviceAlloc {
                bytes,
                reason: "zero-sized allocation".into(),
            });
        }
        let floats = bytes.div_ceil(F32_SIZE);
        let reserved = floats * F32_SIZE;
        if reserved > self.capacity - self.used {
            return Err(OffloadError::DeviceAlloc {
                bytes,
                reason: format!(
                    "out of device memory ({} of {} bytes in use)",
                    self.used, self.capacity
                ),
            });
        }

        let address = self.next_address;
        self.blocks.insert(address, vec![0.0; floats]);
        self.used += reserved;
        let stride = (bytes as u64).div_ceil(BLOCK_ALIGN) * BLOCK_ALIGN;
        self.next_address += stride;
        Ok(address)
    }

    pub fn free(&mut self, address: DeviceAddress) -> Result<()> {
        let block = self
            .blocks
            .remove(&address)
            .ok_or_else(|| OffloadError::DeviceFree {
                address,
                reason: "no allocation at this address".into(),
            })?;
        self.used -= block.len() * F32_SIZE;
        Ok(())
    }

    pub fn block(&self, address: DeviceAddress) -> Result<&[f32]> {
        self.blocks
            .get(&address)
            .map(Vec::as_slice)
            .ok_or(OffloadError::UnknownAddress(address))
    }

    pub fn block_mut(&mut self, address: DeviceAddress) -> Result<&mut [f32]> {
        self.blocks
            .get_mut(&address)
            .map(Vec::as_mut_slice)
            .ok_or(OffloadError::UnknownAddress(address))
    }

    /// Detach a block so it can be written while other blocks are read.
    /// Must be handed back with [`DeviceHeap::restore`].
    pub fn take(&mut self, address: DeviceAddress) -> Result<Vec<f32>> {
        self.blocks
            .remove(&address)
            .ok_or(OffloadError::UnknownAddress(address))
    }

    pub fn restore(&mut self, address: DeviceAddress, block: Vec<f32>) {
        self.blocks.insert(address, block);
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn live_blocks(&self) -> usize {
        self.blocks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_zeroed_and_disjoint() {
        let mut heap = DeviceHeap::new(1024);
        let a = heap.alloc(16).unwrap();
        let b = heap.alloc(4).unwrap();
        assert_ne!(a, b);
        assert_eq!(b - a, 64);
        assert_eq!(heap.block(a).unwrap(), &[0.0; 4]);
        assert_eq!(heap.used(), 20);
    }

    #[test]
    fn test_capacity_enforced() {
        let mut heap = DeviceHeap::new(32);
        heap.alloc(32).unwrap();
        assert!(matches!(
            heap.alloc(4),
            Err(OffloadError::DeviceAlloc { bytes: 4, .. })
        ));
    }

    #[test]
    fn test_free_returns_capacity() {
        let mut heap = DeviceHeap::new(32);
        let a = heap.alloc(32).unwrap();
        heap.free(a).unwrap();
        assert_eq!(heap.used(), 0);
        assert!(heap.alloc(32).is_ok());
        assert!(matches!(heap.free(a), Err(OffloadError::DeviceFree { .. })));
    }

    #[test]
    fn test_addresses_not_reused() {
        let mut heap = DeviceHeap::new(1024);
        let a = heap.alloc(8).unwrap();
        heap.free(a).unwrap();
        let b = heap.alloc(8).unwrap();
        assert_ne!(a, b);
        assert!(heap.block(a).is_err());
    }

    #[test]
    fn test_take_and_restore() {
        let mut heap = DeviceHeap::new(64);
        let a = heap.alloc(8).unwrap();
        let mut block = heap.take(a).unwrap();
        assert!(heap.block(a).is_err());
        block[1] = 3.0;
        heap.restore(a, block);
        assert_eq!(heap.block(a).unwrap(), &[0.0, 3.0]);
    }
}
