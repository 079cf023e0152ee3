//! Register and shared-RAM access.
//!
//! The hardware queue block and the shared RAM are both 32-bit addressable
//! windows. Drivers talk to them through [`IoRegion`] so the same code runs
//! against real MMIO and against RAM-backed models.

use core::ptr;

/// 32-bit access to a device window at byte offsets.
pub trait IoRegion: Send + Sync {
    /// Read the 32-bit word at `offset` (4-byte aligned).
    fn read32(&self, offset: u32) -> u32;

    /// Write the 32-bit word at `offset` (4-byte aligned).
    fn write32(&self, offset: u32, value: u32);

    /// Window size in bytes.
    fn size(&self) -> u32;

    /// Copy bytes out of the window.
    ///
    /// Default implementation issues word reads only, since shared RAM
    /// does not tolerate narrow accesses on every SoC.
    fn read_bytes(&self, offset: u32, buf: &mut [u8]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            let addr = offset + i as u32;
            let word = self.read32(addr & !3);
            *byte = (word >> ((addr & 3) * 8)) as u8;
        }
    }

    /// Copy bytes into the window with read-modify-write of whole words.
    fn write_bytes(&self, offset: u32, data: &[u8]) {
        for (i, &byte) in data.iter().enumerate() {
            let addr = offset + i as u32;
            let shift = (addr & 3) * 8;
            let word = self.read32(addr & !3);
            let word = (word & !(0xFF << shift)) | ((byte as u32) << shift);
            self.write32(addr & !3, word);
        }
    }
}

/// Memory-mapped device window.
pub struct MmioRegion {
    base: *mut u32,
    size: u32,
}

// SAFETY: MMIO registers are accessed with volatile word operations only and
// the window is owned by the driver for its whole lifetime.
unsafe impl Send for MmioRegion {}
unsafe impl Sync for MmioRegion {}

impl MmioRegion {
    /// Wrap a mapped register window.
    ///
    /// # Safety
    /// - `base` must be a valid, mapped, 4-byte aligned MMIO address
    /// - the mapping must stay valid for `size` bytes for the region's life
    pub unsafe fn new(base: *mut u8, size: u32) -> Self {
        Self {
            base: base as *mut u32,
            size,
        }
    }
}

impl IoRegion for MmioRegion {
    #[inline]
    fn read32(&self, offset: u32) -> u32 {
        debug_assert!(offset % 4 == 0 && offset < self.size);
        // SAFETY: bounds and alignment guaranteed by construction contract.
        unsafe { ptr::read_volatile(self.base.add((offset / 4) as usize)) }
    }

    #[inline]
    fn write32(&self, offset: u32, value: u32) {
        debug_assert!(offset % 4 == 0 && offset < self.size);
        // SAFETY: bounds and alignment guaranteed by construction contract.
        unsafe { ptr::write_volatile(self.base.add((offset / 4) as usize), value) }
    }

    fn size(&self) -> u32 {
        self.size
    }
}
