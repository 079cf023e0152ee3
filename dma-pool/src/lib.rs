//! Fixed-capacity descriptor pool for DMA descriptor rings.
//!
//! Host descriptors handed to a DMA engine live at device-visible addresses
//! inside one contiguous memory region. The engine only ever gives back those
//! addresses, so the driver needs a cheap, exact way to go from a slot index
//! to its bus address and back again.
//!
//! # Layout
//! ```text
//! region.base ─┬─ slot 0   (desc_size bytes)
//!              ├─ slot 1
//!              ├─ ...
//!              └─ slot N-1
//! ```
//!
//! Each slot carries a host-side payload `T` (the software data attached to
//! the descriptor) while it is allocated.
//!
//! # Usage
//!
//! ```ignore
//! use prueth_dma_pool::{DescPool, MemoryRegion};
//!
//! let region = MemoryRegion::new(0x8000_0000, 64 * 128);
//! let mut pool: DescPool<u32, 64> = DescPool::new(region, 128, 64)?;
//!
//! let idx = pool.alloc(7).ok().unwrap();
//! let dma = pool.virt2dma(idx);
//! assert_eq!(pool.dma2virt(dma), Some(idx));
//! ```

#![no_std]

/// Minimum descriptor alignment accepted by the pool.
///
/// Bit 0 of a descriptor address is reserved by the DMA engine to flag
/// teardown completion records, so slots are kept at least 16-byte aligned.
pub const DESC_ALIGN: usize = 16;

// ============================================================================
// Utility functions
// ============================================================================

/// Align a value up to the given alignment.
#[inline]
pub const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

// ============================================================================
// Memory region
// ============================================================================

/// A device-visible memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Base bus address (physical = virtual in identity mapping).
    pub base: usize,
    /// Size in bytes.
    pub size: usize,
}

impl MemoryRegion {
    /// Create a new memory region.
    pub const fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    /// End address (exclusive).
    pub const fn end(&self) -> usize {
        self.base + self.size
    }

    /// Check if `addr` falls inside the region.
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Get the region with its base rounded up to `align`.
    pub fn aligned(&self, align: usize) -> Self {
        let aligned_base = align_up(self.base, align);
        let adjustment = aligned_base - self.base;
        Self {
            base: aligned_base,
            size: self.size.saturating_sub(adjustment),
        }
    }
}

// ============================================================================
// Error types
// ============================================================================

/// Descriptor pool errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescPoolError {
    /// Requested more slots than the pool type can hold.
    TooManySlots,
    /// Descriptor size is zero or not a multiple of `DESC_ALIGN`.
    BadDescSize,
    /// Region is misaligned or too small for the requested slots.
    InvalidRegion,
}

impl core::fmt::Display for DescPoolError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::TooManySlots => write!(f, "descriptor count exceeds pool capacity"),
            Self::BadDescSize => write!(f, "descriptor size must be a non-zero multiple of 16"),
            Self::InvalidRegion => write!(f, "descriptor region misaligned or too small"),
        }
    }
}

/// Returned by [`DescPool::alloc`] when every slot is taken.
///
/// Hands the payload back so the caller can retry or report it.
#[derive(Debug, PartialEq, Eq)]
pub struct Exhausted<T>(pub T);

/// Result type for pool construction.
pub type Result<T> = core::result::Result<T, DescPoolError>;

// ============================================================================
// Descriptor pool
// ============================================================================

/// Pool of `N` descriptor slots carved out of one DMA region.
///
/// Allocation is LIFO over a free list, so recently released (cache-warm)
/// descriptors are reused first.
pub struct DescPool<T, const N: usize> {
    /// Region backing the descriptors.
    region: MemoryRegion,
    /// Stride between descriptors.
    desc_size: usize,
    /// Host payload per slot (`Some` while allocated).
    slots: [Option<T>; N],
    /// Free list (indices of free slots).
    free_list: [u16; N],
    /// Number of free slots.
    free_count: usize,
    /// Number of usable slots.
    total_count: usize,
}

impl<T, const N: usize> DescPool<T, N> {
    /// Create a pool of `count` descriptors of `desc_size` bytes.
    ///
    /// # Arguments
    /// - `region`: Device-visible memory holding the descriptors
    /// - `desc_size`: Stride between descriptors (multiple of 16)
    /// - `count`: Number of descriptors (at most `N`)
    pub fn new(region: MemoryRegion, desc_size: usize, count: usize) -> Result<Self> {
        if count > N || count > u16::MAX as usize {
            return Err(DescPoolError::TooManySlots);
        }
        if desc_size == 0 || desc_size % DESC_ALIGN != 0 {
            return Err(DescPoolError::BadDescSize);
        }
        if region.base % DESC_ALIGN != 0 || region.size < desc_size * count {
            return Err(DescPoolError::InvalidRegion);
        }

        let mut free_list = [0u16; N];
        // Lowest index on top of the stack.
        for (i, entry) in free_list.iter_mut().take(count).enumerate() {
            *entry = (count - 1 - i) as u16;
        }

        Ok(Self {
            region,
            desc_size,
            slots: core::array::from_fn(|_| None),
            free_list,
            free_count: count,
            total_count: count,
        })
    }

    /// Allocate a slot and attach `value` to it.
    ///
    /// Returns the slot index, or the value back if the pool is exhausted.
    pub fn alloc(&mut self, value: T) -> core::result::Result<u16, Exhausted<T>> {
        if self.free_count == 0 {
            return Err(Exhausted(value));
        }

        self.free_count -= 1;
        let idx = self.free_list[self.free_count];
        debug_assert!(self.slots[idx as usize].is_none(), "free slot must be empty");
        self.slots[idx as usize] = Some(value);
        Ok(idx)
    }

    /// Release a slot, returning its payload.
    ///
    /// Returns `None` for an out-of-range or already free index.
    pub fn free(&mut self, index: u16) -> Option<T> {
        let idx = index as usize;
        if idx >= self.total_count {
            return None;
        }

        let value = self.slots[idx].take()?;
        self.free_list[self.free_count] = index;
        self.free_count += 1;
        Some(value)
    }

    /// Get the payload of an allocated slot.
    pub fn get(&self, index: u16) -> Option<&T> {
        self.slots.get(index as usize)?.as_ref()
    }

    /// Get the payload of an allocated slot mutably.
    pub fn get_mut(&mut self, index: u16) -> Option<&mut T> {
        self.slots.get_mut(index as usize)?.as_mut()
    }

    /// Bus address of slot `index`.
    #[inline]
    pub fn virt2dma(&self, index: u16) -> u64 {
        (self.region.base + index as usize * self.desc_size) as u64
    }

    /// Slot index for bus address `dma`.
    ///
    /// Returns `None` if the address is outside the pool or not on a
    /// descriptor boundary.
    pub fn dma2virt(&self, dma: u64) -> Option<u16> {
        let addr = usize::try_from(dma).ok()?;
        if !self.region.contains(addr) {
            return None;
        }
        let offset = addr - self.region.base;
        if offset % self.desc_size != 0 {
            return None;
        }
        let idx = offset / self.desc_size;
        (idx < self.total_count).then_some(idx as u16)
    }

    /// Release every allocated slot, handing each payload to `f`.
    pub fn drain_in_use(&mut self, mut f: impl FnMut(u16, T)) {
        for idx in 0..self.total_count {
            if let Some(value) = self.free(idx as u16) {
                f(idx as u16, value);
            }
        }
    }

    /// Number of free slots.
    pub fn available(&self) -> usize {
        self.free_count
    }

    /// Number of slots in the pool.
    pub fn size(&self) -> usize {
        self.total_count
    }

    /// Number of allocated slots.
    pub fn in_use(&self) -> usize {
        self.total_count - self.free_count
    }

    /// Descriptor stride in bytes.
    pub fn desc_size(&self) -> usize {
        self.desc_size
    }

    /// Backing region.
    pub fn region(&self) -> MemoryRegion {
        self.region
    }
}
