//! DMA ring interface.
//!
//! The packet DMA engine owns the ring indices; the driver only pushes host
//! descriptors (by bus address) and pops completed ones. These traits are
//! the seam between the channel logic and the engine glue, so the channel
//! code never touches ring registers directly.

use prueth_dma_pool::MemoryRegion;

/// Bit 0 of a returned descriptor address marks a teardown completion record.
pub const CPPI5_TDCM_MARKER: u64 = 1 << 0;

/// EPIB word 1 flag requesting a TX timestamp.
pub const PRUETH_TX_TS_REQUEST: u32 = 1 << 31;

/// Returned address is the engine's teardown marker, not a descriptor.
#[inline]
pub fn is_teardown_marker(desc_dma: u64) -> bool {
    desc_dma & CPPI5_TDCM_MARKER != 0
}

/// Ring-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// No room for another descriptor.
    Full,
    /// Channel disabled.
    Disabled,
}

/// One buffer of a transmit chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaSegment {
    pub addr: u64,
    pub len: u32,
}

/// Transmit descriptor chain handed to the engine.
#[derive(Debug, Clone, Copy)]
pub struct TxPost<'a> {
    /// Bus address of the head descriptor.
    pub desc_dma: u64,
    /// Total packet length.
    pub pkt_len: u32,
    /// Destination tag (port).
    pub dst_tag: u32,
    /// Extended packet info: `[cookie, flags]`.
    pub epib: [u32; 2],
    /// Buffer chain, head first.
    pub segments: &'a [DmaSegment],
}

/// Empty receive buffer handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxPost {
    pub desc_dma: u64,
    pub buf_dma: u64,
    pub buf_len: u32,
}

/// Filled receive descriptor returned by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxDone {
    pub desc_dma: u64,
    pub pkt_len: u32,
    /// Protocol-specific words: `[ts_lo, ts_hi]` when timestamping.
    pub psdata: [u32; 2],
}

/// Transmit ring of the packet DMA engine.
pub trait TxDmaRing: Send {
    /// Queue a descriptor chain.
    fn push(&mut self, post: &TxPost<'_>) -> core::result::Result<(), RingError>;

    /// Pop one completed head descriptor address.
    fn pop_complete(&mut self) -> Option<u64>;

    fn enable(&mut self);

    fn disable(&mut self);

    /// Ask the engine to tear the channel down. Completion is reported as a
    /// marker address through `pop_complete`.
    fn request_teardown(&mut self);

    /// Force-reset the ring, handing back every still-queued descriptor.
    fn reset(&mut self, reclaim: &mut dyn FnMut(u64));
}

/// Receive ring of the packet DMA engine (one ring per flow).
pub trait RxDmaRing: Send {
    fn push(&mut self, flow: usize, post: RxPost) -> core::result::Result<(), RingError>;

    fn pop(&mut self, flow: usize) -> Option<RxDone>;

    fn enable(&mut self);

    fn disable(&mut self);

    fn request_teardown(&mut self);

    fn reset(&mut self, flow: usize, reclaim: &mut dyn FnMut(u64));
}

/// Ring plus the descriptor memory allocated for it.
pub struct TxRingHandle<R: TxDmaRing> {
    pub ring: R,
    pub desc_region: MemoryRegion,
}

/// Ring plus the descriptor memory allocated for it.
pub struct RxRingHandle<R: RxDmaRing> {
    pub ring: R,
    pub desc_region: MemoryRegion,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_teardown_marker() {
        assert!(is_teardown_marker(0x8000_0001));
        assert!(!is_teardown_marker(0x8000_0080));
    }
}
