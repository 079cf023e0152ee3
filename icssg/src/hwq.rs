//! Hardware buffer queues.
//!
//! The ICSSG exposes 64 hardware FIFOs of 32-bit entries. The firmware uses
//! them as free lists and mailboxes for buffers in the shared RAM: whoever
//! pops an entry owns the buffer it names until it is pushed somewhere else.
//! Queue operations are atomic in hardware, so no host lock is taken.
//!
//! # Registers
//! ```text
//! 0xd00 + 4q   write = push, read = pop
//! 0xe00 + 4q   peek (queues 0..16 only, the window overlaps the counters)
//! 0xe40 + 4q   entry count
//! 0xf40        write queue number to reset it
//! ```

extern crate alloc;

use alloc::sync::Arc;

use crate::error::{IcssgError, Result};
use crate::io::IoRegion;

pub const HWQ_COUNT: u8 = 64;

const ICSSG_QUEUE_OFFSET: u32 = 0xd00;
const ICSSG_QUEUE_PEEK_OFFSET: u32 = 0xe00;
const ICSSG_QUEUE_CNT_OFFSET: u32 = 0xe40;
const ICSSG_QUEUE_RESET_OFFSET: u32 = 0xf40;

/// Queues whose peek register does not alias a counter.
const HWQ_PEEKABLE: u8 = 16;

// ═══════════════════════════════════════════════════════════════════════════
// QUEUE NUMBERS
// ═══════════════════════════════════════════════════════════════════════════

pub const ICSSG_CMD_POP_SLICE0: u8 = 56;
pub const ICSSG_CMD_POP_SLICE1: u8 = 60;

pub const ICSSG_CMD_PUSH_SLICE0: u8 = 57;
pub const ICSSG_CMD_PUSH_SLICE1: u8 = 61;

pub const ICSSG_RSP_POP_SLICE0: u8 = 58;
pub const ICSSG_RSP_POP_SLICE1: u8 = 62;

pub const ICSSG_RSP_PUSH_SLICE0: u8 = 56;
pub const ICSSG_RSP_PUSH_SLICE1: u8 = 60;

pub const ICSSG_TS_POP_SLICE0: u8 = 59;
pub const ICSSG_TS_POP_SLICE1: u8 = 63;

pub const ICSSG_TS_PUSH_SLICE0: u8 = 40;
pub const ICSSG_TS_PUSH_SLICE1: u8 = 41;

/// Queue numbers used by one slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceQueues {
    /// Free command buffers (host pops).
    pub cmd_pop: u8,
    /// Posted commands (host pushes).
    pub cmd_push: u8,
    /// Firmware responses (host pops).
    pub rsp_pop: u8,
    /// Response buffers given back to the free list.
    pub rsp_push: u8,
    /// TX timestamp responses (host pops).
    pub ts_pop: u8,
    /// Consumed timestamp buffers (host pushes).
    pub ts_push: u8,
}

impl SliceQueues {
    pub const fn for_slice(slice: usize) -> Self {
        if slice == 0 {
            Self {
                cmd_pop: ICSSG_CMD_POP_SLICE0,
                cmd_push: ICSSG_CMD_PUSH_SLICE0,
                rsp_pop: ICSSG_RSP_POP_SLICE0,
                rsp_push: ICSSG_RSP_PUSH_SLICE0,
                ts_pop: ICSSG_TS_POP_SLICE0,
                ts_push: ICSSG_TS_PUSH_SLICE0,
            }
        } else {
            Self {
                cmd_pop: ICSSG_CMD_POP_SLICE1,
                cmd_push: ICSSG_CMD_PUSH_SLICE1,
                rsp_pop: ICSSG_RSP_POP_SLICE1,
                rsp_push: ICSSG_RSP_PUSH_SLICE1,
                ts_pop: ICSSG_TS_POP_SLICE1,
                ts_push: ICSSG_TS_PUSH_SLICE1,
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// BUFFER QUEUE
// ═══════════════════════════════════════════════════════════════════════════

/// Handle to the hardware queue block, shared by every port of a device.
#[derive(Clone)]
pub struct BufferQueue {
    regs: Arc<dyn IoRegion>,
}

impl BufferQueue {
    pub fn new(regs: Arc<dyn IoRegion>) -> Self {
        Self { regs }
    }

    #[inline]
    fn check(queue: u8) -> Result<()> {
        if queue >= HWQ_COUNT {
            log::error!("hwq: invalid queue {}", queue);
            return Err(IcssgError::InvalidQueue(queue));
        }
        Ok(())
    }

    /// Append `addr` to `queue`.
    pub fn push(&self, queue: u8, addr: u32) -> Result<()> {
        Self::check(queue)?;
        self.regs.write32(ICSSG_QUEUE_OFFSET + 4 * queue as u32, addr);
        Ok(())
    }

    /// Take the head entry of `queue`; `None` when empty.
    pub fn pop(&self, queue: u8) -> Result<Option<u32>> {
        Self::check(queue)?;
        if self.level(queue)? == 0 {
            return Ok(None);
        }
        Ok(Some(self.regs.read32(ICSSG_QUEUE_OFFSET + 4 * queue as u32)))
    }

    /// Read the head entry without consuming it.
    ///
    /// Only queues below 16 have a peek register.
    pub fn peek(&self, queue: u8) -> Result<Option<u32>> {
        if queue >= HWQ_PEEKABLE {
            return Err(IcssgError::InvalidQueue(queue));
        }
        if self.level(queue)? == 0 {
            return Ok(None);
        }
        Ok(Some(self.regs.read32(ICSSG_QUEUE_PEEK_OFFSET + 4 * queue as u32)))
    }

    /// Number of entries currently in `queue`.
    pub fn level(&self, queue: u8) -> Result<u32> {
        Self::check(queue)?;
        Ok(self.regs.read32(ICSSG_QUEUE_CNT_OFFSET + 4 * queue as u32))
    }

    /// Drop every entry of `queue`.
    pub fn reset(&self, queue: u8) -> Result<()> {
        Self::check(queue)?;
        self.regs.write32(ICSSG_QUEUE_RESET_OFFSET, queue as u32);
        Ok(())
    }

    /// Reset `queue` and fill it with `count` buffers spaced `stride` apart.
    pub fn seed(&self, queue: u8, base: u32, stride: u32, count: u32) -> Result<()> {
        self.reset(queue)?;
        for i in 0..count {
            self.push(queue, base + i * stride)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeIcss;

    fn queue() -> BufferQueue {
        BufferQueue::new(FakeIcss::new().hwq_region())
    }

    #[test]
    fn test_fifo_order() {
        let hwq = queue();
        for addr in [0x100, 0x200, 0x300] {
            hwq.push(5, addr).unwrap();
        }
        assert_eq!(hwq.pop(5).unwrap(), Some(0x100));
        assert_eq!(hwq.pop(5).unwrap(), Some(0x200));
        assert_eq!(hwq.pop(5).unwrap(), Some(0x300));
        assert_eq!(hwq.pop(5).unwrap(), None);
    }

    #[test]
    fn test_level_tracks_push_minus_pop() {
        let hwq = queue();
        for i in 0..7 {
            hwq.push(33, i * 0x40).unwrap();
        }
        for _ in 0..3 {
            hwq.pop(33).unwrap();
        }
        assert_eq!(hwq.level(33).unwrap(), 4);
        assert_eq!(hwq.level(34).unwrap(), 0);
    }

    #[test]
    fn test_invalid_queue() {
        let hwq = queue();
        assert_eq!(hwq.push(64, 0), Err(IcssgError::InvalidQueue(64)));
        assert_eq!(hwq.pop(200), Err(IcssgError::InvalidQueue(200)));
        assert_eq!(hwq.peek(16), Err(IcssgError::InvalidQueue(16)));
    }

    #[test]
    fn test_peek_and_reset() {
        let hwq = queue();
        hwq.push(2, 0xAB).unwrap();
        hwq.push(2, 0xCD).unwrap();
        assert_eq!(hwq.peek(2).unwrap(), Some(0xAB));
        assert_eq!(hwq.level(2).unwrap(), 2);
        hwq.reset(2).unwrap();
        assert_eq!(hwq.pop(2).unwrap(), None);
    }

    #[test]
    fn test_seed() {
        let hwq = queue();
        hwq.push(10, 0xDEAD).unwrap();
        hwq.seed(10, 0x2200, 0x20, 4).unwrap();
        assert_eq!(hwq.level(10).unwrap(), 4);
        assert_eq!(hwq.pop(10).unwrap(), Some(0x2200));
        assert_eq!(hwq.pop(10).unwrap(), Some(0x2220));
    }

    #[test]
    fn test_slice_queues() {
        let q1 = SliceQueues::for_slice(1);
        assert_eq!(q1.cmd_pop, 60);
        assert_eq!(q1.rsp_push, q1.cmd_pop);
        assert_eq!(SliceQueues::for_slice(0).ts_push, 40);
    }
}
