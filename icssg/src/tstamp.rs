//! TX timestamp cookie correlation.
//!
//! A packet asking for a hardware timestamp is parked in a slot; the slot
//! index travels to the firmware as the cookie and comes back with the
//! captured time in a timestamp response.

extern crate alloc;

use alloc::vec::Vec;

use crate::error::{IcssgError, Result};

/// Simultaneous outstanding TX timestamp requests per port.
pub const PRUETH_MAX_TX_TS_REQUESTS: usize = 50;

/// Size of a timestamp response in shared RAM.
pub const TX_TS_RESPONSE_SIZE: usize = 20;

struct TsSlot<T> {
    unit: T,
    queued_at_us: u64,
}

/// Fixed table of outstanding timestamp requests.
pub struct TxTsTable<T> {
    slots: Vec<Option<TsSlot<T>>>,
    pending: usize,
}

impl<T> Default for TxTsTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TxTsTable<T> {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(PRUETH_MAX_TX_TS_REQUESTS);
        slots.resize_with(PRUETH_MAX_TX_TS_REQUESTS, || None);
        Self { slots, pending: 0 }
    }

    /// Park `unit` in the first free slot.
    ///
    /// # Returns
    /// The cookie, or `TsCapacityExceeded` when all slots are taken (the
    /// unit is dropped).
    pub fn reserve(&mut self, unit: T, now_us: u64) -> Result<u32> {
        let Some(cookie) = self.slots.iter().position(Option::is_none) else {
            return Err(IcssgError::TsCapacityExceeded);
        };
        self.slots[cookie] = Some(TsSlot {
            unit,
            queued_at_us: now_us,
        });
        self.pending += 1;
        Ok(cookie as u32)
    }

    /// Take the unit parked under `cookie`.
    pub fn resolve(&mut self, cookie: u32) -> Option<T> {
        let slot = self.slots.get_mut(cookie as usize).and_then(Option::take);
        match slot {
            Some(slot) => {
                self.pending -= 1;
                Some(slot.unit)
            }
            None => {
                log::warn!("tx ts: response for unknown cookie {}", cookie);
                None
            }
        }
    }

    /// Release every entry queued more than `timeout_us` ago.
    ///
    /// # Returns
    /// Number of entries reaped.
    pub fn reap(&mut self, now_us: u64, timeout_us: u64, mut f: impl FnMut(u32, T)) -> usize {
        let mut reaped = 0;
        for (cookie, entry) in self.slots.iter_mut().enumerate() {
            let stale = matches!(entry, Some(slot) if now_us.saturating_sub(slot.queued_at_us) >= timeout_us);
            if stale {
                if let Some(slot) = entry.take() {
                    self.pending -= 1;
                    reaped += 1;
                    f(cookie as u32, slot.unit);
                }
            }
        }
        reaped
    }

    pub fn pending(&self) -> usize {
        self.pending
    }
}

/// Timestamp response written by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxTsResponse {
    pub cookie: u32,
    pub lo_ts: u32,
    pub hi_ts: u32,
}

impl TxTsResponse {
    /// Parse `{reserved[2], cookie, lo_ts, hi_ts}`, little endian.
    pub fn from_bytes(raw: &[u8; TX_TS_RESPONSE_SIZE]) -> Self {
        let word = |i: usize| u32::from_le_bytes([raw[i * 4], raw[i * 4 + 1], raw[i * 4 + 2], raw[i * 4 + 3]]);
        Self {
            cookie: word(2),
            lo_ts: word(3),
            hi_ts: word(4),
        }
    }

    /// Captured time in nanoseconds.
    pub fn timestamp(&self) -> u64 {
        ((self.hi_ts as u64) << 32) | self.lo_ts as u64
    }
}
