//! Transmit channel.
//!
//! Turns outbound units into descriptor chains, reclaims them on completion
//! and runs the teardown protocol.
//!
//! # Teardown
//! ```text
//! Running --request_drain--> DrainRequested --poll--> Draining --0 left--> Stopped
//!                                                         |
//!                                       force_stop (deadline passed) ----+
//! ```
//! The drain counter starts at the number of units in flight and drops
//! with every reclaimed unit. The teardown completion fires exactly once,
//! whichever way the channel reaches `Stopped`.

extern crate alloc;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use prueth_dma_pool::{DescPool, Exhausted};

use crate::config::PRUETH_MAX_RING_DESCS;
use crate::dma::{is_teardown_marker, DmaSegment, RingError, TxDmaRing, TxPost, TxRingHandle};
use crate::error::{IcssgError, Result};
use crate::port::HostStack;
use crate::swdata::{Packet, RedirectFrame, SwData};
use crate::sync::Completion;
use crate::time::PaceTimer;

/// Largest frame a single head buffer may carry.
pub const PRUETH_MAX_PKT_SIZE: usize = 2000;

// ═══════════════════════════════════════════════════════════════════════════
// STATE
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownState {
    Running,
    DrainRequested,
    Draining,
    Stopped,
}

/// Host descriptor bookkeeping. Only the head of a chain owns data.
#[derive(Debug)]
struct TxDesc {
    swdata: Option<SwData>,
    next: Option<u16>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxStats {
    pub packets: u64,
    pub bytes: u64,
    pub frames: u64,
    pub cmds: u64,
    pub dropped: u64,
    pub errors: u64,
    /// Teardowns that ended in a ring reset.
    pub forced_stops: u64,
}

// ═══════════════════════════════════════════════════════════════════════════
// TX CHANNEL
// ═══════════════════════════════════════════════════════════════════════════

pub struct TxChannel<R: TxDmaRing> {
    name: String,
    id: usize,
    dst_tag: u32,
    ring: R,
    descs: Box<DescPool<TxDesc, PRUETH_MAX_RING_DESCS>>,
    /// Submitted units not yet reclaimed.
    in_flight: usize,
    state: TeardownState,
    drain_remaining: usize,
    tdown_complete: Completion,
    pacer: PaceTimer,
    irq_enabled: bool,
    cmd_data: Box<[u32; 4]>,
    stats: TxStats,
}

impl<R: TxDmaRing> TxChannel<R> {
    /// Build a channel over `handle` with `descs` descriptors.
    ///
    /// # Arguments
    /// - `name`: Label used in log messages
    /// - `id`: Channel index (priority) within the port
    /// - `dst_tag`: Destination tag stamped into every descriptor
    pub fn new(
        name: String,
        id: usize,
        dst_tag: u32,
        handle: TxRingHandle<R>,
        descs: usize,
        coalesce_usecs: u32,
    ) -> Result<Self> {
        let pool = DescPool::new(handle.desc_region, crate::config::PRUETH_DESC_SIZE, descs)?;
        Ok(Self {
            name,
            id,
            dst_tag,
            ring: handle.ring,
            descs: Box::new(pool),
            in_flight: 0,
            state: TeardownState::Running,
            drain_remaining: 0,
            tdown_complete: Completion::new(),
            pacer: PaceTimer::new(coalesce_usecs),
            irq_enabled: true,
            cmd_data: Box::new([0; 4]),
            stats: TxStats::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> TeardownState {
        self.state
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn free_descs(&self) -> usize {
        self.descs.available()
    }

    pub fn stats(&self) -> TxStats {
        self.stats
    }

    pub fn teardown_completion(&self) -> &Completion {
        &self.tdown_complete
    }

    pub fn irq_enabled(&self) -> bool {
        self.irq_enabled
    }

    pub fn set_coalesce(&mut self, usecs: u32) {
        if self.pacer.set_interval(usecs) {
            self.irq_enabled = true;
        }
    }

    pub fn enable(&mut self) {
        self.ring.enable();
    }

    pub fn ring(&self) -> &R {
        &self.ring
    }

    // ───────────────────────────────────────────────────────────────────────
    // Submission
    // ───────────────────────────────────────────────────────────────────────

    fn check_running(&self) -> Result<()> {
        match self.state {
            TeardownState::Running => Ok(()),
            _ => Err(IcssgError::ChannelStopping),
        }
    }

    /// Allocate a head descriptor plus `frags` linked fragment descriptors.
    fn alloc_chain(&mut self, swdata: SwData, frags: usize) -> Result<u16> {
        if self.descs.available() < 1 + frags {
            self.stats.dropped += 1;
            return Err(IcssgError::NoDescriptor);
        }
        let head = self
            .descs
            .alloc(TxDesc {
                swdata: Some(swdata),
                next: None,
            })
            .map_err(|Exhausted(_)| IcssgError::NoDescriptor)?;

        let mut tail = head;
        for _ in 0..frags {
            let idx = match self.descs.alloc(TxDesc {
                swdata: None,
                next: None,
            }) {
                Ok(idx) => idx,
                Err(_) => {
                    self.free_chain(head);
                    return Err(IcssgError::NoDescriptor);
                }
            };
            if let Some(desc) = self.descs.get_mut(tail) {
                desc.next = Some(idx);
            }
            tail = idx;
        }
        Ok(head)
    }

    /// Release a chain, returning what its head owned.
    fn free_chain(&mut self, head: u16) -> Option<SwData> {
        let first = self.descs.free(head)?;
        let mut next = first.next;
        while let Some(idx) = next {
            next = self.descs.free(idx).and_then(|d| d.next);
        }
        first.swdata
    }

    fn post(&mut self, head: u16, pkt_len: u32, epib: [u32; 2], segments: &[DmaSegment]) -> Result<()> {
        let post = TxPost {
            desc_dma: self.descs.virt2dma(head),
            pkt_len,
            dst_tag: self.dst_tag,
            epib,
            segments,
        };
        match self.ring.push(&post) {
            Ok(()) => {
                self.in_flight += 1;
                Ok(())
            }
            Err(err) => {
                // Drops the head's payload; the caller still holds its own reference.
                self.free_chain(head);
                self.stats.dropped += 1;
                Err(match err {
                    RingError::Full => IcssgError::QueueFull,
                    RingError::Disabled => IcssgError::ChannelStopping,
                })
            }
        }
    }

    /// Queue an outbound packet.
    ///
    /// # Arguments
    /// - `pkt`: Packet; the channel keeps a reference until completion
    /// - `epib`: Extended packet info words (timestamp cookie and flag)
    pub fn submit_packet(&mut self, pkt: Arc<Packet>, epib: [u32; 2]) -> Result<()> {
        self.check_running()?;
        if pkt.data.len() > PRUETH_MAX_PKT_SIZE {
            self.stats.dropped += 1;
            return Err(IcssgError::FrameTooLarge);
        }

        let mut segments = Vec::with_capacity(1 + pkt.frags.len());
        segments.push(DmaSegment {
            addr: pkt.data.as_ptr() as u64,
            len: pkt.data.len() as u32,
        });
        segments.extend(pkt.frags.iter().map(|frag| DmaSegment {
            addr: frag.as_ptr() as u64,
            len: frag.len() as u32,
        }));
        let pkt_len = pkt.len() as u32;

        let head = self.alloc_chain(SwData::Packet(pkt), segments.len() - 1)?;
        self.post(head, pkt_len, epib, &segments)
    }

    /// Retransmit a received page. On failure the page goes back to its pool.
    pub fn submit_frame(&mut self, frame: RedirectFrame) -> Result<()> {
        self.check_running()?;
        let segment = DmaSegment {
            addr: frame.dma_addr(),
            len: frame.len as u32,
        };
        let head = self.alloc_chain(SwData::Frame(frame), 0)?;
        self.post(head, segment.len, [0; 2], &[segment])
    }

    /// Send an in-band command word to the firmware on this channel.
    pub fn submit_cmd(&mut self, cmd: u32) -> Result<()> {
        self.check_running()?;
        self.cmd_data[0] = cmd;
        let segment = DmaSegment {
            addr: self.cmd_data.as_ptr() as u64,
            len: core::mem::size_of::<[u32; 4]>() as u32,
        };
        let head = self.alloc_chain(SwData::Cmd(cmd), 0)?;
        self.post(head, segment.len, [0; 2], &[segment])
    }

    // ───────────────────────────────────────────────────────────────────────
    // Completion
    // ───────────────────────────────────────────────────────────────────────

    /// Completion interrupt: mask it and ask for a poll.
    pub fn on_irq(&mut self) -> bool {
        self.irq_enabled = false;
        true
    }

    /// Reclaim up to `budget` completed units.
    ///
    /// # Returns
    /// Number of units reclaimed.
    pub fn poll(&mut self, budget: usize, now_us: u64, stack: &mut dyn HostStack) -> usize {
        if self.state == TeardownState::DrainRequested {
            self.state = TeardownState::Draining;
        }

        let mut done = 0;
        while done < budget {
            let Some(desc_dma) = self.ring.pop_complete() else {
                break;
            };

            if is_teardown_marker(desc_dma) {
                log::debug!("{}: teardown marker", self.name);
                self.finish_teardown();
                continue;
            }

            let Some(idx) = self.descs.dma2virt(desc_dma) else {
                log::warn!("{}: completion for unknown descriptor {:#x}", self.name, desc_dma);
                self.stats.errors += 1;
                continue;
            };

            let swdata = self.free_chain(idx);
            self.in_flight = self.in_flight.saturating_sub(1);
            self.release(swdata, stack);
            done += 1;

            if self.state == TeardownState::Draining {
                self.drain_remaining = self.drain_remaining.saturating_sub(1);
                if self.drain_remaining == 0 {
                    self.finish_teardown();
                }
            }
        }

        if done < budget {
            if self.pacer.enabled() && self.state == TeardownState::Running {
                self.pacer.arm(now_us);
            } else {
                self.irq_enabled = true;
            }
        }
        done
    }

    fn release(&mut self, swdata: Option<SwData>, stack: &mut dyn HostStack) {
        match swdata {
            Some(SwData::Packet(pkt)) => {
                self.stats.packets += 1;
                self.stats.bytes += pkt.len() as u64;
                stack.tx_completed(pkt);
            }
            Some(SwData::Frame(frame)) => {
                self.stats.frames += 1;
                drop(frame);
            }
            Some(SwData::Cmd(cmd)) => {
                self.stats.cmds += 1;
                log::debug!("{}: command {:#x} sent", self.name, cmd);
            }
            Some(SwData::Page(_)) => {
                log::warn!("{}: receive page completed on transmit ring", self.name);
                self.stats.errors += 1;
            }
            None => {
                log::warn!("{}: completed descriptor without owner", self.name);
                self.stats.errors += 1;
            }
        }
    }

    /// Pacing timer tick.
    pub fn service_timer(&mut self, now_us: u64) {
        if self.pacer.expire(now_us) {
            self.irq_enabled = true;
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Teardown
    // ───────────────────────────────────────────────────────────────────────

    fn finish_teardown(&mut self) {
        if self.state == TeardownState::Stopped {
            return;
        }
        self.state = TeardownState::Stopped;
        self.ring.disable();
        self.tdown_complete.complete();
    }

    /// Begin draining. Submissions are refused from here on.
    pub fn request_drain(&mut self) {
        if self.state != TeardownState::Running {
            return;
        }
        self.tdown_complete.reinit();
        self.pacer.cancel();
        self.drain_remaining = self.in_flight;
        self.ring.request_teardown();
        if self.in_flight == 0 {
            self.finish_teardown();
        } else {
            self.state = TeardownState::DrainRequested;
        }
    }

    /// Stop now, reclaiming whatever the engine still holds.
    ///
    /// # Returns
    /// Number of units reclaimed.
    pub fn force_stop(&mut self) -> usize {
        if self.state == TeardownState::Stopped {
            return 0;
        }

        let mut returned = Vec::new();
        self.ring.reset(&mut |desc_dma| returned.push(desc_dma));

        let mut reclaimed = 0;
        for desc_dma in returned {
            if is_teardown_marker(desc_dma) {
                continue;
            }
            if let Some(idx) = self.descs.dma2virt(desc_dma) {
                if self.free_chain(idx).is_some() {
                    reclaimed += 1;
                }
            }
        }
        // Heads the engine never handed back; fragments have no owner.
        self.descs.drain_in_use(|_, desc| {
            if desc.swdata.is_some() {
                reclaimed += 1;
            }
        });

        log::warn!(
            "{}: teardown timed out, {} of {} units reclaimed by reset",
            self.name,
            reclaimed,
            self.in_flight
        );
        self.stats.forced_stops += 1;
        self.in_flight = 0;
        self.drain_remaining = 0;
        self.finish_teardown();
        reclaimed
    }

    /// Re-arm a stopped channel for the next open.
    pub fn restart(&mut self) {
        if self.state == TeardownState::Stopped {
            self.state = TeardownState::Running;
            self.tdown_complete.reinit();
            self.irq_enabled = true;
            self.ring.enable();
        }
    }
}
