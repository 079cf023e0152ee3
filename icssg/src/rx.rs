//! Receive channel.
//!
//! Keeps the ring stocked with empty pages and turns filled descriptors into
//! frames for the host stack, after an optional fast-path hook has had a
//! chance to drop, bounce or redirect them.

extern crate alloc;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use prueth_dma_pool::{DescPool, Exhausted};
use smoltcp::wire::EthernetFrame;

use crate::config::{ICSSG_MAX_RFLOWS, PRUETH_DESC_SIZE, PRUETH_MAX_RING_DESCS};
use crate::dma::{is_teardown_marker, RxDmaRing, RxPost, RxRingHandle, TxDmaRing};
use crate::error::{IcssgError, Result};
use crate::port::HostStack;
use crate::swdata::{PagePool, RedirectFrame, RxPacket, RxPage, SwData, PRUETH_HEADROOM};
use crate::time::PaceTimer;
use crate::tx::TxChannel;

// ═══════════════════════════════════════════════════════════════════════════
// FAST PATH
// ═══════════════════════════════════════════════════════════════════════════

bitflags! {
    /// Outcome of the fast path for one buffer, OR-ed over a poll.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct XdpResult: u32 {
        /// Dropped; page recycled.
        const CONSUMED = 1 << 0;
        /// Retransmitted on a TX channel.
        const TX = 1 << 1;
        /// Handed to the redirect target.
        const REDIR = 1 << 2;
    }
}

impl XdpResult {
    /// Delivered to the stack.
    pub const PASS: Self = Self::empty();
}

/// Verdict of a fast-path program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XdpAction {
    /// Program error.
    Aborted,
    Drop,
    Pass,
    Tx,
    Redirect,
}

impl XdpAction {
    pub fn result(self) -> XdpResult {
        match self {
            XdpAction::Pass => XdpResult::PASS,
            XdpAction::Drop => XdpResult::CONSUMED,
            XdpAction::Tx => XdpResult::TX,
            XdpAction::Redirect => XdpResult::REDIR,
            XdpAction::Aborted => {
                log::warn!("rx: fast path aborted, dropping frame");
                XdpResult::CONSUMED
            }
        }
    }
}

/// Hook run on every received frame before the stack sees it.
pub trait FastPath: Send {
    /// Classify `frame`. The hook may rewrite it in place.
    fn run(&mut self, frame: &mut [u8], flow: usize) -> XdpAction;
}

// ═══════════════════════════════════════════════════════════════════════════
// RX CHANNEL
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxStats {
    pub packets: u64,
    pub bytes: u64,
    pub multicast: u64,
    pub dropped: u64,
    pub errors: u64,
    pub xdp_tx: u64,
    pub xdp_redirect: u64,
}

pub struct RxChannel<R: RxDmaRing> {
    name: String,
    ring: R,
    descs: Box<DescPool<SwData, PRUETH_MAX_RING_DESCS>>,
    pages: Arc<PagePool>,
    flows: usize,
    flow_irq: [bool; ICSSG_MAX_RFLOWS],
    pacer: PaceTimer,
    rx_ts_enabled: bool,
    stopping: bool,
    stats: RxStats,
}

impl<R: RxDmaRing> RxChannel<R> {
    pub fn new(
        name: String,
        handle: RxRingHandle<R>,
        descs: usize,
        flows: usize,
        pages: Arc<PagePool>,
        coalesce_usecs: u32,
    ) -> Result<Self> {
        if flows == 0 || flows > ICSSG_MAX_RFLOWS {
            return Err(IcssgError::InvalidConfig("rx flows must be 1..=8"));
        }
        if pages.page_size() <= PRUETH_HEADROOM {
            return Err(IcssgError::InvalidConfig("page_size leaves no room for data"));
        }
        let pool = DescPool::new(handle.desc_region, PRUETH_DESC_SIZE, descs)?;
        Ok(Self {
            name,
            ring: handle.ring,
            descs: Box::new(pool),
            pages,
            flows,
            flow_irq: [true; ICSSG_MAX_RFLOWS],
            pacer: PaceTimer::new(coalesce_usecs),
            rx_ts_enabled: false,
            stopping: false,
            stats: RxStats::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> RxStats {
        self.stats
    }

    pub fn flows(&self) -> usize {
        self.flows
    }

    /// Descriptors currently posted to the engine.
    pub fn posted(&self) -> usize {
        self.descs.in_use()
    }

    pub fn irq_enabled(&self, flow: usize) -> bool {
        self.flow_irq.get(flow).copied().unwrap_or(false)
    }

    pub fn set_rx_timestamping(&mut self, on: bool) {
        self.rx_ts_enabled = on;
    }

    pub fn set_coalesce(&mut self, usecs: u32) {
        if self.pacer.set_interval(usecs) {
            self.flow_irq = [true; ICSSG_MAX_RFLOWS];
        }
    }

    pub fn enable(&mut self) {
        self.stopping = false;
        self.ring.enable();
    }

    /// Post one empty page.
    fn post_page(&mut self, page: RxPage) -> bool {
        let buf_dma = page.dma_addr() + PRUETH_HEADROOM as u64;
        let buf_len = (page.len() - PRUETH_HEADROOM) as u32;
        let idx = match self.descs.alloc(SwData::Page(page)) {
            Ok(idx) => idx,
            Err(Exhausted(_)) => return false,
        };
        let post = RxPost {
            desc_dma: self.descs.virt2dma(idx),
            buf_dma,
            buf_len,
        };
        if self.ring.push(0, post).is_err() {
            self.descs.free(idx);
            return false;
        }
        true
    }

    /// Fill every free descriptor with a page.
    ///
    /// # Returns
    /// Number of pages posted.
    pub fn refill(&mut self) -> usize {
        if self.stopping {
            return 0;
        }
        let mut posted = 0;
        while self.descs.available() > 0 {
            let Some(page) = self.pages.alloc() else {
                break;
            };
            if !self.post_page(page) {
                break;
            }
            posted += 1;
        }
        posted
    }

    /// Completion interrupt on `flow`.
    pub fn on_irq(&mut self, flow: usize) -> bool {
        if let Some(enabled) = self.flow_irq.get_mut(flow) {
            *enabled = false;
            return true;
        }
        false
    }

    /// Pacing timer tick.
    pub fn service_timer(&mut self, now_us: u64) {
        if self.pacer.expire(now_us) {
            self.flow_irq = [true; ICSSG_MAX_RFLOWS];
        }
    }

    /// Process up to `budget` received frames on `flow`.
    ///
    /// # Arguments
    /// - `fast_path`: Optional hook classifying each frame
    /// - `xdp_tx`: Channel used for `XdpAction::Tx`
    /// - `stack`: Receives passed frames and redirects
    ///
    /// # Returns
    /// Number of frames processed.
    pub fn poll<T: TxDmaRing>(
        &mut self,
        flow: usize,
        budget: usize,
        now_us: u64,
        mut fast_path: Option<&mut (dyn FastPath + 'static)>,
        mut xdp_tx: Option<&mut TxChannel<T>>,
        stack: &mut dyn HostStack,
    ) -> usize {
        let mut done = 0;
        let mut aggregate = XdpResult::PASS;

        while done < budget {
            let Some(rx) = self.ring.pop(flow) else {
                break;
            };
            if is_teardown_marker(rx.desc_dma) {
                log::debug!("{}: flow {} teardown complete", self.name, flow);
                continue;
            }
            let Some(idx) = self.descs.dma2virt(rx.desc_dma) else {
                log::warn!("{}: completion for unknown descriptor {:#x}", self.name, rx.desc_dma);
                self.stats.errors += 1;
                continue;
            };
            done += 1;

            let mut page = match self.descs.free(idx) {
                Some(SwData::Page(page)) => page,
                Some(other) => {
                    log::warn!("{}: {:?} descriptor on receive ring", self.name, other.kind());
                    self.stats.errors += 1;
                    continue;
                }
                None => {
                    self.stats.errors += 1;
                    continue;
                }
            };

            if self.stopping {
                self.stats.dropped += 1;
                continue;
            }

            let len = (rx.pkt_len as usize).min(page.len() - PRUETH_HEADROOM);
            let data = &mut page.as_mut_slice()[PRUETH_HEADROOM..PRUETH_HEADROOM + len];
            match EthernetFrame::new_checked(&*data) {
                Ok(frame) => {
                    if frame.dst_addr().is_multicast() {
                        self.stats.multicast += 1;
                    }
                }
                Err(_) => {
                    self.stats.errors += 1;
                    continue;
                }
            }

            let result = match fast_path.as_deref_mut() {
                Some(prog) => prog.run(data, flow).result(),
                None => XdpResult::PASS,
            };
            let result = self.dispatch(result, page, len, flow, &rx.psdata, &mut xdp_tx, stack);
            aggregate |= result;
        }

        if aggregate.contains(XdpResult::REDIR) {
            stack.flush_redirects();
        }

        self.refill();

        if done < budget {
            if self.pacer.enabled() {
                self.pacer.arm(now_us);
            } else if let Some(enabled) = self.flow_irq.get_mut(flow) {
                *enabled = true;
            }
        }
        done
    }

    /// Act on one verdict. Returns what actually happened.
    #[allow(clippy::too_many_arguments)]
    fn dispatch<T: TxDmaRing>(
        &mut self,
        result: XdpResult,
        page: RxPage,
        len: usize,
        flow: usize,
        psdata: &[u32; 2],
        xdp_tx: &mut Option<&mut TxChannel<T>>,
        stack: &mut dyn HostStack,
    ) -> XdpResult {
        let frame = RedirectFrame {
            page,
            offset: PRUETH_HEADROOM,
            len,
        };

        if result == XdpResult::PASS {
            let hwtstamp = self
                .rx_ts_enabled
                .then(|| ((psdata[1] as u64) << 32) | psdata[0] as u64);
            self.stats.packets += 1;
            self.stats.bytes += len as u64;
            stack.receive(RxPacket {
                page: frame.page,
                offset: frame.offset,
                len,
                hwtstamp,
                flow,
            });
            XdpResult::PASS
        } else if result == XdpResult::TX {
            let sent = match xdp_tx.as_deref_mut() {
                Some(tx) => tx.submit_frame(frame).is_ok(),
                None => false,
            };
            if sent {
                self.stats.xdp_tx += 1;
                XdpResult::TX
            } else {
                self.stats.dropped += 1;
                XdpResult::CONSUMED
            }
        } else if result == XdpResult::REDIR {
            if stack.redirect(frame) {
                self.stats.xdp_redirect += 1;
                XdpResult::REDIR
            } else {
                self.stats.dropped += 1;
                XdpResult::CONSUMED
            }
        } else {
            if result != XdpResult::CONSUMED {
                log::warn!("{}: invalid fast path result {:#x}", self.name, result.bits());
            }
            self.stats.dropped += 1;
            XdpResult::CONSUMED
        }
    }

    /// Stop the channel and take every page back from the engine.
    ///
    /// # Returns
    /// Number of pages reclaimed.
    pub fn shutdown(&mut self) -> usize {
        self.stopping = true;
        self.pacer.cancel();
        self.ring.request_teardown();
        self.ring.disable();

        let mut returned = Vec::new();
        for flow in 0..self.flows {
            self.ring.reset(flow, &mut |desc_dma| returned.push(desc_dma));
        }
        let mut reclaimed = 0;
        for desc_dma in returned {
            if let Some(idx) = self.descs.dma2virt(desc_dma) {
                if self.descs.free(idx).is_some() {
                    reclaimed += 1;
                }
            }
        }
        self.descs.drain_in_use(|_, _| reclaimed += 1);
        log::debug!("{}: shutdown, {} pages reclaimed", self.name, reclaimed);
        reclaimed
    }
}
