//! Software data attached to descriptors.
//!
//! Every descriptor the driver hands to a DMA ring carries exactly one
//! [`SwData`] describing what it owns. When the engine gives the descriptor
//! back the owner is recovered from the pool slot and released according to
//! its kind.
//!
//! # Receive pages
//! Pages are allocated once when a [`PagePool`] is created and never freed
//! while the pool lives. An [`RxPage`] holds its buffer plus a reference to
//! the pool and returns the buffer on drop, wherever that happens (stack,
//! redirect target, TX completion).

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;
use spin::Mutex;

// ═══════════════════════════════════════════════════════════════════════════
// HEADROOM
// ═══════════════════════════════════════════════════════════════════════════

pub const XDP_PACKET_HEADROOM: usize = 256;
pub const NET_SKB_PAD: usize = 64;
pub const NET_IP_ALIGN: usize = 2;

const fn max(a: usize, b: usize) -> usize {
    if a > b {
        a
    } else {
        b
    }
}

/// Bytes reserved in front of received data in every page.
pub const PRUETH_HEADROOM: usize = prueth_dma_pool::align_up(
    max(XDP_PACKET_HEADROOM, NET_SKB_PAD) + NET_IP_ALIGN,
    core::mem::size_of::<usize>(),
);

// ═══════════════════════════════════════════════════════════════════════════
// OUTBOUND PACKETS
// ═══════════════════════════════════════════════════════════════════════════

bitflags! {
    /// Per-packet transmit requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TxFlags: u32 {
        /// Capture a hardware TX timestamp.
        const HW_TSTAMP = 1 << 0;
    }
}

/// Outbound packet owned by the host stack until completion.
#[derive(Debug)]
pub struct Packet {
    /// Linear head.
    pub data: Vec<u8>,
    /// Additional fragments, each mapped to its own linked descriptor.
    pub frags: Vec<Vec<u8>>,
    /// Preferred TX queue (priority).
    pub queue: usize,
    pub flags: TxFlags,
    ts_in_progress: AtomicBool,
}

impl Packet {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            frags: Vec::new(),
            queue: 0,
            flags: TxFlags::empty(),
            ts_in_progress: AtomicBool::new(false),
        }
    }

    pub fn with_frags(mut self, frags: Vec<Vec<u8>>) -> Self {
        self.frags = frags;
        self
    }

    pub fn with_queue(mut self, queue: usize) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_timestamp(mut self) -> Self {
        self.flags |= TxFlags::HW_TSTAMP;
        self
    }

    /// Total length over head and fragments.
    pub fn len(&self) -> usize {
        self.data.len() + self.frags.iter().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn wants_timestamp(&self) -> bool {
        self.flags.contains(TxFlags::HW_TSTAMP)
    }

    /// A TX timestamp for this packet is outstanding.
    pub fn ts_in_progress(&self) -> bool {
        self.ts_in_progress.load(Ordering::Acquire)
    }

    pub(crate) fn set_ts_in_progress(&self, on: bool) {
        self.ts_in_progress.store(on, Ordering::Release);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// RECEIVE PAGES
// ═══════════════════════════════════════════════════════════════════════════

/// Fixed set of receive pages, recycled forever.
#[derive(Debug)]
pub struct PagePool {
    free: Mutex<Vec<Box<[u8]>>>,
    page_size: usize,
    total: usize,
}

impl PagePool {
    pub fn new(count: usize, page_size: usize) -> Arc<Self> {
        let free = (0..count)
            .map(|_| vec![0u8; page_size].into_boxed_slice())
            .collect();
        Arc::new(Self {
            free: Mutex::new(free),
            page_size,
            total: count,
        })
    }

    /// Take a page; `None` when every page is out.
    pub fn alloc(self: &Arc<Self>) -> Option<RxPage> {
        let buf = self.free.lock().pop()?;
        Some(RxPage {
            buf: Some(buf),
            pool: Arc::clone(self),
        })
    }

    fn recycle(&self, buf: Box<[u8]>) {
        self.free.lock().push(buf);
    }

    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }
}

/// One receive page on loan from its pool.
#[derive(Debug)]
pub struct RxPage {
    buf: Option<Box<[u8]>>,
    pool: Arc<PagePool>,
}

impl RxPage {
    /// Bus address of the page (identity mapped).
    pub fn dma_addr(&self) -> u64 {
        self.as_slice().as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }

    /// Pool this page returns to.
    pub fn pool(&self) -> &Arc<PagePool> {
        &self.pool
    }
}

impl Drop for RxPage {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.recycle(buf);
        }
    }
}

/// Received page retransmitted without passing through the stack.
#[derive(Debug)]
pub struct RedirectFrame {
    pub page: RxPage,
    pub offset: usize,
    pub len: usize,
}

impl RedirectFrame {
    pub fn data(&self) -> &[u8] {
        &self.page.as_slice()[self.offset..self.offset + self.len]
    }

    pub fn dma_addr(&self) -> u64 {
        self.page.dma_addr() + self.offset as u64
    }
}

/// Frame delivered to the host stack. Dropping it recycles the page.
#[derive(Debug)]
pub struct RxPacket {
    pub page: RxPage,
    pub offset: usize,
    pub len: usize,
    /// Hardware receive timestamp in nanoseconds.
    pub hwtstamp: Option<u64>,
    /// Flow the frame arrived on.
    pub flow: usize,
}

impl RxPacket {
    pub fn data(&self) -> &[u8] {
        &self.page.as_slice()[self.offset..self.offset + self.len]
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SOFTWARE DATA
// ═══════════════════════════════════════════════════════════════════════════

/// What a descriptor owns.
#[derive(Debug)]
pub enum SwData {
    /// Outbound packet from the host stack.
    Packet(Arc<Packet>),
    /// Empty or filled receive page.
    Page(RxPage),
    /// In-band firmware command word.
    Cmd(u32),
    /// Redirected receive page on a TX ring.
    Frame(RedirectFrame),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwDataKind {
    Packet,
    Page,
    Cmd,
    Frame,
}

impl SwData {
    pub fn kind(&self) -> SwDataKind {
        match self {
            SwData::Packet(_) => SwDataKind::Packet,
            SwData::Page(_) => SwDataKind::Page,
            SwData::Cmd(_) => SwDataKind::Cmd,
            SwData::Frame(_) => SwDataKind::Frame,
        }
    }
}
