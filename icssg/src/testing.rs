//! Test doubles for the hardware the driver talks to.
//!
//! - [`RamRegion`]: plain memory behind the [`IoRegion`] trait
//! - [`FakeIcss`]: hardware queue block plus a scripted firmware that
//!   answers commands, keeps an FDB and emits timestamp responses
//! - [`FakeTxRing`] / [`FakeRxRing`]: DMA rings that record posts and
//!   complete them on request
//! - [`ManualClock`]: time only moves when someone waits
//! - [`RecordingStack`]: host stack that keeps everything it is handed

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use smoltcp::wire::EthernetAddress;
use spin::Mutex;

use crate::cmd::{
    FwCommand, MgmtCmd, MgmtRsp, ICSSG_FW_MGMT_CMD_HEADER, ICSS_HS_CMD_BUSY, ICSS_HS_CMD_CANCEL,
    ICSS_HS_CMD_DONE,
};
use crate::config::{ShramLayout, FDB_BUCKET_ENTRIES, FDB_BUCKET_ENTRY_SIZE};
use crate::dma::{DmaSegment, RingError, RxDmaRing, RxDone, RxPost, TxDmaRing, TxPost, CPPI5_TDCM_MARKER};
use crate::hwq::{SliceQueues, HWQ_COUNT};
use crate::io::IoRegion;
use crate::port::{HostStack, ICSS_HS_FW_READY};
use crate::swdata::{Packet, RedirectFrame, RxPacket};
use crate::time::Clock;

// ═══════════════════════════════════════════════════════════════════════════
// MEMORY
// ═══════════════════════════════════════════════════════════════════════════

/// Little-endian RAM behind the register trait.
pub struct RamRegion {
    bytes: Mutex<Vec<u8>>,
}

impl RamRegion {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0; size]),
        }
    }
}

impl IoRegion for RamRegion {
    fn read32(&self, offset: u32) -> u32 {
        let bytes = self.bytes.lock();
        let o = offset as usize;
        u32::from_le_bytes([bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]])
    }

    fn write32(&self, offset: u32, value: u32) {
        let mut bytes = self.bytes.lock();
        let o = offset as usize;
        bytes[o..o + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn size(&self) -> u32 {
        self.bytes.lock().len() as u32
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// ICSS MODEL
// ═══════════════════════════════════════════════════════════════════════════

/// How the scripted firmware answers commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FwBehavior {
    Ack,
    Cancel,
    /// DONE, but with the sequence number of the next request.
    WrongSeq,
    /// Keep the command buffer, never answer.
    Silent,
    /// BUSY first; DONE once the host gave the BUSY buffer back.
    BusyThenDone,
    /// DONE with a corrupted header byte.
    BadHeader,
}

#[derive(Debug, Clone, Copy)]
struct FdbEntry {
    slice: usize,
    mac: [u8; 6],
    fid: u8,
    fid_c2: u8,
}

struct SliceModel {
    behavior: FwBehavior,
    last: Option<MgmtCmd>,
    commands: usize,
    responses: usize,
    pending_done: Option<MgmtRsp>,
}

impl SliceModel {
    fn new() -> Self {
        Self {
            behavior: FwBehavior::Ack,
            last: None,
            commands: 0,
            responses: 0,
            pending_done: None,
        }
    }
}

struct IcssState {
    queues: Vec<VecDeque<u32>>,
    slices: [SliceModel; 2],
    fdb: Vec<FdbEntry>,
}

/// Hardware queue block with the firmware model behind it.
pub struct FakeHwq {
    state: Mutex<IcssState>,
    shram: Arc<RamRegion>,
    layout: ShramLayout,
}

const QUEUE_OFFSET: u32 = 0xd00;
const PEEK_OFFSET: u32 = 0xe00;
const CNT_OFFSET: u32 = 0xe40;
const RESET_OFFSET: u32 = 0xf40;

impl FakeHwq {
    fn slice_for_cmd_push(queue: u8) -> Option<usize> {
        (0..2).find(|&s| SliceQueues::for_slice(s).cmd_push == queue)
    }

    fn slice_for_rsp_push(queue: u8) -> Option<usize> {
        (0..2).find(|&s| SliceQueues::for_slice(s).rsp_push == queue)
    }

    fn respond(&self, state: &mut IcssState, slice: usize, addr: u32, rsp: MgmtRsp) {
        self.shram.write_bytes(addr, &rsp.to_bytes());
        state.queues[SliceQueues::for_slice(slice).rsp_pop as usize].push_back(addr);
        state.slices[slice].responses += 1;
    }

    /// Firmware works through every queued command buffer.
    fn run_command(&self, state: &mut IcssState, slice: usize) {
        let queues = SliceQueues::for_slice(slice);
        let behavior = state.slices[slice].behavior;
        if behavior == FwBehavior::Silent {
            return;
        }
        while let Some(addr) = state.queues[queues.cmd_push as usize].pop_front() {
            self.answer(state, slice, addr, behavior);
        }
    }

    fn answer(&self, state: &mut IcssState, slice: usize, addr: u32, behavior: FwBehavior) {
        let mut words = [0u32; 4];
        for (i, word) in words.iter_mut().enumerate() {
            *word = self.shram.read32(addr + 4 + 4 * i as u32);
        }
        let cmd = MgmtCmd::from_words(&words);
        state.slices[slice].last = Some(cmd);
        state.slices[slice].commands += 1;

        let args = self.execute(state, slice, &cmd);
        let mut rsp = MgmtRsp {
            status: ICSS_HS_CMD_DONE,
            seqnum: cmd.seqnum,
            cmd_type: cmd.cmd_type,
            header: ICSSG_FW_MGMT_CMD_HEADER,
            args,
        };
        match behavior {
            FwBehavior::Cancel => rsp.status = ICSS_HS_CMD_CANCEL,
            FwBehavior::WrongSeq => rsp.seqnum = cmd.seqnum.wrapping_add(1),
            FwBehavior::BadHeader => rsp.header = 0,
            FwBehavior::BusyThenDone => {
                state.slices[slice].pending_done = Some(rsp);
                rsp.status = ICSS_HS_CMD_BUSY;
            }
            FwBehavior::Ack | FwBehavior::Silent => {}
        }
        self.respond(state, slice, addr, rsp);
    }

    /// Host returned a response buffer; finish a BUSY command if one waits.
    fn buffer_returned(&self, state: &mut IcssState, slice: usize) {
        let Some(rsp) = state.slices[slice].pending_done.take() else {
            return;
        };
        let free = SliceQueues::for_slice(slice).cmd_pop as usize;
        if let Some(addr) = state.queues[free].pop_front() {
            self.respond(state, slice, addr, rsp);
        }
    }

    fn execute(&self, state: &mut IcssState, slice: usize, cmd: &MgmtCmd) -> [u32; 3] {
        let Some(command) = FwCommand::decode(cmd.cmd_type, cmd.code()) else {
            return [0; 3];
        };
        let a0 = cmd.args[0].to_le_bytes();
        let a1 = cmd.args[1].to_le_bytes();
        let mac = [a0[0], a0[1], a0[2], a0[3], a1[0], a1[1]];
        let (fid, fid_c2) = (a1[2], a1[3]);
        let same = |e: &FdbEntry| e.slice == slice && e.mac == mac && e.fid == fid;

        match command {
            FwCommand::AddFdb => {
                state.fdb.retain(|e| !same(e));
                state.fdb.push(FdbEntry {
                    slice,
                    mac,
                    fid,
                    fid_c2,
                });
            }
            FwCommand::DelFdb => state.fdb.retain(|e| !same(e)),
            FwCommand::EraseFdb => {
                let multicast_only = cmd.args[0] == 1;
                state
                    .fdb
                    .retain(|e| e.slice != slice || (multicast_only && e.mac[0] & 1 == 0));
            }
            FwCommand::GetFdbSlot => {
                let slot = fdb_slot(&mac);
                let base = self.layout.fdb_bucket_offset(slice);
                let bucket: Vec<FdbEntry> = state
                    .fdb
                    .iter()
                    .filter(|e| e.slice == slice && fdb_slot(&e.mac) == slot)
                    .copied()
                    .collect();
                for i in 0..FDB_BUCKET_ENTRIES {
                    let raw = match bucket.get(i as usize) {
                        Some(e) => [e.mac[0], e.mac[1], e.mac[2], e.mac[3], e.mac[4], e.mac[5], e.fid, e.fid_c2],
                        None => [0; 8],
                    };
                    self.shram.write_bytes(base + i * FDB_BUCKET_ENTRY_SIZE, &raw);
                }
                return [slot, 0, 0];
            }
            _ => {}
        }
        [0; 3]
    }
}

fn fdb_slot(mac: &[u8; 6]) -> u32 {
    mac.iter().fold(0u32, |h, &b| h.wrapping_mul(31) ^ b as u32) & 0xFF
}

impl IoRegion for FakeHwq {
    fn read32(&self, offset: u32) -> u32 {
        let mut state = self.state.lock();
        match offset {
            o if (QUEUE_OFFSET..PEEK_OFFSET).contains(&o) => {
                let q = ((o - QUEUE_OFFSET) / 4) as usize;
                state.queues[q].pop_front().unwrap_or(0)
            }
            o if (PEEK_OFFSET..CNT_OFFSET).contains(&o) => {
                let q = ((o - PEEK_OFFSET) / 4) as usize;
                state.queues[q].front().copied().unwrap_or(0)
            }
            o if (CNT_OFFSET..CNT_OFFSET + 4 * HWQ_COUNT as u32).contains(&o) => {
                let q = ((o - CNT_OFFSET) / 4) as usize;
                state.queues[q].len() as u32
            }
            _ => 0,
        }
    }

    fn write32(&self, offset: u32, value: u32) {
        let mut state = self.state.lock();
        match offset {
            o if (QUEUE_OFFSET..PEEK_OFFSET).contains(&o) => {
                let q = ((o - QUEUE_OFFSET) / 4) as u8;
                state.queues[q as usize].push_back(value);
                if let Some(slice) = Self::slice_for_cmd_push(q) {
                    self.run_command(&mut state, slice);
                } else if let Some(slice) = Self::slice_for_rsp_push(q) {
                    self.buffer_returned(&mut state, slice);
                }
            }
            RESET_OFFSET => {
                if let Some(queue) = state.queues.get_mut(value as usize) {
                    queue.clear();
                }
            }
            _ => {}
        }
    }

    fn size(&self) -> u32 {
        0x1000
    }
}

/// One ICSSG instance: queue block, shared RAM and firmware model.
pub struct FakeIcss {
    hwq: Arc<FakeHwq>,
    shram: Arc<RamRegion>,
    layout: ShramLayout,
}

impl FakeIcss {
    pub fn new() -> Self {
        let layout = ShramLayout::default();
        let shram = Arc::new(RamRegion::new(layout.size as usize));
        for slice in 0..2 {
            shram.write32(layout.fw_status_offset(slice), ICSS_HS_FW_READY);
        }
        let hwq = Arc::new(FakeHwq {
            state: Mutex::new(IcssState {
                queues: (0..HWQ_COUNT).map(|_| VecDeque::new()).collect(),
                slices: [SliceModel::new(), SliceModel::new()],
                fdb: Vec::new(),
            }),
            shram: shram.clone(),
            layout,
        });
        Self { hwq, shram, layout }
    }

    pub fn hwq_region(&self) -> Arc<dyn IoRegion> {
        self.hwq.clone()
    }

    pub fn shram_region(&self) -> Arc<dyn IoRegion> {
        self.shram.clone()
    }

    pub fn layout(&self) -> ShramLayout {
        self.layout
    }

    pub fn set_behavior(&self, slice: usize, behavior: FwBehavior) {
        self.hwq.state.lock().slices[slice].behavior = behavior;
    }

    pub fn set_fw_status(&self, slice: usize, word: u32) {
        self.shram.write32(self.layout.fw_status_offset(slice), word);
    }

    pub fn last_command(&self, slice: usize) -> Option<MgmtCmd> {
        self.hwq.state.lock().slices[slice].last
    }

    pub fn commands_seen(&self, slice: usize) -> usize {
        self.hwq.state.lock().slices[slice].commands
    }

    pub fn responses_sent(&self, slice: usize) -> usize {
        self.hwq.state.lock().slices[slice].responses
    }

    pub fn level(&self, queue: u8) -> u32 {
        self.hwq.state.lock().queues[queue as usize].len() as u32
    }

    /// Answer commands left queued while the firmware was silent.
    pub fn answer_pending(&self, slice: usize) {
        let mut state = self.hwq.state.lock();
        self.hwq.run_command(&mut state, slice);
    }

    pub fn fdb_slot_for(&self, mac: &EthernetAddress) -> u32 {
        fdb_slot(&mac.0)
    }

    /// Emit a TX timestamp response as the firmware would.
    pub fn push_ts_response(&self, slice: usize, cookie: u32, lo: u32, hi: u32) {
        let queues = SliceQueues::for_slice(slice);
        let mut state = self.hwq.state.lock();
        let Some(addr) = state.queues[queues.ts_push as usize].pop_front() else {
            panic!("no free timestamp buffer on slice {}", slice);
        };
        let words = [0, 0, cookie, lo, hi];
        for (i, word) in words.iter().enumerate() {
            self.shram.write32(addr + 4 * i as u32, *word);
        }
        state.queues[queues.ts_pop as usize].push_back(addr);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// DMA RINGS
// ═══════════════════════════════════════════════════════════════════════════

/// What a transmit post looked like when it was pushed.
#[derive(Debug, Clone)]
pub struct TxRecord {
    pub desc_dma: u64,
    pub pkt_len: u32,
    pub dst_tag: u32,
    pub epib: [u32; 2],
    pub segments: Vec<DmaSegment>,
    /// First word of the head buffer.
    pub head_word: u32,
}

#[derive(Default)]
struct TxRingState {
    capacity: usize,
    pending: VecDeque<u64>,
    completed: VecDeque<u64>,
    posted: Vec<TxRecord>,
    enabled: bool,
    teardown: bool,
    reset: bool,
    drain_on_teardown: bool,
}

#[derive(Clone)]
pub struct FakeTxRing {
    state: Arc<Mutex<TxRingState>>,
}

impl FakeTxRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(TxRingState {
                capacity,
                ..TxRingState::default()
            })),
        }
    }

    pub fn posted(&self) -> Vec<TxRecord> {
        self.state.lock().posted.clone()
    }

    /// Complete the `n` oldest pending posts.
    pub fn complete(&self, n: usize) {
        let mut state = self.state.lock();
        for _ in 0..n {
            let Some(desc) = state.pending.pop_front() else {
                break;
            };
            state.completed.push_back(desc);
        }
    }

    pub fn push_teardown_marker(&self) {
        self.state.lock().completed.push_back(CPPI5_TDCM_MARKER);
    }

    /// Complete everything plus the marker as soon as teardown is requested.
    pub fn set_drain_on_teardown(&self, on: bool) {
        self.state.lock().drain_on_teardown = on;
    }

    pub fn teardown_requested(&self) -> bool {
        self.state.lock().teardown
    }

    pub fn was_reset(&self) -> bool {
        self.state.lock().reset
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }
}

impl TxDmaRing for FakeTxRing {
    fn push(&mut self, post: &TxPost<'_>) -> core::result::Result<(), RingError> {
        let mut state = self.state.lock();
        if state.pending.len() >= state.capacity {
            return Err(RingError::Full);
        }
        let head_word = match post.segments.first() {
            // SAFETY: buffers are identity mapped and live until completion.
            Some(seg) if seg.len >= 4 => unsafe { core::ptr::read_unaligned(seg.addr as *const u32) },
            _ => 0,
        };
        state.pending.push_back(post.desc_dma);
        state.posted.push(TxRecord {
            desc_dma: post.desc_dma,
            pkt_len: post.pkt_len,
            dst_tag: post.dst_tag,
            epib: post.epib,
            segments: post.segments.to_vec(),
            head_word,
        });
        Ok(())
    }

    fn pop_complete(&mut self) -> Option<u64> {
        self.state.lock().completed.pop_front()
    }

    fn enable(&mut self) {
        self.state.lock().enabled = true;
    }

    fn disable(&mut self) {
        self.state.lock().enabled = false;
    }

    fn request_teardown(&mut self) {
        let mut state = self.state.lock();
        state.teardown = true;
        if state.drain_on_teardown {
            while let Some(desc) = state.pending.pop_front() {
                state.completed.push_back(desc);
            }
            state.completed.push_back(CPPI5_TDCM_MARKER);
        }
    }

    fn reset(&mut self, reclaim: &mut dyn FnMut(u64)) {
        let mut state = self.state.lock();
        state.reset = true;
        let pending: Vec<u64> = state.pending.drain(..).collect();
        let completed: Vec<u64> = state.completed.drain(..).collect();
        drop(state);
        for desc in pending.into_iter().chain(completed) {
            reclaim(desc);
        }
    }
}

#[derive(Default)]
struct RxRingState {
    capacity: usize,
    posted: Vec<VecDeque<RxPost>>,
    done: Vec<VecDeque<RxDone>>,
    enabled: bool,
}

#[derive(Clone)]
pub struct FakeRxRing {
    state: Arc<Mutex<RxRingState>>,
}

impl FakeRxRing {
    pub fn new(capacity: usize) -> Self {
        let flows = crate::config::ICSSG_MAX_RFLOWS;
        Self {
            state: Arc::new(Mutex::new(RxRingState {
                capacity,
                posted: (0..flows).map(|_| VecDeque::new()).collect(),
                done: (0..flows).map(|_| VecDeque::new()).collect(),
                enabled: false,
            })),
        }
    }

    /// Empty buffers waiting on `flow`.
    pub fn queued(&self, flow: usize) -> usize {
        self.state.lock().posted[flow].len()
    }

    /// Receive `frame` into the oldest posted buffer and complete it on
    /// `flow`.
    pub fn inject(&self, flow: usize, frame: &[u8], psdata: [u32; 2]) {
        let mut state = self.state.lock();
        let post = match state.posted[flow].pop_front() {
            Some(post) => post,
            None => state.posted[0].pop_front().expect("no receive buffer posted"),
        };
        assert!(frame.len() <= post.buf_len as usize);
        // SAFETY: posted pages are identity mapped and owned by the ring.
        unsafe {
            core::ptr::copy_nonoverlapping(frame.as_ptr(), post.buf_dma as *mut u8, frame.len());
        }
        state.done[flow].push_back(RxDone {
            desc_dma: post.desc_dma,
            pkt_len: frame.len() as u32,
            psdata,
        });
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }
}

impl RxDmaRing for FakeRxRing {
    fn push(&mut self, flow: usize, post: RxPost) -> core::result::Result<(), RingError> {
        let mut state = self.state.lock();
        if state.posted[flow].len() >= state.capacity {
            return Err(RingError::Full);
        }
        state.posted[flow].push_back(post);
        Ok(())
    }

    fn pop(&mut self, flow: usize) -> Option<RxDone> {
        self.state.lock().done[flow].pop_front()
    }

    fn enable(&mut self) {
        self.state.lock().enabled = true;
    }

    fn disable(&mut self) {
        self.state.lock().enabled = false;
    }

    fn request_teardown(&mut self) {}

    fn reset(&mut self, flow: usize, reclaim: &mut dyn FnMut(u64)) {
        let mut state = self.state.lock();
        let mut returned: Vec<u64> = state.posted[flow].drain(..).map(|p| p.desc_dma).collect();
        returned.extend(state.done[flow].drain(..).map(|d| d.desc_dma));
        drop(state);
        for desc in returned {
            reclaim(desc);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CLOCK AND STACK
// ═══════════════════════════════════════════════════════════════════════════

/// Clock that advances only when relaxed on.
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_us: u64) -> Self {
        Self {
            now: AtomicU64::new(start_us),
        }
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }

    fn relax(&self, us: u64) {
        self.now.fetch_add(us, Ordering::AcqRel);
    }
}

/// Host stack that records what it receives.
#[derive(Default)]
pub struct RecordingStack {
    pub received: Vec<RxPacket>,
    pub completed: Vec<Arc<Packet>>,
    pub timestamps: Vec<u64>,
    pub redirected: usize,
    pub flushes: usize,
    /// Make `redirect` refuse every frame.
    pub refuse_redirects: bool,
}

impl HostStack for RecordingStack {
    fn receive(&mut self, pkt: RxPacket) {
        self.received.push(pkt);
    }

    fn tx_completed(&mut self, pkt: Arc<Packet>) {
        self.completed.push(pkt);
    }

    fn tx_timestamp(&mut self, _pkt: Arc<Packet>, ns: u64) {
        self.timestamps.push(ns);
    }

    fn redirect(&mut self, frame: RedirectFrame) -> bool {
        if self.refuse_redirects {
            return false;
        }
        drop(frame);
        self.redirected += 1;
        true
    }

    fn flush_redirects(&mut self) {
        self.flushes += 1;
    }
}
