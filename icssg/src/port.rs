//! Network port (one MII slice).
//!
//! A port owns its transmit channels, receive channel, command channel and
//! TX timestamp table. It ties them to the external collaborators: the host
//! stack that sends and receives frames, and the link manager that reports
//! link/speed/duplex.

extern crate alloc;

use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use smoltcp::wire::EthernetAddress;
use spin::Mutex;

use crate::cmd::{CommandChannel, FdbEraseScope, FdbFlags, FwMailbox, PortStateCmd};
use crate::config::{
    PortConfig, ShramLayout, TimeoutConfig, FDB_BUCKET_ENTRIES, FDB_BUCKET_ENTRY_SIZE,
};
use crate::dma::{RxDmaRing, RxRingHandle, TxDmaRing, TxRingHandle, PRUETH_TX_TS_REQUEST};
use crate::error::{IcssgError, Result};
use crate::hwq::{BufferQueue, SliceQueues};
use crate::io::IoRegion;
use crate::rx::{FastPath, RxChannel};
use crate::swdata::{Packet, PagePool, RedirectFrame, RxPacket};
use crate::time::{Clock, Deadline};
use crate::tstamp::{TxTsResponse, TxTsTable, TX_TS_RESPONSE_SIZE};
use crate::tx::{TeardownState, TxChannel};
use crate::vlan::{VlanTable, VLAN_N_VID};

// ═══════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════

/// Firmware handshake word once the firmware is up.
pub const ICSS_HS_FW_READY: u32 = 0x5555_5555;
/// Firmware handshake word after a crash; the low 16 bits hold the code.
pub const ICSS_HS_FW_DEAD: u32 = 0xDEAD_0000;

/// In-band command word telling the firmware the host is going away.
pub const ICSSG_SHUTDOWN_CMD: u32 = 0x0101_0000;

/// Scratchpad offset the firmware reads the RX flow id base from.
pub const ICSSG_SPAD_RX_FLOW_ID: u32 = 0x0;

/// Budget used while draining channels at stop.
const TEARDOWN_POLL_BUDGET: usize = 64;
/// Pause between drain polls at stop.
const TEARDOWN_POLL_US: u64 = 100;

// ═══════════════════════════════════════════════════════════════════════════
// IDENTITY AND OBSERVATIONS
// ═══════════════════════════════════════════════════════════════════════════

/// Switch port. The host port has no slice of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortId {
    Host,
    Mii0,
    Mii1,
}

impl PortId {
    pub fn slice(self) -> Result<usize> {
        match self {
            PortId::Host => Err(IcssgError::InvalidPort),
            PortId::Mii0 => Ok(0),
            PortId::Mii1 => Ok(1),
        }
    }

    /// Bit in VLAN membership masks and FDB membership flags.
    pub fn mask(self) -> u8 {
        match self {
            PortId::Host => 1 << 0,
            PortId::Mii0 => 1 << 1,
            PortId::Mii1 => 1 << 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Duplex {
    Half,
    Full,
}

/// Link observation, written by the link manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkState {
    pub up: bool,
    /// Mbit/s.
    pub speed: u32,
    pub duplex: Duplex,
}

impl Default for LinkState {
    fn default() -> Self {
        Self {
            up: false,
            speed: 0,
            duplex: Duplex::Full,
        }
    }
}

impl LinkState {
    pub fn half_duplex(&self) -> bool {
        self.up && self.duplex == Duplex::Half
    }
}

/// Decoded firmware handshake word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FwStatus {
    Ready,
    Dead(u16),
    /// Still booting or not loaded.
    Unknown(u32),
}

impl FwStatus {
    pub fn from_word(word: u32) -> Self {
        if word == ICSS_HS_FW_READY {
            FwStatus::Ready
        } else if word & 0xFFFF_0000 == ICSS_HS_FW_DEAD {
            FwStatus::Dead(word as u16)
        } else {
            FwStatus::Unknown(word)
        }
    }
}

/// The host network stack, as seen from the data path.
pub trait HostStack {
    /// Frame received and passed by the fast path.
    fn receive(&mut self, pkt: RxPacket);

    /// Transmit completed; the driver's reference is returned.
    fn tx_completed(&mut self, pkt: Arc<Packet>);

    /// Hardware TX timestamp for a packet, in nanoseconds.
    fn tx_timestamp(&mut self, pkt: Arc<Packet>, ns: u64);

    /// Fast path redirected a frame. Returns false if the target refused it.
    fn redirect(&mut self, frame: RedirectFrame) -> bool;

    /// End of a poll that redirected at least one frame.
    fn flush_redirects(&mut self);
}

// ═══════════════════════════════════════════════════════════════════════════
// PORT
// ═══════════════════════════════════════════════════════════════════════════

pub struct Port<T: TxDmaRing, R: RxDmaRing, M: FwMailbox> {
    id: PortId,
    slice: usize,
    name: String,
    mac: EthernetAddress,
    config: PortConfig,
    timeouts: TimeoutConfig,
    layout: ShramLayout,
    tx_chns: Vec<TxChannel<T>>,
    rx_chn: Option<RxChannel<R>>,
    cmd: CommandChannel<M>,
    tx_ts: Mutex<TxTsTable<Arc<Packet>>>,
    hwq: Arc<BufferQueue>,
    shram: Arc<dyn IoRegion>,
    vlan: Arc<VlanTable>,
    pages: Arc<PagePool>,
    fast_path: Option<Box<dyn FastPath>>,
    clock: Arc<dyn Clock>,
    link: LinkState,
    fw_running: bool,
    port_vlan: u16,
    mc_list: Vec<EthernetAddress>,
}

impl<T: TxDmaRing, R: RxDmaRing, M: FwMailbox> Port<T, R, M> {
    /// Create a stopped port.
    ///
    /// # Arguments
    /// - `id`: `Mii0` or `Mii1`
    /// - `mailbox`: Command transport for this port's slice
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: PortId,
        mac: EthernetAddress,
        config: PortConfig,
        timeouts: TimeoutConfig,
        layout: ShramLayout,
        hwq: Arc<BufferQueue>,
        shram: Arc<dyn IoRegion>,
        vlan: Arc<VlanTable>,
        mailbox: M,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let slice = id.slice()?;
        config.validate()?;
        let pages = PagePool::new(config.page_count, config.page_size);
        Ok(Self {
            id,
            slice,
            name: format!("eth{}", slice),
            mac,
            cmd: CommandChannel::new(mailbox, slice, clock.clone(), timeouts),
            config,
            timeouts,
            layout,
            tx_chns: Vec::new(),
            rx_chn: None,
            tx_ts: Mutex::new(TxTsTable::new()),
            hwq,
            shram,
            vlan,
            pages,
            fast_path: None,
            clock,
            link: LinkState::default(),
            fw_running: false,
            port_vlan: 0,
            mc_list: Vec::new(),
        })
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn slice(&self) -> usize {
        self.slice
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mac(&self) -> EthernetAddress {
        self.mac
    }

    pub fn is_running(&self) -> bool {
        self.fw_running
    }

    pub fn link(&self) -> LinkState {
        self.link
    }

    pub fn port_vlan(&self) -> u16 {
        self.port_vlan
    }

    pub fn config(&self) -> &PortConfig {
        &self.config
    }

    pub fn tx_channel(&self, idx: usize) -> Option<&TxChannel<T>> {
        self.tx_chns.get(idx)
    }

    pub fn rx_channel(&self) -> Option<&RxChannel<R>> {
        self.rx_chn.as_ref()
    }

    pub fn command_channel(&self) -> &CommandChannel<M> {
        &self.cmd
    }

    pub fn page_pool(&self) -> &Arc<PagePool> {
        &self.pages
    }

    pub fn tx_ts_pending(&self) -> usize {
        self.tx_ts.lock().pending()
    }

    pub fn set_fast_path(&mut self, prog: Option<Box<dyn FastPath>>) {
        self.fast_path = prog;
    }

    /// Link manager update.
    pub fn set_link(&mut self, link: LinkState) {
        if link != self.link {
            if link.up {
                log::info!(
                    "{}: link up, {} Mbps {}",
                    self.name,
                    link.speed,
                    if link.duplex == Duplex::Full { "full duplex" } else { "half duplex" }
                );
            } else {
                log::info!("{}: link down", self.name);
            }
        }
        self.link = link;
    }

    // ───────────────────────────────────────────────────────────────────────
    // Firmware
    // ───────────────────────────────────────────────────────────────────────

    /// Read the firmware handshake word.
    pub fn firmware_status(&self) -> FwStatus {
        FwStatus::from_word(self.shram.read32(self.layout.fw_status_offset(self.slice)))
    }

    fn check_firmware(&self) -> Result<()> {
        match self.firmware_status() {
            FwStatus::Dead(code) => {
                log::error!("{}: firmware dead, error {:#06x}", self.name, code);
                Err(IcssgError::FirmwareDead(code))
            }
            _ => Ok(()),
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ───────────────────────────────────────────────────────────────────────

    /// Bring the port up on freshly allocated rings.
    ///
    /// # Arguments
    /// - `tx`: One ring per TX channel, lowest priority first
    /// - `rx`: The receive ring
    pub fn open(&mut self, tx: Vec<TxRingHandle<T>>, rx: RxRingHandle<R>) -> Result<()> {
        if self.fw_running {
            return Err(IcssgError::AlreadyRunning);
        }
        self.check_firmware()?;
        if tx.len() != self.config.tx_ch_num {
            return Err(IcssgError::InvalidConfig("tx ring count differs from tx_ch_num"));
        }

        let mut tx_chns = Vec::with_capacity(tx.len());
        for (i, handle) in tx.into_iter().enumerate() {
            let name = format!("{}-tx{}", self.name, i);
            let mut chn = TxChannel::new(
                name,
                i,
                self.slice as u32,
                handle,
                self.config.tx_descs,
                self.config.tx_coalesce_usecs,
            )?;
            chn.enable();
            tx_chns.push(chn);
        }

        let mut rx_chn = RxChannel::new(
            format!("{}-rx", self.name),
            rx,
            self.config.rx_descs,
            self.config.rx_flows,
            self.pages.clone(),
            self.config.rx_coalesce_usecs,
        )?;
        rx_chn.set_rx_timestamping(self.config.rx_ts_enabled);
        rx_chn.enable();
        let posted = rx_chn.refill();

        self.tx_chns = tx_chns;
        self.rx_chn = Some(rx_chn);

        let started = self
            .cmd
            .write_scratchpad(ICSSG_SPAD_RX_FLOW_ID, self.config.rx_flow_id_base)
            .and_then(|_| self.cmd.set_port_state(PortStateCmd::Forward));
        if let Err(err) = started {
            log::error!("{}: firmware refused start: {}", self.name, err);
            self.release_channels();
            return Err(err);
        }

        self.fw_running = true;
        log::info!(
            "{}: up, {} tx channels, {} rx pages posted",
            self.name,
            self.tx_chns.len(),
            posted
        );
        Ok(())
    }

    /// Shut the port down.
    ///
    /// Tells the firmware to stop, drains every TX channel (forcing the
    /// teardown if the drain does not finish in time), reclaims all receive
    /// pages and drops any outstanding timestamp requests. Never hangs.
    pub fn stop(&mut self, stack: &mut dyn HostStack) -> Result<()> {
        if !self.fw_running {
            return Err(IcssgError::NotRunning);
        }

        if let Err(err) = self.cmd.set_port_state(PortStateCmd::Disable) {
            log::warn!("{}: disable command failed: {}", self.name, err);
        }
        if let Some(chn) = self.tx_chns.last_mut() {
            if let Err(err) = chn.submit_cmd(ICSSG_SHUTDOWN_CMD) {
                log::warn!("{}: shutdown command not sent: {}", self.name, err);
            }
        }

        for chn in self.tx_chns.iter_mut() {
            chn.request_drain();
        }

        let clock = self.clock.clone();
        let deadline = Deadline::after(clock.as_ref(), self.timeouts.teardown_us);
        loop {
            let now = clock.now_us();
            for chn in self.tx_chns.iter_mut() {
                chn.poll(TEARDOWN_POLL_BUDGET, now, &mut *stack);
            }
            if self
                .tx_chns
                .iter()
                .all(|chn| chn.teardown_completion().is_done())
            {
                break;
            }
            if deadline.expired(now) {
                for chn in self.tx_chns.iter_mut() {
                    if chn.state() != TeardownState::Stopped {
                        chn.force_stop();
                    }
                }
                break;
            }
            clock.relax(TEARDOWN_POLL_US);
        }

        self.release_channels();
        let dropped = self
            .tx_ts
            .lock()
            .reap(u64::MAX, 0, |_, pkt| pkt.set_ts_in_progress(false));
        if dropped > 0 {
            log::debug!("{}: dropped {} pending tx timestamps", self.name, dropped);
        }

        self.fw_running = false;
        log::info!("{}: down", self.name);
        Ok(())
    }

    fn release_channels(&mut self) {
        for chn in self.tx_chns.iter_mut() {
            chn.force_stop();
        }
        self.tx_chns.clear();
        if let Some(mut rx) = self.rx_chn.take() {
            rx.shutdown();
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Data path
    // ───────────────────────────────────────────────────────────────────────

    /// Queue a packet for transmission.
    ///
    /// # Returns
    /// The timestamp cookie when a TX timestamp was requested and a slot
    /// was free.
    pub fn xmit(&mut self, pkt: Arc<Packet>) -> Result<Option<u32>> {
        if !self.fw_running {
            return Err(IcssgError::NotRunning);
        }
        if !self.link.up {
            return Err(IcssgError::LinkDown);
        }
        let q = pkt.queue % self.tx_chns.len().max(1);

        let mut cookie = None;
        let mut epib = [0u32; 2];
        if self.config.tx_ts_enabled && pkt.wants_timestamp() {
            match self.tx_ts.lock().reserve(pkt.clone(), self.clock.now_us()) {
                Ok(c) => {
                    epib = [c, PRUETH_TX_TS_REQUEST];
                    pkt.set_ts_in_progress(true);
                    cookie = Some(c);
                }
                Err(_) => {
                    log::warn!("{}: no free tx timestamp slot, sending without", self.name);
                }
            }
        }

        let chn = self.tx_chns.get_mut(q).ok_or(IcssgError::NotRunning)?;
        if let Err(err) = chn.submit_packet(pkt.clone(), epib) {
            if let Some(c) = cookie {
                self.tx_ts.lock().resolve(c);
                pkt.set_ts_in_progress(false);
            }
            return Err(err);
        }
        Ok(cookie)
    }

    pub fn on_tx_irq(&mut self, chn: usize) -> bool {
        self.tx_chns.get_mut(chn).map_or(false, |c| c.on_irq())
    }

    pub fn on_rx_irq(&mut self, flow: usize) -> bool {
        self.rx_chn.as_mut().map_or(false, |c| c.on_irq(flow))
    }

    pub fn poll_tx(&mut self, chn: usize, budget: usize, stack: &mut dyn HostStack) -> usize {
        let now = self.clock.now_us();
        match self.tx_chns.get_mut(chn) {
            Some(c) => c.poll(budget, now, stack),
            None => 0,
        }
    }

    /// Receive poll. Fast-path TX verdicts go out on channel 0.
    pub fn poll_rx(&mut self, flow: usize, budget: usize, stack: &mut dyn HostStack) -> usize {
        let now = self.clock.now_us();
        let Some(rx) = self.rx_chn.as_mut() else {
            return 0;
        };
        rx.poll(
            flow,
            budget,
            now,
            self.fast_path.as_deref_mut(),
            self.tx_chns.first_mut(),
            stack,
        )
    }

    /// Fire due pacing timers and reap stale timestamp requests.
    pub fn service_timers(&mut self) {
        let now = self.clock.now_us();
        for chn in self.tx_chns.iter_mut() {
            chn.service_timer(now);
        }
        if let Some(rx) = self.rx_chn.as_mut() {
            rx.service_timer(now);
        }
        self.reap_tx_ts();
    }

    pub fn set_coalesce(&mut self, tx_usecs: u32, rx_usecs: u32) {
        self.config.tx_coalesce_usecs = tx_usecs;
        self.config.rx_coalesce_usecs = rx_usecs;
        for chn in self.tx_chns.iter_mut() {
            chn.set_coalesce(tx_usecs);
        }
        if let Some(rx) = self.rx_chn.as_mut() {
            rx.set_coalesce(rx_usecs);
        }
    }

    pub fn set_hwtstamp(&mut self, tx: bool, rx: bool) {
        self.config.tx_ts_enabled = tx;
        self.config.rx_ts_enabled = rx;
        if let Some(chn) = self.rx_chn.as_mut() {
            chn.set_rx_timestamping(rx);
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // TX timestamps
    // ───────────────────────────────────────────────────────────────────────

    /// Drain the timestamp response queue.
    ///
    /// # Returns
    /// Number of timestamps delivered to the stack.
    pub fn process_tx_ts(&mut self, stack: &mut dyn HostStack) -> Result<usize> {
        let queues = SliceQueues::for_slice(self.slice);
        let mut delivered = 0;
        while let Some(addr) = self.hwq.pop(queues.ts_pop)? {
            let mut raw = [0u8; TX_TS_RESPONSE_SIZE];
            self.shram.read_bytes(addr, &mut raw);
            self.hwq.push(queues.ts_push, addr)?;

            let rsp = TxTsResponse::from_bytes(&raw);
            let Some(pkt) = self.tx_ts.lock().resolve(rsp.cookie) else {
                continue;
            };
            pkt.set_ts_in_progress(false);
            stack.tx_timestamp(pkt, rsp.timestamp());
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Drop timestamp requests the firmware never answered.
    pub fn reap_tx_ts(&mut self) -> usize {
        let now = self.clock.now_us();
        let name = &self.name;
        self.tx_ts
            .lock()
            .reap(now, self.timeouts.ts_reap_us, |cookie, pkt| {
                log::warn!("{}: tx timestamp {} timed out", name, cookie);
                pkt.set_ts_in_progress(false);
            })
    }

    // ───────────────────────────────────────────────────────────────────────
    // Forwarding table
    // ───────────────────────────────────────────────────────────────────────

    pub fn fdb_add(&self, mac: &EthernetAddress, vid: u16, flags: FdbFlags) -> Result<()> {
        self.check_firmware()?;
        self.cmd.fdb_add_del(mac, vid, flags, true)
    }

    pub fn fdb_del(&self, mac: &EthernetAddress, vid: u16) -> Result<()> {
        self.check_firmware()?;
        self.cmd.fdb_add_del(mac, vid, FdbFlags::empty(), false)
    }

    pub fn fdb_erase_all(&self) -> Result<()> {
        self.check_firmware()?;
        self.cmd.fdb_erase(FdbEraseScope::All)
    }

    pub fn fdb_flush_multicast(&self) -> Result<()> {
        self.check_firmware()?;
        self.cmd.fdb_erase(FdbEraseScope::Multicast)
    }

    /// Look up an FDB entry.
    ///
    /// The firmware resolves the hash bucket and copies it to the lookup
    /// area; the entry is then searched for there.
    pub fn fdb_lookup(&self, mac: &EthernetAddress, vid: u16) -> Result<Option<FdbFlags>> {
        self.check_firmware()?;
        let slot = self.cmd.get_fdb_slot(mac, vid)?;
        let base = self.layout.fdb_bucket_offset(self.slice);
        for i in 0..FDB_BUCKET_ENTRIES {
            let mut raw = [0u8; FDB_BUCKET_ENTRY_SIZE as usize];
            self.shram.read_bytes(base + i * FDB_BUCKET_ENTRY_SIZE, &mut raw);
            if raw[..6] == *mac.as_bytes() && raw[6] == vid as u8 {
                return Ok(Some(FdbFlags::from_bits_retain(raw[7])));
            }
        }
        log::debug!("{}: {} vid {} not in bucket {}", self.name, mac, vid, slot);
        Ok(None)
    }

    // ───────────────────────────────────────────────────────────────────────
    // VLAN
    // ───────────────────────────────────────────────────────────────────────

    fn vlan_mask(&self) -> u8 {
        self.id.mask() | PortId::Host.mask()
    }

    /// Make this port (and the host) members of `vid`.
    ///
    /// The firmware is updated first; the shared table only changes once it
    /// acknowledged.
    pub fn vlan_add(&mut self, vid: u16, untagged: bool, pvid: bool) -> Result<()> {
        if vid >= VLAN_N_VID {
            return Err(IcssgError::InvalidVlan(vid));
        }
        self.check_firmware()?;
        let port_mask = self.vlan_mask();
        let untag_mask = if untagged { port_mask } else { 0 };

        self.cmd.vlan_update(vid, port_mask, untag_mask, true)?;
        self.vlan.modify(vid, port_mask, untag_mask, true)?;
        if pvid {
            self.vlan.set_pvid(self.id, vid)?;
            self.port_vlan = vid;
        }
        log::debug!("{}: vlan {} added (untagged {}, pvid {})", self.name, vid, untagged, pvid);
        Ok(())
    }

    pub fn vlan_del(&mut self, vid: u16) -> Result<()> {
        if vid >= VLAN_N_VID {
            return Err(IcssgError::InvalidVlan(vid));
        }
        self.check_firmware()?;
        let port_mask = self.id.mask();

        self.cmd.vlan_update(vid, port_mask, 0, false)?;
        self.vlan.modify(vid, port_mask, 0, false)?;
        if self.port_vlan == vid {
            self.vlan.set_pvid(self.id, 0)?;
            self.port_vlan = 0;
        }
        Ok(())
    }

    pub fn set_vlan_aware(&self, enable: bool) -> Result<()> {
        self.check_firmware()?;
        self.cmd.set_vlan_aware(enable)
    }

    pub fn set_port_state(&self, state: PortStateCmd) -> Result<()> {
        self.check_firmware()?;
        self.cmd.set_port_state(state)
    }

    /// Program the unicast address and the multicast filter list.
    pub fn set_rx_mode(&mut self, mc_list: &[EthernetAddress]) -> Result<()> {
        self.check_firmware()?;
        self.cmd.add_mac(&self.mac)?;
        for mac in mc_list.iter().filter(|m| m.is_multicast()) {
            self.cmd.add_filter(mac)?;
        }
        self.mc_list = mc_list.to_vec();
        Ok(())
    }

    pub fn multicast_list(&self) -> &[EthernetAddress] {
        &self.mc_list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::HwqMailbox;
    use crate::config::SHRAM_BUFFER_STRIDE;
    use crate::testing::{FakeIcss, FakeRxRing, FakeTxRing, FwBehavior, ManualClock, RecordingStack};
    use alloc::vec;
    use prueth_dma_pool::MemoryRegion;

    type TestPort = Port<FakeTxRing, FakeRxRing, HwqMailbox>;

    struct Rig {
        icss: FakeIcss,
        port: TestPort,
        tx: Vec<FakeTxRing>,
        rx: FakeRxRing,
        clock: Arc<ManualClock>,
    }

    fn rig(config: PortConfig) -> Rig {
        let icss = FakeIcss::new();
        let layout = icss.layout();
        let hwq = Arc::new(BufferQueue::new(icss.hwq_region()));
        let queues = SliceQueues::for_slice(1);
        hwq.seed(queues.cmd_pop, layout.cmd_buffer_base(1), SHRAM_BUFFER_STRIDE, layout.cmd_buffer_count)
            .unwrap();
        hwq.seed(queues.ts_push, layout.ts_buffer_base(1), SHRAM_BUFFER_STRIDE, layout.ts_buffer_count)
            .unwrap();
        let vlan = Arc::new(VlanTable::new(icss.shram_region(), layout));
        vlan.init();
        let clock = Arc::new(ManualClock::new(0));
        let mailbox = HwqMailbox::new(hwq.clone(), icss.shram_region(), 1);
        let mut port = Port::new(
            PortId::Mii1,
            EthernetAddress([0x02, 0, 0, 0, 0, 0x01]),
            config,
            TimeoutConfig::default(),
            layout,
            hwq,
            icss.shram_region(),
            vlan,
            mailbox,
            clock.clone(),
        )
        .unwrap();

        let tx: Vec<FakeTxRing> = (0..port.config().tx_ch_num).map(|_| FakeTxRing::new(64)).collect();
        let rx = FakeRxRing::new(128);
        let handles = tx
            .iter()
            .enumerate()
            .map(|(i, ring)| TxRingHandle {
                ring: ring.clone(),
                desc_region: MemoryRegion::new(0x1000_0000 + i * 0x10_0000, 128 * 128),
            })
            .collect();
        port.open(
            handles,
            RxRingHandle {
                ring: rx.clone(),
                desc_region: MemoryRegion::new(0x2000_0000, 128 * 128),
            },
        )
        .unwrap();
        port.set_link(LinkState {
            up: true,
            speed: 1000,
            duplex: Duplex::Full,
        });
        Rig {
            icss,
            port,
            tx,
            rx,
            clock,
        }
    }

    fn ts_config() -> PortConfig {
        PortConfig {
            tx_ts_enabled: true,
            ..PortConfig::default()
        }
    }

    #[test]
    fn test_port_id_slices() {
        assert_eq!(PortId::Host.slice(), Err(IcssgError::InvalidPort));
        assert_eq!(PortId::Mii1.slice(), Ok(1));
        assert_eq!(PortId::Mii0.mask() | PortId::Host.mask(), 0b011);
    }

    #[test]
    fn test_fw_status_decode() {
        assert_eq!(FwStatus::from_word(0x5555_5555), FwStatus::Ready);
        assert_eq!(FwStatus::from_word(0xDEAD_0042), FwStatus::Dead(0x42));
        assert_eq!(FwStatus::from_word(0), FwStatus::Unknown(0));
    }

    #[test]
    fn test_open_starts_firmware() {
        let rig = rig(PortConfig::default());
        assert!(rig.port.is_running());
        let last = rig.icss.last_command(1).unwrap();
        assert_eq!(last.args[0], PortStateCmd::Forward as u32);
        assert_eq!(rig.rx.queued(0), 128);
        assert!(rig.tx.iter().all(|r| r.is_enabled()));
    }

    #[test]
    fn test_open_refused_when_firmware_dead() {
        let mut rig = rig(PortConfig::default());
        let mut stack = RecordingStack::default();
        rig.port.stop(&mut stack).unwrap();
        rig.icss.set_fw_status(1, ICSS_HS_FW_DEAD | 0x7);
        let handles = vec![TxRingHandle {
            ring: FakeTxRing::new(4),
            desc_region: MemoryRegion::new(0x1000_0000, 128 * 128),
        }];
        let rx = RxRingHandle {
            ring: FakeRxRing::new(4),
            desc_region: MemoryRegion::new(0x2000_0000, 128 * 128),
        };
        assert_eq!(rig.port.open(handles, rx), Err(IcssgError::FirmwareDead(7)));
    }

    #[test]
    fn test_xmit_requires_link() {
        let mut rig = rig(PortConfig::default());
        rig.port.set_link(LinkState::default());
        let pkt = Arc::new(Packet::new(vec![0; 60]));
        assert_eq!(rig.port.xmit(pkt), Err(IcssgError::LinkDown));
    }

    #[test]
    fn test_timestamp_round_trip() {
        let mut rig = rig(ts_config());
        let mut stack = RecordingStack::default();
        let pkt = Arc::new(Packet::new(vec![0; 60]).with_timestamp().with_queue(2));

        let cookie = rig.port.xmit(pkt.clone()).unwrap().unwrap();
        assert!(pkt.ts_in_progress());
        let posted = rig.tx[2].posted();
        let post = &posted[0];
        assert_eq!(post.epib, [cookie, PRUETH_TX_TS_REQUEST]);

        rig.icss.push_ts_response(1, cookie, 0x1000, 0x2);
        assert_eq!(rig.port.process_tx_ts(&mut stack), Ok(1));
        assert_eq!(stack.timestamps, vec![(2u64 << 32) | 0x1000]);
        assert!(!pkt.ts_in_progress());
        assert_eq!(rig.port.tx_ts_pending(), 0);

        // Unknown cookie is ignored
        rig.icss.push_ts_response(1, cookie, 0, 0);
        assert_eq!(rig.port.process_tx_ts(&mut stack), Ok(0));
    }

    #[test]
    fn test_timestamp_slots_exhausted_still_sends() {
        let mut rig = rig(ts_config());
        for _ in 0..crate::tstamp::PRUETH_MAX_TX_TS_REQUESTS {
            let pkt = Arc::new(Packet::new(vec![0; 60]).with_timestamp());
            assert!(rig.port.xmit(pkt).unwrap().is_some());
            rig.tx[0].complete(1);
            rig.port.poll_tx(0, 8, &mut RecordingStack::default());
        }
        let pkt = Arc::new(Packet::new(vec![0; 60]).with_timestamp());
        assert_eq!(rig.port.xmit(pkt.clone()), Ok(None));
        assert!(!pkt.ts_in_progress());
    }

    #[test]
    fn test_stale_timestamps_reaped() {
        let mut rig = rig(ts_config());
        let pkt = Arc::new(Packet::new(vec![0; 60]).with_timestamp());
        rig.port.xmit(pkt.clone()).unwrap();
        rig.clock.relax(TimeoutConfig::default().ts_reap_us);
        rig.port.service_timers();
        assert_eq!(rig.port.tx_ts_pending(), 0);
        assert!(!pkt.ts_in_progress());
    }

    #[test]
    fn test_stop_drains_in_flight() {
        let mut rig = rig(PortConfig::default());
        let mut stack = RecordingStack::default();
        for q in 0..3 {
            let pkt = Arc::new(Packet::new(vec![0; 60]).with_queue(q));
            rig.port.xmit(pkt).unwrap();
        }
        for ring in &rig.tx {
            ring.set_drain_on_teardown(true);
        }
        rig.port.stop(&mut stack).unwrap();
        assert!(!rig.port.is_running());
        assert_eq!(stack.completed.len(), 3);
        assert_eq!(rig.port.page_pool().available(), rig.port.page_pool().total());
        // Shutdown word went out on the highest priority channel
        let posted = rig.tx[3].posted();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].head_word, ICSSG_SHUTDOWN_CMD);
    }

    #[test]
    fn test_stop_forces_teardown() {
        let mut rig = rig(PortConfig::default());
        let mut stack = RecordingStack::default();
        rig.port.xmit(Arc::new(Packet::new(vec![0; 60]))).unwrap();

        rig.port.stop(&mut stack).unwrap();
        assert!(rig.tx[0].was_reset());
        // Idle channels stopped on their own
        assert!(!rig.tx[1].was_reset());
        assert!(!rig.tx[2].was_reset());
        assert!(rig.clock.now_us() >= TimeoutConfig::default().teardown_us);
    }

    #[test]
    fn test_rx_delivery_through_port() {
        let mut rig = rig(PortConfig::default());
        let mut stack = RecordingStack::default();
        let mut frame = [0u8; 64];
        frame[0] = 0x01;
        rig.rx.inject(0, &frame, [0; 2]);
        assert_eq!(rig.port.poll_rx(0, 16, &mut stack), 1);
        assert_eq!(stack.received.len(), 1);
        assert_eq!(rig.port.rx_channel().unwrap().stats().multicast, 1);
    }

    #[test]
    fn test_vlan_add_after_ack() {
        let mut rig = rig(PortConfig::default());
        rig.port.vlan_add(10, true, true).unwrap();
        let entry = rig.port.vlan.entry(10).unwrap();
        assert_eq!(entry.members, 0b101);
        assert_eq!(entry.untagged, 0b101);
        assert_eq!(rig.port.vlan.get_pvid(PortId::Mii1), 10);
        assert_eq!(rig.port.port_vlan(), 10);

        rig.port.vlan_del(10).unwrap();
        assert_eq!(rig.port.vlan.entry(10).unwrap().members, 0b001);
        assert_eq!(rig.port.port_vlan(), 0);
    }

    #[test]
    fn test_vlan_untouched_when_cancelled() {
        let mut rig = rig(PortConfig::default());
        rig.icss.set_behavior(1, FwBehavior::Cancel);
        assert_eq!(rig.port.vlan_add(20, false, false), Err(IcssgError::CommandCancelled));
        assert_eq!(rig.port.vlan.entry(20).unwrap().members, 0);
    }

    #[test]
    fn test_fdb_lookup() {
        let rig = rig(PortConfig::default());
        let mac = EthernetAddress([0x02, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE]);
        let flags = FdbFlags::VALID | FdbFlags::P2_MEMBERSHIP;
        rig.port.fdb_add(&mac, 5, flags).unwrap();
        assert_eq!(rig.port.fdb_lookup(&mac, 5), Ok(Some(flags)));
        assert_eq!(rig.port.fdb_lookup(&mac, 6), Ok(None));

        rig.port.fdb_del(&mac, 5).unwrap();
        assert_eq!(rig.port.fdb_lookup(&mac, 5), Ok(None));
    }

    #[test]
    fn test_fdb_flush_multicast_keeps_unicast() {
        let rig = rig(PortConfig::default());
        let uc = EthernetAddress([0x02, 1, 2, 3, 4, 5]);
        let mc = EthernetAddress([0x01, 0x00, 0x5E, 0, 0, 1]);
        rig.port.fdb_add(&uc, 1, FdbFlags::VALID).unwrap();
        rig.port.fdb_add(&mc, 1, FdbFlags::VALID).unwrap();
        rig.port.fdb_flush_multicast().unwrap();
        assert!(rig.port.fdb_lookup(&uc, 1).unwrap().is_some());
        assert!(rig.port.fdb_lookup(&mc, 1).unwrap().is_none());
    }

    #[test]
    fn test_commands_refused_when_firmware_dead() {
        let rig = rig(PortConfig::default());
        rig.icss.set_fw_status(1, ICSS_HS_FW_DEAD | 0x11);
        assert_eq!(rig.port.fdb_erase_all(), Err(IcssgError::FirmwareDead(0x11)));
    }

    #[test]
    fn test_set_rx_mode() {
        let mut rig = rig(PortConfig::default());
        let list = [
            EthernetAddress([0x01, 0x00, 0x5E, 0, 0, 1]),
            EthernetAddress([0x01, 0x00, 0x5E, 0, 0, 2]),
        ];
        rig.port.set_rx_mode(&list).unwrap();
        assert_eq!(rig.port.multicast_list().len(), 2);
        assert_eq!(rig.icss.commands_seen(1), 5);
    }
}
