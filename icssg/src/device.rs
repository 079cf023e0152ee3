//! ICSSG device: two MII ports sharing one firmware instance.
//!
//! The device owns what both slices share (the hardware queue block, the
//! shared RAM and the VLAN table) and the switch-mode bookkeeping. Ports
//! are held in a plain `Vec`; nothing else in the crate points back at the
//! device.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;

use smoltcp::wire::EthernetAddress;

use crate::cmd::{FwMailbox, HwqMailbox};
use crate::config::{PortConfig, ShramLayout, TimeoutConfig, SHRAM_BUFFER_STRIDE};
use crate::dma::{RxDmaRing, TxDmaRing};
use crate::error::{IcssgError, Result};
use crate::hwq::{BufferQueue, SliceQueues};
use crate::io::IoRegion;
use crate::port::{FwStatus, HostStack, Port, PortId};
use crate::time::Clock;
use crate::vlan::VlanTable;

/// Slices (MII ports) per ICSSG instance.
pub const PRUETH_NUM_MACS: usize = 2;

/// VLAN bridged ports share when switch mode comes up.
pub const PRUETH_DEFAULT_VLAN: u16 = 1;

pub struct Device<T: TxDmaRing, R: RxDmaRing, M: FwMailbox> {
    ports: Vec<Port<T, R, M>>,
    hwq: Arc<BufferQueue>,
    shram: Arc<dyn IoRegion>,
    vlan: Arc<VlanTable>,
    layout: ShramLayout,
    timeouts: TimeoutConfig,
    clock: Arc<dyn Clock>,
    switch_mode: bool,
    default_vlan: u16,
    /// Ports currently bridged, as a VLAN port mask.
    br_members: u8,
}

impl<T: TxDmaRing, R: RxDmaRing, M: FwMailbox> Device<T, R, M> {
    /// Bring up the shared state.
    ///
    /// Clears the VLAN table, fills each slice's command and timestamp free
    /// lists and empties the queues the firmware answers on.
    ///
    /// # Arguments
    /// - `hwq_regs`: Hardware queue register block
    /// - `shram`: Shared RAM
    pub fn new(
        hwq_regs: Arc<dyn IoRegion>,
        shram: Arc<dyn IoRegion>,
        layout: ShramLayout,
        timeouts: TimeoutConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        layout.validate()?;
        timeouts.validate()?;
        if shram.size() < layout.size {
            return Err(IcssgError::InvalidConfig("shared RAM smaller than layout"));
        }

        let hwq = Arc::new(BufferQueue::new(hwq_regs));
        let vlan = Arc::new(VlanTable::new(shram.clone(), layout));
        vlan.init();

        for slice in 0..PRUETH_NUM_MACS {
            let queues = SliceQueues::for_slice(slice);
            hwq.reset(queues.cmd_push)?;
            hwq.reset(queues.rsp_pop)?;
            hwq.reset(queues.ts_pop)?;
            hwq.seed(
                queues.cmd_pop,
                layout.cmd_buffer_base(slice),
                SHRAM_BUFFER_STRIDE,
                layout.cmd_buffer_count,
            )?;
            hwq.seed(
                queues.ts_push,
                layout.ts_buffer_base(slice),
                SHRAM_BUFFER_STRIDE,
                layout.ts_buffer_count,
            )?;
        }
        log::debug!("icssg: shared queues seeded");

        Ok(Self {
            ports: Vec::with_capacity(PRUETH_NUM_MACS),
            hwq,
            shram,
            vlan,
            layout,
            timeouts,
            clock,
            switch_mode: false,
            default_vlan: PRUETH_DEFAULT_VLAN,
            br_members: 0,
        })
    }

    /// Attach a port to a slice.
    pub fn add_port(
        &mut self,
        id: PortId,
        mac: EthernetAddress,
        config: PortConfig,
        mailbox: M,
    ) -> Result<&mut Port<T, R, M>> {
        id.slice()?;
        if self.ports.iter().any(|p| p.id() == id) {
            return Err(IcssgError::InvalidConfig("port already attached"));
        }
        let port = Port::new(
            id,
            mac,
            config,
            self.timeouts,
            self.layout,
            self.hwq.clone(),
            self.shram.clone(),
            self.vlan.clone(),
            mailbox,
            self.clock.clone(),
        )?;
        self.ports.push(port);
        log::info!("icssg: {:?} attached, mac {}", id, mac);
        let idx = self.ports.len() - 1;
        Ok(&mut self.ports[idx])
    }

    pub fn port(&self, id: PortId) -> Option<&Port<T, R, M>> {
        self.ports.iter().find(|p| p.id() == id)
    }

    pub fn port_mut(&mut self, id: PortId) -> Option<&mut Port<T, R, M>> {
        self.ports.iter_mut().find(|p| p.id() == id)
    }

    pub fn ports_mut(&mut self) -> impl Iterator<Item = &mut Port<T, R, M>> {
        self.ports.iter_mut()
    }

    pub fn hwq(&self) -> &Arc<BufferQueue> {
        &self.hwq
    }

    pub fn vlan_table(&self) -> &Arc<VlanTable> {
        &self.vlan
    }

    pub fn is_switch_mode(&self) -> bool {
        self.switch_mode
    }

    pub fn default_vlan(&self) -> u16 {
        self.default_vlan
    }

    pub fn bridge_members(&self) -> u8 {
        self.br_members
    }

    pub fn firmware_status(&self, slice: usize) -> FwStatus {
        FwStatus::from_word(self.shram.read32(self.layout.fw_status_offset(slice)))
    }

    // ───────────────────────────────────────────────────────────────────────
    // Switch mode
    // ───────────────────────────────────────────────────────────────────────

    /// Switch from dual-MAC to switch operation.
    ///
    /// Every port becomes VLAN aware and the host joins the default VLAN.
    /// Ports are bridged individually with [`Self::bridge_join`].
    pub fn enable_switch_mode(&mut self) -> Result<()> {
        if self.switch_mode {
            return Ok(());
        }
        for port in self.ports.iter() {
            port.set_vlan_aware(true)?;
        }
        self.vlan
            .modify(self.default_vlan, PortId::Host.mask(), PortId::Host.mask(), true)?;
        self.vlan.set_pvid(PortId::Host, self.default_vlan)?;
        self.switch_mode = true;
        log::info!("icssg: switch mode, default vlan {}", self.default_vlan);
        Ok(())
    }

    /// Back to dual-MAC: unbridge every port and flush learned entries.
    pub fn disable_switch_mode(&mut self) -> Result<()> {
        if !self.switch_mode {
            return Ok(());
        }
        for id in [PortId::Mii0, PortId::Mii1] {
            if self.br_members & id.mask() != 0 {
                self.bridge_leave(id)?;
            }
        }
        for port in self.ports.iter() {
            port.set_vlan_aware(false)?;
            port.fdb_erase_all()?;
        }
        self.switch_mode = false;
        log::info!("icssg: dual mac mode");
        Ok(())
    }

    /// Put a port on the bridge (untagged member of the default VLAN).
    pub fn bridge_join(&mut self, id: PortId) -> Result<()> {
        if !self.switch_mode {
            return Err(IcssgError::InvalidConfig("bridge needs switch mode"));
        }
        let vid = self.default_vlan;
        let port = self.port_mut(id).ok_or(IcssgError::InvalidPort)?;
        port.vlan_add(vid, true, true)?;
        self.br_members |= id.mask();
        Ok(())
    }

    pub fn bridge_leave(&mut self, id: PortId) -> Result<()> {
        let vid = self.default_vlan;
        let port = self.port_mut(id).ok_or(IcssgError::InvalidPort)?;
        port.vlan_del(vid)?;
        port.fdb_erase_all()?;
        self.br_members &= !id.mask();
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────────────
    // Events
    // ───────────────────────────────────────────────────────────────────────

    /// Deliver pending TX timestamps of every port.
    pub fn process_tx_ts(&mut self, stack: &mut dyn HostStack) -> Result<usize> {
        let mut delivered = 0;
        for port in self.ports.iter_mut() {
            delivered += port.process_tx_ts(&mut *stack)?;
        }
        Ok(delivered)
    }

    pub fn service_timers(&mut self) {
        for port in self.ports.iter_mut() {
            port.service_timers();
        }
    }
}

impl<T: TxDmaRing, R: RxDmaRing> Device<T, R, HwqMailbox> {
    /// Mailbox on the shared hardware queues for `slice`.
    pub fn hwq_mailbox(&self, slice: usize) -> HwqMailbox {
        HwqMailbox::new(self.hwq.clone(), self.shram.clone(), slice)
    }

    /// Attach a port whose commands travel over the hardware queues.
    pub fn add_hwq_port(
        &mut self,
        id: PortId,
        mac: EthernetAddress,
        config: PortConfig,
    ) -> Result<&mut Port<T, R, HwqMailbox>> {
        let mailbox = self.hwq_mailbox(id.slice()?);
        self.add_port(id, mac, config, mailbox)
    }
}
