//! VLAN table in shared RAM.
//!
//! One two-byte entry per VID, shared by both slices of the device:
//!
//! ```text
//! byte 0  fid_c1   bits 0..2 port membership (host, mii0, mii1)
//!                  bits 3..5 tag mask (egress tagged)
//! byte 1  fid      forwarding domain
//! ```
//!
//! A port is untagged on a VLAN when it is a member with its tag bit clear.

extern crate alloc;

use alloc::sync::Arc;

use spin::Mutex;

use crate::config::{ShramLayout, VLAN_TABLE_ENTRIES};
use crate::error::{IcssgError, Result};
use crate::io::IoRegion;
use crate::port::PortId;

pub const VLAN_N_VID: u16 = VLAN_TABLE_ENTRIES as u16;

/// TPID stamped into the default VLAN words.
pub const ETH_P_8021Q: u32 = 0x8100;

const FID_C1_MEMBER_MASK: u8 = 0x07;
const FID_C1_TAG_SHIFT: u8 = 3;

/// Decoded table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VlanEntry {
    /// Port bitmask of members.
    pub members: u8,
    /// Port bitmask of members that egress untagged.
    pub untagged: u8,
    pub fid: u8,
}

impl VlanEntry {
    fn decode(fid_c1: u8, fid: u8) -> Self {
        let members = fid_c1 & FID_C1_MEMBER_MASK;
        let tagged = (fid_c1 >> FID_C1_TAG_SHIFT) & FID_C1_MEMBER_MASK;
        Self {
            members,
            untagged: members & !tagged,
            fid,
        }
    }
}

struct TableInner {
    shram: Arc<dyn IoRegion>,
    layout: ShramLayout,
}

impl TableInner {
    fn read(&self, vid: u16) -> (u8, u8) {
        let mut raw = [0u8; 2];
        self.shram.read_bytes(self.layout.vlan_entry_offset(vid), &mut raw);
        (raw[0], raw[1])
    }

    fn write(&self, vid: u16, fid_c1: u8, fid: u8) {
        self.shram
            .write_bytes(self.layout.vlan_entry_offset(vid), &[fid_c1, fid]);
    }

    fn pvid_offset(&self, port: PortId) -> u32 {
        match port.slice() {
            Ok(slice) => self.layout.port_pvid + 4 * slice as u32,
            Err(_) => self.layout.host_pvid,
        }
    }
}

/// Device-wide VLAN table, shared by every port.
pub struct VlanTable {
    inner: Mutex<TableInner>,
}

impl VlanTable {
    pub fn new(shram: Arc<dyn IoRegion>, layout: ShramLayout) -> Self {
        Self {
            inner: Mutex::new(TableInner { shram, layout }),
        }
    }

    fn check(vid: u16) -> Result<()> {
        if vid >= VLAN_N_VID {
            return Err(IcssgError::InvalidVlan(vid));
        }
        Ok(())
    }

    /// Reset every entry: no members, forwarding domain = VID.
    pub fn init(&self) {
        let inner = self.inner.lock();
        for vid in (0..VLAN_N_VID).step_by(2) {
            let word = u32::from_le_bytes([0, vid as u8, 0, (vid + 1) as u8]);
            inner
                .shram
                .write32(inner.layout.vlan_entry_offset(vid), word);
        }
    }

    /// Add or remove ports from a VLAN.
    ///
    /// # Arguments
    /// - `port_mask`: Ports to add or remove
    /// - `untag_mask`: Ports to egress untagged (add only); bits for ports
    ///   that end up without membership are dropped
    /// - `add`: Add when true, remove otherwise
    pub fn modify(&self, vid: u16, port_mask: u8, untag_mask: u8, add: bool) -> Result<VlanEntry> {
        Self::check(vid)?;
        let port_mask = port_mask & FID_C1_MEMBER_MASK;
        let inner = self.inner.lock();
        let (mut fid_c1, fid) = inner.read(vid);

        if add {
            let members = (fid_c1 & FID_C1_MEMBER_MASK) | port_mask;
            let untag = untag_mask & members;
            if untag != untag_mask & FID_C1_MEMBER_MASK {
                log::debug!("vlan {}: untag bits {:#x} without membership dropped", vid, untag_mask);
            }
            fid_c1 |= port_mask | (port_mask << FID_C1_TAG_SHIFT);
            fid_c1 &= !(untag << FID_C1_TAG_SHIFT);
        } else {
            fid_c1 &= !(port_mask | (port_mask << FID_C1_TAG_SHIFT));
        }

        inner.write(vid, fid_c1, fid);
        Ok(VlanEntry::decode(fid_c1, fid))
    }

    pub fn entry(&self, vid: u16) -> Result<VlanEntry> {
        Self::check(vid)?;
        let (fid_c1, fid) = self.inner.lock().read(vid);
        Ok(VlanEntry::decode(fid_c1, fid))
    }

    /// Default VLAN of `port`.
    pub fn get_pvid(&self, port: PortId) -> u16 {
        let inner = self.inner.lock();
        let mut raw = [0u8; 4];
        inner.shram.read_bytes(inner.pvid_offset(port), &mut raw);
        (u32::from_be_bytes(raw) & 0x0FFF) as u16
    }

    /// Set the default VLAN of `port`.
    ///
    /// The word is `TPID << 16 | vid`, big endian.
    pub fn set_pvid(&self, port: PortId, vid: u16) -> Result<()> {
        Self::check(vid)?;
        let inner = self.inner.lock();
        let word = (ETH_P_8021Q << 16) | vid as u32;
        inner.shram.write_bytes(inner.pvid_offset(port), &word.to_be_bytes());
        Ok(())
    }
}
