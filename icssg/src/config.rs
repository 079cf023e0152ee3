//! Port, timeout and shared-RAM layout configuration.

use crate::error::{IcssgError, Result};

// ═══════════════════════════════════════════════════════════════════════════
// LIMITS
// ═══════════════════════════════════════════════════════════════════════════

/// TX channels per port, priority ordered (highest index = highest priority).
pub const PRUETH_MAX_TX_QUEUES: usize = 4;

/// Receive flows per slice.
pub const ICSSG_MAX_RFLOWS: usize = 8;

/// Descriptors per ring the channel pools are sized for.
pub const PRUETH_MAX_RING_DESCS: usize = 128;

/// Default ring size.
pub const PRUETH_DEFAULT_RING_DESCS: usize = 128;

/// Host descriptor stride (descriptor + EPIB + PS data, rounded).
pub const PRUETH_DESC_SIZE: usize = 128;

// ═══════════════════════════════════════════════════════════════════════════
// PORT CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════

/// Per-port data path configuration.
#[derive(Debug, Clone)]
pub struct PortConfig {
    /// Number of TX channels (1..=4).
    pub tx_ch_num: usize,
    /// Descriptors per TX ring.
    pub tx_descs: usize,
    /// Descriptors in the RX ring.
    pub rx_descs: usize,
    /// Receive flows in use (1..=8).
    pub rx_flows: usize,
    /// Receive pages allocated up front.
    pub page_count: usize,
    /// Bytes per receive page.
    pub page_size: usize,
    /// TX completion coalescing interval, 0 = off.
    pub tx_coalesce_usecs: u32,
    /// RX completion coalescing interval, 0 = off.
    pub rx_coalesce_usecs: u32,
    /// Request hardware TX timestamps for flagged packets.
    pub tx_ts_enabled: bool,
    /// Attach hardware RX timestamps to delivered frames.
    pub rx_ts_enabled: bool,
    /// First flow id assigned to this port by the DMA engine.
    pub rx_flow_id_base: u32,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            tx_ch_num: PRUETH_MAX_TX_QUEUES,
            tx_descs: PRUETH_DEFAULT_RING_DESCS,
            rx_descs: PRUETH_DEFAULT_RING_DESCS,
            rx_flows: 1,
            page_count: PRUETH_DEFAULT_RING_DESCS,
            page_size: 2048,
            tx_coalesce_usecs: 0,
            rx_coalesce_usecs: 0,
            tx_ts_enabled: false,
            rx_ts_enabled: false,
            rx_flow_id_base: 0,
        }
    }
}

impl PortConfig {
    /// Reject geometry the channels cannot be built with.
    pub fn validate(&self) -> Result<()> {
        if self.tx_ch_num == 0 || self.tx_ch_num > PRUETH_MAX_TX_QUEUES {
            return Err(IcssgError::InvalidConfig("tx_ch_num must be 1..=4"));
        }
        if self.tx_descs == 0 || self.tx_descs > PRUETH_MAX_RING_DESCS {
            return Err(IcssgError::InvalidConfig("tx_descs must be 1..=128"));
        }
        if self.rx_descs == 0 || self.rx_descs > PRUETH_MAX_RING_DESCS {
            return Err(IcssgError::InvalidConfig("rx_descs must be 1..=128"));
        }
        if self.rx_flows == 0 || self.rx_flows > ICSSG_MAX_RFLOWS {
            return Err(IcssgError::InvalidConfig("rx_flows must be 1..=8"));
        }
        if self.page_count < self.rx_descs {
            return Err(IcssgError::InvalidConfig("page_count below rx_descs"));
        }
        if self.page_size <= crate::swdata::PRUETH_HEADROOM {
            return Err(IcssgError::InvalidConfig("page_size leaves no room for data"));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TIMEOUT CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════

/// Bounded waits, in microseconds.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutConfig {
    /// Firmware command round-trip.
    pub cmd_timeout_us: u64,
    /// Pause between response queue polls.
    pub cmd_poll_us: u64,
    /// TX drain before teardown is forced.
    pub teardown_us: u64,
    /// Age after which an unresolved TX timestamp request is reaped.
    pub ts_reap_us: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            cmd_timeout_us: 20_000,
            cmd_poll_us: 2,
            teardown_us: 1_000_000,
            ts_reap_us: 1_000_000,
        }
    }
}

impl TimeoutConfig {
    /// Command timeout in milliseconds.
    #[inline]
    pub fn cmd_timeout_ms(&self) -> u64 {
        self.cmd_timeout_us / 1_000
    }

    pub fn validate(&self) -> Result<()> {
        if self.cmd_timeout_us == 0 || self.teardown_us == 0 {
            return Err(IcssgError::InvalidConfig("timeouts must be non-zero"));
        }
        if self.cmd_poll_us > self.cmd_timeout_us {
            return Err(IcssgError::InvalidConfig("poll interval exceeds timeout"));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SHARED RAM LAYOUT
// ═══════════════════════════════════════════════════════════════════════════

/// Byte offsets of the host-visible structures in the shared RAM.
///
/// The firmware image fixes these; the defaults match the layout the
/// firmware build in use publishes.
#[derive(Debug, Clone, Copy)]
pub struct ShramLayout {
    /// VLAN table base, 4096 entries of `{fid_c1, fid}`.
    pub vlan_table: u32,
    /// Default VLAN word of the host port.
    pub host_pvid: u32,
    /// Default VLAN words of MII0/MII1, `port_pvid + 4 * slice`.
    pub port_pvid: u32,
    /// Firmware handshake status word, `fw_status + 4 * slice`.
    pub fw_status: u32,
    /// FDB lookup result bucket, `fdb_bucket + FDB_BUCKET_STRIDE * slice`.
    pub fdb_bucket: u32,
    /// Command buffers, `cmd_buffers + SLICE_STRIDE * slice`.
    pub cmd_buffers: u32,
    /// TX timestamp response buffers, `ts_buffers + SLICE_STRIDE * slice`.
    pub ts_buffers: u32,
    /// Command buffers per slice.
    pub cmd_buffer_count: u32,
    /// Timestamp response buffers per slice.
    pub ts_buffer_count: u32,
    /// Total shared RAM size.
    pub size: u32,
}

pub const VLAN_TABLE_ENTRIES: u32 = 4096;
pub const VLAN_ENTRY_SIZE: u32 = 2;
pub const FDB_BUCKET_STRIDE: u32 = 0x20;
pub const FDB_BUCKET_ENTRIES: u32 = 4;
pub const FDB_BUCKET_ENTRY_SIZE: u32 = 8;
pub const SLICE_STRIDE: u32 = 0x100;
pub const SHRAM_BUFFER_STRIDE: u32 = 0x20;

impl Default for ShramLayout {
    fn default() -> Self {
        Self {
            vlan_table: 0x0,
            host_pvid: 0x2000,
            port_pvid: 0x2004,
            fw_status: 0x2010,
            fdb_bucket: 0x2100,
            cmd_buffers: 0x2200,
            ts_buffers: 0x2400,
            cmd_buffer_count: 4,
            ts_buffer_count: 8,
            size: 0x4000,
        }
    }
}

impl ShramLayout {
    pub fn fw_status_offset(&self, slice: usize) -> u32 {
        self.fw_status + 4 * slice as u32
    }

    pub fn fdb_bucket_offset(&self, slice: usize) -> u32 {
        self.fdb_bucket + FDB_BUCKET_STRIDE * slice as u32
    }

    pub fn cmd_buffer_base(&self, slice: usize) -> u32 {
        self.cmd_buffers + SLICE_STRIDE * slice as u32
    }

    pub fn ts_buffer_base(&self, slice: usize) -> u32 {
        self.ts_buffers + SLICE_STRIDE * slice as u32
    }

    pub fn vlan_entry_offset(&self, vid: u16) -> u32 {
        self.vlan_table + VLAN_ENTRY_SIZE * vid as u32
    }

    /// Check that every structure fits in `size` and none overlap the table.
    pub fn validate(&self) -> Result<()> {
        let table_end = self.vlan_table + VLAN_TABLE_ENTRIES * VLAN_ENTRY_SIZE;
        let words = [self.host_pvid, self.port_pvid, self.fw_status, self.fdb_bucket];
        if words
            .iter()
            .any(|&off| off % 4 != 0 || (off >= self.vlan_table && off < table_end))
        {
            return Err(IcssgError::InvalidConfig("shram word inside VLAN table or misaligned"));
        }
        if self.cmd_buffer_count * SHRAM_BUFFER_STRIDE > SLICE_STRIDE
            || self.ts_buffer_count * SHRAM_BUFFER_STRIDE > SLICE_STRIDE
        {
            return Err(IcssgError::InvalidConfig("too many shram buffers per slice"));
        }
        let last = self.cmd_buffer_base(1).max(self.ts_buffer_base(1)) + SLICE_STRIDE;
        if last > self.size || table_end > self.size {
            return Err(IcssgError::InvalidConfig("shram layout exceeds region"));
        }
        Ok(())
    }
}
