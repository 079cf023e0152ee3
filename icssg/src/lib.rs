//! ICSSG PRU Ethernet host side
//!
//! Data plane and firmware control protocol for the dual-port PRU Ethernet
//! subsystem: hardware buffer queues, transmit and receive DMA channels,
//! the firmware command channel, TX timestamp correlation and the shared
//! VLAN table.
//!
//! # Layering
//! ```text
//! device ── port ─┬─ tx / rx ── dma (ring traits) ── prueth-dma-pool
//!                 ├─ cmd ── hwq ── io
//!                 ├─ tstamp
//!                 └─ vlan ── io
//! ```
//! Hardware access goes through the [`io::IoRegion`] and [`dma`] ring
//! traits; time goes through [`time::Clock`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod cmd;
pub mod config;
pub mod device;
pub mod dma;
pub mod error;
pub mod hwq;
pub mod io;
pub mod logger;
pub mod port;
pub mod rx;
pub mod swdata;
pub mod sync;
pub mod time;
pub mod tstamp;
pub mod tx;
pub mod vlan;

#[cfg(test)]
pub(crate) mod testing;

pub use cmd::{CommandChannel, FdbFlags, FwMailbox, HwqMailbox, PortStateCmd};
pub use config::{PortConfig, ShramLayout, TimeoutConfig};
pub use device::Device;
pub use dma::{RxDmaRing, TxDmaRing};
pub use error::{IcssgError, Result};
pub use hwq::BufferQueue;
pub use io::{IoRegion, MmioRegion};
pub use port::{FwStatus, HostStack, LinkState, Port, PortId};
pub use rx::{FastPath, RxChannel, XdpAction, XdpResult};
pub use swdata::{Packet, PagePool, RedirectFrame, RxPacket, SwData};
pub use time::Clock;
pub use tx::{TeardownState, TxChannel};
pub use vlan::VlanTable;
