//! Firmware management command channel.
//!
//! Commands are 16-byte messages posted to the firmware through a
//! [`FwMailbox`]; the firmware answers with a 20-byte response carrying the
//! same sequence number and a BUSY/DONE/CANCEL status. One command is in
//! flight per port, serialized by the channel's lock, which also guards the
//! sequence counter and the scratch words the request is composed in.
//!
//! # Wire layout
//! ```text
//! request   u8 param | u8 seqnum | u8 type | u8 header | u32 args[3]
//! response  u32 reserved | u8 status | u8 seqnum | u8 type | u8 header | u32 args[3]
//! ```
//! `param` holds the command code; FDB commands add the slice in bits 4..7.

extern crate alloc;

use alloc::sync::Arc;

use bitflags::bitflags;
use smoltcp::wire::EthernetAddress;
use spin::Mutex;

use crate::config::TimeoutConfig;
use crate::error::{IcssgError, Result};
use crate::hwq::{BufferQueue, SliceQueues};
use crate::io::IoRegion;
use crate::sync::Completion;
use crate::time::{Clock, Deadline};

// ═══════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════

pub const ICSSG_FW_MGMT_CMD_HEADER: u8 = 0x81;
pub const ICSSG_FW_MGMT_FDB_CMD_TYPE: u8 = 0x03;
pub const ICSSG_FW_MGMT_CMD_TYPE: u8 = 0x04;

/// Handshake status bits as they appear in the response status byte.
pub const ICSS_HS_CMD_DONE: u8 = (0x8000_0000u32 >> 24) as u8;
pub const ICSS_HS_CMD_BUSY: u8 = (0x4000_0000u32 >> 24) as u8;
pub const ICSS_HS_CMD_CANCEL: u8 = (0x1000_0000u32 >> 24) as u8;

pub const MGMT_CMD_SIZE: usize = 16;
pub const MGMT_RSP_SIZE: usize = 20;

/// Command namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CmdType {
    Fdb = ICSSG_FW_MGMT_FDB_CMD_TYPE,
    Mgmt = ICSSG_FW_MGMT_CMD_TYPE,
}

/// Firmware command. Codes are only unique within their [`CmdType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FwCommand {
    AddFdb,
    DelFdb,
    EraseFdb,
    GetFdbSlot,
    SetRun,
    EnableVlan,
    DisableVlan,
    AddFilter,
    AddMac,
    Scratchpad,
    RxTxConfig,
}

impl FwCommand {
    pub fn cmd_type(self) -> CmdType {
        match self {
            Self::AddFdb | Self::DelFdb | Self::EraseFdb | Self::GetFdbSlot => CmdType::Fdb,
            _ => CmdType::Mgmt,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::AddFdb => 0x1,
            Self::DelFdb => 0x2,
            Self::EraseFdb => 0x3,
            Self::SetRun => 0x4,
            Self::GetFdbSlot => 0x5,
            Self::EnableVlan => 0x5,
            Self::DisableVlan => 0x6,
            Self::AddFilter => 0x7,
            Self::AddMac => 0x8,
            Self::RxTxConfig => 0x10,
            Self::Scratchpad => 0x20,
        }
    }

    /// Look a command up by its namespace and code.
    pub fn decode(cmd_type: u8, code: u8) -> Option<Self> {
        let cmd = match (cmd_type, code) {
            (ICSSG_FW_MGMT_FDB_CMD_TYPE, 0x1) => Self::AddFdb,
            (ICSSG_FW_MGMT_FDB_CMD_TYPE, 0x2) => Self::DelFdb,
            (ICSSG_FW_MGMT_FDB_CMD_TYPE, 0x3) => Self::EraseFdb,
            (ICSSG_FW_MGMT_FDB_CMD_TYPE, 0x5) => Self::GetFdbSlot,
            (ICSSG_FW_MGMT_CMD_TYPE, 0x4) => Self::SetRun,
            (ICSSG_FW_MGMT_CMD_TYPE, 0x5) => Self::EnableVlan,
            (ICSSG_FW_MGMT_CMD_TYPE, 0x6) => Self::DisableVlan,
            (ICSSG_FW_MGMT_CMD_TYPE, 0x7) => Self::AddFilter,
            (ICSSG_FW_MGMT_CMD_TYPE, 0x8) => Self::AddMac,
            (ICSSG_FW_MGMT_CMD_TYPE, 0x10) => Self::RxTxConfig,
            (ICSSG_FW_MGMT_CMD_TYPE, 0x20) => Self::Scratchpad,
            _ => return None,
        };
        Some(cmd)
    }
}

/// Port state requests carried by SET_RUN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PortStateCmd {
    Disable = 0,
    Block,
    Forward,
    ForwardWoLearning,
    AcceptAll,
    AcceptTagged,
    AcceptUntaggedNPrio,
    TasTrigger,
    TasEnable,
    TasReset,
    TasDisable,
    UcFloodEnable,
    UcFloodDisable,
    McFloodEnable,
    McFloodDisable,
    PremptTxEnable,
    PremptTxDisable,
    VlanAwareEnable,
    VlanAwareDisable,
}

bitflags! {
    /// FDB entry control byte (`fid_c2`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FdbFlags: u8 {
        const P0_MEMBERSHIP = 1 << 0;
        const P1_MEMBERSHIP = 1 << 1;
        const P2_MEMBERSHIP = 1 << 2;
        const AGEABLE = 1 << 3;
        const BLOCK = 1 << 4;
        const SECURE = 1 << 5;
        const TOUCHED = 1 << 6;
        const VALID = 1 << 7;
    }
}

/// Scope of an FDB erase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FdbEraseScope {
    All = 0,
    Multicast = 1,
}

// ═══════════════════════════════════════════════════════════════════════════
// MESSAGES
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MgmtCmd {
    pub param: u8,
    pub seqnum: u8,
    pub cmd_type: u8,
    pub header: u8,
    pub args: [u32; 3],
}

impl MgmtCmd {
    pub fn new(cmd: FwCommand, seqnum: u8, slice: usize, args: [u32; 3]) -> Self {
        let mut param = cmd.code();
        if cmd.cmd_type() == CmdType::Fdb {
            param |= (slice as u8) << 4;
        }
        Self {
            param,
            seqnum,
            cmd_type: cmd.cmd_type() as u8,
            header: ICSSG_FW_MGMT_CMD_HEADER,
            args,
        }
    }

    pub fn to_words(&self) -> [u32; 4] {
        [
            u32::from_le_bytes([self.param, self.seqnum, self.cmd_type, self.header]),
            self.args[0],
            self.args[1],
            self.args[2],
        ]
    }

    pub fn from_words(words: &[u32; 4]) -> Self {
        let [param, seqnum, cmd_type, header] = words[0].to_le_bytes();
        Self {
            param,
            seqnum,
            cmd_type,
            header,
            args: [words[1], words[2], words[3]],
        }
    }

    /// Command code without the slice bits.
    pub fn code(&self) -> u8 {
        if self.cmd_type == ICSSG_FW_MGMT_FDB_CMD_TYPE {
            self.param & 0x0F
        } else {
            self.param
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MgmtRsp {
    pub status: u8,
    pub seqnum: u8,
    pub cmd_type: u8,
    pub header: u8,
    pub args: [u32; 3],
}

impl MgmtRsp {
    pub fn from_bytes(raw: &[u8; MGMT_RSP_SIZE]) -> Self {
        let word = |i: usize| u32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        Self {
            status: raw[4],
            seqnum: raw[5],
            cmd_type: raw[6],
            header: raw[7],
            args: [word(8), word(12), word(16)],
        }
    }

    pub fn to_bytes(&self) -> [u8; MGMT_RSP_SIZE] {
        let mut raw = [0u8; MGMT_RSP_SIZE];
        raw[4] = self.status;
        raw[5] = self.seqnum;
        raw[6] = self.cmd_type;
        raw[7] = self.header;
        for (i, arg) in self.args.iter().enumerate() {
            raw[8 + 4 * i..12 + 4 * i].copy_from_slice(&arg.to_le_bytes());
        }
        raw
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdStatus {
    Busy,
    Done,
    Cancel,
}

impl CmdStatus {
    pub fn from_byte(status: u8) -> Result<Self> {
        match status {
            ICSS_HS_CMD_DONE => Ok(Self::Done),
            ICSS_HS_CMD_BUSY => Ok(Self::Busy),
            ICSS_HS_CMD_CANCEL => Ok(Self::Cancel),
            other => Err(IcssgError::UnexpectedStatus(other)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TRANSPORT
// ═══════════════════════════════════════════════════════════════════════════

/// Moves raw command words to the firmware and responses back.
pub trait FwMailbox: Send {
    /// Hand a composed request to the firmware.
    fn post(&mut self, words: &[u32; 4]) -> Result<()>;

    /// Take the next response, if one is waiting.
    fn fetch(&mut self) -> Result<Option<MgmtRsp>>;
}

/// Mailbox over the hardware queues and shared RAM buffers.
///
/// A free buffer is popped from the command pool, the request is written at
/// `buffer + 4`, and the buffer is pushed to the command queue. Responses
/// arrive as buffers on the response queue and are returned to the pool
/// once read.
pub struct HwqMailbox {
    hwq: Arc<BufferQueue>,
    shram: Arc<dyn IoRegion>,
    queues: SliceQueues,
}

impl HwqMailbox {
    pub fn new(hwq: Arc<BufferQueue>, shram: Arc<dyn IoRegion>, slice: usize) -> Self {
        Self {
            hwq,
            shram,
            queues: SliceQueues::for_slice(slice),
        }
    }
}

impl FwMailbox for HwqMailbox {
    fn post(&mut self, words: &[u32; 4]) -> Result<()> {
        let addr = self
            .hwq
            .pop(self.queues.cmd_pop)?
            .ok_or(IcssgError::NoCommandBuffer)?;
        for (i, word) in words.iter().enumerate() {
            self.shram.write32(addr + 4 + 4 * i as u32, *word);
        }
        self.hwq.push(self.queues.cmd_push, addr)
    }

    fn fetch(&mut self) -> Result<Option<MgmtRsp>> {
        let Some(addr) = self.hwq.pop(self.queues.rsp_pop)? else {
            return Ok(None);
        };
        let mut raw = [0u8; MGMT_RSP_SIZE];
        self.shram.read_bytes(addr, &mut raw);
        self.hwq.push(self.queues.rsp_push, addr)?;
        Ok(Some(MgmtRsp::from_bytes(&raw)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// COMMAND CHANNEL
// ═══════════════════════════════════════════════════════════════════════════

struct CmdState<M: FwMailbox> {
    mailbox: M,
    seq: u8,
    scratch: [u32; 4],
}

/// Per-port synchronous command channel.
pub struct CommandChannel<M: FwMailbox> {
    state: Mutex<CmdState<M>>,
    response: Mutex<Option<MgmtRsp>>,
    complete: Completion,
    slice: usize,
    clock: Arc<dyn Clock>,
    timeouts: TimeoutConfig,
}

/// Pack a MAC, forwarding domain and control byte into two argument words.
pub fn mac_args(mac: &EthernetAddress, fid: u8, fid_c2: u8) -> [u32; 3] {
    let m = mac.as_bytes();
    [
        u32::from_le_bytes([m[0], m[1], m[2], m[3]]),
        u32::from_le_bytes([m[4], m[5], fid, fid_c2]),
        0,
    ]
}

/// True if `got` belongs to a request issued before `current`.
fn is_stale(current: u8, got: u8) -> bool {
    let age = current.wrapping_sub(got);
    age != 0 && age < 0x80
}

impl<M: FwMailbox> CommandChannel<M> {
    pub fn new(mailbox: M, slice: usize, clock: Arc<dyn Clock>, timeouts: TimeoutConfig) -> Self {
        Self {
            state: Mutex::new(CmdState {
                mailbox,
                seq: 0,
                scratch: [0; 4],
            }),
            response: Mutex::new(None),
            complete: Completion::new(),
            slice,
            clock,
            timeouts,
        }
    }

    pub fn slice(&self) -> usize {
        self.slice
    }

    /// Last sequence number used.
    pub fn seq(&self) -> u8 {
        self.state.lock().seq
    }

    /// Deliver a response from interrupt context.
    pub fn on_response(&self, rsp: MgmtRsp) {
        *self.response.lock() = Some(rsp);
        self.complete.complete();
    }

    /// Send `cmd` and wait for the firmware's final answer.
    ///
    /// # Returns
    /// The DONE response, or
    /// - `SequenceMismatch` if the answer belongs to another request
    /// - `CommandCancelled` if the firmware rejected it
    /// - `Timeout` if no final answer arrived in time
    ///
    /// # Contract
    /// Blocks the caller. The channel lock is held for the whole round trip
    /// and released on every exit path. Responses to earlier requests (ones
    /// that timed out) are discarded, before posting and while waiting.
    pub fn transact(&self, cmd: FwCommand, args: [u32; 3]) -> Result<MgmtRsp> {
        let mut state = self.state.lock();
        state.seq = state.seq.wrapping_add(1);
        let seq = state.seq;
        let msg = MgmtCmd::new(cmd, seq, self.slice, args);
        state.scratch = msg.to_words();

        while let Some(stale) = state.mailbox.fetch()? {
            log::warn!(
                "cmd: dropping late response seq {} status {:#04x}",
                stale.seqnum,
                stale.status
            );
        }
        *self.response.lock() = None;
        self.complete.reinit();
        let scratch = state.scratch;
        state.mailbox.post(&scratch)?;

        let clock = self.clock.as_ref();
        let deadline = Deadline::after(clock, self.timeouts.cmd_timeout_us);
        loop {
            let answered = self
                .complete
                .wait_until(clock, deadline, self.timeouts.cmd_poll_us, || {
                    match state.mailbox.fetch() {
                        Ok(Some(rsp)) => self.on_response(rsp),
                        Ok(None) => {}
                        Err(err) => log::warn!("cmd: response fetch failed: {}", err),
                    }
                });
            if !answered {
                log::warn!("cmd: {:?} seq {} timed out", cmd, seq);
                return Err(IcssgError::Timeout);
            }

            self.complete.reinit();
            let Some(rsp) = self.response.lock().take() else {
                continue;
            };

            if rsp.seqnum != seq && is_stale(seq, rsp.seqnum) {
                log::warn!("cmd: {:?} seq {}: skipping late response seq {}", cmd, seq, rsp.seqnum);
                continue;
            }
            if rsp.seqnum != seq {
                log::error!("cmd: {:?} sent seq {}, response has seq {}", cmd, seq, rsp.seqnum);
                return Err(IcssgError::SequenceMismatch {
                    expected: seq,
                    got: rsp.seqnum,
                });
            }
            if rsp.header != ICSSG_FW_MGMT_CMD_HEADER {
                log::error!("cmd: {:?} seq {}: bad header {:#04x}", cmd, seq, rsp.header);
                return Err(IcssgError::MalformedResponse(rsp.header));
            }
            if rsp.cmd_type != msg.cmd_type {
                return Err(IcssgError::UnexpectedResponse {
                    expected: msg.cmd_type,
                    got: rsp.cmd_type,
                });
            }
            match CmdStatus::from_byte(rsp.status) {
                Ok(CmdStatus::Busy) => continue,
                Ok(CmdStatus::Done) => return Ok(rsp),
                Ok(CmdStatus::Cancel) => {
                    log::debug!("cmd: {:?} seq {} cancelled", cmd, seq);
                    return Err(IcssgError::CommandCancelled);
                }
                Err(err) => {
                    log::error!("cmd: {:?} seq {}: {}", cmd, seq, err);
                    return Err(err);
                }
            }
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Commands
    // ───────────────────────────────────────────────────────────────────────

    /// Add or delete an FDB entry.
    pub fn fdb_add_del(&self, mac: &EthernetAddress, vid: u16, flags: FdbFlags, add: bool) -> Result<()> {
        let cmd = if add { FwCommand::AddFdb } else { FwCommand::DelFdb };
        self.transact(cmd, mac_args(mac, vid as u8, flags.bits()))
            .map(|_| ())
    }

    pub fn fdb_erase(&self, scope: FdbEraseScope) -> Result<()> {
        self.transact(FwCommand::EraseFdb, [scope as u32, 0, 0])
            .map(|_| ())
    }

    /// Ask the firmware which hash bucket holds `mac`/`vid`.
    pub fn get_fdb_slot(&self, mac: &EthernetAddress, vid: u16) -> Result<u32> {
        self.transact(FwCommand::GetFdbSlot, mac_args(mac, vid as u8, 0))
            .map(|rsp| rsp.args[0])
    }

    pub fn set_port_state(&self, state: PortStateCmd) -> Result<()> {
        self.transact(FwCommand::SetRun, [state as u32, 0, 0])
            .map(|_| ())
    }

    pub fn set_vlan_aware(&self, enable: bool) -> Result<()> {
        let cmd = if enable {
            FwCommand::EnableVlan
        } else {
            FwCommand::DisableVlan
        };
        self.transact(cmd, [0; 3]).map(|_| ())
    }

    /// Program a VLAN membership change in the firmware.
    ///
    /// ENABLE/DISABLE_VLAN with a non-zero argument edits one VID:
    /// `args[0] = vid | port_mask << 16 | untag_mask << 24`.
    pub fn vlan_update(&self, vid: u16, port_mask: u8, untag_mask: u8, add: bool) -> Result<()> {
        let cmd = if add {
            FwCommand::EnableVlan
        } else {
            FwCommand::DisableVlan
        };
        let arg = vid as u32 | (port_mask as u32) << 16 | (untag_mask as u32) << 24;
        self.transact(cmd, [arg, 0, 0]).map(|_| ())
    }

    pub fn add_filter(&self, mac: &EthernetAddress) -> Result<()> {
        self.transact(FwCommand::AddFilter, mac_args(mac, 0, 0))
            .map(|_| ())
    }

    pub fn add_mac(&self, mac: &EthernetAddress) -> Result<()> {
        self.transact(FwCommand::AddMac, mac_args(mac, 0, 0))
            .map(|_| ())
    }

    pub fn write_scratchpad(&self, offset: u32, value: u32) -> Result<()> {
        self.transact(FwCommand::Scratchpad, [offset, value, 0])
            .map(|_| ())
    }

    pub fn configure_rx_tx(&self, args: [u32; 3]) -> Result<()> {
        self.transact(FwCommand::RxTxConfig, args).map(|_| ())
    }
}
