//! ICSSG error types

use core::fmt;

pub type Result<T> = core::result::Result<T, IcssgError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IcssgError {
    /// Hardware queue number outside `0..HWQ_COUNT`.
    InvalidQueue(u8),
    /// Operation needs a physical (slice-backed) port.
    InvalidPort,
    /// VLAN id outside `0..4096`.
    InvalidVlan(u16),
    /// Configuration rejected by `validate()`.
    InvalidConfig(&'static str),
    /// No free command buffer in the firmware's free queue.
    NoCommandBuffer,
    /// Firmware did not answer within the command timeout.
    Timeout,
    /// Response sequence number does not match the request.
    SequenceMismatch { expected: u8, got: u8 },
    /// Response carried an unknown status byte.
    UnexpectedStatus(u8),
    /// Response header byte is not the management header.
    MalformedResponse(u8),
    /// Response belongs to another command namespace.
    UnexpectedResponse { expected: u8, got: u8 },
    /// Firmware explicitly rejected the command.
    CommandCancelled,
    /// Firmware handshake word reports a crash.
    FirmwareDead(u16),
    /// Port is not running.
    NotRunning,
    /// Port is already running.
    AlreadyRunning,
    /// Link is down.
    LinkDown,
    /// No free descriptor in the channel's pool.
    NoDescriptor,
    /// DMA ring refused the descriptor.
    QueueFull,
    /// Channel is draining or stopped.
    ChannelStopping,
    /// Frame does not fit a descriptor buffer.
    FrameTooLarge,
    /// All transmit timestamp slots are in use.
    TsCapacityExceeded,
    /// Descriptor pool geometry rejected.
    DescPool(prueth_dma_pool::DescPoolError),
}

impl IcssgError {
    /// Whether the host and firmware disagree on the command sequence.
    ///
    /// Recovery is a port or firmware reset, which is left to the operator.
    pub fn is_desync(&self) -> bool {
        matches!(self, Self::SequenceMismatch { .. })
    }
}

impl From<prueth_dma_pool::DescPoolError> for IcssgError {
    fn from(err: prueth_dma_pool::DescPoolError) -> Self {
        Self::DescPool(err)
    }
}

impl fmt::Display for IcssgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidQueue(q) => write!(f, "Invalid hardware queue {}", q),
            Self::InvalidPort => write!(f, "Port has no ICSSG slice"),
            Self::InvalidVlan(vid) => write!(f, "Invalid VLAN id {}", vid),
            Self::InvalidConfig(what) => write!(f, "Invalid configuration: {}", what),
            Self::NoCommandBuffer => write!(f, "No free firmware command buffer"),
            Self::Timeout => write!(f, "Firmware command timed out"),
            Self::SequenceMismatch { expected, got } => {
                write!(f, "Command sequence mismatch: sent {}, got {}", expected, got)
            }
            Self::UnexpectedStatus(s) => write!(f, "Unexpected command status 0x{:02x}", s),
            Self::MalformedResponse(h) => write!(f, "Malformed response header 0x{:02x}", h),
            Self::UnexpectedResponse { expected, got } => {
                write!(f, "Response type 0x{:02x} for command type 0x{:02x}", got, expected)
            }
            Self::CommandCancelled => write!(f, "Firmware cancelled the command"),
            Self::FirmwareDead(code) => write!(f, "Firmware dead (error 0x{:04x})", code),
            Self::NotRunning => write!(f, "Port not running"),
            Self::AlreadyRunning => write!(f, "Port already running"),
            Self::LinkDown => write!(f, "Link is down"),
            Self::NoDescriptor => write!(f, "Descriptor pool exhausted"),
            Self::QueueFull => write!(f, "DMA ring full"),
            Self::ChannelStopping => write!(f, "Channel is being torn down"),
            Self::FrameTooLarge => write!(f, "Frame too large"),
            Self::TsCapacityExceeded => write!(f, "No TX timestamp slot available"),
            Self::DescPool(err) => write!(f, "Descriptor pool: {}", err),
        }
    }
}
