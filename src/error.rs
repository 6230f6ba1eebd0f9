//! Error taxonomy of the public surface.

use crate::lora::ParamError;
use crate::nvm::NvmError;
use std::fmt;

/// Port layer result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortError {
    Unknown,
    /// Port already open.
    InUse,
    /// Port number outside 1..=250.
    BadNum,
    NotOpened,
    NoTxData,
    NoRxData,
    /// Arena has no room for the message.
    NoMemory,
}

impl fmt::Display for PortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Unknown => "unknown port error",
            Self::InUse => "port already in use",
            Self::BadNum => "bad port number",
            Self::NotOpened => "port not opened",
            Self::NoTxData => "no tx data",
            Self::NoRxData => "no rx data",
            Self::NoMemory => "no buffer memory",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for PortError {}

/// Top-level operation result.
#[derive(Debug, Clone, PartialEq)]
pub enum LoraError {
    /// Generic failure.
    Error,
    Timeout,
    /// Confirmed uplink exhausted its retries without an ack.
    TxNotConfirmed,
    /// Stack is shut down.
    PoweredOff,
    /// No free request slot within the configured wait.
    Busy,
    Port(PortError),
    Storage(NvmError),
    InvalidParam(ParamError),
}

impl fmt::Display for LoraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "operation failed"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::TxNotConfirmed => write!(f, "transmission not confirmed"),
            Self::PoweredOff => write!(f, "lora stack powered off"),
            Self::Busy => write!(f, "request queue busy"),
            Self::Port(e) => write!(f, "port: {}", e),
            Self::Storage(e) => write!(f, "{}", e),
            Self::InvalidParam(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for LoraError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Port(e) => Some(e),
            Self::Storage(e) => Some(e),
            Self::InvalidParam(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PortError> for LoraError {
    fn from(e: PortError) -> Self {
        Self::Port(e)
    }
}

impl From<NvmError> for LoraError {
    fn from(e: NvmError) -> Self {
        Self::Storage(e)
    }
}

impl From<ParamError> for LoraError {
    fn from(e: ParamError) -> Self {
        Self::InvalidParam(e)
    }
}
