//! Error taxonomy for the fleet controller (`spec.md` §7).

use thiserror::Error;

/// A named Modbus exception code, as returned by FC 0x80|fc replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModbusExceptionCode {
    pub code: u8,
    pub name: &'static str,
}

/// Look up the symbolic name for a Modbus exception byte (`spec.md` §4.1).
pub fn exception_name(code: u8) -> &'static str {
    match code {
        0x01 => "IllegalFunction",
        0x02 => "IllegalAddress",
        0x03 => "IllegalValue",
        0x04 => "DeviceFault",
        0x05 => "Ack",
        0x06 => "Busy",
        0x07 => "Conflict",
        0x08 => "MemoryError",
        _ => "Unknown",
    }
}

/// Everything that can go wrong talking to, authenticating, or persisting
/// data for a battery on the bus.
#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {cause}")]
    TransportError { cause: String },

    #[error("frame corrupt: CRC mismatch")]
    FrameCorrupt,

    #[error("protocol violation: {detail}")]
    ProtocolViolation { detail: String },

    #[error("modbus exception {code:#04x} ({name})")]
    ModbusException { code: u8, name: &'static str },

    #[error("authentication step {step} failed: {detail}")]
    AuthStepFailed { step: u8, detail: String },

    #[error("operation blocked: batteries not authenticated: {failed_ids:?}")]
    OperationBlocked { failed_ids: Vec<u8> },

    #[error("no transport is open")]
    NotConnected,

    #[error("failed to decode field {field}: {bytes:?}")]
    DecodeError { field: String, bytes: Vec<u8> },

    #[error("end of history")]
    EndOfHistory,

    #[error("persistence error: {0}")]
    Persistence(String),
}

impl Error {
    pub fn modbus_exception(code: u8) -> Self {
        Error::ModbusException { code, name: exception_name(code) }
    }

    pub fn transport(cause: impl Into<String>) -> Self {
        Error::TransportError { cause: cause.into() }
    }

    pub fn protocol(detail: impl Into<String>) -> Self {
        Error::ProtocolViolation { detail: detail.into() }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
