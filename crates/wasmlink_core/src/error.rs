//! Error taxonomy shared by the transport side, the worker and the registry.
//!
//! Every typed error collapses onto a single-byte [`ErrorCode`] because the
//! remote client only ever sees errors through the Status and Result
//! characteristics. Writes are acknowledged by the transport regardless of
//! what happened at the application level.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error code carried in Status / Result responses.
///
/// Codes `0x00..=0x07` are the ones deployed clients already decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum ErrorCode {
    #[default]
    None = 0x00,
    Overflow = 0x01,
    InvalidMagic = 0x02,
    LoadFailed = 0x03,
    CompileFailed = 0x04,
    FunctionNotFound = 0x05,
    ExecutionFailed = 0x06,
    InvalidParams = 0x07,
    SequenceMismatch = 0x08,
    ParseFailed = 0x09,
    QueueFull = 0x0A,
    CrcMismatch = 0x0B,
    RegistryFull = 0x0C,
    NotFound = 0x0D,
}

impl ErrorCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decode a wire byte. Unknown values map to `None` so a newer peer
    /// never makes an older reader fail.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x01 => Self::Overflow,
            0x02 => Self::InvalidMagic,
            0x03 => Self::LoadFailed,
            0x04 => Self::CompileFailed,
            0x05 => Self::FunctionNotFound,
            0x06 => Self::ExecutionFailed,
            0x07 => Self::InvalidParams,
            0x08 => Self::SequenceMismatch,
            0x09 => Self::ParseFailed,
            0x0A => Self::QueueFull,
            0x0B => Self::CrcMismatch,
            0x0C => Self::RegistryFull,
            0x0D => Self::NotFound,
            _ => Self::None,
        }
    }

    pub fn is_error(self) -> bool {
        self != Self::None
    }
}

/// Rejections raised by the chunk reassembly state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("transfer is not receiving")]
    InvalidState,
    #[error("sequence mismatch: expected {expected}, got {got}")]
    SequenceMismatch { expected: u16, got: u8 },
    #[error("overflow: {requested} bytes exceeds limit of {limit}")]
    Overflow { requested: u32, limit: u32 },
}

impl TransferError {
    pub fn code(&self) -> ErrorCode {
        match self {
            // Stray chunks surface as bad parameters.
            Self::InvalidState => ErrorCode::InvalidParams,
            Self::SequenceMismatch { .. } => ErrorCode::SequenceMismatch,
            Self::Overflow { .. } => ErrorCode::Overflow,
        }
    }
}

/// The work queue refused an item without blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("work queue is full")]
    Full,
    #[error("worker has shut down")]
    Closed,
}

impl QueueError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Full => ErrorCode::QueueFull,
            Self::Closed => ErrorCode::LoadFailed,
        }
    }
}

/// Failures surfaced by the Module Runtime Adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("payload does not start with the module signature")]
    InvalidMagic,
    #[error("runtime initialisation failed: {0}")]
    Init(String),
    #[error("module parse failed: {0}")]
    Parse(String),
    #[error("module load failed: {0}")]
    Load(String),
    #[error("module compile failed: {0}")]
    Compile(String),
    #[error("no module is loaded")]
    NotLoaded,
    #[error("function not found: {0}")]
    FunctionNotFound(String),
    #[error("invalid call parameters: {0}")]
    InvalidParams(String),
    #[error("execution failed: {0}")]
    Execution(String),
}

impl RuntimeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidMagic => ErrorCode::InvalidMagic,
            Self::Init(_) | Self::Load(_) | Self::NotLoaded => ErrorCode::LoadFailed,
            Self::Parse(_) => ErrorCode::ParseFailed,
            Self::Compile(_) => ErrorCode::CompileFailed,
            Self::FunctionNotFound(_) => ErrorCode::FunctionNotFound,
            Self::InvalidParams(_) => ErrorCode::InvalidParams,
            Self::Execution(_) => ErrorCode::ExecutionFailed,
        }
    }
}

/// Resource registry rejections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("crc mismatch: declared {declared:#06x}, calculated {calculated:#06x}")]
    CrcMismatch { declared: u16, calculated: u16 },
    #[error("registry is full")]
    RegistryFull,
    #[error("resource id {0:#06x} is reserved")]
    InvalidId(u16),
}

impl RegistryError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::CrcMismatch { .. } => ErrorCode::CrcMismatch,
            Self::RegistryFull => ErrorCode::RegistryFull,
            Self::InvalidId(_) => ErrorCode::InvalidParams,
        }
    }
}

/// Frame decoding failures. Raised before any field is read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("frame too short: need {needed} bytes, got {got}")]
    TooShort { needed: usize, got: usize },
    #[error("frame of {len} bytes exceeds negotiated maximum of {max}")]
    TooLong { len: usize, max: usize },
    #[error("unknown command {0:#04x}")]
    UnknownCommand(u8),
    #[error("invalid field: {0}")]
    InvalidField(&'static str),
}

impl WireError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::InvalidParams
    }
}

/// Attribute protocol errors returned to the transport. Only framing
/// problems end up here; application failures are reported through the
/// status characteristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(u8)]
pub enum AttError {
    #[error("invalid attribute handle")]
    InvalidHandle = 0x01,
    #[error("read not permitted")]
    ReadNotPermitted = 0x02,
    #[error("write not permitted")]
    WriteNotPermitted = 0x03,
    #[error("invalid offset")]
    InvalidOffset = 0x07,
    #[error("invalid attribute value length")]
    InvalidAttributeLen = 0x0D,
    #[error("unlikely error")]
    Unlikely = 0x0E,
    #[error("insufficient resources")]
    InsufficientResources = 0x11,
}

impl AttError {
    /// ATT error code as sent in an Error Response.
    pub fn att_code(self) -> u8 {
        self as u8
    }

    pub fn code(&self) -> ErrorCode {
        ErrorCode::InvalidParams
    }
}

impl From<WireError> for AttError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::TooShort { .. } | WireError::TooLong { .. } => Self::InvalidAttributeLen,
            WireError::UnknownCommand(_) | WireError::InvalidField(_) => Self::Unlikely,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_values() {
        assert_eq!(ErrorCode::None.as_u8(), 0x00);
        assert_eq!(ErrorCode::Overflow.as_u8(), 0x01);
        assert_eq!(ErrorCode::InvalidParams.as_u8(), 0x07);
        assert_eq!(ErrorCode::NotFound.as_u8(), 0x0D);

        for raw in 0x00..=0x0D {
            assert_eq!(ErrorCode::from_u8(raw).as_u8(), raw);
        }
        assert_eq!(ErrorCode::from_u8(0xEE), ErrorCode::None);
    }

    #[test]
    fn test_typed_errors_map_to_codes() {
        assert_eq!(TransferError::InvalidState.code(), ErrorCode::InvalidParams);
        assert_eq!(
            TransferError::SequenceMismatch { expected: 1, got: 3 }.code(),
            ErrorCode::SequenceMismatch
        );
        assert_eq!(QueueError::Full.code(), ErrorCode::QueueFull);
        assert_eq!(RuntimeError::NotLoaded.code(), ErrorCode::LoadFailed);
        assert_eq!(
            RuntimeError::Parse("bad section".into()).code(),
            ErrorCode::ParseFailed
        );
        assert_eq!(RegistryError::RegistryFull.code(), ErrorCode::RegistryFull);
        assert_eq!(AttError::InvalidAttributeLen.att_code(), 0x0D);
        assert_eq!(
            AttError::from(WireError::TooShort { needed: 8, got: 2 }),
            AttError::InvalidAttributeLen
        );
    }

    #[test]
    fn test_error_display() {
        let err = TransferError::SequenceMismatch { expected: 2, got: 5 };
        assert_eq!(err.to_string(), "sequence mismatch: expected 2, got 5");

        let err = RegistryError::CrcMismatch {
            declared: 0x1234,
            calculated: 0xABCD,
        };
        assert!(err.to_string().contains("0x1234"));
        assert!(err.to_string().contains("0xabcd"));
    }
}
