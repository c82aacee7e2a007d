//! Error types for the Modbus TCP engine
//!
//! The taxonomy separates wire-level failures (fatal for a connection),
//! Modbus exception responses (recoverable, surfaced to the peer), and
//! client-local transaction failures.

use std::time::Duration;
use thiserror::Error;

use crate::pdu::ExceptionCode;

/// Result alias used throughout the crate
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Modbus engine error type
#[derive(Error, Debug)]
pub enum ModbusError {
    /// Frame cannot be decoded; fatal for the connection it arrived on
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Modbus exception response (or local store error mapped to one)
    #[error("Modbus exception: {0}")]
    Exception(ExceptionCode),

    /// No matching response arrived within the allotted time
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Connection failed or was lost; pending transactions are aborted
    #[error("connection error: {0}")]
    Connection(String),

    /// Server failed to bind its listen address
    #[error("bind error: {0}")]
    Bind(String),

    /// Caller-supplied argument rejected before any I/O
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Underlying socket I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ModbusError {
    /// Exception code carried by this error, if it is one
    pub fn exception_code(&self) -> Option<ExceptionCode> {
        match self {
            ModbusError::Exception(code) => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ModbusError::Exception(ExceptionCode::IllegalDataValue);
        assert!(err.to_string().contains("illegal data value"));

        let err = ModbusError::Timeout(Duration::from_millis(250));
        assert!(err.to_string().contains("250ms"));
    }

    #[test]
    fn test_exception_code_accessor() {
        let err = ModbusError::Exception(ExceptionCode::IllegalDataAddress);
        assert_eq!(err.exception_code(), Some(ExceptionCode::IllegalDataAddress));
        assert_eq!(
            ModbusError::Connection("gone".to_string()).exception_code(),
            None
        );
    }
}
