//! Error types for fan wall control

use std::time::Duration;

use thiserror::Error;

/// Modbus exception code carried in an exception response (function code
/// with the 0x80 bit set, exception code in the third byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    /// 0x01: the board does not support the requested function
    IllegalFunction,
    /// 0x02: register address outside the board's register map
    IllegalAddress,
    /// 0x03: register value rejected by the board
    IllegalValue,
    /// 0x04: unrecoverable fault while executing the request
    SlaveFailure,
    /// Any other code the board reports
    Unknown(u8),
}

impl ExceptionCode {
    /// Map a raw exception code byte to its protocol meaning
    pub fn from_byte(code: u8) -> Self {
        match code {
            0x01 => Self::IllegalFunction,
            0x02 => Self::IllegalAddress,
            0x03 => Self::IllegalValue,
            0x04 => Self::SlaveFailure,
            other => Self::Unknown(other),
        }
    }

    /// Raw protocol code byte
    pub fn code(&self) -> u8 {
        match self {
            Self::IllegalFunction => 0x01,
            Self::IllegalAddress => 0x02,
            Self::IllegalValue => 0x03,
            Self::SlaveFailure => 0x04,
            Self::Unknown(code) => *code,
        }
    }
}

impl std::fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IllegalFunction => write!(f, "illegal function"),
            Self::IllegalAddress => write!(f, "illegal data address"),
            Self::IllegalValue => write!(f, "illegal data value"),
            Self::SlaveFailure => write!(f, "slave device failure"),
            Self::Unknown(code) => write!(f, "unknown exception (code 0x{code:02X})"),
        }
    }
}

/// Failure reasons for a single command round trip.
///
/// Every expected failure mode is a variant here so callers can match on
/// the reason instead of parsing message strings. Connection-kind and
/// protocol-kind failures are surfaced as data, never as panics.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CommandError {
    /// Command issued while the controller has no open connection
    #[error("not connected")]
    NotConnected,

    /// No complete response arrived within the configured timeout
    #[error("receive timed out after {0:?}")]
    ReceiveTimeout(Duration),

    /// Peer reset or closed the connection mid-operation
    #[error("connection reset by peer")]
    ConnectionReset,

    /// Other OS/network error during send or receive
    #[error("network error: {0}")]
    Network(String),

    /// Response shorter than the minimum parseable frame
    #[error("response frame too short ({len} bytes)")]
    FrameTooShort { len: usize },

    /// Trailing CRC does not match the CRC computed over the payload
    #[error("CRC mismatch (expected 0x{expected:04X}, received 0x{received:04X})")]
    CrcMismatch { expected: u16, received: u16 },

    /// Board answered with a Modbus exception response
    #[error("device exception: {0}")]
    Exception(ExceptionCode),
}

/// Failure reasons for establishing a connection.
///
/// `BoardController::connect` converts these to a `false` return plus a
/// `connection_errors` increment; the variant is kept for event records.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    /// Board actively refused the connection (wrong endpoint or offline)
    #[error("connection refused")]
    Refused,

    /// TCP connect did not complete within the configured timeout
    #[error("connect timed out")]
    TimedOut,

    /// Other OS/network error
    #[error("network error: {0}")]
    Network(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_code_mapping() {
        assert_eq!(ExceptionCode::from_byte(0x01), ExceptionCode::IllegalFunction);
        assert_eq!(ExceptionCode::from_byte(0x02), ExceptionCode::IllegalAddress);
        assert_eq!(ExceptionCode::from_byte(0x03), ExceptionCode::IllegalValue);
        assert_eq!(ExceptionCode::from_byte(0x04), ExceptionCode::SlaveFailure);
        assert_eq!(ExceptionCode::from_byte(0x2A), ExceptionCode::Unknown(0x2A));
    }

    #[test]
    fn test_exception_code_round_trip() {
        for code in [0x01u8, 0x02, 0x03, 0x04, 0x7F] {
            assert_eq!(ExceptionCode::from_byte(code).code(), code);
        }
    }

    #[test]
    fn test_command_error_messages_are_stable() {
        let err = CommandError::CrcMismatch {
            expected: 0x2188,
            received: 0x0000,
        };
        assert_eq!(
            err.to_string(),
            "CRC mismatch (expected 0x2188, received 0x0000)"
        );
        assert_eq!(CommandError::NotConnected.to_string(), "not connected");
    }
}
