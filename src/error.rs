//! # Error Types
//!
//! This module defines the error taxonomy used throughout the printlink SDK.
//!
//! ## Propagation
//!
//! | Class | Variants | Handled by |
//! |-------|----------|------------|
//! | Transport | `OpenFailed`, `PartialWrite`, `ConnectionLost` | reconnect/backoff in the connection manager |
//! | Protocol | `ProtocolDecode` | logged, offending frame dropped |
//! | Request | `RequestTimeout`, `PartialTransfer` | delivered to the issuing callback |
//! | Caller | `InvalidParameter`, `UnsupportedTransport`, `Config` | returned directly |
//!
//! `SdkError` is `Clone` because a single link failure is delivered to every
//! pending context at once.

use thiserror::Error;

use crate::transport::TransportKind;

/// Main error type for printlink operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SdkError {
    /// No strategy is registered for the requested transport
    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(TransportKind),

    /// The link went away while the request was in flight
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The OS transport handle could not be acquired
    #[error("Open failed: {0}")]
    OpenFailed(String),

    /// The transport accepted fewer bytes than requested
    #[error("Partial write: {written} of {expected} bytes")]
    PartialWrite { written: usize, expected: usize },

    /// Nothing arrived before the receive timeout; the link is still usable
    #[error("Receive timed out")]
    ReceiveTimeout,

    /// Unknown opcode or malformed frame
    #[error("Protocol decode error: {0}")]
    ProtocolDecode(String),

    /// No response before the request deadline
    #[error("Request timed out after {0} ms")]
    RequestTimeout(u64),

    /// A flow-controlled transfer stopped before every chunk was confirmed
    #[error("Partial transfer: {chunks_confirmed} of {chunks_total} chunks confirmed ({reason})")]
    PartialTransfer {
        chunks_confirmed: usize,
        chunks_total: usize,
        reason: String,
    },

    /// Invalid command, parameter or bitmap shape
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Configuration file could not be read or parsed
    #[error("Config error: {0}")]
    Config(String),

    /// I/O error that does not map onto a transport variant
    #[error("I/O error: {0}")]
    Io(String),
}

impl SdkError {
    /// True for the two timeout flavours a caller may choose to retry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ReceiveTimeout | Self::RequestTimeout(_))
    }

    /// True for errors that mean the link itself is unusable.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost(_) | Self::OpenFailed(_) | Self::PartialWrite { .. }
        )
    }
}

impl From<std::io::Error> for SdkError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => Self::ReceiveTimeout,
            ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof => Self::ConnectionLost(e.to_string()),
            _ => Self::Io(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for SdkError {
    fn from(e: serde_json::Error) -> Self {
        Self::Config(e.to_string())
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, SdkError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_io_timeout_maps_to_receive_timeout() {
        let err: SdkError = io::Error::new(io::ErrorKind::TimedOut, "slow").into();
        assert_eq!(err, SdkError::ReceiveTimeout);
        assert!(err.is_timeout());
        assert!(!err.is_transport());
    }

    #[test]
    fn test_io_broken_pipe_maps_to_connection_lost() {
        let err: SdkError = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(err, SdkError::ConnectionLost(_)));
        assert!(err.is_transport());
    }

    #[test]
    fn test_partial_transfer_message() {
        let err = SdkError::PartialTransfer {
            chunks_confirmed: 3,
            chunks_total: 8,
            reason: "chunk 3 timed out".into(),
        };
        assert_eq!(
            err.to_string(),
            "Partial transfer: 3 of 8 chunks confirmed (chunk 3 timed out)"
        );
    }
}
