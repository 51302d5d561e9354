//! Error types for the transport subsystem.

use thiserror::Error;

/// Errors raised while establishing channels or exchanging frames.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The endpoint actively refused the connection.
    #[error("connection refused to {addr}")]
    ConnectionRefused {
        /// Endpoint address.
        addr: String,
    },

    /// Channel establishment exceeded the connect timeout.
    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout {
        /// Endpoint address.
        addr: String,
        /// Configured connect timeout.
        timeout_ms: u64,
    },

    /// The peer closed the connection.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// A frame could not be parsed.
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// Why the frame was rejected.
        reason: String,
    },

    /// Frame magic did not match.
    #[error("invalid magic number: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic {
        /// Expected magic.
        expected: u32,
        /// Received magic.
        got: u32,
    },

    /// Peer speaks another protocol version.
    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch {
        /// Our version.
        expected: u8,
        /// Peer version.
        got: u8,
    },

    /// Payload CRC did not match the header.
    #[error("checksum mismatch: expected 0x{expected:08X}, computed 0x{computed:08X}")]
    ChecksumMismatch {
        /// Checksum carried in the header.
        expected: u32,
        /// Checksum computed over the payload.
        computed: u32,
    },

    /// Payload exceeds the protocol limit.
    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge {
        /// Announced payload size.
        size: u32,
        /// Protocol maximum.
        max_size: u32,
    },

    /// No response arrived within the operation deadline.
    #[error("request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// Multiplexing id of the request.
        request_id: u64,
        /// Deadline that elapsed.
        timeout_ms: u64,
    },

    /// Unknown opcode on the wire.
    #[error("unknown opcode: 0x{0:04X}")]
    UnknownOpcode(u16),

    /// The channel has been closed and must be re-established.
    #[error("not connected")]
    NotConnected,

    /// Payload (de)serialization failed.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Underlying socket error.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl TransportError {
    /// Returns true for failures at the connection level: the endpoint could not be
    /// reached, the channel broke, or a deadline elapsed.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionRefused { .. }
                | TransportError::ConnectionTimeout { .. }
                | TransportError::ConnectionReset
                | TransportError::RequestTimeout { .. }
                | TransportError::NotConnected
                | TransportError::IoError(_)
        )
    }

    /// Returns true when the channel itself is unusable after this failure. A request
    /// deadline leaves the multiplexed channel serving other calls.
    pub fn breaks_channel(&self) -> bool {
        self.is_connection_level() && !matches!(self, TransportError::RequestTimeout { .. })
    }
}

impl Clone for TransportError {
    fn clone(&self) -> Self {
        use TransportError::*;
        match self {
            ConnectionRefused { addr } => ConnectionRefused { addr: addr.clone() },
            ConnectionTimeout { addr, timeout_ms } => ConnectionTimeout {
                addr: addr.clone(),
                timeout_ms: *timeout_ms,
            },
            ConnectionReset => ConnectionReset,
            InvalidFrame { reason } => InvalidFrame {
                reason: reason.clone(),
            },
            InvalidMagic { expected, got } => InvalidMagic {
                expected: *expected,
                got: *got,
            },
            VersionMismatch { expected, got } => VersionMismatch {
                expected: *expected,
                got: *got,
            },
            ChecksumMismatch { expected, computed } => ChecksumMismatch {
                expected: *expected,
                computed: *computed,
            },
            PayloadTooLarge { size, max_size } => PayloadTooLarge {
                size: *size,
                max_size: *max_size,
            },
            RequestTimeout {
                request_id,
                timeout_ms,
            } => RequestTimeout {
                request_id: *request_id,
                timeout_ms: *timeout_ms,
            },
            UnknownOpcode(op) => UnknownOpcode(*op),
            NotConnected => NotConnected,
            SerializationError(msg) => SerializationError(msg.clone()),
            IoError(e) => IoError(std::io::Error::new(e.kind(), e.to_string())),
        }
    }
}

/// Transport result alias.
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_level_classification() {
        assert!(TransportError::ConnectionReset.is_connection_level());
        assert!(TransportError::NotConnected.is_connection_level());
        assert!(TransportError::ConnectionTimeout {
            addr: "10.0.0.1:7400".to_string(),
            timeout_ms: 5000
        }
        .is_connection_level());
        assert!(TransportError::RequestTimeout {
            request_id: 9,
            timeout_ms: 30_000
        }
        .is_connection_level());
        assert!(TransportError::ConnectionRefused {
            addr: "10.0.0.1:7400".to_string()
        }
        .is_connection_level());

        assert!(!TransportError::InvalidFrame {
            reason: "short".to_string()
        }
        .is_connection_level());
        assert!(!TransportError::UnknownOpcode(0xBEEF).is_connection_level());
        assert!(!TransportError::SerializationError("eof".to_string()).is_connection_level());
    }

    #[test]
    fn test_request_timeout_keeps_channel() {
        let timeout = TransportError::RequestTimeout {
            request_id: 3,
            timeout_ms: 100,
        };
        assert!(timeout.is_connection_level());
        assert!(!timeout.breaks_channel());
        assert!(TransportError::ConnectionReset.breaks_channel());
        assert!(TransportError::NotConnected.breaks_channel());
        assert!(!TransportError::UnknownOpcode(1).breaks_channel());
    }

    #[test]
    fn test_clone_keeps_io_kind() {
        let err = TransportError::IoError(std::io::Error::new(
            std::io::ErrorKind::ConnectionAborted,
            "aborted",
        ));
        match err.clone() {
            TransportError::IoError(e) => {
                assert_eq!(e.kind(), std::io::ErrorKind::ConnectionAborted);
                assert_eq!(e.to_string(), "aborted");
            }
            other => panic!("unexpected clone {:?}", other),
        }
    }
}
