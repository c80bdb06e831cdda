//! Error types for the FPCP bridge.
//!
//! The wire carries a small positive integer in `Resp.error` (0 means
//! success). `Timeout` is synthesised on the scene-processor side when a
//! correlated call misses its deadline and never appears on the wire.

use thiserror::Error;

/// Wire code for a missing image or person id.
pub const ERR_NOT_FOUND: i32 = 1;
/// Wire code for a peer that has been shut down.
pub const ERR_CLOSED: i32 = 2;
/// Local-only code for a correlated call that hit its deadline.
pub const ERR_TIMEOUT: i32 = 3;

/// All failures surfaced by the bridge.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FpcpError {
    /// The requested image or person is absent on the frame processor.
    #[error("not found")]
    NotFound,

    /// The peer has been shut down.
    #[error("already closed")]
    Closed,

    /// A correlated call missed its deadline. Never sent on the wire.
    #[error("timed out waiting for response")]
    Timeout,

    /// A non-zero wire code outside the known taxonomy.
    #[error("unknown wire error code {code}")]
    Wire {
        /// The code as received in `Resp.error`.
        code: i32,
    },

    /// An HTTP or network failure between the peers.
    #[error("transport failure: {reason}")]
    Transport {
        /// Short description of the underlying failure.
        reason: String,
    },

    /// A JSON envelope that could not be encoded or decoded.
    #[error("codec failure: {details}")]
    Codec {
        /// Description of the serde failure.
        details: String,
    },
}

impl FpcpError {
    /// The `Resp.error` code for this failure, if it has one.
    ///
    /// Transport and codec failures are local and never travel.
    pub fn wire_code(&self) -> Option<i32> {
        match self {
            Self::NotFound => Some(ERR_NOT_FOUND),
            Self::Closed => Some(ERR_CLOSED),
            Self::Timeout => Some(ERR_TIMEOUT),
            Self::Wire { code } => Some(*code),
            Self::Transport { .. } | Self::Codec { .. } => None,
        }
    }

    /// Maps a received `Resp.error` code to a failure. Zero is success
    /// and maps to `None`; unknown non-zero codes are preserved.
    pub fn from_wire_code(code: i32) -> Option<Self> {
        match code {
            0 => None,
            ERR_NOT_FOUND => Some(Self::NotFound),
            ERR_CLOSED => Some(Self::Closed),
            ERR_TIMEOUT => Some(Self::Timeout),
            other => Some(Self::Wire { code: other }),
        }
    }

    pub(crate) fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport {
            reason: err.to_string(),
        }
    }

    pub(crate) fn codec(err: impl std::fmt::Display) -> Self {
        Self::Codec {
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_code_mapping() {
        assert_eq!(FpcpError::NotFound.wire_code(), Some(1));
        assert_eq!(FpcpError::Closed.wire_code(), Some(2));
        assert_eq!(FpcpError::Timeout.wire_code(), Some(3));
        assert_eq!(FpcpError::Wire { code: 9 }.wire_code(), Some(9));
        assert_eq!(
            FpcpError::Transport {
                reason: "refused".into()
            }
            .wire_code(),
            None
        );
    }

    #[test]
    fn test_from_wire_code() {
        assert_eq!(FpcpError::from_wire_code(0), None);
        assert_eq!(FpcpError::from_wire_code(1), Some(FpcpError::NotFound));
        assert_eq!(FpcpError::from_wire_code(2), Some(FpcpError::Closed));
        assert_eq!(FpcpError::from_wire_code(3), Some(FpcpError::Timeout));
        assert_eq!(
            FpcpError::from_wire_code(42),
            Some(FpcpError::Wire { code: 42 })
        );
    }

    #[test]
    fn test_roundtrip_known_codes() {
        for code in [1, 2, 3, 17] {
            let err = FpcpError::from_wire_code(code).unwrap();
            assert_eq!(err.wire_code(), Some(code));
        }
    }

    #[test]
    fn test_messages() {
        assert_eq!(FpcpError::NotFound.to_string(), "not found");
        assert_eq!(FpcpError::Closed.to_string(), "already closed");
        assert_eq!(
            FpcpError::Wire { code: 7 }.to_string(),
            "unknown wire error code 7"
        );
    }
}
