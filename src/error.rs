//! Error taxonomy shared by the socket, entity, client and server layers.
//!
//! Every failure the bus can observe collapses into [`NetError`]. The same
//! value travels three ways:
//!
//! - returned from blocking calls (`read_data`, `connect`, ...)
//! - handed to delegate and hook callbacks (`socket_did_close`, ...)
//! - encoded as an integer `status` inside a connect-response body
//!
//! The integer form is stable: [`NetError::code`] and [`NetError::from_code`]
//! round-trip for every code, and `0` always means success.
//!
//! Rust guideline compliant 2026-02

use std::io;

/// Errors produced by the message bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum NetError {
    /// Operation attempted while the socket or client is in the wrong state.
    #[error("operation not permitted in the current state")]
    Permission,
    /// A bounded wait expired.
    #[error("operation timed out")]
    Timeout,
    /// The request was discarded because its socket closed.
    #[error("request cancelled")]
    Cancelled,
    /// Handshake, header or body failed validation.
    #[error("malformed data from peer")]
    Malformed,
    /// The transport could not create a native handle.
    #[error("internal transport failure")]
    Internal,
    /// The server has no room for another client.
    #[error("server is busy")]
    Busy,
    /// The underlying connection failed.
    #[error("i/o failure: {0:?}")]
    Io(io::ErrorKind),
    /// A non-zero status reported by the peer that has no local meaning.
    #[error("peer reported status {0}")]
    Peer(i32),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, NetError>;

const CODE_PERMISSION: i32 = 1;
const CODE_TIMEOUT: i32 = 2;
const CODE_CANCELLED: i32 = 3;
const CODE_MALFORMED: i32 = 4;
const CODE_INTERNAL: i32 = 5;
const CODE_BUSY: i32 = 6;
const CODE_IO: i32 = 7;

impl NetError {
    /// Integer status carried on the wire. Never zero.
    pub fn code(self) -> i32 {
        match self {
            Self::Permission => CODE_PERMISSION,
            Self::Timeout => CODE_TIMEOUT,
            Self::Cancelled => CODE_CANCELLED,
            Self::Malformed => CODE_MALFORMED,
            Self::Internal => CODE_INTERNAL,
            Self::Busy => CODE_BUSY,
            Self::Io(_) => CODE_IO,
            Self::Peer(code) => code,
        }
    }

    /// Decode a wire status. `0` is success and yields `None`.
    ///
    /// The I/O kind does not travel on the wire, so code 7 decodes as
    /// `Io(ErrorKind::Other)`.
    pub fn from_code(code: i32) -> Option<Self> {
        let err = match code {
            0 => return None,
            CODE_PERMISSION => Self::Permission,
            CODE_TIMEOUT => Self::Timeout,
            CODE_CANCELLED => Self::Cancelled,
            CODE_MALFORMED => Self::Malformed,
            CODE_INTERNAL => Self::Internal,
            CODE_BUSY => Self::Busy,
            CODE_IO => Self::Io(io::ErrorKind::Other),
            other => Self::Peer(other),
        };
        Some(err)
    }

    /// Wire status for a result: `0` on success.
    pub fn status_of(result: Result<()>) -> i32 {
        result.err().map_or(0, Self::code)
    }
}

impl From<io::Error> for NetError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => Self::Timeout,
            io::ErrorKind::PermissionDenied => Self::Permission,
            kind => Self::Io(kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_is_success() {
        assert_eq!(NetError::from_code(0), None);
        assert_eq!(NetError::status_of(Ok(())), 0);
    }

    #[test]
    fn test_codes_round_trip() {
        for code in [1, 2, 3, 4, 5, 6, 7, 42, -9] {
            let err = NetError::from_code(code).unwrap();
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn test_unknown_code_is_peer_status() {
        assert_eq!(NetError::from_code(99), Some(NetError::Peer(99)));
        assert_eq!(NetError::status_of(Err(NetError::Busy)), 6);
    }

    #[test]
    fn test_io_error_conversion() {
        let err: NetError = io::Error::new(io::ErrorKind::ConnectionReset, "reset").into();
        assert_eq!(err, NetError::Io(io::ErrorKind::ConnectionReset));

        let err: NetError = io::Error::new(io::ErrorKind::TimedOut, "slow").into();
        assert_eq!(err, NetError::Timeout);
    }
}
