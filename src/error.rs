//! Construction-time errors.
//!
//! Transport errors observed once a comm point is running (`recv`, `send`,
//! `accept`, `connect`, `getsockopt`) never reach this type: they are
//! `std::io::Error`s matched and consumed internally at each call site,
//! because the callback contract is infallible. `NetEventError` exists only
//! for the handful of fallible *construction* APIs a caller can reasonably
//! handle.

use std::fmt;

/// Convenience alias for this crate's fallible constructors.
pub type Result<T> = std::result::Result<T, NetEventError>;

/// Error returned by a comm point / base / timer / signal constructor.
#[derive(Debug)]
pub enum NetEventError {
    /// The OS readiness selector could not be created (`epoll_create1`,
    /// `kqueue`).
    SelectorInit(std::io::Error),
    /// A socket operation needed to stand a comm point up failed (bind,
    /// listen, fcntl, getsockname, ...).
    Io(std::io::Error),
    /// `create_tcp` was asked for zero handlers, or more than this core can
    /// address with its arena-index free-list.
    InvalidHandlerCount(usize),
    /// The platform's ancillary-data buffer needed for a `UDP-ANCIL` comm
    /// point doesn't fit a `IP_PKTINFO`/`IPV6_PKTINFO` control message.
    AncillaryBufferTooSmall { needed: usize, available: usize },
    /// `SignalHandlers::new` was called a second time in one process; the OS
    /// signal table is a process-wide shared resource.
    SignalHandlingAlreadyBound,
    /// `SignalHandlers::create` was called against a `Base` constructed with
    /// `enable_signal_handling = false`.
    SignalHandlingNotEnabled,
    /// Allocation failed on a `create_*` path.
    AllocationFailed(&'static str),
}

impl fmt::Display for NetEventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetEventError::SelectorInit(e) => write!(f, "failed to create OS readiness selector: {e}"),
            NetEventError::Io(e) => write!(f, "{e}"),
            NetEventError::InvalidHandlerCount(n) => {
                write!(f, "invalid TCP handler pool size: {n}")
            }
            NetEventError::AncillaryBufferTooSmall { needed, available } => write!(
                f,
                "ancillary control buffer too small: need {needed} bytes, have {available}"
            ),
            NetEventError::SignalHandlingAlreadyBound => {
                write!(f, "signal handling is already bound to another base in this process")
            }
            NetEventError::SignalHandlingNotEnabled => {
                write!(f, "this base was not created with enable_signal_handling = true")
            }
            NetEventError::AllocationFailed(what) => write!(f, "malloc failed: {what}"),
        }
    }
}

impl std::error::Error for NetEventError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NetEventError::SelectorInit(e) | NetEventError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for NetEventError {
    fn from(e: std::io::Error) -> NetEventError {
        NetEventError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_mentions_the_cause() {
        let err = NetEventError::InvalidHandlerCount(0);
        assert!(err.to_string().contains('0'));
    }

    #[test]
    fn io_error_converts_via_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use");
        let err: NetEventError = io_err.into();
        assert!(matches!(err, NetEventError::Io(_)));
    }
}
