//! Transport error types

use thiserror::Error;

/// Result alias used throughout the transport
pub type Result<T> = core::result::Result<T, Error>;

/// Errors raised by the display transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Heap, ring space, record table or a bounded queue is exhausted
    #[error("resource exhausted")]
    ResourceExhausted,

    /// Shared memory holds a value the host should never have produced
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// Context, session or buffer handle is not known
    #[error("invalid handle")]
    InvalidHandle,

    /// Host answered a control call with a failure status
    #[error("host rejected request (rc={0})")]
    HostRejected(i32),

    /// A record is already open on this ring
    #[error("ring busy")]
    Busy,

    /// Ring is not enabled
    #[error("ring disabled")]
    Disabled,

    /// Access outside the shared region
    #[error("out of bounds access at {offset:#x} ({len} bytes)")]
    OutOfBounds {
        /// Region offset of the access
        offset: u32,
        /// Length of the access
        len: u32,
    },

    /// Blocking wait expired
    #[error("timed out")]
    Timeout,

    /// Configuration does not describe a usable layout
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

impl Error {
    /// Whether the caller may retry the operation later
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::ResourceExhausted | Error::Busy | Error::Timeout | Error::HostRejected(_)
        )
    }
}

/// Host status codes
pub mod status {
    /// Success
    pub const VINF_SUCCESS: i32 = 0;
    /// Not implemented by the host
    pub const VERR_NOT_IMPLEMENTED: i32 = -12;
    /// Not supported by the host
    pub const VERR_NOT_SUPPORTED: i32 = -37;
    /// Invalid parameter
    pub const VERR_INVALID_PARAMETER: i32 = -2;

    /// Whether a host status denotes success
    #[inline]
    pub const fn succeeded(rc: i32) -> bool {
        rc >= 0
    }
}
