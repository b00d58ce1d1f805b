//! Error types for the datapath.
//!
//! Every fallible operation in this crate returns [`DatapathError`]. The
//! variants line up with the error surface a QUIC implementation expects to
//! see crossing the datapath boundary: most failures are simply `Io`, but a
//! handful of conditions (OOM, a pending send, a bad caller-supplied
//! parameter) get their own variant because callers branch on them.

use std::io;

/// Errors surfaced by the datapath to its caller.
#[derive(Debug, thiserror::Error)]
pub enum DatapathError {
    /// A caller passed a null/invalid callback, handle, or combination of
    /// parameters that can be checked without touching the kernel.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// A pool or the allocator could not produce the requested object.
    #[error("out of memory")]
    OutOfMemory,

    /// `bind` failed because the address/port was already in use.
    #[error("address in use")]
    AddressInUse,

    /// A socket operation was denied by the OS (e.g. binding a privileged
    /// port without the right entitlement).
    #[error("access denied")]
    AccessDenied,

    /// `ResolveAddress` could not resolve the given host.
    #[error("DNS resolution failed for {0:?}")]
    DnsResolutionError(String),

    /// Registration with the event queue failed, or some other condition
    /// the datapath itself cannot recover from.
    #[error("internal datapath error: {0}")]
    Internal(&'static str),

    /// The send could not complete without blocking. The `SendContext` has
    /// been parked on the socket's pending list and will be resumed when
    /// the socket becomes writable.
    #[error("send pending")]
    Pending,

    /// Anything else, surfaced straight from the OS.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl DatapathError {
    /// True if this error came from a non-blocking operation that would
    /// otherwise have blocked.
    pub fn is_would_block(&self) -> bool {
        matches!(self, DatapathError::Pending)
            || matches!(self, DatapathError::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
    }
}

/// Maps the raw errno from a failed socket call into a [`DatapathError`],
/// collapsing `EAGAIN`/`EWOULDBLOCK` into [`DatapathError::Pending`] since
/// every send-path caller needs that distinction.
pub fn from_send_errno(err: io::Error) -> DatapathError {
    if err.kind() == io::ErrorKind::WouldBlock {
        DatapathError::Pending
    } else {
        match err.raw_os_error() {
            Some(libc::EADDRINUSE) => DatapathError::AddressInUse,
            Some(libc::EACCES) | Some(libc::EPERM) => DatapathError::AccessDenied,
            _ => DatapathError::Io(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, DatapathError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn would_block_maps_to_pending() {
        let err = io::Error::from(io::ErrorKind::WouldBlock);
        assert!(matches!(from_send_errno(err), DatapathError::Pending));
    }

    #[test]
    fn is_would_block_recognizes_both_forms() {
        assert!(DatapathError::Pending.is_would_block());
        assert!(DatapathError::Io(io::Error::from(io::ErrorKind::WouldBlock)).is_would_block());
        assert!(!DatapathError::OutOfMemory.is_would_block());
    }
}
