//! The crate-wide error taxonomy.
//!
//! Every fallible entry point in this crate returns `Result<T, Error>`. The
//! FUSE dispatcher is the only place that ever needs the negated-errno
//! representation the wire protocol requires; everywhere else the typed
//! [`Kind`] is what callers match on.

use std::fmt;

/// Coarse classification of everything that can go wrong below the FUSE
/// dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Malformed request, unknown configuration field, or an argument that
    /// violates an invariant.
    Invalid,
    /// The named fsdev isn't present, or isn't in the `Ready` state.
    NoDevice,
    /// Duplicate name on registration.
    Exists,
    /// The operation-descriptor pool is exhausted; the caller may retry.
    NoBuffers,
    /// A non-pool allocation failed.
    OutOfMemory,
    /// The operation isn't implemented by this backend.
    NotSupported,
    /// Transient conflict, e.g. double-unregister or rmdir on a non-empty
    /// directory.
    Busy,
    /// Backend data-path error, propagated from the OS.
    Io,
    /// FUSE version mismatch or malformed header.
    Protocol,
}

impl Kind {
    /// The positive errno this `Kind` maps to on the FUSE wire, where it is
    /// reported negated in `fuse_out_header::error`.
    pub fn to_errno(self) -> i32 {
        match self {
            Kind::Invalid => libc::EINVAL,
            Kind::NoDevice => libc::ENODEV,
            Kind::Exists => libc::EEXIST,
            Kind::NoBuffers => libc::ENOBUFS,
            Kind::OutOfMemory => libc::ENOMEM,
            Kind::NotSupported => libc::ENOSYS,
            Kind::Busy => libc::EBUSY,
            Kind::Io => libc::EIO,
            Kind::Protocol => libc::EPROTO,
        }
    }

    /// Classifies an OS-reported I/O error into the taxonomy above, falling
    /// back to `Io` for anything not specifically recognized.
    pub fn from_raw_os_error(errno: i32) -> Self {
        match errno {
            libc::ENODEV => Kind::NoDevice,
            libc::EEXIST => Kind::Exists,
            libc::ENOBUFS => Kind::NoBuffers,
            libc::ENOMEM => Kind::OutOfMemory,
            libc::ENOSYS | libc::EOPNOTSUPP => Kind::NotSupported,
            libc::EBUSY => Kind::Busy,
            libc::EINVAL => Kind::Invalid,
            _ => Kind::Io,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Kind::Invalid => "invalid argument",
            Kind::NoDevice => "no such device",
            Kind::Exists => "already exists",
            Kind::NoBuffers => "no buffers available",
            Kind::OutOfMemory => "out of memory",
            Kind::NotSupported => "not supported",
            Kind::Busy => "busy",
            Kind::Io => "i/o error",
            Kind::Protocol => "protocol error",
        };
        f.write_str(s)
    }
}

/// The crate's error type: a [`Kind`], an optional human-readable context
/// message, and an optional underlying cause.
#[derive(Debug, thiserror::Error)]
#[error("{kind}{}", context.as_ref().map(|c| format!(": {c}")).unwrap_or_default())]
pub struct Error {
    kind: Kind,
    context: Option<String>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    /// Builds an error carrying just a [`Kind`].
    pub fn new(kind: Kind) -> Self {
        Error {
            kind,
            context: None,
            source: None,
        }
    }

    /// Attaches a human-readable context message.
    #[must_use]
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Attaches an underlying cause.
    #[must_use]
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// The classification of this error.
    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// The negated-errno this error must appear as on the FUSE wire.
    pub fn to_errno(&self) -> i32 {
        -self.kind.to_errno()
    }
}

impl From<Kind> for Error {
    fn from(kind: Kind) -> Self {
        Error::new(kind)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        let kind = e
            .raw_os_error()
            .map(Kind::from_raw_os_error)
            .unwrap_or(Kind::Io);
        Error::new(kind).with_source(e)
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn errno_round_trips_through_kind() {
        assert_eq!(Kind::from_raw_os_error(libc::ENODEV), Kind::NoDevice);
        assert_eq!(Kind::NoDevice.to_errno(), libc::ENODEV);
    }

    #[test]
    fn wire_errno_is_negated() {
        let err = Error::new(Kind::Invalid);
        assert_eq!(err.to_errno(), -libc::EINVAL);
    }

    #[test]
    fn context_is_rendered_in_display() {
        let err = Error::new(Kind::Exists).context("fsdev \"foo\"");
        assert_eq!(err.to_string(), "already exists: fsdev \"foo\"");
    }
}
