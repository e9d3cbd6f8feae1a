//! Error type shared by every fallible thread operation.

use thiserror::Error;

/// Failure of a thread lifecycle or attribute operation.
///
/// Each variant maps onto the errno a POSIX caller would see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ThreadError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("resources exhausted: {0}")]
    ResourceExhausted(&'static str),
    #[error("no such thread")]
    NoSuchThread,
    #[error("operation would deadlock")]
    Deadlock,
    #[error("resource busy")]
    Busy,
    #[error("caller does not own the lock")]
    NotOwner,
    #[error("not supported: {0}")]
    NotSupported(&'static str),
    #[error("os error {0}")]
    Os(i32),
}

impl ThreadError {
    /// The errno value for this error.
    #[must_use]
    pub const fn errno(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::ResourceExhausted(_) => libc::EAGAIN,
            Self::NoSuchThread => libc::ESRCH,
            Self::Deadlock => libc::EDEADLK,
            Self::Busy => libc::EBUSY,
            Self::NotOwner => libc::EPERM,
            Self::NotSupported(_) => libc::ENOTSUP,
            Self::Os(e) => *e,
        }
    }

    /// Classify a raw errno from a syscall.
    #[must_use]
    pub const fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EINVAL => Self::InvalidArgument("rejected by kernel"),
            libc::EAGAIN => Self::ResourceExhausted("kernel refused"),
            libc::ESRCH => Self::NoSuchThread,
            libc::EDEADLK => Self::Deadlock,
            libc::EBUSY => Self::Busy,
            _ => Self::Os(errno),
        }
    }
}
