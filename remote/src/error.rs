//! Error taxonomy shared by the client stubs, the server and the crew.

use crate::protocol::Verb;

/// Failure of a remote file transfer call.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unexpected reply verb, malformed field or unrepresentable argument.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Short read/write, reset, accept or connect failure.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    /// The operation ran on the peer and failed there; `errno` is the peer's.
    #[error("{verb} failed on remote host: rc={rc}, errno={errno} ({})", describe(.errno))]
    Remote { verb: Verb, rc: i64, errno: i32 },
    /// Buffer or table growth failed; the session must be closed.
    #[error("allocation failed: {0}")]
    Allocation(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// The errno value a C caller of the stub would have observed.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Protocol(_) => libc::EFAULT,
            Error::Transport(err) => errno_of(err),
            Error::Remote { errno, .. } => *errno,
            Error::Allocation(_) => libc::ENOMEM,
        }
    }

    /// True when the session can no longer be used after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Remote { .. })
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Transport(err) => err,
            Error::Remote { errno, .. } => std::io::Error::from_raw_os_error(errno),
            other => std::io::Error::other(other.to_string()),
        }
    }
}

impl From<tokio_util::codec::LinesCodecError> for Error {
    fn from(err: tokio_util::codec::LinesCodecError) -> Self {
        match err {
            tokio_util::codec::LinesCodecError::MaxLineLengthExceeded => {
                Error::protocol("control line exceeds command buffer size")
            }
            tokio_util::codec::LinesCodecError::Io(err) => Error::Transport(err),
        }
    }
}

fn describe(errno: &i32) -> std::io::Error {
    std::io::Error::from_raw_os_error(*errno)
}

/// Map a local I/O error onto the errno echoed in a reply.
pub fn errno_of(err: &std::io::Error) -> i32 {
    if let Some(errno) = err.raw_os_error() {
        return errno;
    }
    match err.kind() {
        std::io::ErrorKind::NotFound => libc::ENOENT,
        std::io::ErrorKind::PermissionDenied => libc::EACCES,
        std::io::ErrorKind::AlreadyExists => libc::EEXIST,
        std::io::ErrorKind::InvalidInput => libc::EINVAL,
        std::io::ErrorKind::WriteZero => libc::ENOSPC,
        std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::ConnectionReset => {
            libc::ECONNRESET
        }
        std::io::ErrorKind::BrokenPipe => libc::EPIPE,
        std::io::ErrorKind::TimedOut => libc::ETIMEDOUT,
        std::io::ErrorKind::AddrInUse => libc::EADDRINUSE,
        std::io::ErrorKind::OutOfMemory => libc::ENOMEM,
        _ => libc::EIO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_classes() {
        assert_eq!(Error::protocol("bad verb").errno(), libc::EFAULT);
        assert_eq!(Error::Allocation("pool".into()).errno(), libc::ENOMEM);
        let remote = Error::Remote {
            verb: Verb::Open,
            rc: -1,
            errno: libc::ENOENT,
        };
        assert_eq!(remote.errno(), libc::ENOENT);
        assert!(!remote.is_fatal());
        let transport = Error::Transport(std::io::Error::from_raw_os_error(libc::ECONNREFUSED));
        assert_eq!(transport.errno(), libc::ECONNREFUSED);
        assert!(transport.is_fatal());
    }

    #[test]
    fn io_error_keeps_remote_errno() {
        let err: std::io::Error = Error::Remote {
            verb: Verb::Mkdir,
            rc: -1,
            errno: libc::EEXIST,
        }
        .into();
        assert_eq!(err.raw_os_error(), Some(libc::EEXIST));
    }

    #[test]
    fn synthetic_io_errors_get_an_errno() {
        let err = std::io::Error::new(std::io::ErrorKind::WriteZero, "short write");
        assert_eq!(errno_of(&err), libc::ENOSPC);
        let err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(errno_of(&err), libc::ECONNRESET);
    }
}
