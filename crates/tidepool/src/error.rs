// Copyright (c) Tidepool Project Contributors.
// Licensed under the MIT License.

use std::path::PathBuf;

use thiserror::Error;

/// Any error that may arise from the pool-bound resource adapters.
///
/// Out-of-memory is deliberately absent: heap exhaustion inside the allocator is not a
/// recoverable condition and terminates the process instead of surfacing here.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The path handed to an adapter contains an interior NUL byte and cannot be passed to the
    /// operating system.
    #[error("path contains an interior NUL byte: {0:?}")]
    InvalidPath(PathBuf),

    /// The stream mode string contains an interior NUL byte and cannot be passed to the
    /// operating system.
    #[error("invalid stream mode: {0:?}")]
    InvalidMode(String),

    /// We are forwarding an error received from the operating system.
    #[error(transparent)]
    StdIo(#[from] std::io::Error),
}

/// A specialized `Result` for pool-bound resource operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents an adapter error as a standard I/O error, for interoperating with libraries that
/// expect one.
impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::StdIo(error) => error,
            _ => Self::other(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::ErrorKind;

    use static_assertions::assert_impl_all;

    use super::*;

    #[test]
    fn thread_safe_type() {
        assert_impl_all!(Error: Send, Sync);
    }

    #[test]
    fn inspect_stdio_error() {
        let e = Error::StdIo(std::io::Error::new(ErrorKind::NotFound, "no such file"));

        match e {
            Error::StdIo(e) => {
                assert_eq!(e.kind(), ErrorKind::NotFound);
                assert_eq!(e.to_string(), "no such file");
            }
            _ => panic!("unexpected error variant"),
        }
    }

    #[test]
    fn into_stdio_error() {
        let e = Error::InvalidMode("w\0b".to_string());

        let io_error: std::io::Error = e.into();
        assert_eq!(io_error.kind(), ErrorKind::Other);

        let e = Error::StdIo(std::io::Error::new(ErrorKind::PermissionDenied, "nope"));

        let io_error: std::io::Error = e.into();
        assert_eq!(io_error.kind(), ErrorKind::PermissionDenied);
    }
}
