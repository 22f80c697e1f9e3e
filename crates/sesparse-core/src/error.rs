//! Error types for the sesparse core library.

use std::path::PathBuf;

/// Boxed error returned by byte-range sources.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The main error type for sesparse operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error on a local file.
    #[error("I/O error at '{}': {source}", path.display())]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },

    /// The on-disk data does not decode to a valid SESparse image.
    ///
    /// Always fatal for the layer that produced it.
    #[error("Format error: {message}")]
    Format { message: String },

    /// An operation was called in a state that does not allow it.
    #[error("Precondition violated: {message}")]
    Precondition { message: String },

    /// A byte-range fetch failed. The source error is kept untouched.
    #[error("Transport error: {source}")]
    Transport {
        #[source]
        source: BoxError,
    },
}

/// A specialized Result type for sesparse operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: path.into(),
        }
    }

    /// Create a format error.
    pub fn format(message: impl Into<String>) -> Self {
        Self::Format {
            message: message.into(),
        }
    }

    /// Create a precondition error.
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition {
            message: message.into(),
        }
    }

    /// Wrap a transport failure.
    pub fn transport(source: BoxError) -> Self {
        Self::Transport { source }
    }

    /// Returns true for errors caused by corrupt or unsupported on-disk data.
    pub fn is_format(&self) -> bool {
        matches!(self, Self::Format { .. })
    }

    /// Returns true for errors caused by calling an operation too early.
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::Precondition { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_io_error_with_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::io(io_err, "/vmfs/volumes/ds1/vm/disk-sesparse.vmdk");
        let msg = err.to_string();
        assert!(msg.contains("I/O error"));
        assert!(msg.contains("disk-sesparse.vmdk"));
    }

    #[test]
    fn test_format_error() {
        let err = Error::format("bad magic");
        assert!(err.is_format());
        assert!(!err.is_precondition());
        assert!(err.to_string().contains("Format error"));
        assert!(err.to_string().contains("bad magic"));
    }

    #[test]
    fn test_precondition_error() {
        let err = Error::precondition("index not built");
        assert!(err.is_precondition());
        assert!(err.to_string().contains("Precondition violated"));
    }

    #[test]
    fn test_transport_error_keeps_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = Error::transport(Box::new(io_err));
        assert!(err.to_string().contains("reset by peer"));

        let source = err.source().expect("transport error has a source");
        let io = source
            .downcast_ref::<std::io::Error>()
            .expect("source is the original io::Error");
        assert_eq!(io.kind(), std::io::ErrorKind::ConnectionReset);
    }
}
