use std::path::PathBuf;

/// The primary error type for all operations in the `strongbox` crate.
#[derive(Debug)]
pub enum SafeError {
    /// An I/O error occurred, typically while reading or writing a container file.
    /// Includes the path where the error happened, when one is known.
    Io { source: std::io::Error, path: PathBuf },

    /// The container file is malformed: bad framing, a missing required header
    /// field, or a duplicate path encountered while parsing. Fatal for `open`.
    Format(String),

    /// The caller asked for something the current archive state does not allow
    /// (duplicate path, missing `id`/`name`, non-directory destination, ...).
    /// The archive state is unchanged.
    Validation(String),

    /// The requested path is not present in the archive.
    NotFound(String),

    /// A cryptographic failure: key setup, padding, or a wrong password.
    Crypto(String),

    /// An error during serialization or deserialization of header or metadata JSON.
    SerdeJson(serde_json::Error),

    /// The operation was cancelled through its probe. Not a failure.
    Cancelled,
}

impl std::fmt::Display for SafeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SafeError::Io { source, path } => {
                if path.as_os_str().is_empty() {
                    write!(f, "I/O error: {}", source)
                } else {
                    write!(f, "I/O error on path '{}': {}", path.display(), source)
                }
            }
            SafeError::Format(msg) => write!(f, "Malformed container: {}", msg),
            SafeError::Validation(msg) => write!(f, "Validation error: {}", msg),
            SafeError::NotFound(path) => write!(f, "Not found in archive: {}", path),
            SafeError::Crypto(msg) => write!(f, "Crypto error: {}", msg),
            SafeError::SerdeJson(e) => write!(f, "Serialization error: {}", e),
            SafeError::Cancelled => write!(f, "Operation cancelled"),
        }
    }
}

impl std::error::Error for SafeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SafeError::Io { source, .. } => Some(source),
            SafeError::SerdeJson(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for SafeError {
    fn from(err: serde_json::Error) -> Self {
        SafeError::SerdeJson(err)
    }
}

// Generic IO error conversion that doesn't require a path
impl From<std::io::Error> for SafeError {
    fn from(err: std::io::Error) -> Self {
        SafeError::Io { source: err, path: PathBuf::new() }
    }
}

impl SafeError {
    pub(crate) fn io_at(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        SafeError::Io { source: err, path: path.into() }
    }

    /// True when the error is a cooperative cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SafeError::Cancelled)
    }
}
