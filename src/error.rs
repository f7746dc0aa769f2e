//! Error types for chunksync

use thiserror::Error;

/// Result type alias for chunksync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for chunksync
///
/// Variants split along the recovery boundary: an `Io` error raised while
/// hashing a single chunk is recovered by the engine (the chunk is retried
/// on the next run); everything else is fatal to the operation that
/// produced it.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors (unknown digest, missing input, mismatched
    /// chunk size or format version between a store/stream and this run)
    #[error("configuration error: {message}")]
    Config { message: String },

    /// I/O errors (file system operations)
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// Malformed delta stream or store container
    #[error("format error: {message}")]
    Format { message: String },

    /// A delta frame's payload did not match its declared hash
    #[error("integrity error at chunk {ordinal}: payload hash {actual} does not match declared {expected}")]
    Integrity {
        ordinal: u64,
        expected: String,
        actual: String,
    },

    /// The reference index for a comparison could not be used
    #[error("reference index unavailable: {message}")]
    Reference { message: String },

    /// A worker thread panicked; the run cannot be trusted
    #[error("worker thread panicked")]
    WorkerPanicked,
}

impl Error {
    /// Create an I/O error with context
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a format error
    pub fn format(message: impl Into<String>) -> Self {
        Self::Format {
            message: message.into(),
        }
    }

    /// Create a reference-unavailable error
    pub fn reference(message: impl Into<String>) -> Self {
        Self::Reference {
            message: message.into(),
        }
    }

    /// Check if this error is recoverable within a hashing run
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Io { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Config {
            message: format!("TOML parse error: {}", err),
        }
    }
}
