//! Error types for collins-screen
//!
//! This module defines the error type shared by every subsystem of the
//! screen engine. Library code returns `Result<T>`; the binary wraps it in
//! anyhow at the top level.

use thiserror::Error;

/// Main error type for the screen engine
#[derive(Error, Debug)]
pub enum CollinsError {
    /// URL resolution errors (redirect loops, auth rejection, no media link)
    #[error("Resolve error: {0}")]
    Resolve(String),

    /// Transport-level HTTP errors
    #[error("Network error: {0}")]
    Network(String),

    /// Disk cache errors
    #[error("Cache error: {0}")]
    Cache(String),

    /// Decoder errors
    #[error("Decoder error: {0}")]
    Decoder(String),

    /// Audio errors
    #[error("Audio error: {0}")]
    Audio(String),

    /// Synchronization wire format errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors
    #[error("File error: {0}")]
    FileIO(#[from] std::io::Error),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The owning session was superseded while work was in flight
    #[error("Session superseded")]
    Superseded,

    /// Generic error for unexpected situations
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ffmpeg_next::Error> for CollinsError {
    fn from(err: ffmpeg_next::Error) -> Self {
        CollinsError::Decoder(format!("FFmpeg error: {}", err))
    }
}

impl From<reqwest::Error> for CollinsError {
    fn from(err: reqwest::Error) -> Self {
        CollinsError::Network(err.to_string())
    }
}

impl CollinsError {
    /// Create a decoder error from string
    pub fn decoder_error<S: Into<String>>(msg: S) -> Self {
        CollinsError::Decoder(msg.into())
    }

    /// Create a cache error from string
    pub fn cache_error<S: Into<String>>(msg: S) -> Self {
        CollinsError::Cache(msg.into())
    }

    /// Create a protocol error from string
    pub fn protocol_error<S: Into<String>>(msg: S) -> Self {
        CollinsError::Protocol(msg.into())
    }
}

/// Convenience type alias for Results in collins-screen
pub type Result<T> = std::result::Result<T, CollinsError>;

/// Extension trait for converting other errors to CollinsError
pub trait IntoCollinsError<T> {
    /// Convert this error into a CollinsError with the given context
    fn network_err(self, context: &str) -> Result<T>;
    fn cache_err(self, context: &str) -> Result<T>;
    fn decoder_err(self, context: &str) -> Result<T>;
    fn audio_err(self, context: &str) -> Result<T>;
    fn config_err(self, context: &str) -> Result<T>;
    fn protocol_err(self, context: &str) -> Result<T>;
}

impl<T, E: std::fmt::Display> IntoCollinsError<T> for std::result::Result<T, E> {
    fn network_err(self, context: &str) -> Result<T> {
        self.map_err(|e| CollinsError::Network(format!("{}: {}", context, e)))
    }

    fn cache_err(self, context: &str) -> Result<T> {
        self.map_err(|e| CollinsError::Cache(format!("{}: {}", context, e)))
    }

    fn decoder_err(self, context: &str) -> Result<T> {
        self.map_err(|e| CollinsError::Decoder(format!("{}: {}", context, e)))
    }

    fn audio_err(self, context: &str) -> Result<T> {
        self.map_err(|e| CollinsError::Audio(format!("{}: {}", context, e)))
    }

    fn config_err(self, context: &str) -> Result<T> {
        self.map_err(|e| CollinsError::Config(format!("{}: {}", context, e)))
    }

    fn protocol_err(self, context: &str) -> Result<T> {
        self.map_err(|e| CollinsError::Protocol(format!("{}: {}", context, e)))
    }
}

/// Helper macro for creating internal errors with file and line information
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::utils::error::CollinsError::Internal(
            format!("{} at {}:{}", $msg, file!(), line!())
        )
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::utils::error::CollinsError::Internal(
            format!("{} at {}:{}", format!($fmt, $($arg)*), file!(), line!())
        )
    };
}
