//! Error types for taskmesh
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - Exit codes for the CLI
//! - Error context and chaining

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for taskmesh operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,

    // Connection errors (3xx)
    ConnectionFailed = 300,
    ConnectionTimeout = 301,
    ConnectionLost = 302,

    // Protocol errors (4xx)
    ProtocolMalformed = 400,
    ProtocolUnexpected = 401,
    FrameTooLarge = 402,
    EmptyFrame = 403,

    // Handler/execution errors (5xx)
    UnknownHandler = 500,
    HandlerFailed = 501,
    TaskTimeout = 502,

    // Resource errors (7xx)
    InsufficientResources = 700,

    // Internal errors (9xx)
    InternalError = 900,
}

impl ErrorCode {
    /// Get the string code (e.g., "E100")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10, // Config errors
            200..=299 => 20, // IO errors
            300..=399 => 30, // Connection errors
            400..=499 => 40, // Protocol errors
            500..=599 => 50, // Handler errors
            700..=799 => 70, // Resource errors
            900..=999 => 90, // Internal errors
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for taskmesh
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Generic configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    /// File write error
    #[error("Failed to write file: {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // Connection Errors
    // ─────────────────────────────────────────────────────────────

    /// Connection to a peer failed
    #[error("Failed to connect to {peer}: {message}")]
    ConnectionFailed { peer: String, message: String },

    /// Connection or handshake timed out
    #[error("Timed out connecting to {peer}")]
    ConnectionTimeout { peer: String },

    /// A live peer link dropped
    #[error("Connection to {peer} lost: {message}")]
    ConnectionLost { peer: String, message: String },

    /// No link to the named peer exists
    #[error("Not connected to peer {0}")]
    NotConnected(String),

    // ─────────────────────────────────────────────────────────────
    // Protocol Errors
    // ─────────────────────────────────────────────────────────────

    /// Malformed frame payload
    #[error("Malformed message: {0}")]
    ProtocolMalformed(String),

    /// Unexpected message kind (e.g. first frame not a handshake)
    #[error("Unexpected message: expected {expected}, got {got}")]
    ProtocolUnexpected { expected: String, got: String },

    /// Frame length prefix exceeds the configured cap
    #[error("Frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: u32, max: u32 },

    /// Frame length prefix of zero
    #[error("Zero-length frame")]
    EmptyFrame,

    // ─────────────────────────────────────────────────────────────
    // Handler / Execution Errors
    // ─────────────────────────────────────────────────────────────

    /// Task names a handler that is not registered
    #[error("Unknown function: {0}")]
    UnknownHandler(String),

    /// A registered handler returned an error
    #[error("Handler failed: {0}")]
    HandlerFailed(String),

    /// Task deadline elapsed before a terminal status arrived
    #[error("Task {task_id} timed out after {timeout_secs} seconds")]
    TaskTimeout { task_id: String, timeout_secs: u64 },

    // ─────────────────────────────────────────────────────────────
    // Resource Errors
    // ─────────────────────────────────────────────────────────────

    /// Local capacity check rejected the task
    #[error("Insufficient resources")]
    InsufficientResources,

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Get the numeric error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::Config(_) => ErrorCode::ConfigValidation,
            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(_) => ErrorCode::IoRead,
            Error::Toml(_) => ErrorCode::ConfigParseError,
            Error::Json(_) => ErrorCode::ProtocolMalformed,
            Error::ConnectionFailed { .. } => ErrorCode::ConnectionFailed,
            Error::ConnectionTimeout { .. } => ErrorCode::ConnectionTimeout,
            Error::ConnectionLost { .. } | Error::NotConnected(_) => ErrorCode::ConnectionLost,
            Error::ProtocolMalformed(_) => ErrorCode::ProtocolMalformed,
            Error::ProtocolUnexpected { .. } => ErrorCode::ProtocolUnexpected,
            Error::FrameTooLarge { .. } => ErrorCode::FrameTooLarge,
            Error::EmptyFrame => ErrorCode::EmptyFrame,
            Error::UnknownHandler(_) => ErrorCode::UnknownHandler,
            Error::HandlerFailed(_) => ErrorCode::HandlerFailed,
            Error::TaskTimeout { .. } => ErrorCode::TaskTimeout,
            Error::InsufficientResources => ErrorCode::InsufficientResources,
            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Get the CLI exit code for this error
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ErrorCode::ConfigValidation.as_str(), "E102");
        assert_eq!(ErrorCode::EmptyFrame.as_str(), "E403");
        assert_eq!(ErrorCode::InsufficientResources.exit_code(), 70);
    }

    #[test]
    fn test_error_to_code() {
        let err = Error::UnknownHandler("square".to_string());
        assert_eq!(err.code(), ErrorCode::UnknownHandler);
        assert_eq!(err.exit_code(), 50);
        assert_eq!(err.to_string(), "Unknown function: square");
    }

    #[test]
    fn test_frame_errors_display() {
        let err = Error::FrameTooLarge { len: 1024, max: 512 };
        assert!(err.to_string().contains("1024"));
        assert_eq!(Error::EmptyFrame.to_string(), "Zero-length frame");
    }
}
