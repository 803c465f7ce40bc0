//! Error types and handling for Helion
//!
//! This module defines the error types used throughout the application,
//! providing consistent error handling and reporting.

use thiserror::Error;

/// Result type alias for Helion operations
pub type Result<T> = std::result::Result<T, HelionError>;

/// Main error type for Helion
#[derive(Debug, Error)]
pub enum HelionError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Serial transport errors (port open, framing, no response)
    #[error("Bus error: {message}")]
    Bus { message: String },

    /// Modbus protocol errors (exception responses, malformed replies)
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Reply carrying an unexpected function code; evidence of a second
    /// master sharing the bus
    #[error("Foreign frame: {message}")]
    ForeignFrame { message: String },

    /// Boundary-file errors (snapshot publish, inbox parse, sidecar mirror)
    #[error("Boundary file error: {message}")]
    Boundary { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Timeout errors
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// Generic errors with context
    #[error("Error: {message}")]
    Generic { message: String },
}

impl HelionError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        HelionError::Config {
            message: message.into(),
        }
    }

    /// Create a new bus transport error
    pub fn bus<S: Into<String>>(message: S) -> Self {
        HelionError::Bus {
            message: message.into(),
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        HelionError::Protocol {
            message: message.into(),
        }
    }

    /// Create a new foreign-frame error
    pub fn foreign_frame<S: Into<String>>(message: S) -> Self {
        HelionError::ForeignFrame {
            message: message.into(),
        }
    }

    /// Create a new boundary-file error
    pub fn boundary<S: Into<String>>(message: S) -> Self {
        HelionError::Boundary {
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        HelionError::Io {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(field: S, message: S) -> Self {
        HelionError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        HelionError::Timeout {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        HelionError::Generic {
            message: message.into(),
        }
    }

    /// Whether this error indicates a frame from another bus master
    pub fn is_foreign_frame(&self) -> bool {
        matches!(self, HelionError::ForeignFrame { .. })
    }
}

impl From<std::io::Error> for HelionError {
    fn from(err: std::io::Error) -> Self {
        HelionError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for HelionError {
    fn from(err: serde_yaml::Error) -> Self {
        HelionError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for HelionError {
    fn from(err: serde_json::Error) -> Self {
        HelionError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<chrono::ParseError> for HelionError {
    fn from(err: chrono::ParseError) -> Self {
        HelionError::validation("datetime", &err.to_string())
    }
}
