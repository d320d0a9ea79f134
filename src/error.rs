//! Error types and handling for Heatwatch
//!
//! This module defines the error types used throughout the application,
//! providing consistent error handling and reporting.

use thiserror::Error;

/// Result type alias for Heatwatch operations
pub type Result<T> = std::result::Result<T, HeatwatchError>;

/// Main error type for Heatwatch
#[derive(Debug, Error)]
pub enum HeatwatchError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Network errors (connection refused, DNS, non-success status)
    #[error("Network error: {message}")]
    Network { message: String },

    /// Malformed or incomplete payloads from devices and services
    #[error("Parse error: {message}")]
    Parse { message: String },

    /// Timeout errors
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Time-series store errors (unreadable or unwritable store file)
    #[error("Store error: {message}")]
    Store { message: String },

    /// MQTT client errors
    #[error("MQTT error: {message}")]
    Mqtt { message: String },

    /// Unknown device or resource
    #[error("Not found: {what}")]
    NotFound { what: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Generic errors with context
    #[error("Error: {message}")]
    Generic { message: String },
}

impl HeatwatchError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a new parse error
    pub fn parse<S: Into<String>>(message: S) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create a new store error
    pub fn store<S: Into<String>>(message: S) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Create a new MQTT error
    pub fn mqtt<S: Into<String>>(message: S) -> Self {
        Self::Mqtt {
            message: message.into(),
        }
    }

    /// Create a new not-found error
    pub fn not_found<S: Into<String>>(what: S) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create a new validation error
    pub fn validation<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        Self::Generic {
            message: message.into(),
        }
    }

    /// Whether the error came from talking to a device, service or broker
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Timeout { .. } | Self::Parse { .. } | Self::Mqtt { .. }
        )
    }
}

impl From<std::io::Error> for HeatwatchError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for HeatwatchError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for HeatwatchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for HeatwatchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout(err.to_string())
        } else if err.is_decode() {
            Self::parse(err.to_string())
        } else {
            Self::network(err.to_string())
        }
    }
}

impl From<chrono::ParseError> for HeatwatchError {
    fn from(err: chrono::ParseError) -> Self {
        Self::validation("datetime", err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = HeatwatchError::config("test config error");
        assert!(matches!(err, HeatwatchError::Config { .. }));

        let err = HeatwatchError::network("refused");
        assert!(matches!(err, HeatwatchError::Network { .. }));

        let err = HeatwatchError::validation("field", "test validation error");
        assert!(matches!(err, HeatwatchError::Validation { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = HeatwatchError::config("test error");
        assert_eq!(format!("{}", err), "Configuration error: test error");

        let err = HeatwatchError::validation("test_field", "invalid value");
        assert_eq!(
            format!("{}", err),
            "Validation error: test_field - invalid value"
        );

        let err = HeatwatchError::not_found("device heater");
        assert_eq!(format!("{}", err), "Not found: device heater");
    }

    #[test]
    fn test_transient_classification() {
        assert!(HeatwatchError::network("x").is_transient());
        assert!(HeatwatchError::timeout("x").is_transient());
        assert!(HeatwatchError::parse("x").is_transient());
        assert!(HeatwatchError::mqtt("x").is_transient());
        assert!(!HeatwatchError::store("x").is_transient());
        assert!(!HeatwatchError::config("x").is_transient());
    }
}
