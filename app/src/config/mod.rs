//! Configuration for the unstable server
//!
//! All tunables are fixed once at startup. The command line builds a
//! [`ChaosConfig`], which is validated before the supervisor is created and
//! never changes afterwards.

pub mod chaos_config;

pub use chaos_config::*;

use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Configuration validation error: {field} - {reason}")]
    ValidationError { field: String, reason: String },

    #[error("Configuration parse error: {reason}")]
    ParseError { reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::ValidationError {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Configuration validation trait
pub trait Validate {
    fn validate(&self) -> Result<(), ConfigError>;
}
