// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Core error type for Corral operations
#[derive(Error, Debug, Diagnostic)]
pub enum CorralError {
    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(
        code(corral::serialization_error),
        help("Ensure the document is valid YAML")
    )]
    SerializationError {
        #[allow(unused)]
        message: String,
        #[source]
        #[allow(unused)]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Result type for Corral operations
pub type Result<T> = std::result::Result<T, CorralError>;

impl CorralError {
    /// Create a SerializationError
    pub fn serialization_error(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::SerializationError {
            message: message.into(),
            source,
        }
    }
}
