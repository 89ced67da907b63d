use crate::shape::Shape;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EmberError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmberError {
    #[error("Unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    #[error("Unsupported dtype: {0}")]
    UnsupportedDType(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl EmberError {
    /// Shorthand for kernels rejecting a tensor whose rank is wrong.
    pub(crate) fn rank(what: &str, expected: usize, got: &Shape) -> Self {
        EmberError::InvalidShape(format!(
            "{} must be {}D, got {}",
            what, expected, got
        ))
    }
}
