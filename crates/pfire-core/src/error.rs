//! Error types for grid, image and solver primitives.

use thiserror::Error;

/// Error type for the core numerical primitives.
#[derive(Error, Debug)]
pub enum CoreError {
    /// A supplied argument does not match the object it is used with.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Two objects that must agree in shape do not.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// The image cannot be normalized (zero or non-finite intensity sum).
    #[error("Image is not normalizable: {0}")]
    NotNormalizable(String),

    /// Failure inside the linear-algebra backend; treated as fatal.
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Create an invalid-argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a backend error.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::invalid_argument("bad vector");
        assert_eq!(err.to_string(), "Invalid argument: bad vector");
    }

    #[test]
    fn test_shape_mismatch_display() {
        let err = CoreError::ShapeMismatch {
            expected: vec![4, 4, 1],
            actual: vec![4, 2, 1],
        };
        let msg = err.to_string();
        assert!(msg.contains("expected"));
        assert!(msg.contains("got"));
    }
}
