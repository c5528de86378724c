//! Error types for the CREPE model and export pipeline.

use thiserror::Error;

/// Result type for CREPE operations.
pub type CrepeResult<T> = Result<T, CrepeError>;

/// Errors that can occur during model construction, checkpoint
/// normalization, or export.
#[derive(Debug, Error)]
pub enum CrepeError {
    /// Tensor operation failed
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Unrecognized capacity tier
    #[error("unknown model capacity '{0}' (expected one of: tiny, small, medium, large, full)")]
    InvalidCapacity(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Raw checkpoint could not be read or is missing its state dict
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// A weight tensor disagrees with the architecture's expected shape
    #[error("shape mismatch for parameter '{name}': expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// A parameter required by the architecture is absent
    #[error("missing parameter '{0}'")]
    MissingParam(String),

    /// A parameter not declared by the architecture is present
    #[error("unexpected parameter '{0}'")]
    UnexpectedParam(String),

    /// Unrecognized compilation target
    #[error("unknown compilation target '{0}' (expected one of: webgpu, vulkan, metal, cuda)")]
    UnknownTarget(String),

    /// Tracing, lowering, or artifact encoding failed
    #[error("compilation error: {0}")]
    Compile(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration file
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),
}

impl CrepeError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create a compilation error
    pub fn compile(msg: impl Into<String>) -> Self {
        Self::Compile(msg.into())
    }

    /// Create a shape mismatch error for a named parameter
    pub fn shape_mismatch(name: impl Into<String>, expected: &[usize], got: &[usize]) -> Self {
        Self::ShapeMismatch {
            name: name.into(),
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_capacity_display() {
        let err = CrepeError::InvalidCapacity("huge".to_string());
        assert!(err.to_string().contains("huge"));
        assert!(err.to_string().contains("tiny"));
    }

    #[test]
    fn test_shape_mismatch_names_parameter() {
        let err = CrepeError::shape_mismatch("fc.weight", &[360, 256], &[360, 128]);
        let msg = err.to_string();
        assert!(msg.contains("fc.weight"));
        assert!(msg.contains("[360, 256]"));
        assert!(msg.contains("[360, 128]"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err: CrepeError = io_err.into();
        assert!(matches!(err, CrepeError::Io(_)));
    }
}
