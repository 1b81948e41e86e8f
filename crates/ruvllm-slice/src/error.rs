//! Error types for RuvLLM-Slice
//!
//! Every failure in this crate is a programming or configuration error that
//! must reach the caller unchanged: nothing here retries or recovers locally.
//! A model name that belongs to another family is *not* an error; adapter
//! constructors report that with `Ok(None)`.

use thiserror::Error;

/// Result type alias for RuvLLM-Slice operations
pub type Result<T> = std::result::Result<T, SliceError>;

/// Main error type for RuvLLM-Slice
#[derive(Error, Debug)]
pub enum SliceError {
    /// Tensor runtime errors (shape, dtype, device)
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Model hub errors
    #[error("Hub error: {0}")]
    Hub(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Strict state transfer found differing parameter names
    #[error("State dict mismatch: missing {missing:?}, unexpected {unexpected:?}")]
    StateDict {
        /// Names the destination expects but the source lacks
        missing: Vec<String>,
        /// Names the source carries but the destination does not know
        unexpected: Vec<String>,
    },

    /// Strict state transfer found a parameter with a different shape
    #[error("Shape mismatch for '{name}': expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Parameter name
        name: String,
        /// Shape of the destination parameter
        expected: Vec<usize>,
        /// Shape of the source parameter
        actual: Vec<usize>,
    },

    /// The wrapped model or layer does not have the expected architecture
    #[error("Structural mismatch: {0}")]
    StructuralMismatch(String),

    /// Layer index outside the model's layer list
    #[error("Layer index {index} out of range for {len} layers")]
    LayerIndexOutOfRange {
        /// Requested index
        index: usize,
        /// Number of layers in the model
        len: usize,
    },

    /// No registered adapter family accepts the model name
    #[error("Unsupported model: {0}")]
    UnsupportedModel(String),

    /// Tokenizer errors
    #[error("Tokenization error: {0}")]
    Tokenization(String),

    /// Invalid operation
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<serde_json::Error> for SliceError {
    fn from(err: serde_json::Error) -> Self {
        SliceError::Serialization(err.to_string())
    }
}

impl From<hf_hub::api::sync::ApiError> for SliceError {
    fn from(err: hf_hub::api::sync::ApiError) -> Self {
        SliceError::Hub(err.to_string())
    }
}
