//! Error types for retrograph-nn.

use thiserror::Error;

/// Encoder error type.
///
/// Configuration problems surface when a layer is built; shape and index
/// problems surface at the start of the operation that first sees them,
/// before any output tensor exists.
#[derive(Debug, Error)]
pub enum Error {
    /// Candle tensor error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A width or count disagrees with what the caller declared.
    #[error("dimension mismatch for {what}: expected {expected}, got {got}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    /// A tensor has the wrong rank or shape.
    #[error("shape mismatch for {what}: expected {expected}, got {got:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: String,
        got: Vec<usize>,
    },

    /// Edge endpoint outside `[0, num_nodes)`.
    #[error("edge {edge} references node {node}, but the graph has {num_nodes} nodes")]
    IndexOutOfRange {
        edge: usize,
        node: i64,
        num_nodes: usize,
    },

    /// Malformed graph offset array.
    #[error("invalid ptr: {0}")]
    InvalidPtr(String),

    /// Class label outside `[0, classes)`.
    #[error("label {label} at position {index} is outside {classes} classes")]
    LabelOutOfRange {
        index: usize,
        label: u32,
        classes: usize,
    },
}

impl Error {
    pub(crate) fn shape(what: &'static str, expected: impl Into<String>, got: &[usize]) -> Self {
        Error::ShapeMismatch {
            what,
            expected: expected.into(),
            got: got.to_vec(),
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
