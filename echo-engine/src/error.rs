//! Error taxonomy for the ESN engine.

use thiserror::Error;

use crate::batch::BatchSchema;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EsnError {
    #[error("readout algorithm '{0}' supports neither closed-form nor iterative training")]
    UnsupportedAlgorithm(String),

    #[error("iterative readout '{0}' requires a loss function")]
    MissingLoss(String),

    #[error("iterative readout '{0}' requires an optimizer")]
    MissingOptimizer(String),

    #[error("batch wire shape mismatch: encoder expects {expected:?}, got {found:?}")]
    SchemaMismatch {
        expected: BatchSchema,
        found: BatchSchema,
    },

    #[error("batch field '{0}' is missing")]
    MissingField(String),

    #[error("training batch {0} carries no labels")]
    MissingLabels(usize),

    #[error("bidirectional merge requested without reversed states")]
    MissingReversedStates,

    #[error("dataset yielded no batches")]
    EmptyDataset,

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("readout '{0}' has not been fitted")]
    NotFitted(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<ndarray::ShapeError> for EsnError {
    fn from(e: ndarray::ShapeError) -> Self {
        Self::ShapeMismatch(e.to_string())
    }
}

impl From<serde_json::Error> for EsnError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for EsnError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EsnError>;
