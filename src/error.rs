use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid construction parameters (`nc`, `p`, `ns`, batch size).
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    /// Input arrays do not match the model dimensions.
    #[error("Shape mismatch: {0}")]
    Shape(String),
    #[error("Label {label} of trace {index} is out of range [0, {num_classes})")]
    LabelRange {
        index: usize,
        label: u16,
        num_classes: usize,
    },
    /// A class has no training trace, so its template cannot be estimated.
    #[error("Class {0} has no training traces")]
    EmptyClass(usize),
    #[error("Within-class scatter matrix is singular, even after regularization")]
    SingularScatter,
    #[error("Pooled covariance matrix is not positive definite")]
    SingularCovariance,
    #[error("Model has not been fitted")]
    UnfittedModel,
    #[error("Invalid model state: {0}")]
    StateValidation(String),
    #[error("Failed to save/load model state")]
    SaveLoadError(#[from] serde_json::Error),
    #[error(transparent)]
    IoError(#[from] io::Error),
}
