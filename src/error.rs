//! Error types for Trazar

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Tensor {0} is disposed or was never registered")]
    DisposedTensor(u64),

    #[error("Missing gradient: {0}")]
    MissingGradient(String),

    #[error("Invalid dtype: {0}")]
    InvalidDType(String),

    #[error("Invalid operation: {0}")]
    InvalidOp(String),
}

pub type Result<T> = std::result::Result<T, Error>;
