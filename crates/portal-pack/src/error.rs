use thiserror::Error;

use crate::value::Dtype;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PackError {
    #[error("truncated payload: expected at least {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("unknown value tag {0}")]
    UnknownTag(u8),
    #[error("invalid utf-8 string payload")]
    InvalidUtf8,
    #[error("array shape {shape:?} does not match data length {len} for dtype {dtype:?}")]
    ShapeMismatch { dtype: Dtype, shape: Vec<u64>, len: usize },
    #[error("map keys must be unique, duplicate key {0:?}")]
    DuplicateKey(String),
}
