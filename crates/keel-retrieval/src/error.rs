use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum RetrievalError {
    #[error("vectors must have same length: got {0} and {1}")]
    LengthMismatch(usize, usize),

    #[error("vectors cannot be empty")]
    EmptyVector,

    #[error("score {0} outside [0, 1]")]
    ScoreOutOfRange(f64),

    #[error("score lists must have same length: {0} vs {1}")]
    ScoreListMismatch(usize, usize),

    #[error("items must be sorted by score descending")]
    Unsorted,

    #[error("min_k ({min_k}) cannot be greater than max_k ({max_k})")]
    MinKGreaterThanMaxK { min_k: usize, max_k: usize },

    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),
}

pub type Result<T> = std::result::Result<T, RetrievalError>;
