use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid object id: {0}")]
    InvalidId(String),

    #[error("fq_name must have at least one component")]
    EmptyFqName,

    #[error("invalid encoded fq_name: {0}")]
    InvalidFqName(String),

    #[error("unknown object type: {0}")]
    UnknownType(String),
}
