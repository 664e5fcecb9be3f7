use cfgdb_alloc::AllocError;
use cfgdb_graph::GraphError;
use cfgdb_store::StoreError;

use crate::report::Action;

/// Errors that abort an audit operation.
///
/// Inconsistencies found in the data are findings, not errors.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("no {action} operation named {name}")]
    UnknownOperation { action: Action, name: String },

    #[error("invalid audit configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type AuditResult<T> = Result<T, AuditError>;
