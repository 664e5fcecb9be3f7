use cfgdb_store::StoreError;
use cfgdb_types::{FqName, ObjectId, TypeError};

/// Errors from object-graph operations.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// The object, id or index entry does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Another object of the same type already owns the name.
    #[error("{obj_type} {fq_name} already exists as {existing}")]
    NameConflict {
        obj_type: String,
        fq_name: FqName,
        existing: ObjectId,
    },

    /// An object with the requested id already exists.
    #[error("object {0} already exists")]
    AlreadyExists(ObjectId),

    /// The parent type may not own objects of this type.
    #[error("invalid parent type {parent_type} for {obj_type}")]
    InvalidParent {
        obj_type: String,
        parent_type: String,
    },

    /// More than one index entry resolves the same name.
    #[error("ambiguous name {obj_type} {fq_name}: {} matches", matches.len())]
    AmbiguousName {
        obj_type: String,
        fq_name: FqName,
        matches: Vec<ObjectId>,
    },

    /// The field is not declared by the type schema, or has the wrong shape.
    #[error("invalid field {field} for {obj_type}")]
    InvalidField { obj_type: String, field: String },

    /// A value could not be encoded to or decoded from a cell.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A stored object row is missing cells every object must have.
    #[error("corrupt object {id}: {reason}")]
    Corrupt { id: ObjectId, reason: String },

    #[error("cache lock poisoned: {0}")]
    LockPoisoned(String),

    #[error(transparent)]
    Type(#[from] TypeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl GraphError {
    /// The backing store could not be reached after retrying.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Store(StoreError::Unavailable { .. }))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result alias for graph operations.
pub type GraphResult<T> = Result<T, GraphError>;
