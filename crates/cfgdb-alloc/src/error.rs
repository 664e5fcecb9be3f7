use cfgdb_store::StoreError;

/// Errors from identifier allocation.
#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    /// No free unit remains in any range of the pool.
    #[error("id pool {path} exhausted")]
    Exhausted { path: String },

    /// Two configured ranges of one pool overlap.
    #[error("overlapping ranges in pool {path}: {first} and {second}")]
    OverlappingRanges {
        path: String,
        first: String,
        second: String,
    },

    /// A configured range has `start > end`.
    #[error("invalid range {start}-{end} in pool {path}")]
    InvalidRange { path: String, start: u64, end: u64 },

    /// The id lies outside every range of the pool.
    #[error("id {id} outside the ranges of pool {path}")]
    OutOfRange { path: String, id: u64 },

    /// The id is already reserved with a different payload.
    #[error("id {id} in pool {path} already reserved for {existing:?}")]
    Conflict {
        path: String,
        id: u64,
        existing: Option<String>,
    },

    /// A persisted interval could not be decoded.
    #[error("corrupt interval {column} in pool {path}: {reason}")]
    Corrupt {
        path: String,
        column: String,
        reason: String,
    },

    /// Concurrent writers kept changing the pool until retries ran out.
    #[error("id pool {path} still contended after {attempts} attempts")]
    Contended { path: String, attempts: u32 },

    #[error("allocator lock poisoned: {0}")]
    LockPoisoned(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result alias for allocator operations.
pub type AllocResult<T> = Result<T, AllocError>;
