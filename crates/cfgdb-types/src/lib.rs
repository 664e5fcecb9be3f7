//! Foundation types for the config object graph.
//!
//! Every other crate in the workspace depends on `cfgdb-types`.
//!
//! # Key Types
//!
//! - [`ObjectId`] — 128-bit object identifier (UUID v7 when generated)
//! - [`FqName`] — Hierarchical name path, unique per object type
//! - [`TypeSchema`] / [`SchemaRegistry`] — Static per-type field and edge descriptors

pub mod error;
pub mod fqname;
pub mod object;
pub mod schema;

pub use error::TypeError;
pub use fqname::FqName;
pub use object::ObjectId;
pub use schema::{FieldKind, SchemaRegistry, TypeSchema, COMMON_PROPERTIES};
