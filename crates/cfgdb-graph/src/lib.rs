//! Object-graph storage engine over a [`cfgdb_store::CellStore`].
//!
//! Each object is one row of `obj_uuid_table`; its properties, parent and
//! child edges, references and back-references are cells of that row. A
//! second table, `obj_fq_name_table`, maps `(type, fq_name)` to ids.
//!
//! # Key Types
//!
//! - [`ObjectGraphStore`] — create/read/update/delete/list over the graph
//! - [`PropertyCodec`] — field values to cells and back
//! - [`GraphIndex`] — edge mirroring and the name index
//! - [`ObjectCache`] — bounded read cache validated by marker timestamps
//!
//! # Design Rules
//!
//! 1. One mutation, one batch: object cells, edges and index entry commit together.
//! 2. Every edge has a mirror on the other object; same-type references mirror as `ref:`.
//! 3. The name index is the authority on `(type, fq_name)` uniqueness.
//! 4. A cached object is served only while its marker cell timestamps are unchanged.
//! 5. Property-only reads never touch the children/back-reference cell range.

pub mod cache;
pub mod codec;
pub mod columns;
pub mod engine;
pub mod error;
pub mod index;
pub mod object;

pub use cache::{CacheStats, CachedObject, ObjectCache};
pub use codec::{CellWrites, PropertyCodec};
pub use engine::ObjectGraphStore;
pub use error::{GraphError, GraphResult};
pub use index::GraphIndex;
pub use object::{
    FieldFilter, ListEntry, ListQuery, ListScope, NewObject, ObjRef, ObjectRecord, ObjectUpdate,
    PropFilter, RefData, RefEdge, RefSpec, RefTarget,
};
