use std::sync::Arc;

use cfgdb_store::{CellStore, ColumnRange, WriteBatch};
use cfgdb_types::{FqName, ObjectId, SchemaRegistry};
use tracing::{debug, warn};

use crate::codec::{now_timestamp, stamp_id_perms, PropertyCodec};
use crate::columns::{
    backref_col, child_col, index_col, index_prefix, parent_col, parse_index_col, ref_col,
    FQ_NAME_COL, FQ_TABLE, ID_PERMS_COL, LATEST_COL, OBJ_TABLE, TYPE_COL,
};
use crate::error::{GraphError, GraphResult};
use crate::object::{ObjRef, RefData};

/// Maintains the derived edges of the object graph and the name index.
///
/// Edge writes are staged into a caller-owned [`WriteBatch`] so that an
/// object mutation and all of its edges land in one atomic apply.
///
/// - Parent/child: `children:` on the parent, `parent:` on the child.
/// - Cross-type reference: `ref:` on the source, `backref:` on the target.
/// - Same-type reference: `ref:` on both ends.
pub struct GraphIndex {
    store: Arc<dyn CellStore>,
    schemas: Arc<SchemaRegistry>,
}

impl GraphIndex {
    pub fn new(store: Arc<dyn CellStore>, schemas: Arc<SchemaRegistry>) -> Self {
        Self { store, schemas }
    }

    pub fn link_child(&self, batch: &mut WriteBatch, parent: &ObjRef, child: &ObjRef) -> GraphResult<()> {
        batch.put(
            OBJ_TABLE,
            &parent.uuid.to_string(),
            child_col(&child.obj_type, &child.uuid),
            "null",
        );
        batch.put(
            OBJ_TABLE,
            &child.uuid.to_string(),
            parent_col(&parent.obj_type, &parent.uuid),
            "null",
        );
        self.touch_activity(batch, parent)
    }

    pub fn unlink_child(&self, batch: &mut WriteBatch, parent: &ObjRef, child: &ObjRef) -> GraphResult<()> {
        batch.delete_cell(
            OBJ_TABLE,
            &parent.uuid.to_string(),
            child_col(&child.obj_type, &child.uuid),
        );
        batch.delete_cell(
            OBJ_TABLE,
            &child.uuid.to_string(),
            parent_col(&parent.obj_type, &parent.uuid),
        );
        self.touch_activity(batch, parent)
    }

    /// Stage a reference `from -> to` together with its mirror on `to`.
    pub fn link_ref(
        &self,
        batch: &mut WriteBatch,
        from: &ObjRef,
        to: &ObjRef,
        attr: Option<&serde_json::Value>,
    ) -> GraphResult<()> {
        let data = RefData { attr: attr.cloned(), is_weakref: false };
        let value = serde_json::to_string(&data)
            .map_err(|e| GraphError::Serialization(format!("ref attr: {e}")))?;
        batch.put(
            OBJ_TABLE,
            &from.uuid.to_string(),
            ref_col(&to.obj_type, &to.uuid),
            value.clone(),
        );
        if from.obj_type == to.obj_type {
            batch.put(OBJ_TABLE, &to.uuid.to_string(), ref_col(&from.obj_type, &from.uuid), value);
            self.refresh_last_modified(batch, &to.uuid)?;
        } else {
            batch.put(
                OBJ_TABLE,
                &to.uuid.to_string(),
                backref_col(&from.obj_type, &from.uuid),
                value,
            );
        }
        self.touch_activity(batch, to)
    }

    pub fn unlink_ref(&self, batch: &mut WriteBatch, from: &ObjRef, to: &ObjRef) -> GraphResult<()> {
        batch.delete_cell(OBJ_TABLE, &from.uuid.to_string(), ref_col(&to.obj_type, &to.uuid));
        if from.obj_type == to.obj_type {
            batch.delete_cell(OBJ_TABLE, &to.uuid.to_string(), ref_col(&from.obj_type, &from.uuid));
            if self.store.row_exists(OBJ_TABLE, &to.uuid.to_string())? {
                self.refresh_last_modified(batch, &to.uuid)?;
            }
        } else {
            batch.delete_cell(
                OBJ_TABLE,
                &to.uuid.to_string(),
                backref_col(&from.obj_type, &from.uuid),
            );
        }
        self.touch_activity(batch, to)
    }

    /// Stage the name index entry for `id`. Fails with `NameConflict` if
    /// another object of the type already owns the name.
    pub fn index_name(
        &self,
        batch: &mut WriteBatch,
        obj_type: &str,
        fq_name: &FqName,
        id: &ObjectId,
    ) -> GraphResult<()> {
        if let Some(existing) = self.lookup_name(obj_type, fq_name)? {
            if existing != *id {
                return Err(GraphError::NameConflict {
                    obj_type: obj_type.to_string(),
                    fq_name: fq_name.clone(),
                    existing,
                });
            }
        }
        batch.put(FQ_TABLE, obj_type, index_col(fq_name, id), "null");
        Ok(())
    }

    pub fn deindex_name(&self, batch: &mut WriteBatch, obj_type: &str, fq_name: &FqName, id: &ObjectId) {
        batch.delete_cell(FQ_TABLE, obj_type, index_col(fq_name, id));
    }

    /// Resolve a name through the index. More than one entry is reported as
    /// `AmbiguousName`; malformed entries are skipped.
    pub fn lookup_name(&self, obj_type: &str, fq_name: &FqName) -> GraphResult<Option<ObjectId>> {
        let prefix = index_prefix(fq_name);
        let cells = self
            .store
            .read_row(FQ_TABLE, obj_type, &ColumnRange::prefix(prefix.as_str()))?;
        let matches: Vec<ObjectId> = cells
            .iter()
            .filter_map(|(column, _)| ObjectId::parse(&column[prefix.len()..]).ok())
            .collect();
        match matches.as_slice() {
            [] => Ok(None),
            [id] => Ok(Some(*id)),
            _ => {
                warn!(obj_type, fq_name = %fq_name, count = matches.len(), "ambiguous name index entry");
                Err(GraphError::AmbiguousName {
                    obj_type: obj_type.to_string(),
                    fq_name: fq_name.clone(),
                    matches,
                })
            }
        }
    }

    pub fn name_to_id(&self, obj_type: &str, fq_name: &FqName) -> GraphResult<ObjectId> {
        self.lookup_name(obj_type, fq_name)?
            .ok_or_else(|| GraphError::NotFound(format!("{obj_type} {fq_name}")))
    }

    /// Name and type of `id`, read from the object row.
    pub fn id_to_name(&self, id: &ObjectId) -> GraphResult<(FqName, String)> {
        let row = id.to_string();
        let fq_raw = self.store.get_value(OBJ_TABLE, &row, FQ_NAME_COL)?;
        let type_raw = self.store.get_value(OBJ_TABLE, &row, TYPE_COL)?;
        match (fq_raw, type_raw) {
            (Some(fq_raw), Some(type_raw)) => {
                let fq_name: FqName = serde_json::from_str(&fq_raw)
                    .map_err(|e| GraphError::Serialization(format!("fq_name of {id}: {e}")))?;
                let obj_type: String = serde_json::from_str(&type_raw)
                    .map_err(|e| GraphError::Serialization(format!("type of {id}: {e}")))?;
                Ok((fq_name, obj_type))
            }
            _ => Err(GraphError::NotFound(format!("object {id}"))),
        }
    }

    /// Every well-formed index entry of a type, in name order.
    pub fn entries(&self, obj_type: &str) -> GraphResult<Vec<(FqName, ObjectId)>> {
        let cells = self.store.read_row(FQ_TABLE, obj_type, &ColumnRange::All)?;
        Ok(cells
            .iter()
            .filter_map(|(column, _)| parse_index_col(column))
            .collect())
    }

    /// Touch the activity marker of `target` unless its type is cache
    /// excluded or the row is gone.
    pub fn touch_activity(&self, batch: &mut WriteBatch, target: &ObjRef) -> GraphResult<()> {
        if self.schemas.is_cache_excluded(&target.obj_type) {
            return Ok(());
        }
        let row = target.uuid.to_string();
        if !self.store.row_exists(OBJ_TABLE, &row)? {
            debug!(target = %target.uuid, "skip activity touch on missing row");
            return Ok(());
        }
        batch.put(OBJ_TABLE, &row, LATEST_COL, "null");
        Ok(())
    }

    /// Rewrite `id_perms.last_modified` of an existing object.
    pub fn refresh_last_modified(&self, batch: &mut WriteBatch, id: &ObjectId) -> GraphResult<()> {
        let row = id.to_string();
        let Some(raw) = self.store.get_value(OBJ_TABLE, &row, ID_PERMS_COL)? else {
            return Ok(());
        };
        let perms = PropertyCodec::decode_value("id_perms", &raw)?;
        let stamped = stamp_id_perms(Some(perms), &now_timestamp());
        let writes = PropertyCodec::encode_scalar("id_perms", Some(&stamped))?;
        writes.apply_to(batch, OBJ_TABLE, &row);
        Ok(())
    }
}

impl std::fmt::Debug for GraphIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphIndex").finish_non_exhaustive()
    }
}
