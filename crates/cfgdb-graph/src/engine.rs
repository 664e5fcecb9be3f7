use std::collections::BTreeMap;
use std::sync::Arc;

use cfgdb_store::{Cell, CellStore, CellTimestamp, ColumnRange, WriteBatch};
use cfgdb_types::{FieldKind, FqName, ObjectId, SchemaRegistry, TypeSchema};
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::{CachedObject, ObjectCache};
use crate::codec::{compare_positions, now_timestamp, stamp_id_perms, PropertyCodec};
use crate::columns::{
    backref_prefix, children_prefix, list_col, list_prefix, map_col, map_prefix, prop_col,
    ref_prefix, Column, FQ_NAME_COL, ID_PERMS_COL, LATEST_COL, OBJ_TABLE, PROPERTY_REGION_START,
    TYPE_COL,
};
use crate::error::{GraphError, GraphResult};
use crate::index::GraphIndex;
use crate::object::{
    FieldFilter, ListEntry, ListQuery, ListScope, NewObject, ObjRef, ObjectRecord, ObjectUpdate,
    RefData, RefEdge, RefSpec, RefTarget,
};

/// CRUD engine over the object graph.
///
/// Every mutation stages the object cells, its edges and its name index
/// entry into one [`WriteBatch`] applied atomically. Reads go through an
/// optional [`ObjectCache`] validated against per-object marker cells.
pub struct ObjectGraphStore {
    store: Arc<dyn CellStore>,
    schemas: Arc<SchemaRegistry>,
    index: GraphIndex,
    cache: Option<ObjectCache>,
}

/// An object row decoded together with its marker timestamps and the cell
/// layout needed to diff list and map fields.
struct DecodedRow {
    record: ObjectRecord,
    id_perms_ts: Option<CellTimestamp>,
    latest_ts: Option<CellTimestamp>,
    list_positions: BTreeMap<String, Vec<String>>,
    map_keys: BTreeMap<String, Vec<String>>,
}

impl ObjectGraphStore {
    /// Engine without a read cache.
    pub fn new(store: Arc<dyn CellStore>, schemas: Arc<SchemaRegistry>) -> Self {
        Self::with_cache(store, schemas, 0)
    }

    /// Engine with an LRU read cache of `cache_entries` objects; 0 disables it.
    pub fn with_cache(store: Arc<dyn CellStore>, schemas: Arc<SchemaRegistry>, cache_entries: usize) -> Self {
        let index = GraphIndex::new(store.clone(), schemas.clone());
        Self { store, schemas, index, cache: ObjectCache::new(cache_entries) }
    }

    pub fn store(&self) -> &Arc<dyn CellStore> {
        &self.store
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    pub fn index(&self) -> &GraphIndex {
        &self.index
    }

    pub fn cache(&self) -> Option<&ObjectCache> {
        self.cache.as_ref()
    }

    // ----- create -----

    pub fn create(&self, obj: NewObject) -> GraphResult<ObjectId> {
        let schema = self.schemas.require(&obj.obj_type)?;
        let id = obj.uuid.unwrap_or_else(ObjectId::new);
        let row = id.to_string();
        if self.store.row_exists(OBJ_TABLE, &row)? {
            return Err(GraphError::AlreadyExists(id));
        }

        let parent = match &obj.parent_type {
            Some(parent_type) => {
                let invalid = || GraphError::InvalidParent {
                    obj_type: obj.obj_type.clone(),
                    parent_type: parent_type.clone(),
                };
                if !schema.allows_parent(parent_type) {
                    return Err(invalid());
                }
                let parent_fq = obj.fq_name.parent().ok_or_else(invalid)?;
                let parent_id = self.index.name_to_id(parent_type, &parent_fq)?;
                Some(ObjRef::new(parent_type.clone(), parent_id))
            }
            None => None,
        };

        for field in obj.props.keys() {
            check_field(schema, field, FieldKind::Scalar)?;
        }
        for field in obj.prop_lists.keys() {
            check_field(schema, field, FieldKind::List)?;
        }
        for field in obj.prop_maps.keys() {
            check_field(schema, field, FieldKind::Map)?;
        }
        let mut targets = Vec::with_capacity(obj.refs.len());
        for spec in &obj.refs {
            if !schema.has_ref(&spec.obj_type) {
                return Err(invalid_field(schema, &format!("{}_refs", spec.obj_type)));
            }
            targets.push((self.resolve_ref(spec)?, spec.attr.clone()));
        }

        let mut props = obj.props;
        props.retain(|_, v| !v.is_null());
        let perms = stamp_id_perms(props.remove("id_perms"), &now_timestamp());
        props.insert("id_perms".into(), perms);
        props
            .entry("display_name".into())
            .or_insert_with(|| Value::String(obj.fq_name.leaf().to_string()));

        let mut batch = WriteBatch::new();
        batch.put(OBJ_TABLE, &row, TYPE_COL, to_json(&obj.obj_type)?);
        batch.put(OBJ_TABLE, &row, FQ_NAME_COL, to_json(&obj.fq_name)?);
        for (field, value) in &props {
            PropertyCodec::encode_scalar(field, Some(value))?.apply_to(&mut batch, OBJ_TABLE, &row);
        }
        for (field, values) in &obj.prop_lists {
            PropertyCodec::encode_list(field, Some(values), &[])?.apply_to(&mut batch, OBJ_TABLE, &row);
        }
        for (field, values) in &obj.prop_maps {
            let key_field = map_key_field(schema, field)?;
            PropertyCodec::encode_map(field, key_field, Some(values), &[])?
                .apply_to(&mut batch, OBJ_TABLE, &row);
        }
        if !schema.is_cache_excluded() {
            batch.put(OBJ_TABLE, &row, LATEST_COL, "null");
        }

        let me = ObjRef::new(obj.obj_type.clone(), id);
        if let Some(parent) = &parent {
            self.index.link_child(&mut batch, parent, &me)?;
        }
        for (target, attr) in &targets {
            self.index.link_ref(&mut batch, &me, target, attr.as_ref())?;
        }
        self.index.index_name(&mut batch, &obj.obj_type, &obj.fq_name, &id)?;

        self.store.apply(batch)?;
        if let Some(cache) = &self.cache {
            cache.put_name(id, obj.fq_name.clone(), obj.obj_type.clone())?;
        }
        debug!(obj_type = %obj.obj_type, fq_name = %obj.fq_name, id = %id, "object created");
        Ok(id)
    }

    // ----- read -----

    /// Read objects projected onto `filter`.
    ///
    /// A single missing id fails with `NotFound`; missing ids in a
    /// multi-id read are skipped.
    pub fn read(&self, ids: &[ObjectId], filter: &FieldFilter) -> GraphResult<Vec<ObjectRecord>> {
        let cacheable = self.cache.as_ref().is_some_and(|c| ids.len() <= c.capacity());
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            match self.read_cached(id, filter, cacheable)? {
                Some(record) => records.push(record),
                None if ids.len() == 1 => {
                    return Err(GraphError::NotFound(format!("object {id}")));
                }
                None => debug!(id = %id, "skipping missing object in multi-read"),
            }
        }
        Ok(records)
    }

    pub fn read_one(&self, id: &ObjectId, filter: &FieldFilter) -> GraphResult<ObjectRecord> {
        self.read_cached(id, filter, self.cache.is_some())?
            .ok_or_else(|| GraphError::NotFound(format!("object {id}")))
    }

    pub fn exists(&self, id: &ObjectId) -> GraphResult<bool> {
        Ok(self.store.get(OBJ_TABLE, &id.to_string(), TYPE_COL)?.is_some())
    }

    fn read_cached(
        &self,
        id: &ObjectId,
        filter: &FieldFilter,
        cacheable: bool,
    ) -> GraphResult<Option<ObjectRecord>> {
        let row = id.to_string();
        let needs_derived = filter.needs_derived();

        if let Some(cache) = &self.cache {
            if let Some(entry) = cache.get(id)? {
                let id_perms_ts = self.marker(&row, ID_PERMS_COL)?;
                let latest_ts = if needs_derived { self.marker(&row, LATEST_COL)? } else { None };
                if entry.is_fresh(needs_derived, id_perms_ts, latest_ts) {
                    cache.record_hit();
                    return Ok(Some(entry.record.filtered(filter)));
                }
                debug!(id = %id, "stale cache entry");
                cache.evict(id)?;
            }
            cache.record_miss();
        }

        let range = if needs_derived {
            ColumnRange::All
        } else {
            ColumnRange::starting_at(PROPERTY_REGION_START)
        };
        let cells = self.store.read_row(OBJ_TABLE, &row, &range)?;
        let Some(decoded) = decode_row(*id, cells)? else {
            return Ok(None);
        };
        let record = decoded.record.filtered(filter);

        if let Some(cache) = &self.cache {
            if cacheable && !self.schemas.is_cache_excluded(&decoded.record.obj_type) {
                cache.insert(
                    *id,
                    CachedObject {
                        record: decoded.record,
                        id_perms_ts: decoded.id_perms_ts,
                        latest_ts: decoded.latest_ts,
                        complete: needs_derived,
                    },
                )?;
            }
        }
        Ok(Some(record))
    }

    fn marker(&self, row: &str, column: &str) -> GraphResult<Option<CellTimestamp>> {
        Ok(self.store.get(OBJ_TABLE, row, column)?.map(|c| c.timestamp))
    }

    /// Read elements of list or map fields with their position or key,
    /// optionally restricted to one position/key.
    pub fn prop_collection_read(
        &self,
        id: &ObjectId,
        fields: &[&str],
        position: Option<&str>,
    ) -> GraphResult<BTreeMap<String, Vec<(Value, String)>>> {
        let row = id.to_string();
        let obj_type = self.uuid_to_obj_type(id)?;
        let schema = self.schemas.require(&obj_type)?;
        let mut result = BTreeMap::new();
        for field in fields {
            let kind = schema.field_kind(field);
            let (prefix, exact) = match kind {
                Some(FieldKind::List) => (list_prefix(field), position.map(|p| list_col(field, p))),
                Some(FieldKind::Map) => (map_prefix(field), position.map(|p| map_col(field, p))),
                _ => return Err(invalid_field(schema, field)),
            };
            let cells = match exact {
                Some(column) => self
                    .store
                    .get(OBJ_TABLE, &row, &column)?
                    .map(|cell| vec![(column, cell)])
                    .unwrap_or_default(),
                None => self.store.read_row(OBJ_TABLE, &row, &ColumnRange::prefix(prefix.as_str()))?,
            };
            let mut elements = Vec::with_capacity(cells.len());
            for (column, cell) in cells {
                let addr = column[prefix.len()..].to_string();
                elements.push((PropertyCodec::decode_value(field, &cell.value)?, addr));
            }
            if kind == Some(FieldKind::List) {
                elements.sort_by(|(_, a), (_, b)| compare_positions(a, b));
            }
            result.insert(field.to_string(), elements);
        }
        Ok(result)
    }

    // ----- update -----

    /// Apply a partial update. Scalars are overwritten; lists, maps and
    /// reference sets are diffed against storage. `id_perms.last_modified`
    /// is always refreshed.
    pub fn update(&self, id: &ObjectId, update: ObjectUpdate) -> GraphResult<()> {
        let row = id.to_string();
        let cells = self
            .store
            .read_row(OBJ_TABLE, &row, &ColumnRange::starting_at(PROPERTY_REGION_START))?;
        let current = decode_row(*id, cells)?
            .ok_or_else(|| GraphError::NotFound(format!("object {id}")))?;
        let obj_type = current.record.obj_type.clone();
        let schema = self.schemas.require(&obj_type)?;
        let me = ObjRef::new(obj_type.clone(), *id);
        let mut batch = WriteBatch::new();

        let mut perms_input = None;
        for (field, value) in &update.props {
            check_field(schema, field, FieldKind::Scalar)?;
            if field == "id_perms" {
                perms_input = value.clone().filter(|v| !v.is_null());
                continue;
            }
            PropertyCodec::encode_scalar(field, value.as_ref())?.apply_to(&mut batch, OBJ_TABLE, &row);
        }
        let base = perms_input.or_else(|| current.record.props.get("id_perms").cloned());
        let perms = stamp_id_perms(base, &now_timestamp());
        PropertyCodec::encode_scalar("id_perms", Some(&perms))?.apply_to(&mut batch, OBJ_TABLE, &row);

        for (field, values) in &update.prop_lists {
            check_field(schema, field, FieldKind::List)?;
            let existing = current.list_positions.get(field).map(Vec::as_slice).unwrap_or_default();
            PropertyCodec::encode_list(field, values.as_deref(), existing)?
                .apply_to(&mut batch, OBJ_TABLE, &row);
        }
        for (field, values) in &update.prop_maps {
            check_field(schema, field, FieldKind::Map)?;
            let key_field = map_key_field(schema, field)?;
            let existing = current.map_keys.get(field).map(Vec::as_slice).unwrap_or_default();
            PropertyCodec::encode_map(field, key_field, values.as_deref(), existing)?
                .apply_to(&mut batch, OBJ_TABLE, &row);
        }

        for (to_type, specs) in &update.refs {
            if !schema.has_ref(to_type) {
                return Err(invalid_field(schema, &format!("{to_type}_refs")));
            }
            let mut wanted: BTreeMap<ObjectId, Option<Value>> = BTreeMap::new();
            for spec in specs {
                if spec.obj_type != *to_type {
                    return Err(invalid_field(schema, &format!("{}_refs", spec.obj_type)));
                }
                let target = self.resolve_ref(spec)?;
                wanted.insert(target.uuid, spec.attr.clone());
            }
            let existing: BTreeMap<ObjectId, Option<Value>> = current
                .record
                .refs_to(to_type)
                .map(|r| (r.uuid, r.attr.clone()))
                .collect();
            for old in existing.keys() {
                if !wanted.contains_key(old) {
                    self.index.unlink_ref(&mut batch, &me, &ObjRef::new(to_type.clone(), *old))?;
                }
            }
            for (target, attr) in &wanted {
                if existing.get(target) != Some(attr) {
                    self.index
                        .link_ref(&mut batch, &me, &ObjRef::new(to_type.clone(), *target), attr.as_ref())?;
                }
            }
        }

        self.index.touch_activity(&mut batch, &me)?;
        self.store.apply(batch)?;
        if let Some(cache) = &self.cache {
            cache.evict(id)?;
        }
        debug!(obj_type = %obj_type, id = %id, "object updated");
        Ok(())
    }

    // ----- delete -----

    /// Unlink parent, references and name index, then drop the row.
    ///
    /// Leftovers of an earlier partial delete are tolerated: edges whose
    /// other end is already gone are removed without error.
    pub fn delete(&self, id: &ObjectId) -> GraphResult<()> {
        let row = id.to_string();
        let cells = self.store.read_row(OBJ_TABLE, &row, &ColumnRange::All)?;
        if cells.is_empty() {
            return Err(GraphError::NotFound(format!("object {id}")));
        }

        let mut obj_type: Option<String> = None;
        let mut fq_name: Option<FqName> = None;
        let mut parents = Vec::new();
        let mut refs = Vec::new();
        for (column, cell) in &cells {
            match Column::parse(column) {
                Column::Type => obj_type = serde_json::from_str(&cell.value).ok(),
                Column::FqName => fq_name = serde_json::from_str(&cell.value).ok(),
                Column::Parent(t, pid) => parents.push(ObjRef::new(t, pid)),
                Column::Ref(t, tid) => refs.push(ObjRef::new(t, tid)),
                _ => {}
            }
        }

        let me = ObjRef::new(obj_type.clone().unwrap_or_default(), *id);
        let mut batch = WriteBatch::new();
        for parent in &parents {
            self.index.unlink_child(&mut batch, parent, &me)?;
        }
        for target in &refs {
            if target.uuid != *id {
                self.index.unlink_ref(&mut batch, &me, target)?;
            }
        }
        match (&obj_type, &fq_name) {
            (Some(t), Some(fq)) => self.index.deindex_name(&mut batch, t, fq, id),
            _ => warn!(id = %id, "deleting object without type or name; index left untouched"),
        }
        batch.delete_row(OBJ_TABLE, &row);

        self.store.apply(batch)?;
        if let Some(cache) = &self.cache {
            cache.evict(id)?;
            cache.evict_name(id)?;
        }
        debug!(id = %id, obj_type = obj_type.as_deref().unwrap_or("?"), "object deleted");
        Ok(())
    }

    // ----- list -----

    /// Deduplicated matches of `query`, ordered by name.
    pub fn list(&self, query: &ListQuery) -> GraphResult<Vec<ListEntry>> {
        self.schemas.require(&query.obj_type)?;
        let mut found: BTreeMap<ObjectId, Option<FqName>> = BTreeMap::new();
        match &query.scope {
            ListScope::All => {
                for (fq_name, id) in self.index.entries(&query.obj_type)? {
                    found.insert(id, Some(fq_name));
                }
            }
            ListScope::Parents(parents) => {
                let prefix = children_prefix(&query.obj_type);
                for parent in parents {
                    for id in self.edge_ids(parent, &prefix)? {
                        found.insert(id, None);
                    }
                }
            }
            ListScope::BackRefs(anchors) => {
                for anchor in anchors {
                    for id in self.edge_ids(anchor, &backref_prefix(&query.obj_type))? {
                        found.insert(id, None);
                    }
                    // same-type references are mirrored as ref: cells
                    let anchor_type = self.store.get_value(OBJ_TABLE, &anchor.to_string(), TYPE_COL)?;
                    if anchor_type.as_deref() == Some(to_json(&query.obj_type)?.as_str()) {
                        for id in self.edge_ids(anchor, &ref_prefix(&query.obj_type))? {
                            found.insert(id, None);
                        }
                    }
                }
            }
            ListScope::Ids(ids) => {
                let wanted = to_json(&query.obj_type)?;
                for id in ids {
                    let t = self.store.get_value(OBJ_TABLE, &id.to_string(), TYPE_COL)?;
                    if t.as_deref() == Some(wanted.as_str()) {
                        found.insert(*id, None);
                    }
                }
            }
        }

        let mut entries = Vec::with_capacity(found.len());
        for (id, fq_name) in found {
            let row = id.to_string();
            let fq_name = match fq_name {
                Some(fq) => fq,
                None => match self.store.get_value(OBJ_TABLE, &row, FQ_NAME_COL)? {
                    Some(raw) => serde_json::from_str(&raw)
                        .map_err(|e| GraphError::Serialization(format!("fq_name of {id}: {e}")))?,
                    None => {
                        debug!(id = %id, "dangling edge skipped in list");
                        continue;
                    }
                },
            };
            if !query.filters.is_empty() && !self.matches_filters(&row, query)? {
                continue;
            }
            entries.push(ListEntry { uuid: id, fq_name });
        }
        entries.sort_by(|a, b| a.fq_name.cmp(&b.fq_name).then(a.uuid.cmp(&b.uuid)));
        Ok(entries)
    }

    pub fn count(&self, query: &ListQuery) -> GraphResult<usize> {
        Ok(self.list(query)?.len())
    }

    /// Read the listed objects themselves.
    pub fn list_records(&self, query: &ListQuery, filter: &FieldFilter) -> GraphResult<Vec<ObjectRecord>> {
        let ids: Vec<ObjectId> = self.list(query)?.into_iter().map(|e| e.uuid).collect();
        if ids.len() == 1 {
            // a concurrent delete must not turn a listing into NotFound
            return Ok(self.read_cached(&ids[0], filter, self.cache.is_some())?.into_iter().collect());
        }
        self.read(&ids, filter)
    }

    fn edge_ids(&self, anchor: &ObjectId, prefix: &str) -> GraphResult<Vec<ObjectId>> {
        let cells = self
            .store
            .read_row(OBJ_TABLE, &anchor.to_string(), &ColumnRange::prefix(prefix))?;
        Ok(cells
            .iter()
            .filter_map(|(column, _)| ObjectId::parse(&column[prefix.len()..]).ok())
            .collect())
    }

    fn matches_filters(&self, row: &str, query: &ListQuery) -> GraphResult<bool> {
        for filter in &query.filters {
            let column = prop_col(&filter.field);
            let Some(raw) = self.store.get_value(OBJ_TABLE, row, &column)? else {
                return Ok(false);
            };
            let value = PropertyCodec::decode_value(&filter.field, &raw)?;
            if !filter.matches(&value) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    // ----- name lookups -----

    pub fn fq_name_to_uuid(&self, obj_type: &str, fq_name: &FqName) -> GraphResult<ObjectId> {
        self.index.name_to_id(obj_type, fq_name)
    }

    pub fn uuid_to_fq_name(&self, id: &ObjectId) -> GraphResult<FqName> {
        Ok(self.lookup_id(id)?.0)
    }

    pub fn uuid_to_obj_type(&self, id: &ObjectId) -> GraphResult<String> {
        Ok(self.lookup_id(id)?.1)
    }

    fn lookup_id(&self, id: &ObjectId) -> GraphResult<(FqName, String)> {
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get_name(id)? {
                return Ok(hit);
            }
        }
        let (fq_name, obj_type) = self.index.id_to_name(id)?;
        if let Some(cache) = &self.cache {
            cache.put_name(*id, fq_name.clone(), obj_type.clone())?;
        }
        Ok((fq_name, obj_type))
    }

    fn resolve_ref(&self, spec: &RefSpec) -> GraphResult<ObjRef> {
        let id = match &spec.target {
            RefTarget::Name(fq_name) => self.index.name_to_id(&spec.obj_type, fq_name)?,
            RefTarget::Id(id) => {
                let (_, obj_type) = self.index.id_to_name(id)?;
                if obj_type != spec.obj_type {
                    return Err(GraphError::NotFound(format!("{} {id}", spec.obj_type)));
                }
                *id
            }
        };
        Ok(ObjRef::new(spec.obj_type.clone(), id))
    }
}

impl std::fmt::Debug for ObjectGraphStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectGraphStore")
            .field("types", &self.schemas.type_names().count())
            .field("cache", &self.cache)
            .finish()
    }
}

fn check_field(schema: &TypeSchema, field: &str, expected: FieldKind) -> GraphResult<()> {
    if schema.field_kind(field) == Some(expected) {
        Ok(())
    } else {
        Err(invalid_field(schema, field))
    }
}

fn invalid_field(schema: &TypeSchema, field: &str) -> GraphError {
    GraphError::InvalidField { obj_type: schema.name().to_string(), field: field.to_string() }
}

fn map_key_field<'a>(schema: &'a TypeSchema, field: &str) -> GraphResult<&'a str> {
    schema.map_key(field).ok_or_else(|| invalid_field(schema, field))
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> GraphResult<String> {
    serde_json::to_string(value).map_err(|e| GraphError::Serialization(e.to_string()))
}

/// Decode a row. `None` when the row has no `type` cell (absent, or only
/// orphaned edge cells remain).
fn decode_row(id: ObjectId, cells: Vec<(String, Cell)>) -> GraphResult<Option<DecodedRow>> {
    let mut obj_type: Option<String> = None;
    let mut fq_name: Option<FqName> = None;
    let mut parent = None;
    let mut props = BTreeMap::new();
    let mut lists: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
    let mut maps: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
    let mut refs = Vec::new();
    let mut back_refs = Vec::new();
    let mut children = Vec::new();
    let mut id_perms_ts = None;
    let mut latest_ts = None;

    for (column, cell) in cells {
        let parsed = Column::parse(&column);
        match parsed {
            Column::Type => {
                obj_type = Some(serde_json::from_str(&cell.value).map_err(|e| GraphError::Corrupt {
                    id,
                    reason: format!("type: {e}"),
                })?);
            }
            Column::FqName => {
                fq_name = Some(serde_json::from_str(&cell.value).map_err(|e| GraphError::Corrupt {
                    id,
                    reason: format!("fq_name: {e}"),
                })?);
            }
            Column::Meta(_) if column == LATEST_COL => latest_ts = Some(cell.timestamp),
            Column::Meta(_) => {}
            Column::Prop(field) => {
                if column == ID_PERMS_COL {
                    id_perms_ts = Some(cell.timestamp);
                }
                let value = PropertyCodec::decode_value(&field, &cell.value)?;
                props.insert(field, value);
            }
            Column::ListElement { field, position } => {
                lists.entry(field).or_default().push((position, cell.value));
            }
            Column::MapElement { field, key } => {
                maps.entry(field).or_default().push((key, cell.value));
            }
            Column::Parent(t, pid) => {
                if parent.is_none() {
                    parent = Some(ObjRef::new(t, pid));
                }
            }
            Column::Child(t, cid) => children.push(ObjRef::new(t, cid)),
            Column::Ref(t, rid) => refs.push(ref_edge(t, rid, &cell.value)?),
            Column::BackRef(t, rid) => back_refs.push(ref_edge(t, rid, &cell.value)?),
            Column::Unknown(name) => debug!(id = %id, column = %name, "ignoring unknown column"),
        }
    }

    let Some(obj_type) = obj_type else {
        return Ok(None);
    };
    let fq_name = fq_name.ok_or_else(|| GraphError::Corrupt { id, reason: "missing fq_name".into() })?;

    let list_positions = lists
        .iter()
        .map(|(f, els)| (f.clone(), els.iter().map(|(p, _)| p.clone()).collect()))
        .collect();
    let map_keys = maps
        .iter()
        .map(|(f, els)| (f.clone(), els.iter().map(|(k, _)| k.clone()).collect()))
        .collect();
    let mut prop_lists = BTreeMap::new();
    for (field, elements) in lists {
        let values = PropertyCodec::decode_list(&field, elements)?;
        prop_lists.insert(field, values);
    }
    let mut prop_maps = BTreeMap::new();
    for (field, elements) in maps {
        let values = PropertyCodec::decode_map(&field, elements)?;
        prop_maps.insert(field, values);
    }

    Ok(Some(DecodedRow {
        record: ObjectRecord {
            uuid: id,
            obj_type,
            fq_name,
            parent,
            props,
            prop_lists,
            prop_maps,
            refs,
            back_refs,
            children,
        },
        id_perms_ts,
        latest_ts,
        list_positions,
        map_keys,
    }))
}

fn ref_edge(obj_type: String, uuid: ObjectId, raw: &str) -> GraphResult<RefEdge> {
    let data: RefData = serde_json::from_str(raw)
        .map_err(|e| GraphError::Serialization(format!("ref to {uuid}: {e}")))?;
    Ok(RefEdge { obj_type, uuid, attr: data.attr })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::PropFilter;
    use cfgdb_store::InMemoryCellStore;
    use proptest::prelude::*;
    use serde_json::json;

    fn fq(parts: &[&str]) -> FqName {
        FqName::new(parts.iter().copied()).unwrap()
    }

    fn engine_on(store: &Arc<dyn CellStore>, cache_entries: usize) -> ObjectGraphStore {
        ObjectGraphStore::with_cache(store.clone(), Arc::new(SchemaRegistry::builtin()), cache_entries)
    }

    fn setup() -> (Arc<dyn CellStore>, ObjectGraphStore) {
        let store: Arc<dyn CellStore> = Arc::new(InMemoryCellStore::new());
        let db = engine_on(&store, 0);
        (store, db)
    }

    /// Domain `d` and project `d:p`.
    fn seed(db: &ObjectGraphStore) -> (ObjectId, ObjectId) {
        let domain = db.create(NewObject::new("domain", fq(&["d"]))).unwrap();
        let project = db
            .create(NewObject::new("project", fq(&["d", "p"])).with_parent("domain"))
            .unwrap();
        (domain, project)
    }

    fn vn(name: &str) -> NewObject {
        NewObject::new("virtual_network", fq(&["d", "p", name])).with_parent("project")
    }

    // ----- create / read -----

    #[test]
    fn create_and_read_back() {
        let (_, db) = setup();
        let (_, project) = seed(&db);
        let id = db
            .create(
                vn("vn1")
                    .prop("is_shared", json!(true))
                    .list("route_target_list", vec![json!("target:1:1"), json!("target:1:2")])
                    .map(
                        "ipam_subnets",
                        vec![json!({"subnet_uuid": "s1", "prefix": "10.0.0.0/24"})],
                    ),
            )
            .unwrap();

        let r = db.read_one(&id, &FieldFilter::all()).unwrap();
        assert_eq!(r.obj_type, "virtual_network");
        assert_eq!(r.fq_name, fq(&["d", "p", "vn1"]));
        assert_eq!(r.parent, Some(ObjRef::new("project", project)));
        assert_eq!(r.prop("is_shared"), Some(&json!(true)));
        assert_eq!(r.prop("display_name"), Some(&json!("vn1")));
        assert_eq!(r.prop_lists["route_target_list"], vec![json!("target:1:1"), json!("target:1:2")]);
        assert_eq!(r.prop_maps["ipam_subnets"].len(), 1);
        let perms = r.prop("id_perms").unwrap();
        assert_eq!(perms["created"], perms["last_modified"]);

        let p = db.read_one(&project, &FieldFilter::all()).unwrap();
        assert_eq!(p.children_of("virtual_network").map(|c| c.uuid).collect::<Vec<_>>(), vec![id]);
    }

    #[test]
    fn create_validates_parent() {
        let (_, db) = setup();
        seed(&db);
        let err = db
            .create(NewObject::new("virtual_network", fq(&["d", "vn"])).with_parent("domain"))
            .unwrap_err();
        assert!(matches!(err, GraphError::InvalidParent { .. }));

        let err = db
            .create(NewObject::new("virtual_network", fq(&["d", "nope", "vn"])).with_parent("project"))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn create_rejects_duplicate_name_and_id() {
        let (_, db) = setup();
        seed(&db);
        let first = db.create(vn("vn1")).unwrap();
        let err = db.create(vn("vn1")).unwrap_err();
        assert!(matches!(err, GraphError::NameConflict { existing, .. } if existing == first));

        let err = db.create(vn("vn2").with_uuid(first)).unwrap_err();
        assert!(matches!(err, GraphError::AlreadyExists(id) if id == first));
    }

    #[test]
    fn create_never_stores_null_properties() {
        let (store, db) = setup();
        seed(&db);
        let id = db
            .create(
                vn("vn1")
                    .prop("is_shared", Value::Null)
                    .prop("display_name", Value::Null)
                    .list("route_target_list", vec![Value::Null, json!("target:1:1")]),
            )
            .unwrap();
        let row = id.to_string();
        assert!(store.get(OBJ_TABLE, &row, "prop:is_shared").unwrap().is_none());
        let cells = store.read_row(OBJ_TABLE, &row, &ColumnRange::All).unwrap();
        assert!(cells
            .iter()
            .filter(|(c, _)| c.starts_with("prop"))
            .all(|(_, cell)| cell.value != "null"));
        let r = db.read_one(&id, &FieldFilter::properties_only()).unwrap();
        assert_eq!(r.prop("display_name"), Some(&json!("vn1")));
        assert_eq!(r.prop_lists["route_target_list"], vec![json!("target:1:1")]);
    }

    #[test]
    fn create_rejects_undeclared_fields() {
        let (_, db) = setup();
        seed(&db);
        let err = db.create(vn("vn1").prop("bogus", json!(1))).unwrap_err();
        assert!(matches!(err, GraphError::InvalidField { ref field, .. } if field == "bogus"));
        // list field passed as scalar
        let err = db.create(vn("vn1").prop("route_target_list", json!([]))).unwrap_err();
        assert!(matches!(err, GraphError::InvalidField { .. }));
        let err = db.create(NewObject::new("gadget", fq(&["g"]))).unwrap_err();
        assert!(matches!(err, GraphError::Type(_)));
    }

    #[test]
    fn single_missing_read_fails_multi_read_skips() {
        let (_, db) = setup();
        let (domain, _) = seed(&db);
        let missing = ObjectId::new();
        assert!(db.read(&[missing], &FieldFilter::all()).unwrap_err().is_not_found());
        assert!(db.read(&[missing, ObjectId::new()], &FieldFilter::all()).unwrap().is_empty());
        let found = db.read(&[missing, domain], &FieldFilter::all()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].uuid, domain);
    }

    #[test]
    fn property_read_skips_derived_regions() {
        let (_, db) = setup();
        let (_, project) = seed(&db);
        db.create(vn("vn1")).unwrap();
        let r = db.read_one(&project, &FieldFilter::properties_only()).unwrap();
        assert!(r.children.is_empty());
        let r = db.read_one(&project, &FieldFilter::all()).unwrap();
        assert_eq!(r.children.len(), 1);
    }

    // ----- references -----

    #[test]
    fn cross_type_reference_symmetry() {
        let (_, db) = setup();
        seed(&db);
        let ipam = db
            .create(NewObject::new("network_ipam", fq(&["d", "p", "ipam"])).with_parent("project"))
            .unwrap();
        let attr = json!({"ipam_subnets": [{"subnet": "10.0.0.0/24"}]});
        let net = db
            .create(vn("vn1").reference(
                RefSpec::to_name("network_ipam", fq(&["d", "p", "ipam"])).with_attr(attr.clone()),
            ))
            .unwrap();

        let v = db.read_one(&net, &FieldFilter::all()).unwrap();
        let edge = v.refs_to("network_ipam").next().unwrap();
        assert_eq!((edge.uuid, edge.attr.clone()), (ipam, Some(attr)));
        let i = db.read_one(&ipam, &FieldFilter::all()).unwrap();
        assert_eq!(i.back_refs_from("virtual_network").map(|r| r.uuid).collect::<Vec<_>>(), vec![net]);

        db.update(&net, ObjectUpdate::new().set_refs("network_ipam", vec![])).unwrap();
        let i = db.read_one(&ipam, &FieldFilter::all()).unwrap();
        assert!(i.back_refs.is_empty());
        assert_eq!(db.read_one(&net, &FieldFilter::all()).unwrap().refs.len(), 0);
    }

    #[test]
    fn delete_removes_backrefs() {
        let (_, db) = setup();
        seed(&db);
        let ipam = db
            .create(NewObject::new("network_ipam", fq(&["d", "p", "ipam"])).with_parent("project"))
            .unwrap();
        let net = db.create(vn("vn1").reference(RefSpec::to_id("network_ipam", ipam))).unwrap();
        db.delete(&net).unwrap();
        let i = db.read_one(&ipam, &FieldFilter::all()).unwrap();
        assert!(i.back_refs.is_empty());
        assert!(!db.exists(&net).unwrap());
    }

    #[test]
    fn same_type_reference_is_visible_from_both_ends() {
        let (_, db) = setup();
        seed(&db);
        let a = db.create(NewObject::new("virtual_machine_interface", fq(&["d", "p", "a"])).with_parent("project")).unwrap();
        let b = db
            .create(
                NewObject::new("virtual_machine_interface", fq(&["d", "p", "b"]))
                    .with_parent("project")
                    .reference(RefSpec::to_id("virtual_machine_interface", a)),
            )
            .unwrap();
        let ra = db.read_one(&a, &FieldFilter::properties_only()).unwrap();
        assert_eq!(ra.refs_to("virtual_machine_interface").map(|r| r.uuid).collect::<Vec<_>>(), vec![b]);

        db.delete(&b).unwrap();
        let ra = db.read_one(&a, &FieldFilter::properties_only()).unwrap();
        assert!(ra.refs.is_empty());
    }

    #[test]
    fn reference_to_wrong_type_rejected() {
        let (_, db) = setup();
        let (domain, _) = seed(&db);
        let err = db.create(vn("vn1").reference(RefSpec::to_id("network_ipam", domain))).unwrap_err();
        assert!(err.is_not_found());
        let err = db.create(vn("vn1").reference(RefSpec::to_id("project", domain))).unwrap_err();
        assert!(matches!(err, GraphError::InvalidField { .. }));
    }

    // ----- update -----

    #[test]
    fn update_diffs_lists_and_maps() {
        let (store, db) = setup();
        seed(&db);
        let id = db
            .create(
                vn("vn1")
                    .list("route_target_list", vec![json!("a"), json!("b"), json!("c")])
                    .map("ipam_subnets", vec![json!({"subnet_uuid": "s1"}), json!({"subnet_uuid": "s2"})]),
            )
            .unwrap();
        db.update(
            &id,
            ObjectUpdate::new()
                .set_list("route_target_list", Some(vec![json!("z")]))
                .set_map("ipam_subnets", Some(vec![json!({"subnet_uuid": "s3"})])),
        )
        .unwrap();

        let r = db.read_one(&id, &FieldFilter::properties_only()).unwrap();
        assert_eq!(r.prop_lists["route_target_list"], vec![json!("z")]);
        assert_eq!(r.prop_maps["ipam_subnets"], vec![json!({"subnet_uuid": "s3"})]);
        let row = id.to_string();
        assert!(store.get(OBJ_TABLE, &row, "propl:route_target_list:2").unwrap().is_none());
        assert!(store.get(OBJ_TABLE, &row, "propm:ipam_subnets:s1").unwrap().is_none());

        db.update(&id, ObjectUpdate::new().set_list("route_target_list", None)).unwrap();
        let r = db.read_one(&id, &FieldFilter::properties_only()).unwrap();
        assert!(!r.prop_lists.contains_key("route_target_list"));
    }

    #[test]
    fn update_refreshes_last_modified() {
        let (_, db) = setup();
        seed(&db);
        let id = db.create(vn("vn1")).unwrap();
        let before = db.read_one(&id, &FieldFilter::properties_only()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        db.update(
            &id,
            ObjectUpdate::new()
                .set("is_shared", json!(true))
                .set("id_perms", json!({"last_modified": "1999-01-01T00:00:00", "enable": false})),
        )
        .unwrap();
        let after = db.read_one(&id, &FieldFilter::properties_only()).unwrap();
        let (b, a) = (&before.props["id_perms"], &after.props["id_perms"]);
        assert_ne!(a["last_modified"], json!("1999-01-01T00:00:00"));
        assert_ne!(a["last_modified"], b["last_modified"]);
        assert_eq!(a["enable"], json!(false));
        assert_eq!(after.prop("is_shared"), Some(&json!(true)));
    }

    #[test]
    fn update_clears_scalar() {
        let (_, db) = setup();
        seed(&db);
        let id = db.create(vn("vn1").prop("is_shared", json!(true))).unwrap();
        db.update(&id, ObjectUpdate::new().clear("is_shared")).unwrap();
        let r = db.read_one(&id, &FieldFilter::properties_only()).unwrap();
        assert!(r.prop("is_shared").is_none());
        assert!(db.update(&ObjectId::new(), ObjectUpdate::new()).unwrap_err().is_not_found());
    }

    #[test]
    fn update_to_null_removes_cell() {
        let (store, db) = setup();
        seed(&db);
        let id = db.create(vn("vn1").prop("is_shared", json!(true))).unwrap();
        db.update(&id, ObjectUpdate::new().set("is_shared", Value::Null)).unwrap();
        assert!(store.get(OBJ_TABLE, &id.to_string(), "prop:is_shared").unwrap().is_none());
        let r = db.read_one(&id, &FieldFilter::properties_only()).unwrap();
        assert!(r.prop("is_shared").is_none());

        db.update(&id, ObjectUpdate::new().set("id_perms", Value::Null)).unwrap();
        let r = db.read_one(&id, &FieldFilter::properties_only()).unwrap();
        assert_eq!(r.props["id_perms"]["enable"], json!(true));
    }

    // ----- delete -----

    #[test]
    fn delete_unlinks_and_deindexes() {
        let (_, db) = setup();
        let (_, project) = seed(&db);
        let id = db.create(vn("vn1")).unwrap();
        db.delete(&id).unwrap();
        assert!(db.fq_name_to_uuid("virtual_network", &fq(&["d", "p", "vn1"])).unwrap_err().is_not_found());
        let p = db.read_one(&project, &FieldFilter::all()).unwrap();
        assert!(p.children.is_empty());
        assert!(db.delete(&id).unwrap_err().is_not_found());
        // the name is free again
        db.create(vn("vn1")).unwrap();
    }

    #[test]
    fn delete_tolerates_missing_parent() {
        let (store, db) = setup();
        let (_, project) = seed(&db);
        let id = db.create(vn("vn1")).unwrap();
        let mut batch = WriteBatch::new();
        batch.delete_row(OBJ_TABLE, &project.to_string());
        store.apply(batch).unwrap();

        db.delete(&id).unwrap();
        assert!(!store.row_exists(OBJ_TABLE, &id.to_string()).unwrap());
        // no resurrected parent row
        assert!(!store.row_exists(OBJ_TABLE, &project.to_string()).unwrap());
    }

    // ----- list -----

    #[test]
    fn list_scopes_and_filters() {
        let (_, db) = setup();
        let (_, project) = seed(&db);
        let ipam = db
            .create(NewObject::new("network_ipam", fq(&["d", "p", "ipam"])).with_parent("project"))
            .unwrap();
        let a = db
            .create(vn("a").prop("is_shared", json!(true)).reference(RefSpec::to_id("network_ipam", ipam)))
            .unwrap();
        let b = db.create(vn("b").prop("is_shared", json!(false))).unwrap();

        let ids = |entries: Vec<ListEntry>| entries.into_iter().map(|e| e.uuid).collect::<Vec<_>>();
        assert_eq!(ids(db.list(&ListQuery::all("virtual_network")).unwrap()), vec![a, b]);
        assert_eq!(ids(db.list(&ListQuery::children_of("virtual_network", vec![project, project])).unwrap()), vec![a, b]);
        assert_eq!(ids(db.list(&ListQuery::referring_to("virtual_network", vec![ipam])).unwrap()), vec![a]);
        assert_eq!(ids(db.list(&ListQuery::ids("virtual_network", vec![b, ipam])).unwrap()), vec![b]);
        let shared = ListQuery::all("virtual_network").filter(PropFilter::new("is_shared", json!(true)));
        assert_eq!(ids(db.list(&shared).unwrap()), vec![a]);
        assert_eq!(db.count(&ListQuery::all("virtual_network")).unwrap(), 2);

        let records = db.list_records(&ListQuery::all("virtual_network"), &FieldFilter::properties_only()).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn prop_collection_read_by_position() {
        let (_, db) = setup();
        seed(&db);
        let id = db
            .create(vn("vn1").list("route_target_list", (0..12).map(|i| json!(i)).collect()))
            .unwrap();
        let all = db.prop_collection_read(&id, &["route_target_list"], None).unwrap();
        let values: Vec<Value> = all["route_target_list"].iter().map(|(v, _)| v.clone()).collect();
        assert_eq!(values, (0..12).map(|i| json!(i)).collect::<Vec<_>>());

        let one = db.prop_collection_read(&id, &["route_target_list"], Some("10")).unwrap();
        assert_eq!(one["route_target_list"], vec![(json!(10), "10".to_string())]);
        assert!(db.prop_collection_read(&id, &["is_shared"], None).is_err());
    }

    #[test]
    fn name_lookups() {
        let (_, db) = setup();
        let (domain, _) = seed(&db);
        assert_eq!(db.fq_name_to_uuid("domain", &fq(&["d"])).unwrap(), domain);
        assert_eq!(db.uuid_to_fq_name(&domain).unwrap(), fq(&["d"]));
        assert_eq!(db.uuid_to_obj_type(&domain).unwrap(), "domain");
    }

    // ----- cache -----

    #[test]
    fn cache_hits_when_unchanged() {
        let store: Arc<dyn CellStore> = Arc::new(InMemoryCellStore::new());
        let db = engine_on(&store, 16);
        let (domain, _) = seed(&db);
        db.read_one(&domain, &FieldFilter::all()).unwrap();
        db.read_one(&domain, &FieldFilter::all()).unwrap();
        db.read_one(&domain, &FieldFilter::properties_only()).unwrap();
        let stats = db.cache().unwrap().stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
    }

    #[test]
    fn cache_detects_write_from_other_instance() {
        let store: Arc<dyn CellStore> = Arc::new(InMemoryCellStore::new());
        let reader = engine_on(&store, 16);
        let writer = engine_on(&store, 0);
        seed(&writer);
        let id = writer.create(vn("vn1").prop("is_shared", json!(false))).unwrap();

        let r = reader.read_one(&id, &FieldFilter::properties_only()).unwrap();
        assert_eq!(r.prop("is_shared"), Some(&json!(false)));

        writer.update(&id, ObjectUpdate::new().set("is_shared", json!(true))).unwrap();
        let r = reader.read_one(&id, &FieldFilter::properties_only()).unwrap();
        assert_eq!(r.prop("is_shared"), Some(&json!(true)));
        assert_eq!(reader.cache().unwrap().stats().hits, 0);
    }

    #[test]
    fn cache_detects_new_child_via_activity_marker() {
        let store: Arc<dyn CellStore> = Arc::new(InMemoryCellStore::new());
        let reader = engine_on(&store, 16);
        let writer = engine_on(&store, 0);
        let (_, project) = seed(&writer);

        assert!(reader.read_one(&project, &FieldFilter::all()).unwrap().children.is_empty());
        let child = writer.create(vn("vn1")).unwrap();
        let p = reader.read_one(&project, &FieldFilter::all()).unwrap();
        assert_eq!(p.children.iter().map(|c| c.uuid).collect::<Vec<_>>(), vec![child]);
    }

    #[test]
    fn cache_detects_bypassing_store_write() {
        let store: Arc<dyn CellStore> = Arc::new(InMemoryCellStore::new());
        let db = engine_on(&store, 16);
        let (domain, _) = seed(&db);
        db.read_one(&domain, &FieldFilter::properties_only()).unwrap();

        let mut batch = WriteBatch::new();
        let row = domain.to_string();
        batch.put(OBJ_TABLE, &row, "prop:display_name", "\"renamed\"");
        batch.put(OBJ_TABLE, &row, ID_PERMS_COL, r#"{"enable":true}"#);
        store.apply(batch).unwrap();

        let r = db.read_one(&domain, &FieldFilter::properties_only()).unwrap();
        assert_eq!(r.prop("display_name"), Some(&json!("renamed")));
    }

    #[test]
    fn cache_excluded_types_are_not_cached() {
        let store: Arc<dyn CellStore> = Arc::new(InMemoryCellStore::new());
        let db = engine_on(&store, 16);
        let rt = db.create(NewObject::new("route_target", fq(&["target:1:1"]))).unwrap();
        db.read_one(&rt, &FieldFilter::all()).unwrap();
        assert!(db.cache().unwrap().is_empty());
    }

    // ----- name index uniqueness -----

    proptest! {
        #[test]
        fn name_index_tracks_live_objects(ops in prop::collection::vec((any::<bool>(), 0u8..4), 1..40)) {
            let (_, db) = setup();
            let mut live: BTreeMap<FqName, ObjectId> = BTreeMap::new();
            for (create, n) in ops {
                let name = fq(&[format!("dom{n}").as_str()]);
                if create {
                    match db.create(NewObject::new("domain", name.clone())) {
                        Ok(id) => {
                            prop_assert!(!live.contains_key(&name));
                            live.insert(name, id);
                        }
                        Err(GraphError::NameConflict { existing, .. }) => {
                            prop_assert_eq!(live.get(&name), Some(&existing));
                        }
                        Err(e) => prop_assert!(false, "unexpected error {e}"),
                    }
                } else if let Some(id) = live.remove(&name) {
                    db.delete(&id).unwrap();
                }
                let entries = db.index().entries("domain").unwrap();
                let expected: Vec<(FqName, ObjectId)> = live.iter().map(|(k, v)| (k.clone(), *v)).collect();
                prop_assert_eq!(entries, expected);
            }
        }
    }
}
