//! Paged full-table snapshot of object rows and name-index entries.

use std::collections::BTreeMap;

use cfgdb_graph::columns::{FQ_NAME_COL, FQ_TABLE, OBJ_TABLE, TYPE_COL};
use cfgdb_graph::PropertyCodec;
use cfgdb_store::{Cell, CellStore, ColumnRange};
use cfgdb_types::{FqName, ObjectId};
use serde_json::Value;
use tracing::debug;

use crate::error::AuditResult;

/// One object row exactly as stored; nothing is assumed well formed.
#[derive(Clone, Debug)]
pub struct RawObject {
    pub row: String,
    /// `None` when the row key is not a uuid.
    pub id: Option<ObjectId>,
    pub cells: BTreeMap<String, Cell>,
}

impl RawObject {
    pub fn obj_type(&self) -> Option<String> {
        serde_json::from_str(&self.cells.get(TYPE_COL)?.value).ok()
    }

    pub fn fq_name(&self) -> Option<FqName> {
        serde_json::from_str(&self.cells.get(FQ_NAME_COL)?.value).ok()
    }

    /// Decoded scalar property. A JSON `null` reads as absent.
    pub fn prop(&self, field: &str) -> Option<Value> {
        let cell = self.cells.get(&format!("prop:{field}"))?;
        match PropertyCodec::decode_value(field, &cell.value) {
            Ok(Value::Null) | Err(_) => None,
            Ok(value) => Some(value),
        }
    }

    pub fn has(&self, column: &str) -> bool {
        self.cells.contains_key(column)
    }

    /// Cells whose column starts with `prefix`, in column order.
    pub fn with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a String, &'a Cell)> {
        self.cells
            .range(prefix.to_string()..)
            .take_while(move |(column, _)| column.starts_with(prefix))
    }

    /// Type, name and id all decode.
    pub fn identity(&self) -> Option<(ObjectId, String, FqName)> {
        Some((self.id?, self.obj_type()?, self.fq_name()?))
    }
}

/// Snapshot of both tables taken at the start of an operation.
#[derive(Clone, Debug, Default)]
pub struct Inventory {
    pub objects: BTreeMap<String, RawObject>,
    /// `(obj_type, index column)` for every cell of the name index.
    pub index: Vec<(String, String)>,
}

impl Inventory {
    /// Walk both tables `page_size` rows at a time, yielding the thread
    /// between pages.
    pub fn load(store: &dyn CellStore, page_size: usize) -> AuditResult<Self> {
        let mut inventory = Inventory::default();
        let mut after: Option<String> = None;
        loop {
            let rows = store.list_rows(OBJ_TABLE, after.as_deref(), page_size)?;
            if rows.is_empty() {
                break;
            }
            let contents = store.read_rows(OBJ_TABLE, &rows, &ColumnRange::All)?;
            for (row, cells) in rows.iter().zip(contents) {
                let object = RawObject {
                    row: row.clone(),
                    id: ObjectId::parse(row).ok(),
                    cells: cells.into_iter().collect(),
                };
                inventory.objects.insert(row.clone(), object);
            }
            let done = rows.len() < page_size;
            after = rows.last().cloned();
            if done {
                break;
            }
            std::thread::yield_now();
        }

        let mut after: Option<String> = None;
        loop {
            let types = store.list_rows(FQ_TABLE, after.as_deref(), page_size)?;
            for obj_type in &types {
                for (column, _) in store.read_row(FQ_TABLE, obj_type, &ColumnRange::All)? {
                    inventory.index.push((obj_type.clone(), column));
                }
            }
            if types.len() < page_size {
                break;
            }
            after = types.last().cloned();
            std::thread::yield_now();
        }
        debug!(
            objects = inventory.objects.len(),
            index_entries = inventory.index.len(),
            "inventory loaded"
        );
        Ok(inventory)
    }

    pub fn get(&self, id: &ObjectId) -> Option<&RawObject> {
        self.objects.get(&id.to_string())
    }

    /// Whether `id` names an object with a decodable type.
    pub fn is_live(&self, id: &ObjectId) -> bool {
        self.get(id).and_then(RawObject::obj_type).is_some()
    }

    /// Well-formed objects of one type, in row order.
    pub fn of_type<'a>(&'a self, obj_type: &'a str) -> impl Iterator<Item = (ObjectId, FqName, &'a RawObject)> {
        self.objects.values().filter_map(move |o| {
            let (id, t, fq) = o.identity()?;
            (t == obj_type).then_some((id, fq, o))
        })
    }
}
