//! Mandatory-field and edge integrity operations.

use std::collections::BTreeMap;

use cfgdb_graph::columns::{
    list_prefix, map_prefix, prop_col, Column, ID_PERMS_COL, LATEST_COL, OBJ_TABLE,
};
use cfgdb_store::WriteBatch;
use cfgdb_types::SchemaRegistry;
use tracing::debug;

use crate::auditor::{Auditor, Pass};
use crate::error::AuditResult;
use crate::finding::Finding;
use crate::scan::{Inventory, RawObject};

/// Fields without which a row is not a usable object.
const CORE_FIELDS: &[&str] = &["type", "fq_name", "id_perms"];

fn missing_fields(object: &RawObject, schemas: &SchemaRegistry) -> Vec<String> {
    let mut missing = Vec::new();
    let obj_type = object.obj_type();
    if obj_type.is_none() {
        missing.push("type".to_string());
    }
    if object.fq_name().is_none() {
        missing.push("fq_name".to_string());
    }
    if !object.has(ID_PERMS_COL) {
        missing.push("id_perms".to_string());
    }
    if let Some(schema) = obj_type.as_deref().and_then(|t| schemas.get(t)) {
        for field in schema.required_fields() {
            let present = object.has(&prop_col(field))
                || object.with_prefix(&list_prefix(field)).next().is_some()
                || object.with_prefix(&map_prefix(field)).next().is_some();
            if !present {
                missing.push(field.clone());
            }
        }
    }
    missing
}

fn dangling_edges(inv: &Inventory) -> Vec<(String, String)> {
    let mut dangling = Vec::new();
    for object in inv.objects.values() {
        for column in object.cells.keys() {
            let target = match Column::parse(column) {
                Column::Parent(_, id)
                | Column::Child(_, id)
                | Column::Ref(_, id)
                | Column::BackRef(_, id) => id,
                _ => continue,
            };
            if !inv.is_live(&target) {
                dangling.push((object.row.clone(), column.clone()));
            }
        }
    }
    dangling
}

pub(crate) fn check_mandatory_fields(auditor: &Auditor, pass: &mut Pass) -> AuditResult<()> {
    let inv = auditor.inventory()?;
    let schemas = auditor.graph().schemas();
    for object in inv.objects.values() {
        for field in missing_fields(object, schemas) {
            pass.report(Finding::missing_mandatory_field(&object.row, &field));
        }
    }
    Ok(())
}

/// Rows lacking a core field are removed: through the graph when type,
/// name and id still decode, so edges and index go with them, else raw.
pub(crate) fn clean_missing_mandatory_fields(auditor: &Auditor, pass: &mut Pass) -> AuditResult<()> {
    let inv = auditor.inventory()?;
    let schemas = auditor.graph().schemas();
    for object in inv.objects.values() {
        let core: Vec<String> = missing_fields(object, schemas)
            .into_iter()
            .filter(|f| CORE_FIELDS.contains(&f.as_str()))
            .collect();
        if core.is_empty() {
            continue;
        }
        match object.identity() {
            Some((id, obj_type, fq_name)) => {
                let missing = core.join(", ");
                if pass.apply(format_args!("delete {obj_type} {fq_name} ({id}) missing {missing}")) {
                    match auditor.graph().delete(&id) {
                        Ok(()) => {}
                        Err(e) if e.is_not_found() => debug!(id = %id, "object already gone"),
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            None => {
                if pass.apply(format_args!("delete row {} missing {}", object.row, core.join(", "))) {
                    let mut batch = WriteBatch::new();
                    batch.delete_row(OBJ_TABLE, &object.row);
                    auditor.db().apply(batch)?;
                }
            }
        }
        for field in core {
            pass.report(Finding::missing_mandatory_field(&object.row, &field));
        }
    }
    Ok(())
}

pub(crate) fn check_dangling_edges(auditor: &Auditor, pass: &mut Pass) -> AuditResult<()> {
    let inv = auditor.inventory()?;
    for (row, column) in dangling_edges(&inv) {
        pass.report(Finding::orphaned_reference(&row, &column));
    }
    Ok(())
}

/// One batch per row; live rows get their activity marker touched so
/// cached readers notice.
pub(crate) fn clean_dangling_edges(auditor: &Auditor, pass: &mut Pass) -> AuditResult<()> {
    let inv = auditor.inventory()?;
    let mut by_row: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (row, column) in dangling_edges(&inv) {
        by_row.entry(row).or_default().push(column);
    }
    for (row, columns) in by_row {
        if pass.apply(format_args!("drop {} dangling edges of {row}", columns.len())) {
            let mut batch = WriteBatch::new();
            for column in &columns {
                batch.delete_cell(OBJ_TABLE, &row, column.as_str());
            }
            let touch = inv
                .objects
                .get(&row)
                .and_then(RawObject::obj_type)
                .is_some_and(|t| !auditor.graph().schemas().is_cache_excluded(&t));
            if touch {
                batch.put(OBJ_TABLE, &row, LATEST_COL, "null");
            }
            auditor.db().apply(batch)?;
        }
        for column in columns {
            pass.report(Finding::orphaned_reference(&row, &column));
        }
    }
    Ok(())
}
