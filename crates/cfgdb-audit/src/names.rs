//! Name-index operations.

use std::collections::{BTreeMap, BTreeSet};

use cfgdb_graph::columns::{index_col, parse_index_col, FQ_TABLE};
use cfgdb_graph::GraphError;
use cfgdb_store::WriteBatch;
use cfgdb_types::{FqName, ObjectId};
use tracing::{debug, warn};

use crate::auditor::{Auditor, Pass};
use crate::error::AuditResult;
use crate::finding::{Finding, FindingKind};
use crate::scan::Inventory;

/// Cross-match index entries with object rows in both directions.
pub(crate) fn fq_index_findings(inv: &Inventory) -> Vec<Finding> {
    let mut findings = Vec::new();
    let mut indexed: BTreeSet<(String, ObjectId)> = BTreeSet::new();
    for (obj_type, column) in &inv.index {
        let Some((fq_name, id)) = parse_index_col(column) else {
            findings.push(Finding::stale_index(obj_type, column, "malformed entry"));
            continue;
        };
        let stored = inv.get(&id).and_then(|o| Some((o.obj_type()?, o.fq_name()?)));
        match stored {
            None => findings.push(Finding::stale_index(obj_type, column, "object missing")),
            Some((actual_type, actual)) if actual_type != *obj_type || actual != fq_name => {
                findings.push(Finding::fq_name_mismatch(obj_type, column, &actual_type, &actual));
            }
            Some(_) => {
                indexed.insert((obj_type.clone(), id));
            }
        }
    }
    for object in inv.objects.values() {
        let Some((id, obj_type, fq_name)) = object.identity() else {
            continue;
        };
        if !indexed.contains(&(obj_type.clone(), id)) {
            findings.push(Finding::missing_index(&obj_type, &fq_name, &id));
        }
    }
    findings
}

/// Live objects grouped by `(type, fq_name)`, groups of two or more only.
fn duplicate_groups(inv: &Inventory) -> BTreeMap<(String, FqName), Vec<ObjectId>> {
    let mut groups: BTreeMap<(String, FqName), Vec<ObjectId>> = BTreeMap::new();
    for object in inv.objects.values() {
        if let Some((id, obj_type, fq_name)) = object.identity() {
            groups.entry((obj_type, fq_name)).or_default().push(id);
        }
    }
    groups.retain(|_, ids| ids.len() > 1);
    groups
}

pub(crate) fn check_fq_name_index(auditor: &Auditor, pass: &mut Pass) -> AuditResult<()> {
    let inv = auditor.inventory()?;
    pass.report_all(fq_index_findings(&inv));
    Ok(())
}

pub(crate) fn check_duplicate_fq_name(auditor: &Auditor, pass: &mut Pass) -> AuditResult<()> {
    let inv = auditor.inventory()?;
    for ((obj_type, fq_name), ids) in duplicate_groups(&inv) {
        pass.report(Finding::duplicate_fq_name(&obj_type, &fq_name, &ids));
    }
    Ok(())
}

pub(crate) fn clean_stale_fq_names(auditor: &Auditor, pass: &mut Pass) -> AuditResult<()> {
    let inv = auditor.inventory()?;
    for finding in fq_index_findings(&inv) {
        if !matches!(finding.kind, FindingKind::StaleIndex | FindingKind::FqNameMismatch) {
            continue;
        }
        let [obj_type, column] = finding.keys.as_slice() else {
            continue;
        };
        if pass.apply(format_args!("delete {obj_type} index entry {column}")) {
            let mut batch = WriteBatch::new();
            batch.delete_cell(FQ_TABLE, obj_type, column.as_str());
            auditor.db().apply(batch)?;
        }
        pass.report(finding);
    }
    Ok(())
}

pub(crate) fn clean_duplicate_objects(auditor: &Auditor, pass: &mut Pass) -> AuditResult<()> {
    let inv = auditor.inventory()?;
    for ((obj_type, fq_name), ids) in duplicate_groups(&inv) {
        let owner = match auditor.graph().index().lookup_name(&obj_type, &fq_name) {
            Ok(Some(owner)) if ids.contains(&owner) => owner,
            Ok(_) | Err(GraphError::AmbiguousName { .. }) => {
                warn!(obj_type = %obj_type, fq_name = %fq_name, "no single indexed owner; duplicates left in place");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        for id in ids.iter().filter(|id| **id != owner) {
            if pass.apply(format_args!("delete duplicate {obj_type} {fq_name} ({id}), owner {owner}")) {
                match auditor.graph().delete(id) {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => debug!(id = %id, "duplicate already gone"),
                    Err(e) => return Err(e.into()),
                }
            }
        }
        pass.report(Finding::duplicate_fq_name(&obj_type, &fq_name, &ids));
    }
    Ok(())
}

pub(crate) fn heal_fq_name_index(auditor: &Auditor, pass: &mut Pass) -> AuditResult<()> {
    let inv = auditor.inventory()?;
    for finding in fq_index_findings(&inv) {
        if finding.kind != FindingKind::MissingIndex {
            continue;
        }
        let [obj_type, encoded, id] = finding.keys.as_slice() else {
            continue;
        };
        let (Ok(fq_name), Ok(id)) = (FqName::decode(encoded), ObjectId::parse(id)) else {
            continue;
        };
        let holders = inv.of_type(obj_type).filter(|(_, fq, _)| *fq == fq_name).count();
        if holders != 1 {
            warn!(obj_type = %obj_type, fq_name = %fq_name, holders, "name held by several objects; not indexed");
            continue;
        }
        match auditor.graph().index().lookup_name(obj_type, &fq_name) {
            Ok(None) => {}
            Ok(Some(_)) | Err(GraphError::AmbiguousName { .. }) => {
                warn!(obj_type = %obj_type, fq_name = %fq_name, "name already claimed; not indexed");
                continue;
            }
            Err(e) => return Err(e.into()),
        }
        if pass.apply(format_args!("index {obj_type} {fq_name} as {id}")) {
            let mut batch = WriteBatch::new();
            batch.put(FQ_TABLE, obj_type, index_col(&fq_name, &id), "null");
            auditor.db().apply(batch)?;
        }
        pass.report(finding);
    }
    Ok(())
}
