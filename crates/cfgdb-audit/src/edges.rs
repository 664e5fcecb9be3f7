//! Edge symmetry between live objects, and resources whose parent is gone.
//!
//! Every edge has a mirror on the other row: `parent:` pairs with
//! `children:`, a cross-type `ref:` with `backref:`, a same-type `ref:` with
//! a `ref:` back. Parent and ref cells are authoritative. A missing mirror of
//! one is healed by writing it; a children or backref cell whose
//! authoritative side is gone is cleaned by dropping it.

use std::collections::BTreeMap;

use cfgdb_graph::columns::{backref_col, child_col, parent_col, ref_col, Column, LATEST_COL, OBJ_TABLE};
use cfgdb_store::WriteBatch;
use cfgdb_types::ObjectId;
use tracing::debug;

use crate::auditor::{Auditor, Pass};
use crate::error::AuditResult;
use crate::finding::Finding;
use crate::scan::Inventory;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EdgeRole {
    Parent,
    Child,
    Ref,
    BackRef,
}

impl EdgeRole {
    fn is_authoritative(self) -> bool {
        matches!(self, Self::Parent | Self::Ref)
    }
}

/// A live-to-live edge whose mirror cell is absent.
#[derive(Debug)]
struct OneSided {
    role: EdgeRole,
    row: String,
    column: String,
    value: String,
    target_row: String,
    target_type: String,
    mirror: String,
}

impl OneSided {
    fn finding(&self) -> Finding {
        Finding::missing_mirror_edge(&self.row, &self.column, &self.target_row, &self.mirror)
    }
}

fn one_sided_edges(inv: &Inventory) -> Vec<OneSided> {
    let mut found = Vec::new();
    for object in inv.objects.values() {
        let (Some(id), Some(obj_type)) = (object.id, object.obj_type()) else {
            continue;
        };
        for (column, cell) in &object.cells {
            let (role, edge_type, target) = match Column::parse(column) {
                Column::Parent(t, target) => (EdgeRole::Parent, t, target),
                Column::Child(t, target) => (EdgeRole::Child, t, target),
                Column::Ref(t, target) => (EdgeRole::Ref, t, target),
                Column::BackRef(t, target) => (EdgeRole::BackRef, t, target),
                _ => continue,
            };
            if target == id {
                continue;
            }
            // dangling edges are reported on their own
            let Some(other) = inv.get(&target) else { continue };
            let Some(target_type) = other.obj_type() else { continue };
            let mirror = match role {
                EdgeRole::Parent => child_col(&obj_type, &id),
                EdgeRole::Child => parent_col(&obj_type, &id),
                EdgeRole::Ref if edge_type == obj_type => ref_col(&obj_type, &id),
                EdgeRole::Ref => backref_col(&obj_type, &id),
                EdgeRole::BackRef => ref_col(&obj_type, &id),
            };
            if other.has(&mirror) {
                continue;
            }
            found.push(OneSided {
                role,
                row: object.row.clone(),
                column: column.clone(),
                value: cell.value.clone(),
                target_row: other.row.clone(),
                target_type,
                mirror,
            });
        }
    }
    found
}

pub(crate) fn check_missing_mirror_edges(auditor: &Auditor, pass: &mut Pass) -> AuditResult<()> {
    let inv = auditor.inventory()?;
    pass.report_all(one_sided_edges(&inv).iter().map(OneSided::finding));
    Ok(())
}

/// Drop children and backref cells whose parent or ref side is absent.
pub(crate) fn clean_one_sided_edges(auditor: &Auditor, pass: &mut Pass) -> AuditResult<()> {
    let inv = auditor.inventory()?;
    let mut by_row: BTreeMap<String, Vec<OneSided>> = BTreeMap::new();
    for edge in one_sided_edges(&inv).into_iter().filter(|e| !e.role.is_authoritative()) {
        by_row.entry(edge.row.clone()).or_default().push(edge);
    }
    for (row, edges) in by_row {
        if pass.apply(format_args!("drop {} one-sided edges of {row}", edges.len())) {
            let mut batch = WriteBatch::new();
            for edge in &edges {
                batch.delete_cell(OBJ_TABLE, &row, edge.column.as_str());
            }
            let touch = inv
                .objects
                .get(&row)
                .and_then(|o| o.obj_type())
                .is_some_and(|t| !auditor.graph().schemas().is_cache_excluded(&t));
            if touch {
                batch.put(OBJ_TABLE, &row, LATEST_COL, "null");
            }
            auditor.db().apply(batch)?;
        }
        pass.report_all(edges.iter().map(OneSided::finding));
    }
    Ok(())
}

/// Write the missing mirrors of authoritative edges of `role`, one batch per
/// target row.
fn insert_mirrors(auditor: &Auditor, pass: &mut Pass, role: EdgeRole) -> AuditResult<()> {
    let inv = auditor.inventory()?;
    let mut by_target: BTreeMap<String, Vec<OneSided>> = BTreeMap::new();
    for edge in one_sided_edges(&inv).into_iter().filter(|e| e.role == role) {
        by_target.entry(edge.target_row.clone()).or_default().push(edge);
    }
    for (target_row, edges) in by_target {
        let columns: Vec<&str> = edges.iter().map(|e| e.mirror.as_str()).collect();
        if pass.apply(format_args!("insert {} into {target_row}", columns.join(", "))) {
            let mut batch = WriteBatch::new();
            for edge in &edges {
                let value = match role {
                    EdgeRole::Parent => "null",
                    _ => edge.value.as_str(),
                };
                batch.put(OBJ_TABLE, &target_row, edge.mirror.as_str(), value);
            }
            let target_type = edges.first().map(|e| e.target_type.as_str()).unwrap_or_default();
            if !auditor.graph().schemas().is_cache_excluded(target_type) {
                batch.put(OBJ_TABLE, &target_row, LATEST_COL, "null");
            }
            auditor.db().apply(batch)?;
        }
        pass.report_all(edges.iter().map(OneSided::finding));
    }
    Ok(())
}

pub(crate) fn heal_children_index(auditor: &Auditor, pass: &mut Pass) -> AuditResult<()> {
    insert_mirrors(auditor, pass, EdgeRole::Parent)
}

pub(crate) fn heal_back_ref_index(auditor: &Auditor, pass: &mut Pass) -> AuditResult<()> {
    insert_mirrors(auditor, pass, EdgeRole::Ref)
}

/// Well-formed objects with parent edges, none of which reaches a live
/// object, as `(id, type, first parent column)`.
fn orphans(inv: &Inventory) -> Vec<(ObjectId, String, String)> {
    let mut found = Vec::new();
    for object in inv.objects.values() {
        let Some((id, obj_type, _)) = object.identity() else { continue };
        let parents: Vec<(&String, ObjectId)> = object
            .with_prefix("parent:")
            .filter_map(|(column, _)| match Column::parse(column) {
                Column::Parent(_, parent) => Some((column, parent)),
                _ => None,
            })
            .collect();
        let Some((first, _)) = parents.first() else { continue };
        if parents.iter().any(|(_, parent)| inv.is_live(parent)) {
            continue;
        }
        found.push((id, obj_type, (*first).clone()));
    }
    found
}

pub(crate) fn check_orphan_resources(auditor: &Auditor, pass: &mut Pass) -> AuditResult<()> {
    let inv = auditor.inventory()?;
    for (id, obj_type, column) in orphans(&inv) {
        pass.report(Finding::orphan_resource(&obj_type, &id, &column));
    }
    Ok(())
}

/// Delete orphans through the graph. Children of a deleted orphan become
/// orphans themselves and are removed in the following round.
pub(crate) fn clean_orphan_resources(auditor: &Auditor, pass: &mut Pass) -> AuditResult<()> {
    loop {
        let inv = auditor.inventory()?;
        let found = orphans(&inv);
        if found.is_empty() {
            return Ok(());
        }
        let mut deleted = 0usize;
        for (id, obj_type, column) in found {
            if pass.apply(format_args!("delete orphan {obj_type} {id}")) {
                match auditor.graph().delete(&id) {
                    Ok(()) => deleted += 1,
                    Err(e) if e.is_not_found() => debug!(id = %id, "orphan already gone"),
                    Err(e) => return Err(e.into()),
                }
            }
            pass.report(Finding::orphan_resource(&obj_type, &id, &column));
        }
        if deleted == 0 {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use cfgdb_graph::columns::children_prefix;
    use cfgdb_graph::{NewObject, RefSpec};
    use cfgdb_store::{CellStore, ColumnRange};

    use crate::finding::FindingKind;
    use crate::report::{Action, RunMode};
    use crate::testutil::{fq, make_auditor, make_domain};

    fn make_project(auditor: &Auditor, domain: &str, name: &str) -> ObjectId {
        auditor
            .graph()
            .create(NewObject::new("project", fq(&[domain, name])).with_parent("domain"))
            .unwrap()
    }

    fn drop_cell(store: &std::sync::Arc<dyn CellStore>, row: &ObjectId, column: &str) {
        let mut batch = WriteBatch::new();
        batch.delete_cell(OBJ_TABLE, &row.to_string(), column);
        store.apply(batch).unwrap();
    }

    // ----- mirror edges -----

    #[test]
    fn missing_children_cell_is_found_and_healed() {
        let (store, auditor) = make_auditor(RunMode::Execute);
        let domain = make_domain(&auditor, "d");
        let project = make_project(&auditor, "d", "p");
        drop_cell(&store, &domain, &child_col("project", &project));

        let report = auditor.run(Action::Check, "check_missing_mirror_edges").unwrap();
        assert_eq!(report.count(FindingKind::MissingMirrorEdge), 1);
        assert_eq!(report.findings[0].keys[0], project.to_string());
        assert_eq!(report.findings[0].keys[3], child_col("project", &project));

        let healed = auditor.run(Action::Heal, "heal_children_index").unwrap();
        assert_eq!(healed.applied, 1);
        assert!(store.get(OBJ_TABLE, &domain.to_string(), &child_col("project", &project)).unwrap().is_some());
        assert!(auditor.run(Action::Check, "check_missing_mirror_edges").unwrap().success());
    }

    #[test]
    fn missing_backref_is_healed_with_ref_data() {
        let (store, auditor) = make_auditor(RunMode::Execute);
        make_domain(&auditor, "d");
        make_project(&auditor, "d", "p");
        let ipam = auditor
            .graph()
            .create(NewObject::new("network_ipam", fq(&["d", "p", "ipam"])).with_parent("project"))
            .unwrap();
        let vn = auditor
            .graph()
            .create(
                NewObject::new("virtual_network", fq(&["d", "p", "vn"]))
                    .with_parent("project")
                    .reference(RefSpec::to_id("network_ipam", ipam)),
            )
            .unwrap();
        let backref = backref_col("virtual_network", &vn);
        let original = store.get_value(OBJ_TABLE, &ipam.to_string(), &backref).unwrap().unwrap();
        drop_cell(&store, &ipam, &backref);

        let report = auditor.run(Action::Check, "check_missing_mirror_edges").unwrap();
        assert_eq!(report.count(FindingKind::MissingMirrorEdge), 1);
        // children repair leaves refs alone
        assert_eq!(auditor.run(Action::Heal, "heal_children_index").unwrap().applied, 0);

        auditor.run(Action::Heal, "heal_back_ref_index").unwrap();
        let healed = store.get_value(OBJ_TABLE, &ipam.to_string(), &backref).unwrap();
        assert_eq!(healed.as_deref(), Some(original.as_str()));
        assert!(auditor.run(Action::Check, "check_missing_mirror_edges").unwrap().success());
    }

    #[test]
    fn same_type_ref_mirror_is_a_ref() {
        let (store, auditor) = make_auditor(RunMode::Execute);
        make_domain(&auditor, "d");
        make_project(&auditor, "d", "p");
        let vn = |name: &str| NewObject::new("virtual_network", fq(&["d", "p", name])).with_parent("project");
        auditor.graph().create(vn("vn")).unwrap();
        let ri = |name: &str| {
            NewObject::new("routing_instance", fq(&["d", "p", "vn", name])).with_parent("virtual_network")
        };
        let a = auditor.graph().create(ri("a")).unwrap();
        let b = auditor
            .graph()
            .create(ri("b").reference(RefSpec::to_id("routing_instance", a)))
            .unwrap();
        drop_cell(&store, &a, &ref_col("routing_instance", &b));

        let report = auditor.run(Action::Check, "check_missing_mirror_edges").unwrap();
        assert_eq!(report.count(FindingKind::MissingMirrorEdge), 1);
        auditor.run(Action::Heal, "heal_back_ref_index").unwrap();
        assert!(store.get(OBJ_TABLE, &a.to_string(), &ref_col("routing_instance", &b)).unwrap().is_some());
        assert!(auditor.run(Action::Check, "check_missing_mirror_edges").unwrap().success());
    }

    #[test]
    fn derived_side_without_authority_is_dropped() {
        let (store, auditor) = make_auditor(RunMode::Execute);
        let domain = make_domain(&auditor, "d");
        let project = make_project(&auditor, "d", "p");
        drop_cell(&store, &project, &parent_col("domain", &domain));

        let report = auditor.run(Action::Check, "check_missing_mirror_edges").unwrap();
        assert_eq!(report.count(FindingKind::MissingMirrorEdge), 1);
        assert_eq!(auditor.run(Action::Heal, "heal_children_index").unwrap().applied, 0);

        let cleaned = auditor.run(Action::Clean, "clean_one_sided_edges").unwrap();
        assert_eq!(cleaned.applied, 1);
        assert!(store
            .read_row(OBJ_TABLE, &domain.to_string(), &ColumnRange::prefix(children_prefix("project")))
            .unwrap()
            .is_empty());
        assert!(auditor.run(Action::Check, "check_missing_mirror_edges").unwrap().success());
    }

    #[test]
    fn dry_run_mirror_repair_writes_nothing() {
        let (store, auditor) = make_auditor(RunMode::DryRun);
        let domain = make_domain(&auditor, "d");
        let project = make_project(&auditor, "d", "p");
        drop_cell(&store, &domain, &child_col("project", &project));

        let report = auditor.run(Action::Heal, "heal_children_index").unwrap();
        assert_eq!(report.applied, 0);
        assert_eq!(report.count(FindingKind::MissingMirrorEdge), 1);
        assert!(store.get(OBJ_TABLE, &domain.to_string(), &child_col("project", &project)).unwrap().is_none());
    }

    // ----- orphans -----

    #[test]
    fn orphans_are_found_and_deleted_with_descendants() {
        let (store, auditor) = make_auditor(RunMode::Execute);
        let domain = make_domain(&auditor, "d");
        let project = make_project(&auditor, "d", "p");
        let vn = auditor
            .graph()
            .create(NewObject::new("virtual_network", fq(&["d", "p", "vn"])).with_parent("project"))
            .unwrap();
        let keeper = make_domain(&auditor, "other");

        let mut batch = WriteBatch::new();
        batch.delete_row(OBJ_TABLE, &domain.to_string());
        store.apply(batch).unwrap();

        let report = auditor.run(Action::Check, "check_orphan_resources").unwrap();
        assert_eq!(report.count(FindingKind::OrphanResource), 1);
        assert_eq!(report.findings[0].keys[1], project.to_string());

        let cleaned = auditor.run(Action::Clean, "clean_orphan_resources").unwrap();
        assert_eq!(cleaned.applied, 2);
        assert!(!auditor.graph().exists(&project).unwrap());
        assert!(!auditor.graph().exists(&vn).unwrap());
        assert!(auditor.graph().exists(&keeper).unwrap());
        assert!(auditor.graph().index().lookup_name("project", &fq(&["d", "p"])).unwrap().is_none());
        assert!(auditor.run(Action::Check, "check_orphan_resources").unwrap().success());
    }

    #[test]
    fn parentless_objects_are_not_orphans() {
        let (_store, auditor) = make_auditor(RunMode::Execute);
        make_domain(&auditor, "d");
        auditor
            .graph()
            .create(NewObject::new("virtual_machine", fq(&["vm"])))
            .unwrap();
        assert!(auditor.run(Action::Check, "check_orphan_resources").unwrap().success());
    }
}
