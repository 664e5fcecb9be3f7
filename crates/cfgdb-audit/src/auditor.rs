use std::fmt;
use std::sync::Arc;

use cfgdb_graph::ObjectGraphStore;
use cfgdb_store::CellStore;
use cfgdb_types::SchemaRegistry;
use tracing::{error, info, warn};

use crate::config::AuditConfig;
use crate::error::{AuditError, AuditResult};
use crate::finding::Finding;
use crate::report::{Action, OperationReport, RunMode};
use crate::scan::Inventory;
use crate::{addrpool, edges, fields, idpool, names, routetarget, subnetuuid};

type RunFn = fn(&Auditor, &mut Pass) -> AuditResult<()>;

/// A named, individually runnable audit operation.
pub struct Operation {
    pub name: &'static str,
    pub action: Action,
    pub summary: &'static str,
    run: RunFn,
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name)
            .field("action", &self.action)
            .finish_non_exhaustive()
    }
}

const fn op(name: &'static str, action: Action, summary: &'static str, run: RunFn) -> Operation {
    Operation { name, action, summary, run }
}

/// Registry of every operation, in run order per action.
pub static OPERATIONS: &[Operation] = &[
    op(
        "check_fq_name_index",
        Action::Check,
        "stale, missing and mismatched name-index entries",
        names::check_fq_name_index,
    ),
    op(
        "check_duplicate_fq_name",
        Action::Check,
        "objects sharing one (type, fq_name)",
        names::check_duplicate_fq_name,
    ),
    op(
        "check_mandatory_fields",
        Action::Check,
        "objects missing type, fq_name, id_perms or required fields",
        fields::check_mandatory_fields,
    ),
    op(
        "check_dangling_edges",
        Action::Check,
        "edge cells pointing at missing objects",
        fields::check_dangling_edges,
    ),
    op(
        "check_missing_mirror_edges",
        Action::Check,
        "edges between live objects lacking their mirror cell",
        edges::check_missing_mirror_edges,
    ),
    op(
        "check_orphan_resources",
        Action::Check,
        "objects whose parents are all missing",
        edges::check_orphan_resources,
    ),
    op(
        "check_id_pools",
        Action::Check,
        "id pools against resource id properties",
        idpool::check_id_pools,
    ),
    op(
        "check_address_pools",
        Action::Check,
        "subnet address pools against ip addresses",
        addrpool::check_address_pools,
    ),
    op(
        "check_route_targets_id",
        Action::Check,
        "system route targets against their id pool",
        routetarget::check_route_targets_id,
    ),
    op(
        "check_subnet_uuid",
        Action::Check,
        "subnet uuid mappings against network subnets",
        subnetuuid::check_subnet_uuid,
    ),
    op(
        "clean_stale_fq_names",
        Action::Clean,
        "drop stale and mismatched name-index entries",
        names::clean_stale_fq_names,
    ),
    op(
        "clean_duplicate_objects",
        Action::Clean,
        "delete duplicates not owning their indexed name",
        names::clean_duplicate_objects,
    ),
    op(
        "clean_missing_mandatory_fields",
        Action::Clean,
        "delete objects without type, fq_name or id_perms",
        fields::clean_missing_mandatory_fields,
    ),
    op(
        "clean_orphan_resources",
        Action::Clean,
        "delete objects whose parents are all missing",
        edges::clean_orphan_resources,
    ),
    op(
        "clean_dangling_edges",
        Action::Clean,
        "drop edge cells pointing at missing objects",
        fields::clean_dangling_edges,
    ),
    op(
        "clean_one_sided_edges",
        Action::Clean,
        "drop children and backref cells lacking their parent or ref",
        edges::clean_one_sided_edges,
    ),
    op(
        "clean_id_pools",
        Action::Clean,
        "release extra ids and strip duplicate id properties",
        idpool::clean_id_pools,
    ),
    op(
        "clean_address_pools",
        Action::Clean,
        "release extra addresses",
        addrpool::clean_address_pools,
    ),
    op(
        "clean_stale_route_target_id",
        Action::Clean,
        "delete unpooled route targets and release unclaimed ids",
        routetarget::clean_stale_route_target_id,
    ),
    op(
        "clean_stale_subnet_uuid",
        Action::Clean,
        "remove subnet uuid and key rows with no subnet behind them",
        subnetuuid::clean_stale_subnet_uuid,
    ),
    op(
        "heal_fq_name_index",
        Action::Heal,
        "insert missing name-index entries",
        names::heal_fq_name_index,
    ),
    op(
        "heal_children_index",
        Action::Heal,
        "insert children cells missing on parents",
        edges::heal_children_index,
    ),
    op(
        "heal_back_ref_index",
        Action::Heal,
        "insert backref cells missing on reference targets",
        edges::heal_back_ref_index,
    ),
    op(
        "heal_id_pools",
        Action::Heal,
        "reserve missing ids and assign ids to resources lacking one",
        idpool::heal_id_pools,
    ),
    op(
        "heal_address_pools",
        Action::Heal,
        "reserve missing addresses",
        addrpool::heal_address_pools,
    ),
    op(
        "heal_subnet_uuid",
        Action::Heal,
        "insert missing subnet uuid mappings",
        subnetuuid::heal_subnet_uuid,
    ),
];

/// Mutable state of one operation run.
#[derive(Debug)]
pub struct Pass {
    action: Action,
    dry_run: bool,
    findings: Vec<Finding>,
    applied: usize,
}

impl Pass {
    fn new(action: Action, dry_run: bool) -> Self {
        Self { action, dry_run, findings: Vec::new(), applied: 0 }
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn report(&mut self, finding: Finding) {
        self.findings.push(finding);
    }

    pub fn report_all(&mut self, findings: impl IntoIterator<Item = Finding>) {
        self.findings.extend(findings);
    }

    /// Gate a repair. In dry-run mode the repair is logged and skipped.
    pub fn apply(&mut self, description: impl fmt::Display) -> bool {
        if self.dry_run {
            info!("Would {description}");
            return false;
        }
        info!("{description}");
        self.applied += 1;
        true
    }

    fn finish(self, name: &str) -> OperationReport {
        OperationReport {
            name: name.to_string(),
            action: self.action,
            dry_run: self.dry_run,
            findings: self.findings,
            applied: self.applied,
        }
    }
}

/// Consistency auditor over an object store and an id-pool store.
///
/// The two stores may be the same. Every operation takes a fresh snapshot;
/// nothing is cached between runs.
pub struct Auditor {
    db: Arc<dyn CellStore>,
    pools: Arc<dyn CellStore>,
    graph: ObjectGraphStore,
    config: AuditConfig,
    mode: RunMode,
}

impl Auditor {
    pub fn new(
        db: Arc<dyn CellStore>,
        pools: Arc<dyn CellStore>,
        schemas: Arc<SchemaRegistry>,
        config: AuditConfig,
        mode: RunMode,
    ) -> AuditResult<Self> {
        config.validate()?;
        let graph = ObjectGraphStore::new(db.clone(), schemas);
        Ok(Self { db, pools, graph, config, mode })
    }

    pub fn operations() -> &'static [Operation] {
        OPERATIONS
    }

    pub fn find(action: Action, name: &str) -> Option<&'static Operation> {
        OPERATIONS.iter().find(|op| op.action == action && op.name == name)
    }

    pub fn db(&self) -> &Arc<dyn CellStore> {
        &self.db
    }

    pub fn pools(&self) -> &Arc<dyn CellStore> {
        &self.pools
    }

    pub fn graph(&self) -> &ObjectGraphStore {
        &self.graph
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub(crate) fn inventory(&self) -> AuditResult<Inventory> {
        Inventory::load(self.db.as_ref(), self.config.scan_batch_size)
    }

    /// Run one named operation of `action`.
    pub fn run(&self, action: Action, name: &str) -> AuditResult<OperationReport> {
        let op = Self::find(action, name).ok_or_else(|| AuditError::UnknownOperation {
            action,
            name: name.to_string(),
        })?;
        self.execute(op)
    }

    /// Run every operation of `action` in registry order. The first
    /// unexpected error aborts the run.
    pub fn run_all(&self, action: Action) -> AuditResult<Vec<OperationReport>> {
        OPERATIONS
            .iter()
            .filter(|op| op.action == action)
            .map(|op| self.execute(op))
            .collect()
    }

    fn execute(&self, op: &Operation) -> AuditResult<OperationReport> {
        let actor = op.action.actor();
        let dry_run = op.action != Action::Check && self.mode == RunMode::DryRun;
        let mut pass = Pass::new(op.action, dry_run);
        if let Err(e) = (op.run)(self, &mut pass) {
            error!(
                operation = op.name,
                findings = pass.findings.len(),
                error = %e,
                "{actor} {}: unexpected error",
                op.name
            );
            for finding in &pass.findings {
                error!("  {finding}");
            }
            return Err(e);
        }

        let report = pass.finish(op.name);
        if report.success() {
            info!("{actor} {}: Success", op.name);
        } else {
            warn!("{actor} {}: Failed", op.name);
        }
        for finding in &report.findings {
            if report.action == Action::Check {
                warn!("  {finding}");
            } else {
                info!("  {finding}");
            }
        }
        Ok(report)
    }
}

impl fmt::Debug for Auditor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Auditor")
            .field("mode", &self.mode)
            .field("id_pools", &self.config.id_pools.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfgdb_graph::columns::{index_col, FQ_TABLE, OBJ_TABLE};
    use cfgdb_store::{StoreDump, WriteBatch};
    use proptest::prelude::*;

    use crate::finding::FindingKind;
    use crate::testutil::{fq, make_auditor, make_domain};

    fn total(reports: &[OperationReport], kind: FindingKind) -> usize {
        reports.iter().map(|r| r.count(kind)).sum()
    }

    fn seed(store: &Arc<dyn CellStore>, auditor: &Auditor, stale: usize, missing: usize) {
        for i in 0..stale {
            let id = make_domain(auditor, &format!("stale{i}"));
            let mut batch = WriteBatch::new();
            batch.delete_row(OBJ_TABLE, &id.to_string());
            store.apply(batch).unwrap();
        }
        for i in 0..missing {
            let id = make_domain(auditor, &format!("missing{i}"));
            let mut batch = WriteBatch::new();
            batch.delete_cell(FQ_TABLE, "domain", index_col(&fq(&[format!("missing{i}").as_str()]), &id));
            store.apply(batch).unwrap();
        }
        make_domain(auditor, "healthy");
    }

    // ----- registry -----

    #[test]
    fn registry_names_are_unique_per_action() {
        for op in OPERATIONS {
            assert_eq!(OPERATIONS.iter().filter(|o| o.name == op.name).count(), 1);
            assert!(op.name.starts_with(&op.action.to_string()));
        }
        assert!(Auditor::find(Action::Check, "check_id_pools").is_some());
        assert!(Auditor::find(Action::Clean, "check_id_pools").is_none());
    }

    #[test]
    fn unknown_operation_is_an_error() {
        let (_store, auditor) = make_auditor(RunMode::DryRun);
        let err = auditor.run(Action::Heal, "heal_everything").unwrap_err();
        assert!(matches!(err, AuditError::UnknownOperation { action: Action::Heal, .. }));
    }

    #[test]
    fn invalid_config_rejected() {
        let store: Arc<dyn CellStore> = Arc::new(cfgdb_store::InMemoryCellStore::new());
        let config = AuditConfig { scan_batch_size: 0, ..AuditConfig::default() };
        let result = Auditor::new(store.clone(), store, Arc::new(SchemaRegistry::builtin()), config, RunMode::DryRun);
        assert!(matches!(result, Err(AuditError::Config(_))));
    }

    // ----- passes -----

    #[test]
    fn check_reports_exact_counts_and_repairs_reach_fixed_point() {
        let (store, auditor) = make_auditor(RunMode::Execute);
        seed(&store, &auditor, 3, 2);

        let reports = auditor.run_all(Action::Check).unwrap();
        assert_eq!(total(&reports, FindingKind::StaleIndex), 3);
        assert_eq!(total(&reports, FindingKind::MissingIndex), 2);

        auditor.run_all(Action::Clean).unwrap();
        auditor.run_all(Action::Heal).unwrap();
        let reports = auditor.run_all(Action::Check).unwrap();
        let remaining: usize = reports.iter().map(|r| r.findings.len()).sum();
        assert_eq!(remaining, 0, "{reports:?}");
        assert!(reports.iter().all(OperationReport::success));
    }

    #[test]
    fn damaged_edges_and_orphans_reach_fixed_point() {
        use cfgdb_graph::columns::{backref_col, child_col};
        use cfgdb_graph::{NewObject, RefSpec};

        let (store, auditor) = make_auditor(RunMode::Execute);
        let domain = make_domain(&auditor, "d");
        let project = |d: &str| NewObject::new("project", fq(&[d, "p"])).with_parent("domain");
        let p = auditor.graph().create(project("d")).unwrap();
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
        let doomed = make_domain(&auditor, "doomed");
        auditor.graph().create(project("doomed")).unwrap();

        let mut batch = WriteBatch::new();
        batch.delete_cell(OBJ_TABLE, &domain.to_string(), child_col("project", &p));
        batch.delete_cell(OBJ_TABLE, &ipam.to_string(), backref_col("virtual_network", &vn));
        batch.delete_row(OBJ_TABLE, &doomed.to_string());
        store.apply(batch).unwrap();

        let reports = auditor.run_all(Action::Check).unwrap();
        assert_eq!(total(&reports, FindingKind::MissingMirrorEdge), 2);
        assert_eq!(total(&reports, FindingKind::OrphanResource), 1);

        auditor.run_all(Action::Clean).unwrap();
        auditor.run_all(Action::Heal).unwrap();
        let reports = auditor.run_all(Action::Check).unwrap();
        assert!(reports.iter().all(OperationReport::success), "{reports:?}");
    }

    #[test]
    fn dry_run_mutates_nothing() {
        let (store, auditor) = make_auditor(RunMode::DryRun);
        seed(&store, &auditor, 2, 2);
        let before = StoreDump::capture(store.as_ref()).unwrap();

        let cleaned = auditor.run_all(Action::Clean).unwrap();
        let healed = auditor.run_all(Action::Heal).unwrap();
        assert_eq!(StoreDump::capture(store.as_ref()).unwrap(), before);
        assert!(cleaned.iter().chain(&healed).all(|r| r.dry_run && r.applied == 0));
        assert_eq!(total(&cleaned, FindingKind::StaleIndex), 2);
        assert_eq!(total(&healed, FindingKind::MissingIndex), 2);
    }

    #[test]
    fn repeated_repair_is_idempotent() {
        let (store, auditor) = make_auditor(RunMode::Execute);
        seed(&store, &auditor, 1, 1);
        auditor.run_all(Action::Clean).unwrap();
        auditor.run_all(Action::Heal).unwrap();
        let snapshot = StoreDump::capture(store.as_ref()).unwrap().cell_count();

        let cleaned = auditor.run_all(Action::Clean).unwrap();
        let healed = auditor.run_all(Action::Heal).unwrap();
        assert!(cleaned.iter().chain(&healed).all(|r| r.applied == 0));
        assert_eq!(StoreDump::capture(store.as_ref()).unwrap().cell_count(), snapshot);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn completeness_for_any_seed(stale in 0usize..5, missing in 0usize..5) {
            let (store, auditor) = make_auditor(RunMode::Execute);
            seed(&store, &auditor, stale, missing);
            let reports = auditor.run(Action::Check, "check_fq_name_index").unwrap();
            prop_assert_eq!(reports.count(FindingKind::StaleIndex), stale);
            prop_assert_eq!(reports.count(FindingKind::MissingIndex), missing);

            auditor.run(Action::Clean, "clean_stale_fq_names").unwrap();
            auditor.run(Action::Heal, "heal_fq_name_index").unwrap();
            prop_assert!(auditor.run(Action::Check, "check_fq_name_index").unwrap().findings.is_empty());
        }
    }
}
