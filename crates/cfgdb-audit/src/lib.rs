//! Consistency auditing of the object graph and its id pools.
//!
//! Every operation belongs to one action of a small state machine:
//! **check** is read-only and produces [`Finding`]s; **clean** removes stale
//! secondary data; **heal** inserts missing secondary data. Clean and heal
//! derive their work from the same predicates as check and are safe to
//! repeat.
//!
//! # Key Types
//!
//! - [`Auditor`] — operation registry and runner over a pair of cell stores
//! - [`Finding`] — one typed divergence with machine-readable keys
//! - [`OperationReport`] — findings and applied repairs of one operation
//! - [`AuditConfig`] — id pool, address pool, route target and subnet mapping layout
//!
//! # Design Rules
//!
//! 1. Findings are always derived from a fresh scan; nothing carries over between runs.
//! 2. Dry-run clean/heal logs "Would ..." and never writes.
//! 3. Each repair commits on its own; a failure stops the run and is re-raised.
//! 4. Missing objects are findings, never errors.
//! 5. Scans page through tables and yield between pages.

pub mod addrpool;
pub mod auditor;
pub mod config;
pub mod edges;
pub mod error;
pub mod fields;
pub mod finding;
pub mod idpool;
pub mod names;
pub mod report;
pub mod routetarget;
pub mod scan;
pub mod subnetuuid;

pub use addrpool::Subnet;
pub use auditor::{Auditor, Operation, Pass, OPERATIONS};
pub use config::{AddressPoolSpec, AuditConfig, IdPoolSpec, ReservedId, RouteTargetSpec, SubnetUuidSpec};
pub use error::{AuditError, AuditResult};
pub use finding::{Finding, FindingKind};
pub use report::{Action, OperationReport, RunMode};
pub use scan::{Inventory, RawObject};

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::Arc;

    use cfgdb_graph::NewObject;
    use cfgdb_store::{CellStore, InMemoryCellStore};
    use cfgdb_types::{FqName, ObjectId, SchemaRegistry};

    use crate::{AuditConfig, Auditor, RunMode};

    pub fn fq(parts: &[&str]) -> FqName {
        FqName::new(parts.iter().copied()).unwrap()
    }

    pub fn make_auditor(mode: RunMode) -> (Arc<dyn CellStore>, Auditor) {
        let store: Arc<dyn CellStore> = Arc::new(InMemoryCellStore::new());
        let auditor = Auditor::new(
            store.clone(),
            store.clone(),
            Arc::new(SchemaRegistry::builtin()),
            AuditConfig::default(),
            mode,
        )
        .unwrap();
        (store, auditor)
    }

    pub fn make_domain(auditor: &Auditor, name: &str) -> ObjectId {
        auditor.graph().create(NewObject::new("domain", fq(&[name]))).unwrap()
    }
}
