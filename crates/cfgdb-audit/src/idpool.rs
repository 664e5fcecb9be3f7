//! Id pools against the numeric id property of their resource type.

use std::collections::BTreeMap;

use cfgdb_alloc::{AllocError, RangeIdAllocator};
use cfgdb_graph::ObjectUpdate;
use cfgdb_types::ObjectId;
use serde_json::Value;
use tracing::warn;

use crate::auditor::{Auditor, Pass};
use crate::config::IdPoolSpec;
use crate::error::AuditResult;
use crate::finding::Finding;
use crate::scan::Inventory;

/// A resource that needs a fresh id: none stored, or one outside the pool.
#[derive(Debug)]
struct Unassigned {
    id: ObjectId,
    fq_name: String,
}

/// Reconciliation of one pool against its resources.
#[derive(Debug, Default)]
struct PoolState {
    findings: Vec<Finding>,
    /// Pool entries nothing expects, `(id, payload)`.
    extra: Vec<(u64, Option<String>)>,
    /// Expected entries absent from the pool, `(id, payload)`.
    missing: Vec<(u64, String)>,
    /// Resources sharing an id they do not own.
    strip: Vec<(ObjectId, String)>,
    unassigned: Vec<Unassigned>,
    /// Payloads of expected entries, by pool id.
    expected: BTreeMap<u64, String>,
}

fn open_pool(auditor: &Auditor, spec: &IdPoolSpec, init: bool) -> AuditResult<RangeIdAllocator> {
    let store = auditor.pools().clone();
    let pool = if init {
        RangeIdAllocator::new(store, spec.path.as_str(), spec.ranges.clone(), spec.policy)?
    } else {
        RangeIdAllocator::attach(store, spec.path.as_str(), spec.ranges.clone(), spec.policy)?
    };
    Ok(pool)
}

fn reconcile(inv: &Inventory, spec: &IdPoolSpec, pool: &RangeIdAllocator) -> AuditResult<PoolState> {
    let path = spec.path.as_str();
    let actual: BTreeMap<u64, Option<String>> = pool.allocations()?.into_iter().collect();
    let reserved: BTreeMap<u64, &str> = spec.reserved.iter().map(|r| (r.id, r.value.as_str())).collect();
    let mut state = PoolState::default();

    let mut holders: BTreeMap<u64, Vec<(String, ObjectId)>> = BTreeMap::new();
    for (id, fq_name, object) in inv.of_type(&spec.obj_type) {
        let fq_name = fq_name.to_string();
        match object.prop(&spec.field).as_ref().and_then(Value::as_u64) {
            None => {
                state.findings.push(Finding::id_missing_on_resource(path, &id, &fq_name));
                state.unassigned.push(Unassigned { id, fq_name });
            }
            // assigned outside the pool
            Some(value) if value < spec.offset => {}
            Some(value) => {
                let pool_id = value - spec.offset;
                if pool.contains(pool_id) {
                    holders.entry(pool_id).or_default().push((fq_name, id));
                } else {
                    state.findings.push(Finding::id_out_of_range(path, &id, &fq_name, value));
                    state.unassigned.push(Unassigned { id, fq_name });
                }
            }
        }
    }

    for (pool_id, value) in &reserved {
        state.expected.insert(*pool_id, value.to_string());
    }
    for (pool_id, owners) in holders {
        let stored = actual.get(&pool_id).and_then(Option::as_deref);
        let keep = if reserved.contains_key(&pool_id) {
            None
        } else {
            Some(owners.iter().position(|(fq, _)| Some(fq.as_str()) == stored).unwrap_or(0))
        };
        if owners.len() > 1 || keep.is_none() {
            state.findings.push(Finding::duplicate_id(path, pool_id, &owners));
        }
        for (i, (fq_name, id)) in owners.into_iter().enumerate() {
            if Some(i) == keep {
                state.expected.insert(pool_id, fq_name);
            } else {
                state.strip.push((id, fq_name));
            }
        }
    }

    for (pool_id, value) in &actual {
        if state.expected.get(pool_id) != value.as_ref() {
            state.findings.push(Finding::id_extra_in_pool(path, *pool_id, value.as_deref()));
            state.extra.push((*pool_id, value.clone()));
        }
    }
    for (pool_id, value) in &state.expected {
        if actual.get(pool_id).and_then(Option::as_deref) != Some(value.as_str()) {
            state.findings.push(Finding::id_missing_in_pool(path, *pool_id, value));
            state.missing.push((*pool_id, value.clone()));
        }
    }
    Ok(state)
}

pub(crate) fn check_id_pools(auditor: &Auditor, pass: &mut Pass) -> AuditResult<()> {
    let inv = auditor.inventory()?;
    for spec in &auditor.config().id_pools {
        let pool = open_pool(auditor, spec, false)?;
        pass.report_all(reconcile(&inv, spec, &pool)?.findings);
    }
    Ok(())
}

pub(crate) fn clean_id_pools(auditor: &Auditor, pass: &mut Pass) -> AuditResult<()> {
    let inv = auditor.inventory()?;
    for spec in &auditor.config().id_pools {
        let pool = open_pool(auditor, spec, false)?;
        let state = reconcile(&inv, spec, &pool)?;
        for (pool_id, value) in state.extra {
            if pass.apply(format_args!("release id {pool_id} from {}", spec.path)) {
                pool.release(pool_id)?;
            }
            pass.report(Finding::id_extra_in_pool(&spec.path, pool_id, value.as_deref()));
        }
        for (id, fq_name) in state.strip {
            if pass.apply(format_args!("clear {} of {fq_name} ({id})", spec.field)) {
                auditor.graph().update(&id, ObjectUpdate::new().clear(spec.field.as_str()))?;
            }
        }
    }
    Ok(())
}

/// Missing entries are reserved first so fresh allocations cannot take
/// them. A resource lacking an id reuses a free-standing entry already
/// carrying its name before a new id is allocated.
pub(crate) fn heal_id_pools(auditor: &Auditor, pass: &mut Pass) -> AuditResult<()> {
    let inv = auditor.inventory()?;
    for spec in &auditor.config().id_pools {
        let pool = open_pool(auditor, spec, !pass.dry_run())?;
        let state = reconcile(&inv, spec, &pool)?;
        for (pool_id, value) in state.missing {
            if pass.apply(format_args!("reserve id {pool_id} in {} for {value}", spec.path)) {
                match pool.reserve(pool_id, Some(&value)) {
                    Ok(_) => {}
                    Err(AllocError::Conflict { existing, .. }) => {
                        warn!(path = %spec.path, id = pool_id, ?existing, "id held by another payload; not reserved");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            pass.report(Finding::id_missing_in_pool(&spec.path, pool_id, &value));
        }

        for resource in state.unassigned {
            if !pass.apply(format_args!("assign an id from {} to {}", spec.path, resource.fq_name)) {
                continue;
            }
            let reusable = pool.allocations()?.into_iter().find_map(|(pool_id, value)| {
                (value.as_deref() == Some(resource.fq_name.as_str()) && !state.expected.contains_key(&pool_id))
                    .then_some(pool_id)
            });
            let pool_id = match reusable {
                Some(pool_id) => pool_id,
                None => pool.alloc(Some(&resource.fq_name))?,
            };
            let value = Value::from(pool_id + spec.offset);
            auditor
                .graph()
                .update(&resource.id, ObjectUpdate::new().set(spec.field.as_str(), value))?;
        }
    }
    Ok(())
}
