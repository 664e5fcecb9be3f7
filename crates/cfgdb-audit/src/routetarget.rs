//! System route targets against their id pool.
//!
//! A route target named `target:<global asn>:<n>` with `n` in the system
//! range owns pool id `n`, carrying the fq_name of the routing instance
//! referring to it. Route target lists configured on networks may not name
//! system numbers.

use std::collections::{BTreeMap, BTreeSet};

use cfgdb_alloc::{AllocPolicy, RangeIdAllocator};
use cfgdb_graph::columns::{backref_prefix, list_prefix};
use cfgdb_graph::{ObjectUpdate, PropertyCodec};
use cfgdb_types::ObjectId;
use serde_json::Value;
use tracing::debug;

use crate::auditor::{Auditor, Pass};
use crate::config::RouteTargetSpec;
use crate::error::AuditResult;
use crate::finding::Finding;
use crate::scan::{Inventory, RawObject};

/// Owner recorded for a system route target no routing instance refers to.
pub const NO_OWNER: &str = "No Routing Instance associated";

/// `(asn, number)` of a `target:<asn>:<number>` name. The asn is kept as
/// text since it may also be an IPv4 address.
fn parse_route_target(name: &str) -> Option<(&str, u64)> {
    let mut parts = name.split(':');
    let (prefix, asn, number) = (parts.next()?, parts.next()?, parts.next()?);
    if prefix != "target" || parts.next().is_some() {
        return None;
    }
    let asn_ok = asn.parse::<u64>().is_ok() || asn.parse::<std::net::Ipv4Addr>().is_ok();
    if !asn_ok {
        return None;
    }
    Some((asn, number.parse().ok()?))
}

fn is_system(spec: &RouteTargetSpec, asn: &str, number: u64) -> bool {
    asn.parse::<u64>().ok() == Some(spec.global_asn) && number >= spec.min_id()
}

/// A configured list entry to strip.
#[derive(Debug)]
struct StaleEntry {
    holder: ObjectId,
    field: String,
    target: String,
    malformed: bool,
}

impl StaleEntry {
    fn finding(&self) -> Finding {
        if self.malformed {
            Finding::malformed_route_target(&self.holder, &self.target)
        } else {
            Finding::route_target_in_system_range(&self.holder, &self.field, &self.target)
        }
    }
}

#[derive(Debug, Default)]
struct RouteTargetState {
    findings: Vec<Finding>,
    malformed: Vec<(ObjectId, String)>,
    /// System route targets with no matching pool entry, `(uuid, n, owner)`.
    extra_in_config: Vec<(ObjectId, u64, String)>,
    extra_in_pool: Vec<(u64, Option<String>)>,
    stale_entries: Vec<StaleEntry>,
}

fn owner_of(inv: &Inventory, spec: &RouteTargetSpec, target: &RawObject) -> String {
    let prefix = backref_prefix(&spec.owner_type);
    let owner = target
        .with_prefix(&prefix)
        .filter_map(|(column, _)| ObjectId::parse(&column[prefix.len()..]).ok())
        .find_map(|owner| inv.get(&owner)?.fq_name())
        .map(|fq| fq.to_string())
        .unwrap_or_else(|| NO_OWNER.to_string());
    owner
}

fn list_entries(holder: &RawObject, field: &str) -> Vec<Value> {
    let prefix = list_prefix(field);
    let elements: Vec<(String, String)> = holder
        .with_prefix(&prefix)
        .map(|(column, cell)| (column[prefix.len()..].to_string(), cell.value.clone()))
        .collect();
    PropertyCodec::decode_list(field, elements).unwrap_or_default()
}

fn open_pool(auditor: &Auditor, spec: &RouteTargetSpec) -> AuditResult<RangeIdAllocator> {
    Ok(RangeIdAllocator::attach(
        auditor.pools().clone(),
        spec.path.as_str(),
        spec.ranges.clone(),
        AllocPolicy::Ascending,
    )?)
}

fn reconcile(inv: &Inventory, spec: &RouteTargetSpec, pool: &RangeIdAllocator) -> AuditResult<RouteTargetState> {
    let mut state = RouteTargetState::default();
    let mut user_defined = 0usize;
    let mut config: BTreeSet<(u64, String)> = BTreeSet::new();
    for (id, fq_name, object) in inv.of_type(&spec.route_target_type) {
        let name = fq_name.leaf().to_string();
        let Some((asn, number)) = parse_route_target(&name) else {
            state.findings.push(Finding::malformed_route_target(&id, &name));
            state.malformed.push((id, name));
            continue;
        };
        if !is_system(spec, asn, number) {
            user_defined += 1;
            continue;
        }
        let owner = owner_of(inv, spec, object);
        config.insert((number, owner.clone()));
        state.extra_in_config.push((id, number, owner));
    }
    debug!(system = config.len(), user_defined, "route targets scanned");

    let actual: BTreeSet<(u64, Option<String>)> = pool.allocations()?.into_iter().collect();
    state.extra_in_config.retain(|(id, number, owner)| {
        let held = actual.contains(&(*number, Some(owner.clone())));
        if !held {
            state.findings.push(Finding::route_target_id_extra_in_config(id, *number, owner));
        }
        !held
    });
    for (number, value) in actual {
        let claimed = value.as_ref().is_some_and(|v| config.contains(&(number, v.clone())));
        if !claimed {
            state.findings.push(Finding::route_target_id_extra_in_pool(&spec.path, number, value.as_deref()));
            state.extra_in_pool.push((number, value));
        }
    }

    for (holder, _, object) in inv.of_type(&spec.list_holder_type) {
        for field in &spec.list_fields {
            for entry in list_entries(object, field) {
                let Some(target) = entry.as_str() else { continue };
                let stale = match parse_route_target(target) {
                    None => Some(true),
                    Some((asn, number)) if is_system(spec, asn, number) => Some(false),
                    Some(_) => None,
                };
                if let Some(malformed) = stale {
                    let entry = StaleEntry { holder, field: field.clone(), target: target.to_string(), malformed };
                    state.findings.push(entry.finding());
                    state.stale_entries.push(entry);
                }
            }
        }
    }
    Ok(state)
}

pub(crate) fn check_route_targets_id(auditor: &Auditor, pass: &mut Pass) -> AuditResult<()> {
    let inv = auditor.inventory()?;
    let spec = &auditor.config().route_targets;
    let pool = open_pool(auditor, spec)?;
    pass.report_all(reconcile(&inv, spec, &pool)?.findings);
    Ok(())
}

fn delete_route_target(auditor: &Auditor, id: &ObjectId) -> AuditResult<()> {
    match auditor.graph().delete(id) {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => {
            debug!(id = %id, "route target already gone");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// The pool is the source of truth. Route targets it does not hold are
/// deleted and entries no route target claims are released.
pub(crate) fn clean_stale_route_target_id(auditor: &Auditor, pass: &mut Pass) -> AuditResult<()> {
    let inv = auditor.inventory()?;
    let spec = &auditor.config().route_targets;
    let pool = open_pool(auditor, spec)?;
    let state = reconcile(&inv, spec, &pool)?;

    for (id, name) in state.malformed {
        if pass.apply(format_args!("delete malformed route target {name} ({id})")) {
            delete_route_target(auditor, &id)?;
        }
        pass.report(Finding::malformed_route_target(&id, &name));
    }
    for (id, number, owner) in state.extra_in_config {
        if pass.apply(format_args!("delete route target {id} holding unallocated id {number}")) {
            delete_route_target(auditor, &id)?;
        }
        pass.report(Finding::route_target_id_extra_in_config(&id, number, &owner));
    }
    for (number, value) in state.extra_in_pool {
        if pass.apply(format_args!("release route target id {number} from {}", spec.path)) {
            pool.release(number)?;
        }
        pass.report(Finding::route_target_id_extra_in_pool(&spec.path, number, value.as_deref()));
    }

    let mut by_list: BTreeMap<(ObjectId, String), Vec<StaleEntry>> = BTreeMap::new();
    for entry in state.stale_entries {
        by_list.entry((entry.holder, entry.field.clone())).or_default().push(entry);
    }
    for ((holder, field), stale) in by_list {
        let targets: Vec<&str> = stale.iter().map(|e| e.target.as_str()).collect();
        if pass.apply(format_args!("strip {} from {field} of {holder}", targets.join(", "))) {
            let Some(object) = inv.get(&holder) else { continue };
            let kept: Vec<Value> = list_entries(object, &field)
                .into_iter()
                .filter(|v| !v.as_str().is_some_and(|t| targets.contains(&t)))
                .collect();
            let kept = (!kept.is_empty()).then_some(kept);
            auditor.graph().update(&holder, ObjectUpdate::new().set_list(field.as_str(), kept))?;
        }
        pass.report_all(stale.iter().map(StaleEntry::finding));
    }
    Ok(())
}
