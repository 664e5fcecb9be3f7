//! Subnet uuid mappings in the key/value table against network subnets.
//!
//! Each subnet element of a network is expected to have a row keyed by its
//! uuid whose value is `"<network uuid> <prefix>/<len>"`. Rows keyed by such
//! a subnet key map back to the uuid and must not outlive their uuid row.

use std::collections::BTreeMap;

use cfgdb_graph::columns::map_prefix;
use cfgdb_graph::PropertyCodec;
use cfgdb_store::{CellStore, ColumnRange, WriteBatch};
use serde_json::Value;
use tracing::debug;

use crate::auditor::{Auditor, Pass};
use crate::config::SubnetUuidSpec;
use crate::error::AuditResult;
use crate::finding::Finding;
use crate::scan::Inventory;

/// Whether a row key is a subnet key rather than a subnet uuid.
fn is_subnet_key(key: &str) -> bool {
    key.split_once(' ').is_some_and(|(_, rest)| rest.contains('/'))
}

/// Rows of the key/value table, split by direction.
#[derive(Debug, Default)]
struct KeyValRows {
    /// subnet uuid -> subnet key
    by_uuid: BTreeMap<String, String>,
    /// subnet key -> subnet uuid
    by_key: BTreeMap<String, String>,
}

fn load_rows(store: &dyn CellStore, spec: &SubnetUuidSpec, page_size: usize) -> AuditResult<KeyValRows> {
    let mut rows = KeyValRows::default();
    let mut after: Option<String> = None;
    let value_range = ColumnRange::prefix(spec.value_column.as_str());
    loop {
        let keys = store.list_rows(&spec.table, after.as_deref(), page_size)?;
        let contents = store.read_rows(&spec.table, &keys, &value_range)?;
        for (key, cells) in keys.iter().zip(contents) {
            let Some((_, cell)) = cells.into_iter().find(|(column, _)| *column == spec.value_column) else {
                debug!(key = %key, "key/value row without value");
                continue;
            };
            if is_subnet_key(key) {
                rows.by_key.insert(key.clone(), cell.value);
            } else {
                rows.by_uuid.insert(key.clone(), cell.value);
            }
        }
        if keys.len() < page_size {
            return Ok(rows);
        }
        after = keys.last().cloned();
        std::thread::yield_now();
    }
}

#[derive(Debug, Default)]
struct SubnetState {
    findings: Vec<Finding>,
    /// `(uuid, key)` rows with no subnet behind them.
    extra: Vec<(String, String)>,
    /// `(uuid, key)` subnets without a uuid row.
    missing: Vec<(String, String)>,
    /// `(key, uuid)` key rows whose uuid row is absent.
    dangling_keys: Vec<(String, String)>,
}

/// `subnet uuid -> key` for every subnet element of every network.
fn expected(inv: &Inventory, spec: &SubnetUuidSpec, findings: &mut Vec<Finding>) -> BTreeMap<String, String> {
    let prefix = map_prefix(&spec.subnets_field);
    let mut expected = BTreeMap::new();
    for (network, _, object) in inv.of_type(&spec.network_type) {
        for (_, cell) in object.with_prefix(&prefix) {
            let Ok(element) = PropertyCodec::decode_value(&spec.subnets_field, &cell.value) else {
                continue;
            };
            let Some(subnet_uuid) = element.get("subnet_uuid").and_then(Value::as_str) else {
                continue;
            };
            let subnet = element.get("subnet");
            let prefix = subnet.and_then(|s| s.get("ip_prefix")).and_then(Value::as_str);
            let len = subnet.and_then(|s| s.get("ip_prefix_len")).and_then(Value::as_u64);
            match (prefix, len) {
                (Some(prefix), Some(len)) => {
                    expected.insert(subnet_uuid.to_string(), format!("{network} {prefix}/{len}"));
                }
                _ => findings.push(Finding::malformed_subnet(&network, subnet_uuid)),
            }
        }
    }
    expected
}

fn reconcile(auditor: &Auditor, inv: &Inventory, spec: &SubnetUuidSpec) -> AuditResult<SubnetState> {
    let rows = load_rows(auditor.db().as_ref(), spec, auditor.config().scan_batch_size)?;
    let mut state = SubnetState::default();
    let expected = expected(inv, spec, &mut state.findings);

    for (key, subnet_uuid) in &rows.by_key {
        if !rows.by_uuid.contains_key(subnet_uuid) {
            state.findings.push(Finding::subnet_key_without_uuid(key, subnet_uuid));
            state.dangling_keys.push((key.clone(), subnet_uuid.clone()));
        }
    }
    for (subnet_uuid, key) in &rows.by_uuid {
        if !expected.contains_key(subnet_uuid) {
            state.findings.push(Finding::subnet_uuid_extra(subnet_uuid, key));
            state.extra.push((subnet_uuid.clone(), key.clone()));
        }
    }
    for (subnet_uuid, key) in expected {
        if !rows.by_uuid.contains_key(&subnet_uuid) {
            state.findings.push(Finding::subnet_uuid_missing(&subnet_uuid, &key));
            state.missing.push((subnet_uuid, key));
        }
    }
    Ok(state)
}

pub(crate) fn check_subnet_uuid(auditor: &Auditor, pass: &mut Pass) -> AuditResult<()> {
    let inv = auditor.inventory()?;
    pass.report_all(reconcile(auditor, &inv, &auditor.config().subnet_uuid)?.findings);
    Ok(())
}

/// Extra uuid rows go together with the key row they name.
pub(crate) fn clean_stale_subnet_uuid(auditor: &Auditor, pass: &mut Pass) -> AuditResult<()> {
    let inv = auditor.inventory()?;
    let spec = &auditor.config().subnet_uuid;
    let state = reconcile(auditor, &inv, spec)?;
    for (subnet_uuid, key) in state.extra {
        if pass.apply(format_args!("remove stale subnet uuid {subnet_uuid} and key {key:?}")) {
            let mut batch = WriteBatch::new();
            batch.delete_row(&spec.table, &subnet_uuid);
            batch.delete_row(&spec.table, &key);
            auditor.db().apply(batch)?;
        }
        pass.report(Finding::subnet_uuid_extra(&subnet_uuid, &key));
    }
    for (key, subnet_uuid) in state.dangling_keys {
        if pass.apply(format_args!("remove stale subnet key {key:?}")) {
            let mut batch = WriteBatch::new();
            batch.delete_row(&spec.table, &key);
            auditor.db().apply(batch)?;
        }
        pass.report(Finding::subnet_key_without_uuid(&key, &subnet_uuid));
    }
    Ok(())
}

pub(crate) fn heal_subnet_uuid(auditor: &Auditor, pass: &mut Pass) -> AuditResult<()> {
    let inv = auditor.inventory()?;
    let spec = &auditor.config().subnet_uuid;
    for (subnet_uuid, key) in reconcile(auditor, &inv, spec)?.missing {
        if pass.apply(format_args!("insert subnet uuid {subnet_uuid} for {key:?}")) {
            let mut batch = WriteBatch::new();
            batch.put(&spec.table, &subnet_uuid, spec.value_column.as_str(), key.as_str());
            auditor.db().apply(batch)?;
        }
        pass.report(Finding::subnet_uuid_missing(&subnet_uuid, &key));
    }
    Ok(())
}
