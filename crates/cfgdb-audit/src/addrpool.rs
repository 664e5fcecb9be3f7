//! Per-subnet IPv4 address pools against the addresses of ip objects.
//!
//! Addresses are pool ids by their `u32` value. The network and broadcast
//! addresses, the default gateway and the DNS server address are never
//! reported: the first two lie outside the host range, the others are held
//! by the pool itself.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use cfgdb_alloc::{AllocError, AllocPolicy, IdRange, RangeIdAllocator};
use cfgdb_graph::columns::{map_prefix, ref_prefix};
use cfgdb_graph::PropertyCodec;
use cfgdb_types::ObjectId;
use serde_json::Value;
use tracing::{debug, warn};

use crate::auditor::{Auditor, Pass};
use crate::config::AddressPoolSpec;
use crate::error::AuditResult;
use crate::finding::Finding;
use crate::scan::{Inventory, RawObject};

/// An IPv4 subnet read from a network's subnet map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subnet {
    pub network: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Option<Ipv4Addr>,
    pub dns: Option<Ipv4Addr>,
}

impl Subnet {
    /// Parse a subnet map element. `None` for anything that is not IPv4.
    pub fn from_element(element: &Value) -> Option<Self> {
        let subnet = element.get("subnet")?;
        let prefix: Ipv4Addr = subnet.get("ip_prefix")?.as_str()?.parse().ok()?;
        let prefix_len = u8::try_from(subnet.get("ip_prefix_len")?.as_u64()?).ok()?;
        if prefix_len > 32 {
            return None;
        }
        let addr = |field: &str| element.get(field)?.as_str()?.parse::<Ipv4Addr>().ok();
        let mut parsed = Self {
            network: prefix,
            prefix_len,
            gateway: addr("default_gateway"),
            dns: addr("dns_server_address"),
        };
        parsed.network = Ipv4Addr::from(u32::from(prefix) & parsed.mask());
        Some(parsed)
    }

    fn mask(&self) -> u32 {
        match self.prefix_len {
            0 => 0,
            len => u32::MAX << (32 - u32::from(len)),
        }
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !self.mask())
    }

    /// Allocatable addresses. /31 and /32 have no network or broadcast
    /// address to exclude.
    pub fn hosts(&self) -> IdRange {
        let first = u64::from(u32::from(self.network));
        let last = u64::from(u32::from(self.broadcast()));
        if self.prefix_len >= 31 {
            IdRange::new(first, last)
        } else {
            IdRange::new(first + 1, last - 1)
        }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.hosts().contains(u64::from(u32::from(addr)))
    }

    /// Addresses held by the pool itself.
    fn is_service_address(&self, addr: u64) -> bool {
        [self.gateway, self.dns]
            .into_iter()
            .flatten()
            .any(|a| u64::from(u32::from(a)) == addr)
    }
}

impl std::fmt::Display for Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

fn subnets_of(network: &RawObject, spec: &AddressPoolSpec) -> Vec<Subnet> {
    let prefix = map_prefix(&spec.subnets_field);
    network
        .with_prefix(&prefix)
        .filter_map(|(column, cell)| {
            let element = PropertyCodec::decode_value(&spec.subnets_field, &cell.value).ok()?;
            let subnet = Subnet::from_element(&element);
            if subnet.is_none() {
                debug!(row = %network.row, column = %column, "skipping non-IPv4 subnet");
            }
            subnet
        })
        .collect()
}

/// One known subnet pool.
#[derive(Debug)]
struct SubnetPool {
    path: String,
    subnet: Subnet,
    /// address -> uuids of the ip objects using it
    holders: BTreeMap<u64, Vec<String>>,
}

#[derive(Debug, Default)]
struct AddressState {
    findings: Vec<Finding>,
    /// `(path, address, payload)`
    extra: Vec<(String, u64, Option<String>)>,
    missing: Vec<(String, u64, String)>,
    pools: BTreeMap<String, SubnetPool>,
}

fn dotted(addr: u64) -> String {
    u32::try_from(addr).map(|a| Ipv4Addr::from(a).to_string()).unwrap_or_else(|_| addr.to_string())
}

fn reconcile(auditor: &Auditor, inv: &Inventory, spec: &AddressPoolSpec) -> AuditResult<AddressState> {
    let mut state = AddressState::default();
    let mut by_network: BTreeMap<ObjectId, Vec<String>> = BTreeMap::new();
    for (id, fq_name, network) in inv.of_type(&spec.network_type) {
        let mut paths = Vec::new();
        for subnet in subnets_of(network, spec) {
            let path = format!("{}{fq_name}:{subnet}", spec.path_prefix);
            paths.push(path.clone());
            state.pools.insert(path.clone(), SubnetPool { path, subnet, holders: BTreeMap::new() });
        }
        by_network.insert(id, paths);
    }

    let network_refs = ref_prefix(&spec.network_type);
    for (ip_id, _, ip) in inv.of_type(&spec.ip_type) {
        let Some(addr) = ip.prop(&spec.address_field) else {
            continue;
        };
        let Some(addr) = addr.as_str().and_then(|a| a.parse::<Ipv4Addr>().ok()) else {
            continue;
        };
        let network = ip
            .with_prefix(&network_refs)
            .find_map(|(column, _)| ObjectId::parse(&column[network_refs.len()..]).ok());
        let Some(paths) = network.and_then(|n| by_network.get(&n)) else {
            continue;
        };
        let path = paths
            .iter()
            .find(|p| state.pools.get(*p).is_some_and(|pool| pool.subnet.contains(addr)));
        match path.and_then(|p| state.pools.get_mut(p)) {
            Some(pool) => pool
                .holders
                .entry(u64::from(u32::from(addr)))
                .or_default()
                .push(ip_id.to_string()),
            None => {
                let network = network.map(|n| n.to_string()).unwrap_or_default();
                state.findings.push(Finding::address_outside_subnets(&ip_id, &addr.to_string(), &network));
            }
        }
    }

    let mut seen = BTreeSet::new();
    let persisted = RangeIdAllocator::list_pools(auditor.pools().as_ref(), &spec.path_prefix)?;
    for path in persisted.iter().chain(state.pools.keys()) {
        if !seen.insert(path.clone()) {
            continue;
        }
        let known = state.pools.get(path);
        let ranges = known.map(|p| vec![p.subnet.hosts()]).unwrap_or_default();
        let pool =
            RangeIdAllocator::attach(auditor.pools().clone(), path.as_str(), ranges, AllocPolicy::Ascending)?;
        let actual: BTreeMap<u64, Option<String>> = pool.allocations()?.into_iter().collect();

        let mut expected: BTreeMap<u64, String> = BTreeMap::new();
        if let Some(known) = known {
            for (addr, owners) in &known.holders {
                let stored = actual.get(addr).and_then(Option::as_deref);
                if owners.len() > 1 {
                    state.findings.push(Finding::duplicate_address(path, &dotted(*addr), owners));
                }
                if known.subnet.is_service_address(*addr) {
                    continue;
                }
                let owner = owners.iter().find(|o| Some(o.as_str()) == stored).or_else(|| owners.first());
                if let Some(owner) = owner {
                    expected.insert(*addr, owner.clone());
                }
            }
        }

        for (addr, value) in &actual {
            if known.is_some_and(|k| k.subnet.is_service_address(*addr)) {
                continue;
            }
            if expected.get(addr) != value.as_ref() {
                state.findings.push(Finding::address_extra_in_pool(path, &dotted(*addr), value.as_deref()));
                state.extra.push((path.clone(), *addr, value.clone()));
            }
        }
        for (addr, value) in expected {
            if actual.get(&addr).and_then(Option::as_deref) != Some(value.as_str()) {
                state.findings.push(Finding::address_missing_in_pool(path, &dotted(addr), &value));
                state.missing.push((path.clone(), addr, value));
            }
        }
    }
    Ok(state)
}

pub(crate) fn check_address_pools(auditor: &Auditor, pass: &mut Pass) -> AuditResult<()> {
    let inv = auditor.inventory()?;
    for spec in &auditor.config().address_pools {
        pass.report_all(reconcile(auditor, &inv, spec)?.findings);
    }
    Ok(())
}

pub(crate) fn clean_address_pools(auditor: &Auditor, pass: &mut Pass) -> AuditResult<()> {
    let inv = auditor.inventory()?;
    for spec in &auditor.config().address_pools {
        for (path, addr, value) in reconcile(auditor, &inv, spec)?.extra {
            if pass.apply(format_args!("release {} from {path}", dotted(addr))) {
                let pool = RangeIdAllocator::attach(
                    auditor.pools().clone(),
                    path.as_str(),
                    Vec::new(),
                    AllocPolicy::Ascending,
                )?;
                pool.release(addr)?;
            }
            pass.report(Finding::address_extra_in_pool(&path, &dotted(addr), value.as_deref()));
        }
    }
    Ok(())
}

pub(crate) fn heal_address_pools(auditor: &Auditor, pass: &mut Pass) -> AuditResult<()> {
    let inv = auditor.inventory()?;
    for spec in &auditor.config().address_pools {
        let state = reconcile(auditor, &inv, spec)?;
        for (path, addr, value) in state.missing {
            let Some(known) = state.pools.get(&path) else {
                continue;
            };
            if pass.apply(format_args!("reserve {} in {path} for {value}", dotted(addr))) {
                let pool = RangeIdAllocator::new(
                    auditor.pools().clone(),
                    path.as_str(),
                    vec![known.subnet.hosts()],
                    AllocPolicy::Ascending,
                )?;
                match pool.reserve(addr, Some(&value)) {
                    Ok(_) => {}
                    Err(AllocError::Conflict { existing, .. }) => {
                        warn!(path = %known.path, addr = %dotted(addr), ?existing, "address held by another payload; not reserved");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            pass.report(Finding::address_missing_in_pool(&path, &dotted(addr), &value));
        }
    }
    Ok(())
}
