use std::collections::BTreeSet;

use cfgdb_alloc::{validate_ranges, AllocPolicy, IdRange};
use serde::{Deserialize, Serialize};

use crate::error::{AuditError, AuditResult};

/// A pool id held permanently by a fixed value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedId {
    pub id: u64,
    pub value: String,
}

/// An id pool whose allocations mirror a numeric property of one object type.
///
/// A resource holding property value `v` owns pool id `v - offset`; values
/// below `offset` are assigned outside the pool and ignored. Pool entries
/// carry the owner's fq_name joined with `:`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdPoolSpec {
    pub name: String,
    pub obj_type: String,
    pub field: String,
    pub path: String,
    pub ranges: Vec<IdRange>,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub reserved: Vec<ReservedId>,
    /// Direction in which heal hands out fresh ids.
    #[serde(default)]
    pub policy: AllocPolicy,
}

impl IdPoolSpec {
    pub fn virtual_network() -> Self {
        Self {
            name: "virtual_network_id".into(),
            obj_type: "virtual_network".into(),
            field: "virtual_network_network_id".into(),
            path: "/id/virtual-networks/".into(),
            ranges: vec![IdRange::new(0, (1 << 24) - 2)],
            offset: 1,
            reserved: Vec::new(),
            policy: AllocPolicy::Ascending,
        }
    }

    pub fn security_group() -> Self {
        Self {
            name: "security_group_id".into(),
            obj_type: "security_group".into(),
            field: "security_group_id".into(),
            path: "/id/security-groups/id/".into(),
            ranges: vec![IdRange::new(0, u64::from(u32::MAX) - 8_000_000)],
            offset: 8_000_000,
            reserved: vec![ReservedId { id: 0, value: "__reserved__".into() }],
            policy: AllocPolicy::Ascending,
        }
    }
}

/// Address pools of one IP object type, one pool per network subnet.
///
/// Pool paths are `<path_prefix><network fq_name>:<prefix>/<len>`. IP objects
/// point at their network through a reference.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressPoolSpec {
    pub ip_type: String,
    pub address_field: String,
    pub network_type: String,
    pub subnets_field: String,
    pub path_prefix: String,
}

impl Default for AddressPoolSpec {
    fn default() -> Self {
        Self {
            ip_type: "instance_ip".into(),
            address_field: "instance_ip_address".into(),
            network_type: "virtual_network".into(),
            subnets_field: "ipam_subnets".into(),
            path_prefix: "/api-server/subnets/".into(),
        }
    }
}

/// System route targets, named `target:<asn>:<number>`.
///
/// Numbers at or above the start of `ranges` under `global_asn` are handed
/// out from the pool at `path`, whose entries carry the owning routing
/// instance's fq_name joined with `:`. Anything else is user defined.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteTargetSpec {
    pub path: String,
    pub global_asn: u64,
    pub ranges: Vec<IdRange>,
    pub route_target_type: String,
    pub owner_type: String,
    /// Type whose list properties may name route targets.
    pub list_holder_type: String,
    pub list_fields: Vec<String>,
}

impl Default for RouteTargetSpec {
    fn default() -> Self {
        Self {
            path: "/id/bgp/route-targets/".into(),
            global_asn: 64512,
            ranges: vec![IdRange::new(8_000_000, u64::from(u32::MAX))],
            route_target_type: "route_target".into(),
            owner_type: "routing_instance".into(),
            list_holder_type: "virtual_network".into(),
            list_fields: vec!["route_target_list".into()],
        }
    }
}

impl RouteTargetSpec {
    /// Smallest system-assigned number.
    pub fn min_id(&self) -> u64 {
        self.ranges.iter().map(|r| r.start).min().unwrap_or(0)
    }
}

/// Key/value rows mapping subnet uuids to `"<network uuid> <prefix>/<len>"`
/// keys, and keys back to uuids.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubnetUuidSpec {
    pub table: String,
    pub value_column: String,
    pub network_type: String,
    pub subnets_field: String,
}

impl Default for SubnetUuidSpec {
    fn default() -> Self {
        Self {
            table: "useragent_keyval_table".into(),
            value_column: "value".into(),
            network_type: "virtual_network".into(),
            subnets_field: "ipam_subnets".into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Rows read per scan page.
    pub scan_batch_size: usize,
    pub id_pools: Vec<IdPoolSpec>,
    pub address_pools: Vec<AddressPoolSpec>,
    pub route_targets: RouteTargetSpec,
    pub subnet_uuid: SubnetUuidSpec,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            scan_batch_size: 1000,
            id_pools: vec![IdPoolSpec::virtual_network(), IdPoolSpec::security_group()],
            address_pools: vec![AddressPoolSpec::default()],
            route_targets: RouteTargetSpec::default(),
            subnet_uuid: SubnetUuidSpec::default(),
        }
    }
}

impl AuditConfig {
    pub fn validate(&self) -> AuditResult<()> {
        if self.scan_batch_size == 0 {
            return Err(AuditError::Config("scan_batch_size must be at least 1".into()));
        }
        let mut names = BTreeSet::new();
        for pool in &self.id_pools {
            if !names.insert(pool.name.as_str()) {
                return Err(AuditError::Config(format!("duplicate id pool {}", pool.name)));
            }
            let ranges = validate_ranges(&pool.path, pool.ranges.clone())?;
            for r in &pool.reserved {
                if !ranges.iter().any(|range| range.contains(r.id)) {
                    return Err(AuditError::Config(format!(
                        "{}: reserved id {} outside ranges",
                        pool.name, r.id
                    )));
                }
            }
        }
        let targets = &self.route_targets;
        if targets.ranges.is_empty() {
            return Err(AuditError::Config("route_targets needs at least one range".into()));
        }
        validate_ranges(&targets.path, targets.ranges.clone())?;
        Ok(())
    }
}
