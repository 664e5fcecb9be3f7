use std::fmt;

use cfgdb_types::{FqName, ObjectId};
use serde::Serialize;

/// Category of an audit finding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    /// Index entry whose object is gone or unparsable.
    StaleIndex,
    /// Live object with no index entry for its name.
    MissingIndex,
    /// Index entry naming a live object under the wrong type or name.
    FqNameMismatch,
    /// Several live objects share one `(type, fq_name)`.
    DuplicateFqName,
    MissingMandatoryField,
    /// Edge cell pointing at an object that does not exist.
    OrphanedReference,
    /// Edge between live objects whose mirror cell is absent.
    MissingMirrorEdge,
    /// Object whose parent edges all point at missing objects.
    OrphanResource,
    IdExtraInPool,
    IdMissingInPool,
    DuplicateId,
    IdOutOfRange,
    IdMissingOnResource,
    AddressExtraInPool,
    AddressMissingInPool,
    DuplicateAddress,
    AddressOutsideSubnets,
    /// Route target whose name is not `target:<asn>:<number>`.
    MalformedRouteTarget,
    /// System route target object with no matching pool entry.
    RouteTargetIdExtraInConfig,
    /// Route target pool entry with no matching object.
    RouteTargetIdExtraInPool,
    /// Configured route target list entry inside the system range.
    RouteTargetInSystemRange,
    /// Subnet uuid mapping with no subnet behind it.
    SubnetUuidExtra,
    /// Subnet with no uuid mapping.
    SubnetUuidMissing,
    /// Subnet key mapping naming a uuid with no mapping of its own.
    SubnetKeyWithoutUuid,
    /// Subnet element lacking its prefix.
    MalformedSubnet,
}

/// One detected divergence. `keys` are the machine-readable coordinates the
/// repair paths act on; their layout is fixed per kind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub kind: FindingKind,
    pub message: String,
    pub keys: Vec<String>,
}

impl Finding {
    fn new(kind: FindingKind, message: String, keys: Vec<String>) -> Self {
        Self { kind, message, keys }
    }

    /// keys: `[obj_type, index column]`
    pub fn stale_index(obj_type: &str, column: &str, reason: &str) -> Self {
        Self::new(
            FindingKind::StaleIndex,
            format!("stale {obj_type} index entry {column}: {reason}"),
            vec![obj_type.into(), column.into()],
        )
    }

    /// keys: `[obj_type, encoded fq_name, uuid]`
    pub fn missing_index(obj_type: &str, fq_name: &FqName, id: &ObjectId) -> Self {
        Self::new(
            FindingKind::MissingIndex,
            format!("{obj_type} {fq_name} ({id}) has no index entry"),
            vec![obj_type.into(), fq_name.encode(), id.to_string()],
        )
    }

    /// keys: `[obj_type, index column]`
    pub fn fq_name_mismatch(obj_type: &str, column: &str, actual_type: &str, actual: &FqName) -> Self {
        Self::new(
            FindingKind::FqNameMismatch,
            format!("{obj_type} index entry {column} names object stored as {actual_type} {actual}"),
            vec![obj_type.into(), column.into()],
        )
    }

    /// keys: `[obj_type, encoded fq_name, uuid...]`
    pub fn duplicate_fq_name(obj_type: &str, fq_name: &FqName, ids: &[ObjectId]) -> Self {
        let mut keys = vec![obj_type.to_string(), fq_name.encode()];
        keys.extend(ids.iter().map(ToString::to_string));
        Self::new(
            FindingKind::DuplicateFqName,
            format!("{obj_type} {fq_name} is held by {} objects", ids.len()),
            keys,
        )
    }

    /// keys: `[row, field]`
    pub fn missing_mandatory_field(row: &str, field: &str) -> Self {
        Self::new(
            FindingKind::MissingMandatoryField,
            format!("object {row} is missing {field}"),
            vec![row.into(), field.into()],
        )
    }

    /// keys: `[row, column]`
    pub fn orphaned_reference(row: &str, column: &str) -> Self {
        Self::new(
            FindingKind::OrphanedReference,
            format!("object {row} has edge {column} to a missing object"),
            vec![row.into(), column.into()],
        )
    }

    /// keys: `[row, column, mirror row, mirror column]`
    pub fn missing_mirror_edge(row: &str, column: &str, mirror_row: &str, mirror_column: &str) -> Self {
        Self::new(
            FindingKind::MissingMirrorEdge,
            format!("object {row} edge {column} has no {mirror_column} on {mirror_row}"),
            vec![row.into(), column.into(), mirror_row.into(), mirror_column.into()],
        )
    }

    /// keys: `[obj_type, uuid, parent column]`
    pub fn orphan_resource(obj_type: &str, id: &ObjectId, parent_column: &str) -> Self {
        Self::new(
            FindingKind::OrphanResource,
            format!("{obj_type} {id} parent does not exist: {parent_column}"),
            vec![obj_type.into(), id.to_string(), parent_column.into()],
        )
    }

    /// keys: `[path, id, value]`
    pub fn id_extra_in_pool(path: &str, id: u64, value: Option<&str>) -> Self {
        Self::new(
            FindingKind::IdExtraInPool,
            format!("{path}: id {id} held by {} has no matching resource", value.unwrap_or("-")),
            vec![path.into(), id.to_string(), value.unwrap_or_default().into()],
        )
    }

    /// keys: `[path, id, value]`
    pub fn id_missing_in_pool(path: &str, id: u64, value: &str) -> Self {
        Self::new(
            FindingKind::IdMissingInPool,
            format!("{path}: id {id} used by {value} is not allocated"),
            vec![path.into(), id.to_string(), value.into()],
        )
    }

    /// keys: `[path, id, uuid...]`
    pub fn duplicate_id(path: &str, id: u64, owners: &[(String, ObjectId)]) -> Self {
        let mut keys = vec![path.to_string(), id.to_string()];
        keys.extend(owners.iter().map(|(_, uuid)| uuid.to_string()));
        let names: Vec<&str> = owners.iter().map(|(fq, _)| fq.as_str()).collect();
        Self::new(
            FindingKind::DuplicateId,
            format!("{path}: id {id} is used by {}", names.join(", ")),
            keys,
        )
    }

    /// keys: `[path, uuid, value]`
    pub fn id_out_of_range(path: &str, id: &ObjectId, fq_name: &str, value: u64) -> Self {
        Self::new(
            FindingKind::IdOutOfRange,
            format!("{path}: {fq_name} ({id}) holds {value}, outside the pool ranges"),
            vec![path.into(), id.to_string(), value.to_string()],
        )
    }

    /// keys: `[path, uuid]`
    pub fn id_missing_on_resource(path: &str, id: &ObjectId, fq_name: &str) -> Self {
        Self::new(
            FindingKind::IdMissingOnResource,
            format!("{path}: {fq_name} ({id}) has no id"),
            vec![path.into(), id.to_string()],
        )
    }

    /// keys: `[path, address, value]`
    pub fn address_extra_in_pool(path: &str, addr: &str, value: Option<&str>) -> Self {
        Self::new(
            FindingKind::AddressExtraInPool,
            format!("{path}: {addr} held by {} has no matching ip", value.unwrap_or("-")),
            vec![path.into(), addr.into(), value.unwrap_or_default().into()],
        )
    }

    /// keys: `[path, address, value]`
    pub fn address_missing_in_pool(path: &str, addr: &str, value: &str) -> Self {
        Self::new(
            FindingKind::AddressMissingInPool,
            format!("{path}: {addr} used by {value} is not allocated"),
            vec![path.into(), addr.into(), value.into()],
        )
    }

    /// keys: `[path, address, uuid...]`
    pub fn duplicate_address(path: &str, addr: &str, owners: &[String]) -> Self {
        let mut keys = vec![path.to_string(), addr.to_string()];
        keys.extend(owners.iter().cloned());
        Self::new(
            FindingKind::DuplicateAddress,
            format!("{path}: {addr} is used by {} ips", owners.len()),
            keys,
        )
    }

    /// keys: `[uuid, address]`
    pub fn address_outside_subnets(id: &ObjectId, addr: &str, network: &str) -> Self {
        Self::new(
            FindingKind::AddressOutsideSubnets,
            format!("ip {id} address {addr} is in no subnet of {network}"),
            vec![id.to_string(), addr.into()],
        )
    }

    /// keys: `[uuid, name]`
    pub fn malformed_route_target(id: &ObjectId, name: &str) -> Self {
        Self::new(
            FindingKind::MalformedRouteTarget,
            format!("route target {name:?} ({id}) is malformed"),
            vec![id.to_string(), name.into()],
        )
    }

    /// keys: `[uuid, id, owner]`
    pub fn route_target_id_extra_in_config(id: &ObjectId, number: u64, owner: &str) -> Self {
        Self::new(
            FindingKind::RouteTargetIdExtraInConfig,
            format!("route target {id} holds id {number} for {owner} without a pool entry"),
            vec![id.to_string(), number.to_string(), owner.into()],
        )
    }

    /// keys: `[path, id, value]`
    pub fn route_target_id_extra_in_pool(path: &str, number: u64, value: Option<&str>) -> Self {
        Self::new(
            FindingKind::RouteTargetIdExtraInPool,
            format!("{path}: route target id {number} held by {} has no route target", value.unwrap_or("-")),
            vec![path.into(), number.to_string(), value.unwrap_or_default().into()],
        )
    }

    /// keys: `[uuid, field, route target]`
    pub fn route_target_in_system_range(id: &ObjectId, field: &str, target: &str) -> Self {
        Self::new(
            FindingKind::RouteTargetInSystemRange,
            format!("object {id} {field} holds {target} from the system range"),
            vec![id.to_string(), field.into(), target.into()],
        )
    }

    /// keys: `[subnet uuid, subnet key]`
    pub fn subnet_uuid_extra(subnet_uuid: &str, key: &str) -> Self {
        Self::new(
            FindingKind::SubnetUuidExtra,
            format!("subnet uuid {subnet_uuid} maps {key:?} but no such subnet exists"),
            vec![subnet_uuid.into(), key.into()],
        )
    }

    /// keys: `[subnet uuid, subnet key]`
    pub fn subnet_uuid_missing(subnet_uuid: &str, key: &str) -> Self {
        Self::new(
            FindingKind::SubnetUuidMissing,
            format!("subnet {key:?} has no mapping for uuid {subnet_uuid}"),
            vec![subnet_uuid.into(), key.into()],
        )
    }

    /// keys: `[subnet key, subnet uuid]`
    pub fn subnet_key_without_uuid(key: &str, subnet_uuid: &str) -> Self {
        Self::new(
            FindingKind::SubnetKeyWithoutUuid,
            format!("subnet key {key:?} maps to {subnet_uuid}, which has no mapping"),
            vec![key.into(), subnet_uuid.into()],
        )
    }

    /// keys: `[network uuid, subnet uuid]`
    pub fn malformed_subnet(network: &ObjectId, subnet_uuid: &str) -> Self {
        Self::new(
            FindingKind::MalformedSubnet,
            format!("subnet {subnet_uuid} of network {network} has no prefix"),
            vec![network.to_string(), subnet_uuid.into()],
        )
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)
    }
}
