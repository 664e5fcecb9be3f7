//! Static type schema registry.
//!
//! Every object type is described once by a [`TypeSchema`]: which parent
//! types may own it, which fields are scalar properties, ordered lists or
//! keyed maps, and which types it may reference. The registry is built at
//! start-up and shared read-only by the storage engine and the auditor.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::TypeError;

/// Properties every type carries in addition to its own.
pub const COMMON_PROPERTIES: &[&str] = &["id_perms", "display_name", "annotations", "perms2"];

/// Storage shape of a property field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    /// One cell holding the whole value.
    Scalar,
    /// One cell per element, addressed by position.
    List,
    /// One cell per element, addressed by the value of the map's key field.
    Map,
}

/// Schema descriptor for one object type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeSchema {
    name: String,
    parent_types: BTreeSet<String>,
    properties: BTreeSet<String>,
    list_properties: BTreeSet<String>,
    map_properties: BTreeMap<String, String>,
    ref_types: BTreeSet<String>,
    required: Vec<String>,
    cache_excluded: bool,
}

impl TypeSchema {
    /// Start a schema for `name` carrying only the common properties.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent_types: BTreeSet::new(),
            properties: COMMON_PROPERTIES.iter().map(|p| p.to_string()).collect(),
            list_properties: BTreeSet::new(),
            map_properties: BTreeMap::new(),
            ref_types: BTreeSet::new(),
            required: Vec::new(),
            cache_excluded: false,
        }
    }

    pub fn parent(mut self, parent_type: &str) -> Self {
        self.parent_types.insert(parent_type.to_string());
        self
    }

    pub fn properties(mut self, names: &[&str]) -> Self {
        self.properties.extend(names.iter().map(|n| n.to_string()));
        self
    }

    pub fn list_property(mut self, name: &str) -> Self {
        self.list_properties.insert(name.to_string());
        self
    }

    /// Declare a keyed map property whose elements are addressed by `key_field`.
    pub fn map_property(mut self, name: &str, key_field: &str) -> Self {
        self.map_properties.insert(name.to_string(), key_field.to_string());
        self
    }

    pub fn refs(mut self, target_types: &[&str]) -> Self {
        self.ref_types.extend(target_types.iter().map(|t| t.to_string()));
        self
    }

    /// Fields that must be present on every stored object of this type.
    pub fn required(mut self, fields: &[&str]) -> Self {
        self.required.extend(fields.iter().map(|f| f.to_string()));
        self
    }

    /// Mark the type as never cached; edges pointing at it skip activity touches.
    pub fn exclude_from_cache(mut self) -> Self {
        self.cache_excluded = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent_types(&self) -> impl Iterator<Item = &str> {
        self.parent_types.iter().map(String::as_str)
    }

    pub fn ref_types(&self) -> impl Iterator<Item = &str> {
        self.ref_types.iter().map(String::as_str)
    }

    pub fn required_fields(&self) -> &[String] {
        &self.required
    }

    pub fn is_cache_excluded(&self) -> bool {
        self.cache_excluded
    }

    pub fn allows_parent(&self, parent_type: &str) -> bool {
        self.parent_types.contains(parent_type)
    }

    pub fn has_ref(&self, target_type: &str) -> bool {
        self.ref_types.contains(target_type)
    }

    /// Storage shape of `field`, or `None` if the type does not declare it.
    pub fn field_kind(&self, field: &str) -> Option<FieldKind> {
        if self.properties.contains(field) {
            Some(FieldKind::Scalar)
        } else if self.list_properties.contains(field) {
            Some(FieldKind::List)
        } else if self.map_properties.contains_key(field) {
            Some(FieldKind::Map)
        } else {
            None
        }
    }

    /// Key field of a map property.
    pub fn map_key(&self, field: &str) -> Option<&str> {
        self.map_properties.get(field).map(String::as_str)
    }
}

/// Registry mapping a type tag to its schema.
#[derive(Clone, Debug, Default)]
pub struct SchemaRegistry {
    types: BTreeMap<String, TypeSchema>,
}

impl SchemaRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a type schema.
    pub fn register(&mut self, schema: TypeSchema) -> &mut Self {
        self.types.insert(schema.name.clone(), schema);
        self
    }

    /// Builder-style [`SchemaRegistry::register`].
    pub fn with(mut self, schema: TypeSchema) -> Self {
        self.register(schema);
        self
    }

    pub fn get(&self, obj_type: &str) -> Option<&TypeSchema> {
        self.types.get(obj_type)
    }

    /// Like [`SchemaRegistry::get`] but fails for unknown types.
    pub fn require(&self, obj_type: &str) -> Result<&TypeSchema, TypeError> {
        self.get(obj_type)
            .ok_or_else(|| TypeError::UnknownType(obj_type.to_string()))
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    /// Types that may be owned by `parent_type`.
    pub fn child_types_of<'a>(&'a self, parent_type: &'a str) -> impl Iterator<Item = &'a str> {
        self.types
            .values()
            .filter(move |s| s.allows_parent(parent_type))
            .map(|s| s.name.as_str())
    }

    pub fn is_cache_excluded(&self, obj_type: &str) -> bool {
        self.get(obj_type).is_some_and(TypeSchema::is_cache_excluded)
    }

    /// The network-configuration types known out of the box.
    pub fn builtin() -> Self {
        Self::new()
            .with(TypeSchema::new("domain"))
            .with(TypeSchema::new("project").parent("domain").properties(&["quota"]))
            .with(
                TypeSchema::new("virtual_network")
                    .parent("project")
                    .properties(&[
                        "virtual_network_network_id",
                        "virtual_network_properties",
                        "is_shared",
                        "router_external",
                    ])
                    .list_property("route_target_list")
                    .map_property("ipam_subnets", "subnet_uuid")
                    .refs(&["network_ipam", "network_policy", "route_table"]),
            )
            .with(TypeSchema::new("network_ipam").parent("project").properties(&["ipam_method"]))
            .with(
                TypeSchema::new("network_policy")
                    .parent("project")
                    .list_property("network_policy_entries"),
            )
            .with(TypeSchema::new("route_table").parent("project").list_property("routes"))
            .with(
                TypeSchema::new("security_group")
                    .parent("project")
                    .properties(&["security_group_id", "configured_security_group_id"])
                    .list_property("security_group_entries"),
            )
            .with(TypeSchema::new("virtual_machine").properties(&["server_type"]))
            .with(
                TypeSchema::new("virtual_machine_interface")
                    .parent("project")
                    .parent("virtual_machine")
                    .properties(&["virtual_machine_interface_device_owner"])
                    .list_property("virtual_machine_interface_mac_addresses")
                    .map_property("virtual_machine_interface_bindings", "key")
                    .refs(&[
                        "virtual_network",
                        "security_group",
                        "virtual_machine",
                        "virtual_machine_interface",
                        "routing_instance",
                    ]),
            )
            .with(
                TypeSchema::new("instance_ip")
                    .properties(&["instance_ip_address", "instance_ip_family", "subnet_uuid"])
                    .refs(&["virtual_network", "virtual_machine_interface"]),
            )
            .with(
                TypeSchema::new("routing_instance")
                    .parent("virtual_network")
                    .properties(&["routing_instance_is_default"])
                    .refs(&["route_target", "routing_instance"]),
            )
            .with(TypeSchema::new("route_target").exclude_from_cache())
    }
}
