use std::collections::{BTreeMap, BTreeSet};

use cfgdb_types::{FqName, ObjectId};
use serde::Serialize;
use serde_json::Value;

/// Typed pointer to an object.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ObjRef {
    pub obj_type: String,
    pub uuid: ObjectId,
}

impl ObjRef {
    pub fn new(obj_type: impl Into<String>, uuid: ObjectId) -> Self {
        Self { obj_type: obj_type.into(), uuid }
    }
}

/// One reference edge as seen from the reading object.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RefEdge {
    pub obj_type: String,
    pub uuid: ObjectId,
    /// Attribute payload carried by the edge.
    pub attr: Option<Value>,
}

/// Stored value of a `ref:` / `backref:` cell.
#[derive(Clone, Debug, Default, PartialEq, Serialize, serde::Deserialize)]
pub struct RefData {
    pub attr: Option<Value>,
    #[serde(default)]
    pub is_weakref: bool,
}

/// A fully decoded object.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ObjectRecord {
    pub uuid: ObjectId,
    pub obj_type: String,
    pub fq_name: FqName,
    pub parent: Option<ObjRef>,
    pub props: BTreeMap<String, Value>,
    pub prop_lists: BTreeMap<String, Vec<Value>>,
    pub prop_maps: BTreeMap<String, Vec<Value>>,
    pub refs: Vec<RefEdge>,
    pub back_refs: Vec<RefEdge>,
    pub children: Vec<ObjRef>,
}

impl ObjectRecord {
    pub fn prop(&self, field: &str) -> Option<&Value> {
        self.props.get(field)
    }

    pub fn refs_to<'a>(&'a self, obj_type: &'a str) -> impl Iterator<Item = &'a RefEdge> {
        self.refs.iter().filter(move |r| r.obj_type == obj_type)
    }

    pub fn back_refs_from<'a>(&'a self, obj_type: &'a str) -> impl Iterator<Item = &'a RefEdge> {
        self.back_refs.iter().filter(move |r| r.obj_type == obj_type)
    }

    pub fn children_of<'a>(&'a self, obj_type: &'a str) -> impl Iterator<Item = &'a ObjRef> {
        self.children.iter().filter(move |c| c.obj_type == obj_type)
    }

    /// Project the record onto `filter`. Identity, name and parent always survive.
    pub fn filtered(&self, filter: &FieldFilter) -> ObjectRecord {
        let keep = |field: &str| filter.wants(field);
        ObjectRecord {
            uuid: self.uuid,
            obj_type: self.obj_type.clone(),
            fq_name: self.fq_name.clone(),
            parent: self.parent.clone(),
            props: self
                .props
                .iter()
                .filter(|(k, _)| keep(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            prop_lists: self
                .prop_lists
                .iter()
                .filter(|(k, _)| keep(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            prop_maps: self
                .prop_maps
                .iter()
                .filter(|(k, _)| keep(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            refs: self
                .refs
                .iter()
                .filter(|r| keep(&format!("{}_refs", r.obj_type)))
                .cloned()
                .collect(),
            back_refs: if filter.include_back_refs {
                self.back_refs.clone()
            } else {
                Vec::new()
            },
            children: if filter.include_children {
                self.children.clone()
            } else {
                Vec::new()
            },
        }
    }
}

/// Which parts of an object a read returns.
///
/// `fields` names properties and `<type>_refs` groups; `None` means all.
/// Children and back-references are derived regions and must be asked for.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldFilter {
    pub fields: Option<BTreeSet<String>>,
    pub include_back_refs: bool,
    pub include_children: bool,
}

impl FieldFilter {
    /// Everything, including derived regions.
    pub fn all() -> Self {
        Self { fields: None, include_back_refs: true, include_children: true }
    }

    /// Properties and forward references only.
    pub fn properties_only() -> Self {
        Self::default()
    }

    pub fn only<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { fields: Some(fields.into_iter().map(Into::into).collect()), ..Self::default() }
    }

    pub fn wants(&self, field: &str) -> bool {
        self.fields.as_ref().map_or(true, |f| f.contains(field))
    }

    pub fn needs_derived(&self) -> bool {
        self.include_back_refs || self.include_children
    }
}

/// How a reference names its target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefTarget {
    Id(ObjectId),
    Name(FqName),
}

/// A reference to establish from the object being written.
#[derive(Clone, Debug, PartialEq)]
pub struct RefSpec {
    pub obj_type: String,
    pub target: RefTarget,
    pub attr: Option<Value>,
}

impl RefSpec {
    pub fn to_id(obj_type: impl Into<String>, id: ObjectId) -> Self {
        Self { obj_type: obj_type.into(), target: RefTarget::Id(id), attr: None }
    }

    pub fn to_name(obj_type: impl Into<String>, fq_name: FqName) -> Self {
        Self { obj_type: obj_type.into(), target: RefTarget::Name(fq_name), attr: None }
    }

    pub fn with_attr(mut self, attr: Value) -> Self {
        self.attr = Some(attr);
        self
    }
}

/// Input to `ObjectGraphStore::create`.
#[derive(Clone, Debug, PartialEq)]
pub struct NewObject {
    pub obj_type: String,
    pub fq_name: FqName,
    /// Caller-chosen id; generated when `None`.
    pub uuid: Option<ObjectId>,
    /// Owning type. The parent is located by `fq_name` minus its leaf.
    pub parent_type: Option<String>,
    pub props: BTreeMap<String, Value>,
    pub prop_lists: BTreeMap<String, Vec<Value>>,
    pub prop_maps: BTreeMap<String, Vec<Value>>,
    pub refs: Vec<RefSpec>,
}

impl NewObject {
    pub fn new(obj_type: impl Into<String>, fq_name: FqName) -> Self {
        Self {
            obj_type: obj_type.into(),
            fq_name,
            uuid: None,
            parent_type: None,
            props: BTreeMap::new(),
            prop_lists: BTreeMap::new(),
            prop_maps: BTreeMap::new(),
            refs: Vec::new(),
        }
    }

    pub fn with_uuid(mut self, uuid: ObjectId) -> Self {
        self.uuid = Some(uuid);
        self
    }

    pub fn with_parent(mut self, parent_type: impl Into<String>) -> Self {
        self.parent_type = Some(parent_type.into());
        self
    }

    pub fn prop(mut self, field: impl Into<String>, value: Value) -> Self {
        self.props.insert(field.into(), value);
        self
    }

    pub fn list(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.prop_lists.insert(field.into(), values);
        self
    }

    pub fn map(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.prop_maps.insert(field.into(), values);
        self
    }

    pub fn reference(mut self, spec: RefSpec) -> Self {
        self.refs.push(spec);
        self
    }
}

/// Input to `ObjectGraphStore::update`. Only named fields change.
///
/// A `None` value removes the field. A `refs` entry replaces the full set of
/// references to that target type; an empty vector removes them all.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjectUpdate {
    pub props: BTreeMap<String, Option<Value>>,
    pub prop_lists: BTreeMap<String, Option<Vec<Value>>>,
    pub prop_maps: BTreeMap<String, Option<Vec<Value>>>,
    pub refs: BTreeMap<String, Vec<RefSpec>>,
}

impl ObjectUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: Value) -> Self {
        self.props.insert(field.into(), Some(value));
        self
    }

    pub fn clear(mut self, field: impl Into<String>) -> Self {
        self.props.insert(field.into(), None);
        self
    }

    pub fn set_list(mut self, field: impl Into<String>, values: Option<Vec<Value>>) -> Self {
        self.prop_lists.insert(field.into(), values);
        self
    }

    pub fn set_map(mut self, field: impl Into<String>, values: Option<Vec<Value>>) -> Self {
        self.prop_maps.insert(field.into(), values);
        self
    }

    pub fn set_refs(mut self, obj_type: impl Into<String>, specs: Vec<RefSpec>) -> Self {
        self.refs.insert(obj_type.into(), specs);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
            && self.prop_lists.is_empty()
            && self.prop_maps.is_empty()
            && self.refs.is_empty()
    }
}

/// Candidate set a list query starts from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListScope {
    /// Every indexed object of the type.
    All,
    /// Children of any of these parents.
    Parents(Vec<ObjectId>),
    /// Objects referring to any of these anchors.
    BackRefs(Vec<ObjectId>),
    /// Exactly these ids, when they exist with the queried type.
    Ids(Vec<ObjectId>),
}

/// Property predicate: equality, or containment when both sides are JSON objects.
#[derive(Clone, Debug, PartialEq)]
pub struct PropFilter {
    pub field: String,
    pub value: Value,
}

impl PropFilter {
    pub fn new(field: impl Into<String>, value: Value) -> Self {
        Self { field: field.into(), value }
    }

    pub fn matches(&self, actual: &Value) -> bool {
        json_contains(actual, &self.value)
    }
}

fn json_contains(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Object(a), Value::Object(e)) => e
            .iter()
            .all(|(k, ev)| a.get(k).is_some_and(|av| json_contains(av, ev))),
        _ => actual == expected,
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ListQuery {
    pub obj_type: String,
    pub scope: ListScope,
    pub filters: Vec<PropFilter>,
}

impl ListQuery {
    pub fn all(obj_type: impl Into<String>) -> Self {
        Self { obj_type: obj_type.into(), scope: ListScope::All, filters: Vec::new() }
    }

    pub fn children_of(obj_type: impl Into<String>, parents: Vec<ObjectId>) -> Self {
        Self { obj_type: obj_type.into(), scope: ListScope::Parents(parents), filters: Vec::new() }
    }

    pub fn referring_to(obj_type: impl Into<String>, anchors: Vec<ObjectId>) -> Self {
        Self { obj_type: obj_type.into(), scope: ListScope::BackRefs(anchors), filters: Vec::new() }
    }

    pub fn ids(obj_type: impl Into<String>, ids: Vec<ObjectId>) -> Self {
        Self { obj_type: obj_type.into(), scope: ListScope::Ids(ids), filters: Vec::new() }
    }

    pub fn filter(mut self, filter: PropFilter) -> Self {
        self.filters.push(filter);
        self
    }
}

/// One list result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ListEntry {
    pub uuid: ObjectId,
    pub fq_name: FqName,
}
