//! Cell-name grammar of object rows and the name index.
//!
//! ```text
//! type                       object type tag
//! fq_name                    JSON array of name components
//! META:latest_col_ts         activity marker (timestamp is the marker)
//! prop:<field>               scalar property
//! propl:<field>:<position>   list element
//! propm:<field>:<key>        map element
//! parent:<type>:<uuid>       edge to the owning object
//! children:<type>:<uuid>     edge to an owned object
//! ref:<type>:<uuid>          forward (or same-type mirrored) reference
//! backref:<type>:<uuid>      cross-type reference arriving from <uuid>
//! ```
//!
//! Name index cells live in [`FQ_TABLE`], row = object type, column =
//! `<encoded fq_name>:<uuid>`.

use cfgdb_types::{FqName, ObjectId};

pub const OBJ_TABLE: &str = "obj_uuid_table";
pub const FQ_TABLE: &str = "obj_fq_name_table";

pub const TYPE_COL: &str = "type";
pub const FQ_NAME_COL: &str = "fq_name";
pub const LATEST_COL: &str = "META:latest_col_ts";
pub const ID_PERMS_COL: &str = "prop:id_perms";

/// Columns sorting at or after this start skip the `META:`, `backref:` and
/// `children:` regions.
pub const PROPERTY_REGION_START: &str = "d";

pub fn prop_col(field: &str) -> String {
    format!("prop:{field}")
}

pub fn list_prefix(field: &str) -> String {
    format!("propl:{field}:")
}

pub fn list_col(field: &str, position: &str) -> String {
    format!("propl:{field}:{position}")
}

pub fn map_prefix(field: &str) -> String {
    format!("propm:{field}:")
}

pub fn map_col(field: &str, key: &str) -> String {
    format!("propm:{field}:{key}")
}

pub fn parent_col(obj_type: &str, id: &ObjectId) -> String {
    format!("parent:{obj_type}:{id}")
}

pub fn children_prefix(obj_type: &str) -> String {
    format!("children:{obj_type}:")
}

pub fn child_col(obj_type: &str, id: &ObjectId) -> String {
    format!("children:{obj_type}:{id}")
}

pub fn ref_prefix(obj_type: &str) -> String {
    format!("ref:{obj_type}:")
}

pub fn ref_col(obj_type: &str, id: &ObjectId) -> String {
    format!("ref:{obj_type}:{id}")
}

pub fn backref_prefix(obj_type: &str) -> String {
    format!("backref:{obj_type}:")
}

pub fn backref_col(obj_type: &str, id: &ObjectId) -> String {
    format!("backref:{obj_type}:{id}")
}

pub fn index_prefix(fq_name: &FqName) -> String {
    format!("{}:", fq_name.encode())
}

pub fn index_col(fq_name: &FqName, id: &ObjectId) -> String {
    format!("{}:{id}", fq_name.encode())
}

/// Split an index column back into name and id. `None` if malformed.
pub fn parse_index_col(column: &str) -> Option<(FqName, ObjectId)> {
    let (encoded, id) = column.rsplit_once(':')?;
    let id = ObjectId::parse(id).ok()?;
    let fq_name = FqName::decode(encoded).ok()?;
    Some((fq_name, id))
}

/// A parsed object-row column name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Column {
    Type,
    FqName,
    Meta(String),
    Prop(String),
    ListElement { field: String, position: String },
    MapElement { field: String, key: String },
    Parent(String, ObjectId),
    Child(String, ObjectId),
    Ref(String, ObjectId),
    BackRef(String, ObjectId),
    /// Anything not matching the grammar.
    Unknown(String),
}

impl Column {
    pub fn parse(column: &str) -> Column {
        let unknown = || Column::Unknown(column.to_string());
        match column {
            TYPE_COL => return Column::Type,
            FQ_NAME_COL => return Column::FqName,
            _ => {}
        }
        let Some((prefix, rest)) = column.split_once(':') else {
            return unknown();
        };
        let edge = |rest: &str| -> Option<(String, ObjectId)> {
            let (obj_type, id) = rest.split_once(':')?;
            Some((obj_type.to_string(), ObjectId::parse(id).ok()?))
        };
        match prefix {
            "META" => Column::Meta(rest.to_string()),
            "prop" => Column::Prop(rest.to_string()),
            "propl" => match rest.split_once(':') {
                Some((field, position)) => Column::ListElement {
                    field: field.to_string(),
                    position: position.to_string(),
                },
                None => unknown(),
            },
            "propm" => match rest.split_once(':') {
                Some((field, key)) => Column::MapElement {
                    field: field.to_string(),
                    key: key.to_string(),
                },
                None => unknown(),
            },
            "parent" => edge(rest).map_or_else(unknown, |(t, id)| Column::Parent(t, id)),
            "children" => edge(rest).map_or_else(unknown, |(t, id)| Column::Child(t, id)),
            "ref" => edge(rest).map_or_else(unknown, |(t, id)| Column::Ref(t, id)),
            "backref" => edge(rest).map_or_else(unknown, |(t, id)| Column::BackRef(t, id)),
            _ => unknown(),
        }
    }

    /// Whether the column belongs to the derived children/backref region.
    pub fn is_derived(&self) -> bool {
        matches!(self, Column::Child(..) | Column::BackRef(..) | Column::Meta(_))
    }
}
