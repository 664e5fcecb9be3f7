//! Property codec: structured field values to and from cells.
//!
//! Scalars occupy one `prop:` cell. Lists are split into one `propl:` cell
//! per element addressed by position; maps into one `propm:` cell per
//! element addressed by the value of the map's key field. Cell values are
//! JSON text.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde_json::{Map, Value};

use crate::columns::{list_col, map_col, prop_col};
use crate::error::{GraphError, GraphResult};

/// Cell mutations produced by encoding one field.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CellWrites {
    pub puts: Vec<(String, String)>,
    pub deletes: Vec<String>,
}

impl CellWrites {
    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.deletes.is_empty()
    }

    /// Append to `batch` for one row. Deletes go first so a rewritten
    /// element keeps its new value.
    pub fn apply_to(self, batch: &mut cfgdb_store::WriteBatch, table: &str, row: &str) {
        for column in self.deletes {
            batch.delete_cell(table, row, column);
        }
        for (column, value) in self.puts {
            batch.put(table, row, column, value);
        }
    }
}

/// Stateless encoder/decoder for property cells.
pub struct PropertyCodec;

impl PropertyCodec {
    /// Encode a scalar. `None` and JSON `null` both delete the cell, so a
    /// stored property is never `null`.
    pub fn encode_scalar(field: &str, value: Option<&Value>) -> GraphResult<CellWrites> {
        check_field_name(field)?;
        let mut writes = CellWrites::default();
        match value.filter(|v| !v.is_null()) {
            Some(v) => writes.puts.push((prop_col(field), to_json(field, v)?)),
            None => writes.deletes.push(prop_col(field)),
        }
        Ok(writes)
    }

    /// Encode a list, replacing every element at `existing_positions`.
    /// `None` deletes the whole list; `null` elements are dropped.
    pub fn encode_list(
        field: &str,
        values: Option<&[Value]>,
        existing_positions: &[String],
    ) -> GraphResult<CellWrites> {
        check_field_name(field)?;
        let mut writes = CellWrites::default();
        let values: Vec<&Value> = values.unwrap_or_default().iter().filter(|v| !v.is_null()).collect();
        let new_positions: BTreeSet<String> = (0..values.len()).map(|i| i.to_string()).collect();
        for position in existing_positions {
            if !new_positions.contains(position) {
                writes.deletes.push(list_col(field, position));
            }
        }
        for (i, v) in values.iter().enumerate() {
            writes.puts.push((list_col(field, &i.to_string()), to_json(field, v)?));
        }
        Ok(writes)
    }

    /// Encode a keyed map, deleting elements at `existing_keys` that are
    /// no longer present. `None` deletes the whole map; `null` elements are
    /// dropped.
    pub fn encode_map(
        field: &str,
        key_field: &str,
        values: Option<&[Value]>,
        existing_keys: &[String],
    ) -> GraphResult<CellWrites> {
        check_field_name(field)?;
        let mut writes = CellWrites::default();
        let mut new_keys = BTreeSet::new();
        for v in values.unwrap_or_default().iter().filter(|v| !v.is_null()) {
            let key = Self::map_key(field, key_field, v)?;
            if !new_keys.insert(key.clone()) {
                return Err(GraphError::Serialization(format!(
                    "{field}: duplicate map key {key:?}"
                )));
            }
            writes.puts.push((map_col(field, &key), to_json(field, v)?));
        }
        for key in existing_keys {
            if !new_keys.contains(key) {
                writes.deletes.push(map_col(field, key));
            }
        }
        Ok(writes)
    }

    /// Key of a map element: the string (or number) at `key_field`.
    pub fn map_key(field: &str, key_field: &str, element: &Value) -> GraphResult<String> {
        match element.get(key_field) {
            Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            _ => Err(GraphError::Serialization(format!(
                "{field}: element has no usable {key_field:?} key"
            ))),
        }
    }

    pub fn decode_value(field: &str, raw: &str) -> GraphResult<Value> {
        serde_json::from_str(raw)
            .map_err(|e| GraphError::Serialization(format!("{field}: {e}")))
    }

    /// Decode `(position, raw)` pairs into a list ordered by numeric position.
    pub fn decode_list(field: &str, mut elements: Vec<(String, String)>) -> GraphResult<Vec<Value>> {
        elements.sort_by(|(a, _), (b, _)| compare_positions(a, b));
        elements
            .iter()
            .map(|(_, raw)| Self::decode_value(field, raw))
            .collect()
    }

    /// Decode `(key, raw)` pairs into a list ordered by key.
    pub fn decode_map(field: &str, mut elements: Vec<(String, String)>) -> GraphResult<Vec<Value>> {
        elements.sort_by(|(a, _), (b, _)| a.cmp(b));
        elements
            .iter()
            .map(|(_, raw)| Self::decode_value(field, raw))
            .collect()
    }
}

/// Numeric positions order numerically and before any non-numeric one.
pub fn compare_positions(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

fn check_field_name(field: &str) -> GraphResult<()> {
    if field.is_empty() || field.contains(':') {
        return Err(GraphError::Serialization(format!(
            "field name {field:?} cannot be used in a cell name"
        )));
    }
    Ok(())
}

fn to_json(field: &str, value: &Value) -> GraphResult<String> {
    serde_json::to_string(value).map_err(|e| GraphError::Serialization(format!("{field}: {e}")))
}

/// Current UTC time in the `id_perms` timestamp format.
pub fn now_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

/// Fill the bookkeeping members of an `id_perms` value.
///
/// `last_modified` is always overwritten with `now`; `created` only when
/// absent. `enable` and `user_visible` default to `true`.
pub fn stamp_id_perms(current: Option<Value>, now: &str) -> Value {
    let mut perms = match current {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    perms
        .entry("created")
        .or_insert_with(|| Value::String(now.to_string()));
    perms.insert("last_modified".into(), Value::String(now.to_string()));
    perms.entry("enable").or_insert(Value::Bool(true));
    perms.entry("user_visible").or_insert(Value::Bool(true));
    Value::Object(perms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn scalar_put_and_delete() {
        let w = PropertyCodec::encode_scalar("display_name", Some(&json!("vn1"))).unwrap();
        assert_eq!(w.puts, vec![("prop:display_name".to_string(), "\"vn1\"".to_string())]);
        assert!(w.deletes.is_empty());

        let w = PropertyCodec::encode_scalar("display_name", None).unwrap();
        assert!(w.puts.is_empty());
        assert_eq!(w.deletes, vec!["prop:display_name".to_string()]);
    }

    #[test]
    fn null_scalar_deletes_instead_of_storing() {
        let w = PropertyCodec::encode_scalar("display_name", Some(&Value::Null)).unwrap();
        assert!(w.puts.is_empty());
        assert_eq!(w.deletes, vec!["prop:display_name".to_string()]);
    }

    #[test]
    fn null_elements_never_become_cells() {
        let existing = vec!["0".to_string(), "1".to_string(), "2".to_string()];
        let values = [json!("a"), Value::Null, json!("b")];
        let w = PropertyCodec::encode_list("routes", Some(&values), &existing).unwrap();
        assert_eq!(
            w.puts,
            vec![
                ("propl:routes:0".to_string(), "\"a\"".to_string()),
                ("propl:routes:1".to_string(), "\"b\"".to_string()),
            ]
        );
        assert_eq!(w.deletes, vec!["propl:routes:2".to_string()]);

        let values = [Value::Null, json!({"subnet_uuid": "s1"})];
        let w = PropertyCodec::encode_map("ipam_subnets", "subnet_uuid", Some(&values), &[]).unwrap();
        assert_eq!(w.puts.len(), 1);
        assert!(w.puts.iter().all(|(_, raw)| raw != "null"));
    }

    #[test]
    fn bad_field_name_rejected() {
        let err = PropertyCodec::encode_scalar("a:b", Some(&json!(1))).unwrap_err();
        assert!(matches!(err, GraphError::Serialization(_)));
        assert!(PropertyCodec::encode_list("", None, &[]).is_err());
    }

    #[test]
    fn list_shrink_deletes_tail() {
        let existing: Vec<String> = ["0", "1", "2"].iter().map(|s| s.to_string()).collect();
        let values = [json!("a")];
        let w = PropertyCodec::encode_list("routes", Some(&values), &existing).unwrap();
        assert_eq!(w.deletes, vec!["propl:routes:1".to_string(), "propl:routes:2".to_string()]);
        assert_eq!(w.puts, vec![("propl:routes:0".to_string(), "\"a\"".to_string())]);
    }

    #[test]
    fn list_none_deletes_everything() {
        let existing = vec!["0".to_string(), "1".to_string()];
        let w = PropertyCodec::encode_list("routes", None, &existing).unwrap();
        assert!(w.puts.is_empty());
        assert_eq!(w.deletes.len(), 2);
    }

    #[test]
    fn decode_list_orders_numerically() {
        let elements = vec![
            ("10".to_string(), "10".to_string()),
            ("2".to_string(), "2".to_string()),
            ("0".to_string(), "0".to_string()),
        ];
        let values = PropertyCodec::decode_list("f", elements).unwrap();
        assert_eq!(values, vec![json!(0), json!(2), json!(10)]);
    }

    #[test]
    fn map_elements_keyed_by_key_field() {
        let values = [
            json!({"subnet_uuid": "s1", "prefix": "10.0.0.0/24"}),
            json!({"subnet_uuid": "s2", "prefix": "10.0.1.0/24"}),
        ];
        let existing = vec!["s0".to_string(), "s1".to_string()];
        let w = PropertyCodec::encode_map("ipam_subnets", "subnet_uuid", Some(&values), &existing)
            .unwrap();
        let put_cols: Vec<&str> = w.puts.iter().map(|(c, _)| c.as_str()).collect();
        assert_eq!(put_cols, vec!["propm:ipam_subnets:s1", "propm:ipam_subnets:s2"]);
        assert_eq!(w.deletes, vec!["propm:ipam_subnets:s0".to_string()]);
    }

    #[test]
    fn map_element_without_key_fails() {
        let values = [json!({"prefix": "10.0.0.0/24"})];
        let err = PropertyCodec::encode_map("ipam_subnets", "subnet_uuid", Some(&values), &[])
            .unwrap_err();
        assert!(matches!(err, GraphError::Serialization(_)));
    }

    #[test]
    fn map_duplicate_key_fails() {
        let values = [json!({"key": "a"}), json!({"key": "a"})];
        assert!(PropertyCodec::encode_map("m", "key", Some(&values), &[]).is_err());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            PropertyCodec::decode_value("f", "{not json"),
            Err(GraphError::Serialization(_))
        ));
    }

    #[test]
    fn stamp_keeps_created_and_refreshes_modified() {
        let first = stamp_id_perms(None, "2024-01-01T00:00:00.000000");
        assert_eq!(first["created"], json!("2024-01-01T00:00:00.000000"));
        assert_eq!(first["enable"], json!(true));

        let second = stamp_id_perms(Some(first), "2024-02-02T00:00:00.000000");
        assert_eq!(second["created"], json!("2024-01-01T00:00:00.000000"));
        assert_eq!(second["last_modified"], json!("2024-02-02T00:00:00.000000"));
    }

    #[test]
    fn stamp_preserves_explicit_flags() {
        let v = stamp_id_perms(Some(json!({"enable": false, "description": "x"})), "t");
        assert_eq!(v["enable"], json!(false));
        assert_eq!(v["description"], json!("x"));
        assert_eq!(v["user_visible"], json!(true));
    }

    proptest! {
        #[test]
        fn list_encode_decode_preserves_order(values in prop::collection::vec(any::<i64>(), 0..40)) {
            let values: Vec<Value> = values.into_iter().map(Value::from).collect();
            let w = PropertyCodec::encode_list("f", Some(&values), &[]).unwrap();
            let prefix = "propl:f:";
            let elements: Vec<(String, String)> = w
                .puts
                .into_iter()
                .rev()
                .map(|(c, v)| (c[prefix.len()..].to_string(), v))
                .collect();
            prop_assert_eq!(PropertyCodec::decode_list("f", elements).unwrap(), values);
        }
    }
}
