//! Nested labeled data exchanged as dictionary messages

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use crate::codec::WireValue;

/// Labels to values or nested maps
pub type FieldMap = BTreeMap<String, Field>;

/// One entry of a dictionary message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Value(WireValue),
    Map(FieldMap),
}

impl Field {
    pub fn as_value(&self) -> Option<&WireValue> {
        match self {
            Field::Value(value) => Some(value),
            Field::Map(_) => None,
        }
    }

    pub fn as_map(&self) -> Option<&FieldMap> {
        match self {
            Field::Map(map) => Some(map),
            Field::Value(_) => None,
        }
    }
}

impl From<WireValue> for Field {
    fn from(value: WireValue) -> Self {
        Field::Value(value)
    }
}

impl From<FieldMap> for Field {
    fn from(map: FieldMap) -> Self {
        Field::Map(map)
    }
}

/// Convert a JSON document into a field map. Objects become nested maps,
/// arrays become lists, and a non-object root is stored under `"value"`.
pub fn field_map_from_json(json: &JsonValue) -> FieldMap {
    match json {
        JsonValue::Object(object) => object
            .iter()
            .map(|(key, value)| (key.clone(), field_from_json(value)))
            .collect(),
        other => FieldMap::from([("value".to_string(), field_from_json(other))]),
    }
}

fn field_from_json(json: &JsonValue) -> Field {
    match json {
        JsonValue::Object(_) => Field::Map(field_map_from_json(json)),
        other => Field::Value(wire_from_json(other)),
    }
}

fn wire_from_json(json: &JsonValue) -> WireValue {
    match json {
        JsonValue::Null => WireValue::None,
        JsonValue::Bool(flag) => WireValue::Bool(*flag),
        JsonValue::Number(number) => match number.as_i64() {
            Some(int) => WireValue::Int(int),
            None => WireValue::Float(number.as_f64().unwrap_or(f64::NAN)),
        },
        JsonValue::String(text) => WireValue::Text(text.clone()),
        JsonValue::Array(items) => WireValue::List(items.iter().map(wire_from_json).collect()),
        JsonValue::Object(_) => WireValue::Text(json.to_string()),
    }
}

/// Render a field map as JSON for display. Arrays become `{dtype, shape, values}`.
pub fn field_map_to_json(map: &FieldMap) -> JsonValue {
    JsonValue::Object(
        map.iter()
            .map(|(key, field)| {
                let value = match field {
                    Field::Value(value) => wire_to_json(value),
                    Field::Map(nested) => field_map_to_json(nested),
                };
                (key.clone(), value)
            })
            .collect(),
    )
}

pub fn wire_to_json(value: &WireValue) -> JsonValue {
    match value {
        WireValue::None => JsonValue::Null,
        WireValue::Bytes(bytes) => JsonValue::from(bytes.clone()),
        WireValue::Text(text) => JsonValue::from(text.as_str()),
        WireValue::Bool(flag) => JsonValue::from(*flag),
        WireValue::Int(int) => JsonValue::from(*int),
        WireValue::Float(float) => JsonValue::from(*float),
        WireValue::List(items) => JsonValue::Array(items.iter().map(wire_to_json).collect()),
        WireValue::Array(array) => serde_json::json!({
            "dtype": array.dtype().name(),
            "shape": array.shape(),
            "values": array.to_f64_vec(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_object_becomes_nested_map() {
        let map = field_map_from_json(&json!({
            "gravity": -9.81,
            "steps": 10,
            "mesh": {"path": "liver.obj", "scale": [1, 2]},
        }));

        assert_eq!(map["gravity"], Field::Value(WireValue::Float(-9.81)));
        assert_eq!(map["steps"], Field::Value(WireValue::Int(10)));
        let mesh = map["mesh"].as_map().unwrap();
        assert_eq!(mesh["path"], Field::Value(WireValue::Text("liver.obj".into())));
        assert_eq!(
            mesh["scale"],
            Field::Value(WireValue::List(vec![WireValue::Int(1), WireValue::Int(2)]))
        );
    }

    #[test]
    fn test_scalar_root_is_wrapped() {
        let map = field_map_from_json(&json!(3));
        assert_eq!(map["value"], Field::Value(WireValue::Int(3)));
    }

    #[test]
    fn test_to_json_renders_arrays() {
        let array = crate::codec::NdArray::from_f64(vec![2], &[0.5, 1.5]).unwrap();
        let map = FieldMap::from([("x".to_string(), Field::Value(WireValue::Array(array)))]);
        assert_eq!(
            field_map_to_json(&map),
            json!({"x": {"dtype": "f64", "shape": [2], "values": [0.5, 1.5]}})
        );
    }
}
