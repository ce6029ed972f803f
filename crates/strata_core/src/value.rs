use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A decoded row: field name to value, in schema declaration order.
pub type Row = IndexMap<String, Value>;

/// Database cell value.
///
/// Custom enum instead of `serde_json::Value` so that backend-specific types
/// (decimals, big integers, timestamps, byte blobs) survive a round-trip
/// without precision loss, and so that in-memory sorting and deduplication
/// can be type-aware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Arbitrary-size integers beyond i64 range.
    BigInt(i128),
    Text(String),
    Bytes(Vec<u8>),
    /// JSON stored as its serialized text for exact round-trip preservation.
    Json(String),
    /// Decimal stored as canonical string to preserve exact precision.
    Decimal(String),
    /// Timestamp with timezone.
    DateTime(DateTime<Utc>),
    /// Enum member name.
    Enum(String),
    /// Scalar list or a to-many relation payload.
    List(Vec<Value>),
    /// Nested row, as produced by JSON-aggregated relation selections.
    Record(Row),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Enum(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::BigInt(i) => i64::try_from(*i).ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Row> {
        match self {
            Value::Record(row) => Some(row),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Walk a member path into nested records.
    ///
    /// Used by `auth()` member access: any missing intermediate segment
    /// yields `Null` rather than an error.
    pub fn walk_path(&self, path: &[String]) -> Value {
        let mut current = self;
        for segment in path {
            match current {
                Value::Record(row) => match row.get(segment) {
                    Some(next) => current = next,
                    None => return Value::Null,
                },
                _ => return Value::Null,
            }
        }
        current.clone()
    }

    /// Convert an untyped JSON value into the closest `Value`.
    ///
    /// Typed coercion against a schema field lives in the result processor;
    /// this is for schemaless trees (auth principals, raw params).
    pub fn from_json_untyped(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::Text(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json_untyped).collect())
            }
            serde_json::Value::Object(map) => {
                let mut row = Row::new();
                for (k, v) in map {
                    row.insert(k.clone(), Value::from_json_untyped(v));
                }
                Value::Record(row)
            }
        }
    }

    /// Render as JSON, losing backend-specific typing.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Value::from(*f),
            Value::BigInt(i) => match i64::try_from(*i) {
                Ok(small) => serde_json::Value::from(small),
                Err(_) => serde_json::Value::String(i.to_string()),
            },
            Value::Text(s) | Value::Enum(s) | Value::Decimal(s) => {
                serde_json::Value::String(s.clone())
            }
            Value::Bytes(b) => {
                serde_json::Value::String(b.iter().map(|x| format!("{:02x}", x)).collect())
            }
            Value::Json(s) => {
                serde_json::from_str(s).unwrap_or(serde_json::Value::String(s.clone()))
            }
            Value::DateTime(dt) => serde_json::Value::String(dt.to_rfc3339()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Record(row) => {
                let mut map = serde_json::Map::new();
                for (k, v) in row {
                    map.insert(k.clone(), v.to_json());
                }
                serde_json::Value::Object(map)
            }
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::BigInt(i) => write!(f, "{}", i),
            Value::Text(s) | Value::Json(s) | Value::Decimal(s) | Value::Enum(s) => {
                write!(f, "{}", s)
            }
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S")),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Record(_) => write!(f, "{}", self.to_json()),
        }
    }
}

impl Value {
    fn type_order(&self) -> u8 {
        match self {
            Value::Bool(_) => 0,
            Value::Int(_) => 1,
            Value::BigInt(_) => 2,
            Value::Float(_) => 3,
            Value::Decimal(_) => 4,
            Value::Text(_) => 5,
            Value::Enum(_) => 6,
            Value::Json(_) => 7,
            Value::DateTime(_) => 8,
            Value::Bytes(_) => 9,
            Value::List(_) => 10,
            Value::Record(_) => 11,
            Value::Null => 12,
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        use Value::*;

        match (self, other) {
            // Nulls last (SQL standard behavior)
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Greater,
            (_, Null) => Ordering::Less,

            (Bool(a), Bool(b)) => a.cmp(b),
            (Int(a), Int(b)) => a.cmp(b),
            (BigInt(a), BigInt(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            (Text(a), Text(b)) => a.cmp(b),
            (Enum(a), Enum(b)) => a.cmp(b),
            (Bytes(a), Bytes(b)) => a.cmp(b),
            (Json(a), Json(b)) => a.cmp(b),
            (Decimal(a), Decimal(b)) => a.cmp(b),
            (DateTime(a), DateTime(b)) => a.cmp(b),
            (List(a), List(b)) => a.cmp(b),

            // Cross-type numeric promotion
            (Int(a), Float(b)) => (*a as f64).total_cmp(b),
            (Float(a), Int(b)) => a.total_cmp(&(*b as f64)),
            (Int(a), BigInt(b)) => i128::from(*a).cmp(b),
            (BigInt(a), Int(b)) => a.cmp(&i128::from(*b)),

            _ => self.type_order().cmp(&other.type_order()),
        }
    }
}

impl Eq for Value {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walk_path_missing_segment_is_null() {
        let auth = Value::from_json_untyped(&serde_json::json!({
            "profile": { "role": "ADMIN" }
        }));

        assert_eq!(
            auth.walk_path(&["profile".into(), "role".into()]),
            Value::Text("ADMIN".into())
        );
        assert_eq!(auth.walk_path(&["profile".into(), "age".into()]), Value::Null);
        assert_eq!(auth.walk_path(&["missing".into(), "x".into()]), Value::Null);
    }

    #[test]
    fn ordering_places_nulls_last() {
        let mut values = vec![Value::Null, Value::Int(2), Value::Int(1)];
        values.sort();
        assert_eq!(values, vec![Value::Int(1), Value::Int(2), Value::Null]);
    }

    #[test]
    fn cross_type_numeric_comparison() {
        assert_eq!(Value::Int(2).cmp(&Value::Float(2.5)), Ordering::Less);
        assert_eq!(Value::BigInt(10).cmp(&Value::Int(3)), Ordering::Greater);
    }
}
