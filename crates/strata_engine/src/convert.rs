use chrono::{DateTime, TimeZone, Utc};
use strata_core::{BuiltinType, Error, FieldDef, FieldType, Result, Schema, Value};

/// Coerce a JSON argument scalar into a typed `Value` for `field`.
///
/// The validator has already checked shapes; this enforces the type contract
/// and normalizes representations (ISO strings and epoch millis for
/// DateTime, strings for Decimal/BigInt, hex for Bytes).
pub fn coerce_scalar(
    schema: &Schema,
    field: &FieldDef,
    json: &serde_json::Value,
) -> Result<Value> {
    if json.is_null() {
        return Ok(Value::Null);
    }

    if field.array {
        let items = json.as_array().ok_or_else(|| {
            Error::internal(format!("field '{}' expects a list", field.name))
        })?;
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            out.push(coerce_element(schema, field, item)?);
        }
        return Ok(Value::List(out));
    }

    coerce_element(schema, field, json)
}

fn coerce_element(
    schema: &Schema,
    field: &FieldDef,
    json: &serde_json::Value,
) -> Result<Value> {
    match &field.field_type {
        FieldType::Builtin(builtin) => coerce_builtin(*builtin, &field.name, json),
        FieldType::Enum(enum_name) => {
            let member = json.as_str().ok_or_else(|| {
                Error::internal(format!("field '{}' expects an enum member", field.name))
            })?;
            match schema.enum_def(enum_name) {
                Some(def) if def.has_member(member) => Ok(Value::Enum(member.to_string())),
                Some(def) => Err(Error::internal(format!(
                    "'{}' is not a member of enum '{}'",
                    member, def.name
                ))),
                None => Err(Error::internal(format!("unknown enum '{}'", enum_name))),
            }
        }
        FieldType::TypeDef(_) => Ok(Value::Json(json.to_string())),
        FieldType::Model(_) => Err(Error::internal(format!(
            "relation field '{}' has no scalar value",
            field.name
        ))),
    }
}

pub fn coerce_builtin(
    builtin: BuiltinType,
    field_name: &str,
    json: &serde_json::Value,
) -> Result<Value> {
    let mismatch = || {
        Error::internal(format!(
            "value {} does not fit field '{}' ({:?})",
            json, field_name, builtin
        ))
    };

    match builtin {
        BuiltinType::String => json
            .as_str()
            .map(|s| Value::Text(s.to_string()))
            .ok_or_else(mismatch),
        BuiltinType::Boolean => json.as_bool().map(Value::Bool).ok_or_else(mismatch),
        BuiltinType::Int => json.as_i64().map(Value::Int).ok_or_else(mismatch),
        BuiltinType::Float => json.as_f64().map(Value::Float).ok_or_else(mismatch),
        BuiltinType::BigInt => {
            if let Some(i) = json.as_i64() {
                Ok(Value::BigInt(i128::from(i)))
            } else if let Some(s) = json.as_str() {
                s.parse::<i128>().map(Value::BigInt).map_err(|_| mismatch())
            } else {
                Err(mismatch())
            }
        }
        BuiltinType::Decimal => {
            if let Some(s) = json.as_str() {
                Ok(Value::Decimal(s.to_string()))
            } else if json.is_number() {
                Ok(Value::Decimal(json.to_string()))
            } else {
                Err(mismatch())
            }
        }
        BuiltinType::DateTime => parse_date_time(json).ok_or_else(mismatch),
        BuiltinType::Bytes => {
            let text = json.as_str().ok_or_else(mismatch)?;
            hex::decode(text).map(Value::Bytes).map_err(|_| mismatch())
        }
        BuiltinType::Json => Ok(Value::Json(json.to_string())),
        BuiltinType::Unsupported => Err(Error::Unsupported(format!(
            "field '{}' has an unsupported type",
            field_name
        ))),
    }
}

/// ISO-8601 strings or millisecond epochs.
pub fn parse_date_time(json: &serde_json::Value) -> Option<Value> {
    if let Some(s) = json.as_str() {
        return DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| Value::DateTime(dt.with_timezone(&Utc)));
    }
    if let Some(ms) = json.as_i64() {
        return Utc
            .timestamp_millis_opt(ms)
            .single()
            .map(Value::DateTime);
    }
    None
}

/// Whether a JSON value fits a builtin type, for validator shape checks.
pub fn json_fits_builtin(builtin: BuiltinType, json: &serde_json::Value) -> bool {
    coerce_builtin(builtin, "", json).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datetime_accepts_iso_and_epoch() {
        let iso = serde_json::json!("2024-05-01T10:30:00Z");
        assert!(matches!(
            parse_date_time(&iso),
            Some(Value::DateTime(_))
        ));

        let epoch = serde_json::json!(1714559400000_i64);
        assert!(matches!(parse_date_time(&epoch), Some(Value::DateTime(_))));

        assert!(parse_date_time(&serde_json::json!("not a date")).is_none());
    }

    #[test]
    fn bigint_accepts_string_beyond_i64() {
        let big = serde_json::json!("170141183460469231731687303715884105727");
        assert!(matches!(
            coerce_builtin(BuiltinType::BigInt, "n", &big),
            Ok(Value::BigInt(_))
        ));
    }
}
