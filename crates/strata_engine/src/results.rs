use crate::plan::{PostPlan, DELEGATE_PREFIX};
use chrono::{TimeZone, Utc};
use serde_json::Value as Json;
use strata_core::{
    BuiltinType, Error, FieldDef, FieldType, ModelDef, QueryResult, Result, Row, Schema, Value,
};

/// Decodes driver rows back into typed values, unpacks JSON-aggregated
/// relation payloads, merges delegate-descendant columns, and restores
/// original order for negative `take`.
pub struct ResultProcessor<'a> {
    pub schema: &'a Schema,
}

impl<'a> ResultProcessor<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Self { schema }
    }

    /// Process a find result into typed rows.
    pub fn process(
        &self,
        model: &ModelDef,
        result: &QueryResult,
        post: &PostPlan,
    ) -> Result<Vec<Row>> {
        let mut rows = Vec::with_capacity(result.rows.len());
        for raw in &result.rows {
            rows.push(self.process_row(model, &result.columns, raw)?);
        }

        if let Some(fields) = &post.distinct_fields {
            rows = dedup_rows(rows, fields);
        }

        if post.reverse {
            rows.reverse();
        }
        for path in &post.relation_reversals {
            for row in &mut rows {
                reverse_at_path(row, path);
            }
        }

        Ok(rows)
    }

    fn process_row(
        &self,
        model: &ModelDef,
        columns: &[strata_core::ColumnMeta],
        raw: &[Value],
    ) -> Result<Row> {
        let mut row = Row::new();

        for (i, column) in columns.iter().enumerate() {
            let value = &raw[i];
            let name = &column.name;

            // Delegate-descendant payloads merge into the row when the
            // joined ids are non-null, and vanish otherwise.
            if let Some(descendant_name) = name.strip_prefix(DELEGATE_PREFIX) {
                let descendant = self.schema.model(descendant_name)?;
                if let Some(payload) = parse_json_payload(value) {
                    if let Json::Object(map) = payload {
                        let ids_present = descendant
                            .id_fields
                            .iter()
                            .all(|id| map.get(id).is_some_and(|v| !v.is_null()));
                        if ids_present {
                            for (key, json) in &map {
                                if let Some(field) = descendant.field(key) {
                                    row.insert(
                                        key.clone(),
                                        self.decode_json_value(field, json)?,
                                    );
                                }
                            }
                        }
                    }
                }
                continue;
            }

            if name == "_count" {
                // Arrives as a JSON object, possibly serialized.
                let payload = parse_json_payload(value).unwrap_or(Json::Null);
                row.insert(name.clone(), Value::from_json_untyped(&payload));
                continue;
            }

            match model.field(name) {
                Some(field) if field.is_relation() => {
                    let payload = parse_json_payload(value);
                    row.insert(
                        name.clone(),
                        self.decode_relation_payload(model, field, payload)?,
                    );
                }
                Some(field) => {
                    row.insert(name.clone(), self.decode_driver_value(field, value)?);
                }
                None => {
                    if let Some(computed) = model.computed_fields.get(name) {
                        row.insert(
                            name.clone(),
                            decode_builtin_driver_value(
                                computed
                                    .field_type
                                    .as_builtin()
                                    .unwrap_or(BuiltinType::Json),
                                value,
                            )?,
                        );
                    } else {
                        // Planner-introduced helper columns pass through.
                        row.insert(name.clone(), value.clone());
                    }
                }
            }
        }

        Ok(row)
    }

    fn decode_relation_payload(
        &self,
        model: &ModelDef,
        field: &FieldDef,
        payload: Option<Json>,
    ) -> Result<Value> {
        let (target, _) = self.schema.opposite_relation(model, field)?;

        match payload {
            None | Some(Json::Null) => {
                if field.is_to_many() {
                    Ok(Value::List(Vec::new()))
                } else {
                    Ok(Value::Null)
                }
            }
            Some(Json::Array(items)) => {
                let mut rows = Vec::with_capacity(items.len());
                for item in items {
                    rows.push(self.decode_json_row(target, &item)?);
                }
                Ok(Value::List(rows))
            }
            Some(object) => self.decode_json_row(target, &object),
        }
    }

    /// Decode one JSON-encoded related row against its model.
    fn decode_json_row(&self, model: &ModelDef, json: &Json) -> Result<Value> {
        let Json::Object(map) = json else {
            return Ok(Value::from_json_untyped(json));
        };
        let mut row = Row::new();
        for (key, value) in map {
            if key == "_count" {
                row.insert(key.clone(), Value::from_json_untyped(value));
                continue;
            }
            if let Some(descendant_name) = key.strip_prefix(DELEGATE_PREFIX) {
                let descendant = self.schema.model(descendant_name)?;
                if let Json::Object(fields) = value {
                    let ids_present = descendant
                        .id_fields
                        .iter()
                        .all(|id| fields.get(id).is_some_and(|v| !v.is_null()));
                    if ids_present {
                        for (k, v) in fields {
                            if let Some(field) = descendant.field(k) {
                                row.insert(
                                    k.clone(),
                                    self.decode_json_value(field, v)?,
                                );
                            }
                        }
                    }
                }
                continue;
            }
            match model.field(key) {
                Some(field) if field.is_relation() => {
                    row.insert(
                        key.clone(),
                        self.decode_relation_payload(model, field, Some(value.clone()))?,
                    );
                }
                Some(field) => {
                    row.insert(key.clone(), self.decode_json_value(field, value)?);
                }
                None => {
                    row.insert(key.clone(), Value::from_json_untyped(value));
                }
            }
        }
        Ok(Value::Record(row))
    }

    /// Decode a JSON-transported scalar against the field's declared type.
    fn decode_json_value(&self, field: &FieldDef, json: &Json) -> Result<Value> {
        if json.is_null() {
            if field.array {
                return Ok(Value::List(Vec::new()));
            }
            return Ok(Value::Null);
        }
        if field.array {
            let items = match json {
                Json::Array(items) => items.clone(),
                Json::String(s) => serde_json::from_str::<Json>(s)
                    .ok()
                    .and_then(|j| j.as_array().cloned())
                    .unwrap_or_default(),
                _ => Vec::new(),
            };
            let mut out = Vec::with_capacity(items.len());
            for item in &items {
                out.push(decode_builtin_json(element_builtin(field), item)?);
            }
            return Ok(Value::List(out));
        }
        decode_builtin_json(element_builtin(field), json)
    }

    /// Decode a driver-native cell against the field's declared type.
    fn decode_driver_value(&self, field: &FieldDef, value: &Value) -> Result<Value> {
        if field.array {
            return Ok(match value {
                Value::Null => Value::List(Vec::new()),
                Value::List(items) => Value::List(
                    items
                        .iter()
                        .map(|v| decode_builtin_driver_value(element_builtin(field), v))
                        .collect::<Result<_>>()?,
                ),
                Value::Text(s) | Value::Json(s) => {
                    // SQLite stores scalar lists as JSON text.
                    let parsed: Json = serde_json::from_str(s)
                        .map_err(|e| Error::internal(format!("bad list payload: {}", e)))?;
                    let items = parsed.as_array().cloned().unwrap_or_default();
                    Value::List(
                        items
                            .iter()
                            .map(|item| decode_builtin_json(element_builtin(field), item))
                            .collect::<Result<_>>()?,
                    )
                }
                other => other.clone(),
            });
        }

        if let FieldType::Enum(_) = field.field_type {
            return Ok(match value {
                Value::Text(s) => Value::Enum(s.clone()),
                other => other.clone(),
            });
        }

        decode_builtin_driver_value(element_builtin(field), value)
    }
}

fn element_builtin(field: &FieldDef) -> BuiltinType {
    match &field.field_type {
        FieldType::Builtin(b) => *b,
        FieldType::Enum(_) => BuiltinType::String,
        FieldType::TypeDef(_) => BuiltinType::Json,
        FieldType::Model(_) => BuiltinType::Unsupported,
    }
}

/// Decode a backend-native cell to the canonical `Value` for a builtin type.
fn decode_builtin_driver_value(builtin: BuiltinType, value: &Value) -> Result<Value> {
    Ok(match (builtin, value) {
        (_, Value::Null) => Value::Null,
        (BuiltinType::Boolean, Value::Int(i)) => Value::Bool(*i != 0),
        (BuiltinType::Boolean, Value::Bool(b)) => Value::Bool(*b),
        (BuiltinType::DateTime, Value::Text(s)) => parse_date_time_text(s)?,
        (BuiltinType::DateTime, Value::Int(ms)) => Utc
            .timestamp_millis_opt(*ms)
            .single()
            .map(Value::DateTime)
            .ok_or_else(|| Error::internal(format!("bad epoch {}", ms)))?,
        (BuiltinType::DateTime, Value::DateTime(dt)) => Value::DateTime(*dt),
        (BuiltinType::Decimal, Value::Text(s)) => Value::Decimal(s.clone()),
        (BuiltinType::Decimal, Value::Int(i)) => Value::Decimal(i.to_string()),
        (BuiltinType::Decimal, Value::Float(f)) => Value::Decimal(f.to_string()),
        (BuiltinType::Decimal, Value::Decimal(s)) => Value::Decimal(s.clone()),
        (BuiltinType::BigInt, Value::Int(i)) => Value::BigInt(i128::from(*i)),
        (BuiltinType::BigInt, Value::Text(s)) => s
            .parse::<i128>()
            .map(Value::BigInt)
            .map_err(|_| Error::internal(format!("bad bigint '{}'", s)))?,
        (BuiltinType::BigInt, Value::BigInt(i)) => Value::BigInt(*i),
        (BuiltinType::Json, Value::Text(s)) => Value::Json(s.clone()),
        (BuiltinType::Json, Value::Json(s)) => Value::Json(s.clone()),
        (BuiltinType::Bytes, Value::Bytes(b)) => Value::Bytes(b.clone()),
        (BuiltinType::Float, Value::Int(i)) => Value::Float(*i as f64),
        _ => value.clone(),
    })
}

/// Decode a JSON-transported scalar to the canonical `Value`.
fn decode_builtin_json(builtin: BuiltinType, json: &Json) -> Result<Value> {
    Ok(match (builtin, json) {
        (_, Json::Null) => Value::Null,
        (BuiltinType::Boolean, Json::Number(n)) => Value::Bool(n.as_i64() != Some(0)),
        (BuiltinType::Boolean, Json::Bool(b)) => Value::Bool(*b),
        (BuiltinType::DateTime, Json::String(s)) => parse_date_time_text(s)?,
        (BuiltinType::DateTime, Json::Number(n)) => {
            let ms = n.as_i64().unwrap_or_default();
            Utc.timestamp_millis_opt(ms)
                .single()
                .map(Value::DateTime)
                .ok_or_else(|| Error::internal(format!("bad epoch {}", ms)))?
        }
        (BuiltinType::Decimal, Json::String(s)) => Value::Decimal(s.clone()),
        (BuiltinType::Decimal, Json::Number(n)) => Value::Decimal(n.to_string()),
        (BuiltinType::BigInt, Json::Number(n)) => {
            Value::BigInt(i128::from(n.as_i64().unwrap_or_default()))
        }
        (BuiltinType::BigInt, Json::String(s)) => s
            .parse::<i128>()
            .map(Value::BigInt)
            .map_err(|_| Error::internal(format!("bad bigint '{}'", s)))?,
        (BuiltinType::Json, other) => Value::Json(other.to_string()),
        (BuiltinType::Bytes, Json::String(s)) => hex::decode(s)
            .map(Value::Bytes)
            .unwrap_or_else(|_| Value::Text(s.clone())),
        (BuiltinType::String, Json::String(s)) => Value::Text(s.clone()),
        _ => Value::from_json_untyped(json),
    })
}

/// Strings are parsed as ISO-8601 (with a space-separator fallback for
/// SQLite-style storage).
fn parse_date_time_text(s: &str) -> Result<Value> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Ok(Value::DateTime(dt.with_timezone(&Utc)));
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(Value::DateTime(Utc.from_utc_datetime(&naive)));
    }
    Err(Error::internal(format!("bad datetime '{}'", s)))
}

/// JSON payload transported as text or native JSON.
fn parse_json_payload(value: &Value) -> Option<Json> {
    match value {
        Value::Null => None,
        Value::Text(s) | Value::Json(s) => serde_json::from_str(s).ok(),
        other => Some(other.to_json()),
    }
}

/// In-memory distinct keyed by the JSON rendering of the selected fields.
fn dedup_rows(rows: Vec<Row>, fields: &[String]) -> Vec<Row> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let key: String = fields
            .iter()
            .map(|f| {
                row.get(f)
                    .map(|v| v.to_json().to_string())
                    .unwrap_or_default()
            })
            .collect::<Vec<_>>()
            .join("\u{1f}");
        if seen.insert(key) {
            out.push(row);
        }
    }
    out
}

/// Reverse the to-many list at a relation path inside a processed row.
fn reverse_at_path(row: &mut Row, path: &[String]) {
    let Some((head, rest)) = path.split_first() else {
        return;
    };
    let Some(value) = row.get_mut(head) else { return };
    match value {
        Value::List(items) => {
            if rest.is_empty() {
                items.reverse();
            } else {
                for item in items {
                    if let Value::Record(nested) = item {
                        reverse_at_path(nested, rest);
                    }
                }
            }
        }
        Value::Record(nested) => reverse_at_path(nested, rest),
        _ => {}
    }
}

/// Process groupBy rows: typed `by` columns plus nested aggregates.
pub fn process_group_by(
    schema: &Schema,
    model: &ModelDef,
    result: &QueryResult,
) -> Result<Vec<Value>> {
    let processor = ResultProcessor::new(schema);
    let mut out = Vec::with_capacity(result.rows.len());
    for raw in &result.rows {
        let nested = nest_aggregate_row(&result.columns, raw);
        let Value::Record(mut row) = nested else {
            return Err(Error::internal("groupBy row is not a record"));
        };
        for (key, value) in row.iter_mut() {
            if let Some(field) = model.field(key) {
                if !field.is_relation() {
                    *value = processor.decode_driver_value(field, &value.clone())?;
                }
            }
        }
        out.push(Value::Record(row));
    }
    Ok(out)
}

/// Re-nest `_group.field` aliased aggregate columns into records.
pub fn nest_aggregate_row(columns: &[strata_core::ColumnMeta], raw: &[Value]) -> Value {
    let mut root = Row::new();
    for (i, column) in columns.iter().enumerate() {
        let value = raw[i].clone();
        match column.name.split_once('.') {
            Some((group, field)) => {
                let entry = root
                    .entry(group.to_string())
                    .or_insert_with(|| Value::Record(Row::new()));
                if let Value::Record(map) = entry {
                    map.insert(field.to_string(), value);
                }
            }
            None => {
                root.insert(column.name.clone(), value);
            }
        }
    }
    Value::Record(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_booleans_and_datetimes_decode() {
        assert_eq!(
            decode_builtin_driver_value(BuiltinType::Boolean, &Value::Int(1)).unwrap(),
            Value::Bool(true)
        );
        let decoded = decode_builtin_driver_value(
            BuiltinType::DateTime,
            &Value::Text("2024-05-01T10:30:00Z".into()),
        )
        .unwrap();
        assert!(matches!(decoded, Value::DateTime(_)));
    }

    #[test]
    fn null_scalar_list_becomes_empty() {
        let schema = strata_core::SchemaBuilder::new(strata_core::SqlProvider::Sqlite)
            .model(
                strata_core::ModelBuilder::new("Doc")
                    .field(strata_core::FieldBuilder::id_cuid("id"))
                    .field(strata_core::FieldBuilder::string("tags").array()),
            )
            .build()
            .unwrap();
        let processor = ResultProcessor::new(&schema);
        let doc = schema.model("Doc").unwrap();
        let tags = doc.field("tags").unwrap();
        assert_eq!(
            processor.decode_driver_value(tags, &Value::Null).unwrap(),
            Value::List(Vec::new())
        );
    }

    #[test]
    fn reversal_applies_to_nested_relation_lists() {
        let mut row = Row::new();
        row.insert(
            "posts".into(),
            Value::List(vec![Value::Int(1), Value::Int(2)]),
        );
        reverse_at_path(&mut row, &["posts".into()]);
        assert_eq!(
            row.get("posts"),
            Some(&Value::List(vec![Value::Int(2), Value::Int(1)]))
        );
    }

    #[test]
    fn aggregate_columns_nest_by_prefix() {
        let columns = vec![
            strata_core::ColumnMeta {
                name: "_count._all".into(),
            },
            strata_core::ColumnMeta {
                name: "_avg.age".into(),
            },
        ];
        let nested = nest_aggregate_row(&columns, &[Value::Int(3), Value::Float(21.5)]);
        let record = nested.as_record().unwrap();
        assert_eq!(
            record.get("_count").and_then(|v| v.as_record()).and_then(|m| m.get("_all")),
            Some(&Value::Int(3))
        );
    }
}
