use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Instant;
use strata_core::{
    BuiltinType, ColumnMeta, Connection, DialectCapabilities, Error, PlaceholderStyle,
    QueryRequest, QueryResult, RawPiece, Result, SqlDialect, SqlExpr, SqlProvider,
    StringCasingBehavior, Value,
};
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::NoTls;

/// PostgreSQL SQL dialect.
pub struct PostgresDialect;

static POSTGRES_DIALECT: PostgresDialect = PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn provider(&self) -> SqlProvider {
        SqlProvider::Postgres
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::DollarNumber
    }

    fn capabilities(&self) -> DialectCapabilities {
        DialectCapabilities::RETURNING
            | DialectCapabilities::DISTINCT_ON
            | DialectCapabilities::NATIVE_ARRAYS
    }

    fn string_casing(&self) -> StringCasingBehavior {
        StringCasingBehavior {
            supports_ilike: true,
            like_case_sensitive: true,
        }
    }

    fn field_sql_type(&self, builtin: BuiltinType, array: bool) -> String {
        let base = match builtin {
            BuiltinType::String => "TEXT",
            // Wide integers keep i64 bindings unambiguous.
            BuiltinType::Int | BuiltinType::BigInt => "BIGINT",
            BuiltinType::Float => "DOUBLE PRECISION",
            BuiltinType::Boolean => "BOOLEAN",
            // Stored as text for exact round-trips.
            BuiltinType::Decimal => "TEXT",
            BuiltinType::DateTime => "TIMESTAMPTZ",
            BuiltinType::Bytes => "BYTEA",
            BuiltinType::Json => "JSONB",
            BuiltinType::Unsupported => "TEXT",
        };
        if array {
            format!("{}[]", base)
        } else {
            base.to_string()
        }
    }

    fn transform_primitive(&self, value: Value, _builtin: BuiltinType, _array: bool) -> Value {
        match value {
            Value::Enum(s) | Value::Decimal(s) => Value::Text(s),
            Value::BigInt(i) => match i64::try_from(i) {
                Ok(small) => Value::Int(small),
                Err(_) => Value::Text(i.to_string()),
            },
            other => other,
        }
    }

    fn render_json_object(&self, pairs: &[(String, String, bool)]) -> String {
        let args: Vec<String> = pairs
            .iter()
            .map(|(key, sql, _is_json)| format!("'{}', {}", key.replace('\'', "''"), sql))
            .collect();
        format!("json_build_object({})", args.join(", "))
    }

    fn render_json_array_agg(&self, element: &str, _element_is_json: bool) -> String {
        format!("coalesce(json_agg({}), '[]'::json)", element)
    }

    fn array_literal(&self, items: Vec<Value>, builtin: BuiltinType) -> SqlExpr {
        let items = items
            .into_iter()
            .map(|v| self.transform_primitive(v, builtin, false))
            .collect();
        SqlExpr::Param(Value::List(items))
    }

    fn array_has(&self, column: SqlExpr, item: Value, builtin: BuiltinType) -> SqlExpr {
        SqlExpr::Raw(vec![
            RawPiece::Param(self.transform_primitive(item, builtin, false)),
            RawPiece::Sql(" = ANY(".into()),
            RawPiece::Expr(Box::new(column)),
            RawPiece::Sql(")".into()),
        ])
    }

    fn array_has_every(
        &self,
        column: SqlExpr,
        items: Vec<Value>,
        builtin: BuiltinType,
    ) -> SqlExpr {
        SqlExpr::Raw(vec![
            RawPiece::Expr(Box::new(column)),
            RawPiece::Sql(" @> ".into()),
            RawPiece::Expr(Box::new(self.array_literal(items, builtin))),
        ])
    }

    fn array_has_some(
        &self,
        column: SqlExpr,
        items: Vec<Value>,
        builtin: BuiltinType,
    ) -> SqlExpr {
        SqlExpr::Raw(vec![
            RawPiece::Expr(Box::new(column)),
            RawPiece::Sql(" && ".into()),
            RawPiece::Expr(Box::new(self.array_literal(items, builtin))),
        ])
    }

    fn array_is_empty(&self, column: SqlExpr) -> SqlExpr {
        SqlExpr::Raw(vec![
            RawPiece::Sql("coalesce(array_length(".into()),
            RawPiece::Expr(Box::new(column)),
            RawPiece::Sql(", 1), 0) = 0".into()),
        ])
    }

    fn array_append(&self, column: SqlExpr, items: Vec<Value>, builtin: BuiltinType) -> SqlExpr {
        SqlExpr::Raw(vec![
            RawPiece::Sql("coalesce(".into()),
            RawPiece::Expr(Box::new(column)),
            RawPiece::Sql(", '{}') || ".into()),
            RawPiece::Expr(Box::new(self.array_literal(items, builtin))),
        ])
    }
}

/// Native async PostgreSQL connection.
pub struct PostgresConnection {
    client: tokio_postgres::Client,
}

impl PostgresConnection {
    /// Connect with a `tokio_postgres` config string
    /// (`host=... user=... dbname=...`).
    pub async fn connect(config: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(config, NoTls)
            .await
            .map_err(|e| Error::query(format!("connection failed: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                log::warn!("postgres connection task ended: {}", e);
            }
        });

        log::info!("PostgreSQL connection established");
        Ok(Self { client })
    }
}

#[async_trait]
impl Connection for PostgresConnection {
    fn provider(&self) -> SqlProvider {
        SqlProvider::Postgres
    }

    fn dialect(&self) -> &dyn SqlDialect {
        &POSTGRES_DIALECT
    }

    async fn execute(&self, req: &QueryRequest) -> Result<QueryResult> {
        let start = Instant::now();
        let stmt = self
            .client
            .prepare(&req.sql)
            .await
            .map_err(map_pg_error)?;

        let params: Vec<Box<dyn ToSql + Sync + Send>> =
            req.params.iter().map(to_pg_param).collect::<Result<_>>()?;
        let param_refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();

        if stmt.columns().is_empty() {
            let affected = self
                .client
                .execute(&stmt, &param_refs)
                .await
                .map_err(map_pg_error)?;
            return Ok(QueryResult {
                columns: Vec::new(),
                rows: Vec::new(),
                affected_rows: affected,
                execution_time: start.elapsed(),
            });
        }

        let columns: Vec<ColumnMeta> = stmt
            .columns()
            .iter()
            .map(|c| ColumnMeta {
                name: c.name().to_string(),
            })
            .collect();

        let raw_rows = self
            .client
            .query(&stmt, &param_refs)
            .await
            .map_err(map_pg_error)?;

        let mut rows = Vec::with_capacity(raw_rows.len());
        for raw in &raw_rows {
            let mut out = Vec::with_capacity(columns.len());
            for (i, column) in raw.columns().iter().enumerate() {
                out.push(from_pg_value(raw, i, column.type_())?);
            }
            rows.push(out);
        }

        let affected = rows.len() as u64;
        Ok(QueryResult {
            columns,
            rows,
            affected_rows: affected,
            execution_time: start.elapsed(),
        })
    }

    async fn close(&self) -> Result<()> {
        // Dropping the client tears the connection down; nothing to flush.
        log::info!("PostgreSQL connection closing");
        Ok(())
    }
}

/// A NULL bindable against any column type.
#[derive(Debug)]
struct AnyNull;

impl ToSql for AnyNull {
    fn to_sql(
        &self,
        _ty: &Type,
        _out: &mut tokio_postgres::types::private::BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        Ok(IsNull::Yes)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn to_pg_param(value: &Value) -> Result<Box<dyn ToSql + Sync + Send>> {
    Ok(match value {
        Value::Null => Box::new(AnyNull),
        Value::Bool(b) => Box::new(*b),
        Value::Int(i) => Box::new(*i),
        Value::Float(f) => Box::new(*f),
        Value::BigInt(i) => match i64::try_from(*i) {
            Ok(small) => Box::new(small),
            Err(_) => Box::new(i.to_string()),
        },
        Value::Text(s) | Value::Decimal(s) | Value::Enum(s) => Box::new(s.clone()),
        Value::Json(s) => {
            let json: serde_json::Value = serde_json::from_str(s)
                .map_err(|e| Error::internal(format!("bad json param: {}", e)))?;
            Box::new(json)
        }
        Value::Bytes(b) => Box::new(b.clone()),
        Value::DateTime(dt) => Box::new(*dt),
        Value::List(items) => to_pg_array(items)?,
        Value::Record(_) => {
            let json: serde_json::Value = value.to_json();
            Box::new(json)
        }
    })
}

/// Native array binding; element type taken from the first non-null member.
fn to_pg_array(items: &[Value]) -> Result<Box<dyn ToSql + Sync + Send>> {
    let first = items.iter().find(|v| !v.is_null());
    Ok(match first {
        None => Box::new(Vec::<Option<String>>::new()),
        Some(Value::Int(_)) => Box::new(
            items
                .iter()
                .map(|v| v.as_i64())
                .collect::<Vec<Option<i64>>>(),
        ),
        Some(Value::Float(_)) => Box::new(
            items
                .iter()
                .map(|v| match v {
                    Value::Float(f) => Some(*f),
                    Value::Int(i) => Some(*i as f64),
                    _ => None,
                })
                .collect::<Vec<Option<f64>>>(),
        ),
        Some(Value::Bool(_)) => Box::new(
            items
                .iter()
                .map(|v| v.as_bool())
                .collect::<Vec<Option<bool>>>(),
        ),
        Some(Value::DateTime(_)) => Box::new(
            items
                .iter()
                .map(|v| match v {
                    Value::DateTime(dt) => Some(*dt),
                    _ => None,
                })
                .collect::<Vec<Option<DateTime<Utc>>>>(),
        ),
        Some(_) => Box::new(
            items
                .iter()
                .map(|v| match v {
                    Value::Null => None,
                    other => Some(other.to_string()),
                })
                .collect::<Vec<Option<String>>>(),
        ),
    })
}

fn from_pg_value(row: &tokio_postgres::Row, idx: usize, ty: &Type) -> Result<Value> {
    let value = match *ty {
        Type::BOOL => row
            .try_get::<_, Option<bool>>(idx)
            .map_err(map_pg_error)?
            .map(Value::Bool),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)
            .map_err(map_pg_error)?
            .map(|v| Value::Int(i64::from(v))),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)
            .map_err(map_pg_error)?
            .map(|v| Value::Int(i64::from(v))),
        Type::INT8 => row
            .try_get::<_, Option<i64>>(idx)
            .map_err(map_pg_error)?
            .map(Value::Int),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)
            .map_err(map_pg_error)?
            .map(|v| Value::Float(f64::from(v))),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(idx)
            .map_err(map_pg_error)?
            .map(Value::Float),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => row
            .try_get::<_, Option<String>>(idx)
            .map_err(map_pg_error)?
            .map(Value::Text),
        Type::BYTEA => row
            .try_get::<_, Option<Vec<u8>>>(idx)
            .map_err(map_pg_error)?
            .map(Value::Bytes),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)
            .map_err(map_pg_error)?
            .map(Value::DateTime),
        Type::TIMESTAMP => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)
            .map_err(map_pg_error)?
            .map(|naive| Value::DateTime(DateTime::from_naive_utc_and_offset(naive, Utc))),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(idx)
            .map_err(map_pg_error)?
            .map(|json| Value::Json(json.to_string())),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => row
            .try_get::<_, Option<Vec<Option<String>>>>(idx)
            .map_err(map_pg_error)?
            .map(|items| {
                Value::List(
                    items
                        .into_iter()
                        .map(|v| v.map(Value::Text).unwrap_or(Value::Null))
                        .collect(),
                )
            }),
        Type::INT8_ARRAY => row
            .try_get::<_, Option<Vec<Option<i64>>>>(idx)
            .map_err(map_pg_error)?
            .map(|items| {
                Value::List(
                    items
                        .into_iter()
                        .map(|v| v.map(Value::Int).unwrap_or(Value::Null))
                        .collect(),
                )
            }),
        Type::BOOL_ARRAY => row
            .try_get::<_, Option<Vec<Option<bool>>>>(idx)
            .map_err(map_pg_error)?
            .map(|items| {
                Value::List(
                    items
                        .into_iter()
                        .map(|v| v.map(Value::Bool).unwrap_or(Value::Null))
                        .collect(),
                )
            }),
        Type::FLOAT8_ARRAY => row
            .try_get::<_, Option<Vec<Option<f64>>>>(idx)
            .map_err(map_pg_error)?
            .map(|items| {
                Value::List(
                    items
                        .into_iter()
                        .map(|v| v.map(Value::Float).unwrap_or(Value::Null))
                        .collect(),
                )
            }),
        _ => {
            // Unknown types fall back to their text representation.
            row.try_get::<_, Option<String>>(idx)
                .map_err(|e| {
                    Error::query(format!(
                        "cannot decode column of type {}: {}",
                        ty, e
                    ))
                })?
                .map(Value::Text)
        }
    };
    Ok(value.unwrap_or(Value::Null))
}

fn map_pg_error(e: tokio_postgres::Error) -> Error {
    Error::query(e.to_string())
}
