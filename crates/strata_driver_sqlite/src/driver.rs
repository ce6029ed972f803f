use async_trait::async_trait;
use rusqlite::Connection as RusqliteConnection;
use std::path::Path;
use std::time::Instant;
use strata_core::{
    BuiltinType, ColumnMeta, Connection, DialectCapabilities, Error, PlaceholderStyle,
    QueryRequest, QueryResult, RawPiece, Result, SqlDialect, SqlExpr, SqlProvider,
    StringCasingBehavior, Value,
};
use tokio::sync::Mutex;

/// SQLite SQL dialect.
///
/// Scalar lists, decimals, datetimes, and booleans have no native storage
/// class; they ride as JSON text, text, ISO text, and integers.
pub struct SqliteDialect;

static SQLITE_DIALECT: SqliteDialect = SqliteDialect;

/// Fixed-width UTC format so stored timestamps compare lexicographically.
const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

impl SqlDialect for SqliteDialect {
    fn provider(&self) -> SqlProvider {
        SqlProvider::Sqlite
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::QuestionMark
    }

    fn capabilities(&self) -> DialectCapabilities {
        DialectCapabilities::RETURNING
    }

    fn string_casing(&self) -> StringCasingBehavior {
        StringCasingBehavior {
            supports_ilike: false,
            // ASCII case folding is built into LIKE.
            like_case_sensitive: false,
        }
    }

    fn field_sql_type(&self, builtin: BuiltinType, array: bool) -> String {
        if array {
            return "TEXT".to_string();
        }
        match builtin {
            BuiltinType::String | BuiltinType::Decimal | BuiltinType::Json => "TEXT",
            BuiltinType::DateTime => "TEXT",
            BuiltinType::Boolean | BuiltinType::Int | BuiltinType::BigInt => "INTEGER",
            BuiltinType::Float => "REAL",
            BuiltinType::Bytes => "BLOB",
            BuiltinType::Unsupported => "TEXT",
        }
        .to_string()
    }

    fn transform_primitive(&self, value: Value, builtin: BuiltinType, array: bool) -> Value {
        if array {
            return match value {
                Value::List(items) => {
                    let json: Vec<serde_json::Value> = items
                        .iter()
                        .map(|item| {
                            self.transform_primitive(item.clone(), builtin, false).to_json()
                        })
                        .collect();
                    Value::Json(serde_json::Value::Array(json).to_string())
                }
                other => other,
            };
        }
        match value {
            Value::Bool(b) => Value::Int(i64::from(b)),
            Value::DateTime(dt) => Value::Text(dt.format(DATETIME_FORMAT).to_string()),
            Value::Decimal(s) => Value::Text(s),
            Value::Enum(s) => Value::Text(s),
            Value::BigInt(i) => match i64::try_from(i) {
                Ok(small) => Value::Int(small),
                Err(_) => Value::Text(i.to_string()),
            },
            Value::List(items) => {
                let json: Vec<serde_json::Value> =
                    items.iter().map(Value::to_json).collect();
                Value::Json(serde_json::Value::Array(json).to_string())
            }
            Value::Record(_) => Value::Json(value.to_json().to_string()),
            other => other,
        }
    }

    fn render_json_object(&self, pairs: &[(String, String, bool)]) -> String {
        let args: Vec<String> = pairs
            .iter()
            .map(|(key, sql, is_json)| {
                let value = if *is_json {
                    format!("json({})", sql)
                } else {
                    sql.clone()
                };
                format!("'{}', {}", key.replace('\'', "''"), value)
            })
            .collect();
        format!("json_object({})", args.join(", "))
    }

    fn render_json_array_agg(&self, element: &str, element_is_json: bool) -> String {
        let element = if element_is_json {
            format!("json({})", element)
        } else {
            element.to_string()
        };
        format!("coalesce(json_group_array({}), '[]')", element)
    }

    fn array_literal(&self, items: Vec<Value>, builtin: BuiltinType) -> SqlExpr {
        SqlExpr::Param(self.transform_primitive(Value::List(items), builtin, true))
    }

    fn array_has(&self, column: SqlExpr, item: Value, _builtin: BuiltinType) -> SqlExpr {
        SqlExpr::Raw(vec![
            RawPiece::Sql("EXISTS (SELECT 1 FROM json_each(coalesce(".into()),
            RawPiece::Expr(Box::new(column)),
            RawPiece::Sql(", '[]')) WHERE value = ".into()),
            RawPiece::Param(item),
            RawPiece::Sql(")".into()),
        ])
    }

    fn array_has_every(
        &self,
        column: SqlExpr,
        items: Vec<Value>,
        builtin: BuiltinType,
    ) -> SqlExpr {
        let needle = self.transform_primitive(Value::List(items), builtin, true);
        SqlExpr::Raw(vec![
            RawPiece::Sql("NOT EXISTS (SELECT 1 FROM json_each(".into()),
            RawPiece::Param(needle),
            RawPiece::Sql(
                ") WHERE value NOT IN (SELECT value FROM json_each(coalesce(".into(),
            ),
            RawPiece::Expr(Box::new(column)),
            RawPiece::Sql(", '[]'))))".into()),
        ])
    }

    fn array_has_some(
        &self,
        column: SqlExpr,
        items: Vec<Value>,
        builtin: BuiltinType,
    ) -> SqlExpr {
        let needle = self.transform_primitive(Value::List(items), builtin, true);
        SqlExpr::Raw(vec![
            RawPiece::Sql("EXISTS (SELECT 1 FROM json_each(coalesce(".into()),
            RawPiece::Expr(Box::new(column)),
            RawPiece::Sql(", '[]')) WHERE value IN (SELECT value FROM json_each(".into()),
            RawPiece::Param(needle),
            RawPiece::Sql(")))".into()),
        ])
    }

    fn array_is_empty(&self, column: SqlExpr) -> SqlExpr {
        SqlExpr::Raw(vec![
            RawPiece::Sql("json_array_length(coalesce(".into()),
            RawPiece::Expr(Box::new(column)),
            RawPiece::Sql(", '[]')) = 0".into()),
        ])
    }

    fn array_append(&self, column: SqlExpr, items: Vec<Value>, builtin: BuiltinType) -> SqlExpr {
        let tail = self.transform_primitive(Value::List(items), builtin, true);
        SqlExpr::Raw(vec![
            RawPiece::Sql(
                "(SELECT json_group_array(value) FROM (SELECT value FROM json_each(coalesce("
                    .into(),
            ),
            RawPiece::Expr(Box::new(column)),
            RawPiece::Sql(", '[]')) UNION ALL SELECT value FROM json_each(".into()),
            RawPiece::Param(tail),
            RawPiece::Sql(")))".into()),
        ])
    }
}

/// SQLite connection: the synchronous rusqlite handle behind an async lock.
///
/// Statements are short-lived; blocking the executor for their duration is
/// the accepted trade for an embedded file database.
pub struct SqliteConnection {
    conn: Mutex<Option<RusqliteConnection>>,
}

impl SqliteConnection {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = RusqliteConnection::open(path.as_ref())
            .map_err(|e| Error::query(format!("failed to open database: {}", e)))?;
        Self::configure(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = RusqliteConnection::open_in_memory()
            .map_err(|e| Error::query(format!("failed to open database: {}", e)))?;
        Self::configure(conn)
    }

    fn configure(conn: RusqliteConnection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(map_sqlite_error)?;
        log::info!("SQLite connection established");
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }
}

#[async_trait]
impl Connection for SqliteConnection {
    fn provider(&self) -> SqlProvider {
        SqlProvider::Sqlite
    }

    fn dialect(&self) -> &dyn SqlDialect {
        &SQLITE_DIALECT
    }

    async fn execute(&self, req: &QueryRequest) -> Result<QueryResult> {
        let guard = self.conn.lock().await;
        let conn = guard
            .as_ref()
            .ok_or_else(|| Error::query("connection is closed"))?;

        let start = Instant::now();
        let mut stmt = conn.prepare(&req.sql).map_err(map_sqlite_error)?;

        let params: Vec<rusqlite::types::Value> =
            req.params.iter().map(to_sqlite_value).collect();
        let params_ref: Vec<&dyn rusqlite::ToSql> = params
            .iter()
            .map(|p| p as &dyn rusqlite::ToSql)
            .collect();

        if stmt.column_count() == 0 {
            let affected = stmt
                .execute(params_ref.as_slice())
                .map_err(map_sqlite_error)?;
            return Ok(QueryResult {
                columns: Vec::new(),
                rows: Vec::new(),
                affected_rows: affected as u64,
                execution_time: start.elapsed(),
            });
        }

        let columns: Vec<ColumnMeta> = stmt
            .column_names()
            .iter()
            .map(|name| ColumnMeta {
                name: (*name).to_string(),
            })
            .collect();
        let column_count = columns.len();

        let mut rows = Vec::new();
        let mut raw_rows = stmt
            .query(params_ref.as_slice())
            .map_err(map_sqlite_error)?;
        while let Some(row) = raw_rows.next().map_err(map_sqlite_error)? {
            let mut out = Vec::with_capacity(column_count);
            for i in 0..column_count {
                out.push(from_sqlite_value(row.get_ref(i).map_err(map_sqlite_error)?));
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
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.take() {
            conn.close()
                .map_err(|(_, e)| Error::query(format!("close failed: {}", e)))?;
            log::info!("SQLite connection closed");
        }
        Ok(())
    }
}

fn to_sqlite_value(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sv;
    match value {
        Value::Null => Sv::Null,
        Value::Bool(b) => Sv::Integer(i64::from(*b)),
        Value::Int(i) => Sv::Integer(*i),
        Value::Float(f) => Sv::Real(*f),
        Value::BigInt(i) => match i64::try_from(*i) {
            Ok(small) => Sv::Integer(small),
            Err(_) => Sv::Text(i.to_string()),
        },
        Value::Text(s) | Value::Json(s) | Value::Decimal(s) | Value::Enum(s) => {
            Sv::Text(s.clone())
        }
        Value::Bytes(b) => Sv::Blob(b.clone()),
        Value::DateTime(dt) => Sv::Text(dt.format(DATETIME_FORMAT).to_string()),
        Value::List(_) | Value::Record(_) => Sv::Text(value.to_json().to_string()),
    }
}

fn from_sqlite_value(value: rusqlite::types::ValueRef<'_>) -> Value {
    use rusqlite::types::ValueRef;
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).to_string()),
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    }
}

fn map_sqlite_error(e: rusqlite::Error) -> Error {
    Error::query(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datetime_binding_is_lexicographic() {
        let early = Value::DateTime(
            chrono::DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&chrono::Utc),
        );
        let late = Value::DateTime(
            chrono::DateTime::parse_from_rfc3339("2024-06-01T00:00:00Z")
                .unwrap()
                .with_timezone(&chrono::Utc),
        );
        let (a, b) = (to_sqlite_value(&early), to_sqlite_value(&late));
        match (a, b) {
            (rusqlite::types::Value::Text(a), rusqlite::types::Value::Text(b)) => {
                assert!(a < b);
            }
            other => panic!("expected text bindings, got {:?}", other),
        }
    }

    #[test]
    fn lists_bind_as_json_text() {
        let dialect = SqliteDialect;
        let bound = dialect.transform_primitive(
            Value::List(vec![Value::Int(1), Value::Int(2)]),
            BuiltinType::Int,
            true,
        );
        assert_eq!(bound, Value::Json("[1,2]".to_string()));
    }
}
