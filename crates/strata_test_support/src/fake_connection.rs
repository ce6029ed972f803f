use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use strata_core::{
    BuiltinType, ColumnMeta, Connection, DialectCapabilities, Error, PlaceholderStyle,
    QueryRequest, QueryResult, Result, SqlDialect, SqlExpr, SqlProvider, StringCasingBehavior,
    Value,
};

/// ANSI-flavored dialect for statement-shape tests.
pub struct AnsiDialect;

static ANSI_DIALECT: AnsiDialect = AnsiDialect;

impl SqlDialect for AnsiDialect {
    fn provider(&self) -> SqlProvider {
        SqlProvider::Postgres
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::QuestionMark
    }

    fn capabilities(&self) -> DialectCapabilities {
        DialectCapabilities::RETURNING | DialectCapabilities::DISTINCT_ON
    }

    fn string_casing(&self) -> StringCasingBehavior {
        StringCasingBehavior {
            supports_ilike: true,
            like_case_sensitive: true,
        }
    }

    fn field_sql_type(&self, _builtin: BuiltinType, _array: bool) -> String {
        "TEXT".to_string()
    }

    fn transform_primitive(&self, value: Value, _builtin: BuiltinType, _array: bool) -> Value {
        value
    }

    fn render_json_object(&self, pairs: &[(String, String, bool)]) -> String {
        let args: Vec<String> = pairs
            .iter()
            .map(|(k, v, _)| format!("'{}', {}", k, v))
            .collect();
        format!("json_build_object({})", args.join(", "))
    }

    fn render_json_array_agg(&self, element: &str, _element_is_json: bool) -> String {
        format!("coalesce(json_agg({}), '[]')", element)
    }

    fn array_literal(&self, items: Vec<Value>, _builtin: BuiltinType) -> SqlExpr {
        SqlExpr::Param(Value::List(items))
    }

    fn array_has(&self, column: SqlExpr, item: Value, _builtin: BuiltinType) -> SqlExpr {
        column.eq(SqlExpr::Param(item))
    }

    fn array_has_every(&self, column: SqlExpr, items: Vec<Value>, _b: BuiltinType) -> SqlExpr {
        column.eq(SqlExpr::Param(Value::List(items)))
    }

    fn array_has_some(&self, column: SqlExpr, items: Vec<Value>, _b: BuiltinType) -> SqlExpr {
        column.eq(SqlExpr::Param(Value::List(items)))
    }

    fn array_is_empty(&self, column: SqlExpr) -> SqlExpr {
        column.is_null_check(false)
    }

    fn array_append(&self, column: SqlExpr, _items: Vec<Value>, _b: BuiltinType) -> SqlExpr {
        column
    }
}

#[derive(Debug, Clone)]
pub enum FakeOutcome {
    Success(QueryResult),
    Error(String),
}

impl FakeOutcome {
    fn into_result(&self) -> Result<QueryResult> {
        match self {
            Self::Success(result) => Ok(result.clone()),
            Self::Error(message) => Err(Error::query(message.clone())),
        }
    }
}

#[derive(Default)]
struct FakeState {
    outcomes: HashMap<String, FakeOutcome>,
    default_outcome: Option<FakeOutcome>,
    executed: Vec<QueryRequest>,
    close_calls: usize,
}

/// Scriptable connection: maps SQL substrings to canned outcomes and records
/// everything executed.
#[derive(Clone)]
pub struct FakeConnection {
    provider: SqlProvider,
    state: Arc<Mutex<FakeState>>,
}

impl FakeConnection {
    pub fn new() -> Self {
        Self {
            provider: SqlProvider::Postgres,
            state: Arc::new(Mutex::new(FakeState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake connection state")
    }

    /// Return `result` for any statement containing `sql_fragment`.
    pub fn with_query_result(self, sql_fragment: impl Into<String>, result: QueryResult) -> Self {
        self.lock()
            .outcomes
            .insert(sql_fragment.into(), FakeOutcome::Success(result));
        self
    }

    pub fn with_query_error(
        self,
        sql_fragment: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        self.lock()
            .outcomes
            .insert(sql_fragment.into(), FakeOutcome::Error(message.into()));
        self
    }

    pub fn with_default_result(self, result: QueryResult) -> Self {
        self.lock().default_outcome = Some(FakeOutcome::Success(result));
        self
    }

    pub fn executed_sql(&self) -> Vec<String> {
        self.lock().executed.iter().map(|r| r.sql.clone()).collect()
    }

    pub fn close_calls(&self) -> usize {
        self.lock().close_calls
    }

    pub fn as_connection(self) -> Arc<dyn Connection> {
        Arc::new(self)
    }
}

impl Default for FakeConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connection for FakeConnection {
    fn provider(&self) -> SqlProvider {
        self.provider
    }

    fn dialect(&self) -> &dyn SqlDialect {
        &ANSI_DIALECT
    }

    async fn execute(&self, req: &QueryRequest) -> Result<QueryResult> {
        let mut state = self.lock();
        state.executed.push(req.clone());

        let matched = state
            .outcomes
            .iter()
            .find(|(fragment, _)| req.sql.contains(fragment.as_str()))
            .map(|(_, outcome)| outcome.clone());
        match matched.or_else(|| state.default_outcome.clone()) {
            Some(outcome) => outcome.into_result(),
            None => Ok(QueryResult::empty()),
        }
    }

    async fn close(&self) -> Result<()> {
        self.lock().close_calls += 1;
        Ok(())
    }
}

/// Build a one-row result with named columns.
pub fn single_row(columns: &[(&str, Value)]) -> QueryResult {
    QueryResult {
        columns: columns
            .iter()
            .map(|(name, _)| ColumnMeta {
                name: (*name).to_string(),
            })
            .collect(),
        rows: vec![columns.iter().map(|(_, v)| v.clone()).collect()],
        affected_rows: 1,
        execution_time: std::time::Duration::ZERO,
    }
}
