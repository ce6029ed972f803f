use crate::ops::{MutationAction, Operation};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value as Json;
use std::sync::Arc;
use strata_core::{
    render_statement, Connection, QueryRequest, QueryResult, Result, Row, Schema, SqlDialect,
    Statement, Value,
};

/// One high-level CRUD call as seen by `on_query` interceptors.
#[derive(Debug, Clone)]
pub struct QueryCtx {
    pub model: String,
    pub operation: Operation,
    pub args: Json,
}

/// What a plugin wants from a mutation statement.
#[derive(Debug, Clone, Copy, Default)]
pub struct InterceptionDecision {
    pub intercept: bool,
    pub load_before_mutation_entities: bool,
    pub load_after_mutation_entities: bool,
}

/// Payload for before/after entity-mutation hooks.
#[derive(Debug, Clone)]
pub struct MutationHookEvent {
    pub action: MutationAction,
    pub model: String,
    pub statement: Statement,
    pub before_entities: Option<Vec<Row>>,
    pub after_entities: Option<Vec<Row>>,
}

/// Services available to `on_statement` interceptors.
///
/// `run_raw` renders and executes an auxiliary statement directly against
/// the connection, without re-entering the plugin chain.
pub struct PluginContext<'a> {
    pub schema: &'a Schema,
    pub auth: Option<&'a Value>,
    conn: &'a dyn Connection,
}

impl<'a> PluginContext<'a> {
    pub(crate) fn new(
        schema: &'a Schema,
        auth: Option<&'a Value>,
        conn: &'a dyn Connection,
    ) -> Self {
        Self { schema, auth, conn }
    }

    pub fn dialect(&self) -> &dyn SqlDialect {
        self.conn.dialect()
    }

    pub async fn run_raw(&self, stmt: &Statement) -> Result<QueryResult> {
        let rendered = render_statement(stmt, self.conn.dialect())?;
        log::debug!("[plugin] aux query: {}", rendered.sql);
        self.conn
            .execute(&QueryRequest::new(rendered.sql.clone()).with_params(rendered.params))
            .await
            .map_err(|e| e.with_sql(&rendered.sql))
    }
}

/// A pipeline plugin.
///
/// Plugins form a stack: the last-installed plugin runs outermost. Each hook
/// may transform its input before calling `next`, transform the output,
/// short-circuit, or fail.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique plugin id.
    fn id(&self) -> &str;

    /// Intercept one high-level CRUD call.
    async fn on_query(&self, ctx: QueryCtx, next: QueryNext<'_, '_>) -> Result<Value> {
        next.run(ctx).await
    }

    /// Intercept one root SQL statement just before execution.
    async fn on_statement(
        &self,
        stmt: Statement,
        cx: &PluginContext<'_>,
        next: StatementNext<'_, '_>,
    ) -> Result<QueryResult> {
        let _ = cx;
        next.run(stmt).await
    }

    /// Decide whether to observe a mutation statement.
    fn mutation_interception_filter(
        &self,
        action: MutationAction,
        model: &str,
        stmt: &Statement,
    ) -> InterceptionDecision {
        let _ = (action, model, stmt);
        InterceptionDecision::default()
    }

    async fn before_entity_mutation(&self, event: &MutationHookEvent) -> Result<()> {
        let _ = event;
        Ok(())
    }

    /// Runs only once the enclosing transaction commits; suppressed on
    /// rollback.
    async fn after_entity_mutation(&self, event: &MutationHookEvent) -> Result<()> {
        let _ = event;
        Ok(())
    }

    /// Whether this plugin filters mutation read-back (the orchestrator
    /// reports a shrunken read-back as a policy rejection).
    fn constrains_read_back(&self) -> bool {
        false
    }
}

/// Remaining `on_query` chain; calling `run` descends one level.
///
/// `'a` bounds the chain/base borrows; `'f` bounds the future `base`
/// produces. Keeping them distinct (rather than a single lifetime used for
/// both) avoids a borrow-checker false positive where the compiler can't
/// prove a locally boxed `base` outlives its own short-lived reference when
/// both are tied to one lifetime parameter inside an `async fn`.
pub struct QueryNext<'a, 'f> {
    plugins: &'a [Arc<dyn Plugin>],
    base: &'a QueryHandlerFn<'f>,
}

pub type QueryHandlerFn<'f> = dyn Fn(QueryCtx) -> BoxFuture<'f, Result<Value>> + Send + Sync + 'f;

impl<'a, 'f> QueryNext<'a, 'f> {
    pub fn new(plugins: &'a [Arc<dyn Plugin>], base: &'a QueryHandlerFn<'f>) -> Self {
        Self { plugins, base }
    }

    pub fn run(self, ctx: QueryCtx) -> BoxFuture<'f, Result<Value>> {
        match self.plugins.split_first() {
            Some((outer, rest)) => {
                let next = QueryNext {
                    plugins: rest,
                    base: self.base,
                };
                outer.on_query(ctx, next)
            }
            None => (self.base)(ctx),
        }
    }
}

/// Remaining `on_statement` chain. See [`QueryNext`] for why `'a` and `'f`
/// are kept separate.
pub struct StatementNext<'a, 'f> {
    plugins: &'a [Arc<dyn Plugin>],
    cx: &'a PluginContext<'a>,
    base: &'a StatementHandlerFn<'f>,
}

pub type StatementHandlerFn<'f> =
    dyn Fn(Statement) -> BoxFuture<'f, Result<QueryResult>> + Send + Sync + 'f;

impl<'a, 'f> StatementNext<'a, 'f> {
    pub fn new(
        plugins: &'a [Arc<dyn Plugin>],
        cx: &'a PluginContext<'a>,
        base: &'a StatementHandlerFn<'f>,
    ) -> Self {
        Self { plugins, cx, base }
    }

    pub fn run(self, stmt: Statement) -> BoxFuture<'f, Result<QueryResult>> {
        match self.plugins.split_first() {
            Some((outer, rest)) => {
                let next = StatementNext {
                    plugins: rest,
                    cx: self.cx,
                    base: self.base,
                };
                outer.on_statement(stmt, self.cx, next)
            }
            None => (self.base)(stmt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TagPlugin {
        name: &'static str,
        log: Arc<std::sync::Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Plugin for TagPlugin {
        fn id(&self) -> &str {
            self.name
        }

        async fn on_query(&self, ctx: QueryCtx, next: QueryNext<'_, '_>) -> Result<Value> {
            self.log.lock().unwrap().push(self.name);
            next.run(ctx).await
        }
    }

    #[tokio::test]
    async fn last_installed_runs_outermost() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let installed: Vec<Arc<dyn Plugin>> = vec![
            Arc::new(TagPlugin {
                name: "first",
                log: log.clone(),
            }),
            Arc::new(TagPlugin {
                name: "second",
                log: log.clone(),
            }),
        ];
        // The pipeline runs the stack reversed: last installed outermost.
        let chain: Vec<Arc<dyn Plugin>> = installed.iter().rev().cloned().collect();

        let base: Box<QueryHandlerFn> =
            Box::new(|_ctx| Box::pin(async { Ok(Value::Null) }));
        let next = QueryNext::new(&chain, &*base);
        next.run(QueryCtx {
            model: "User".into(),
            operation: Operation::FindMany,
            args: serde_json::json!({}),
        })
        .await
        .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["second", "first"]);
    }
}
