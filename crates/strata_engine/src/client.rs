use crate::executor::{EngineCore, Executor, TxState};
use crate::mutation::{IdValues, MutationEngine};
use crate::ops::Operation;
use crate::pipeline::{Plugin, QueryCtx, QueryHandlerFn, QueryNext};
use crate::plan::QueryPlanner;
use crate::results::{nest_aggregate_row, process_group_by, ResultProcessor};
use crate::validator::Validator;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value as Json;
use std::future::Future;
use std::sync::Arc;
use strata_core::{
    generate_schema_ddl, Connection, Error, ModelDef, PolicyReason, QueryRequest, QueryResult,
    Result, Row, Schema, Statement, Value,
};
use tokio::sync::OwnedMutexGuard;

/// Scope marker for a client bound to an open transaction.
struct TxScope {
    state: TxState,
}

/// Rolls the transaction back if its future is dropped mid-flight.
///
/// The spawned task keeps the connection gate until the rollback lands, so
/// no other statement can slip into the abandoned transaction.
struct TxCleanup {
    inner: Option<(Arc<dyn Connection>, OwnedMutexGuard<()>)>,
}

impl TxCleanup {
    fn disarm(&mut self) -> Option<(Arc<dyn Connection>, OwnedMutexGuard<()>)> {
        self.inner.take()
    }
}

impl Drop for TxCleanup {
    fn drop(&mut self) {
        if let Some((conn, guard)) = self.inner.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        let _guard = guard;
                        if let Err(e) = conn.rollback().await {
                            log::warn!("rollback of abandoned transaction failed: {}", e);
                        }
                    });
                }
                Err(_) => log::warn!("abandoned transaction could not be rolled back"),
            }
        }
    }
}

/// The data access client.
///
/// Owns the schema, connection, plugin stack, and ambient auth value.
/// Derived clients (`use_plugin`, `set_auth`) share the connection; a
/// transactional client additionally carries the open transaction scope.
#[derive(Clone)]
pub struct Client {
    core: Arc<EngineCore>,
    tx: Option<Arc<TxScope>>,
}

impl Client {
    /// Create a client over an established connection.
    pub fn new(schema: Schema, conn: Arc<dyn Connection>) -> Result<Self> {
        if schema.provider != conn.provider() {
            return Err(Error::internal(format!(
                "schema targets {:?} but the connection speaks {:?}",
                schema.provider,
                conn.provider()
            )));
        }
        let schema = Arc::new(schema);
        Ok(Self {
            core: Arc::new(EngineCore {
                validator: Validator::new(schema.clone()),
                schema,
                conn,
                plugins: Vec::new(),
                auth: None,
                gate: Arc::new(tokio::sync::Mutex::new(())),
            }),
            tx: None,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.core.schema
    }

    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    /// The plugins installed on this client, in install order.
    pub fn plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.core.plugins
    }

    pub fn auth(&self) -> Option<&Value> {
        self.core.auth.as_ref()
    }

    fn derive(&self, f: impl FnOnce(&EngineCore) -> EngineCore) -> Result<Client> {
        if self.tx.is_some() {
            return Err(Error::Unsupported(
                "client configuration is not available inside a transaction".to_string(),
            ));
        }
        Ok(Client {
            core: Arc::new(f(&self.core)),
            tx: None,
        })
    }

    /// Extend the plugin stack; the new plugin runs outermost.
    pub fn use_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<Client> {
        self.derive(|core| {
            let mut plugins = core.plugins.clone();
            plugins.retain(|p| p.id() != plugin.id());
            plugins.push(plugin);
            EngineCore {
                schema: core.schema.clone(),
                conn: core.conn.clone(),
                plugins,
                auth: core.auth.clone(),
                validator: Validator::new(core.schema.clone()),
                gate: core.gate.clone(),
            }
        })
    }

    /// Drop every installed plugin.
    pub fn unuse_all(&self) -> Result<Client> {
        self.derive(|core| EngineCore {
            schema: core.schema.clone(),
            conn: core.conn.clone(),
            plugins: Vec::new(),
            auth: core.auth.clone(),
            validator: Validator::new(core.schema.clone()),
            gate: core.gate.clone(),
        })
    }

    /// Set the ambient caller identity consumed by `auth()` expressions and
    /// defaults.
    pub fn set_auth(&self, auth: Option<Json>) -> Result<Client> {
        self.derive(|core| EngineCore {
            schema: core.schema.clone(),
            conn: core.conn.clone(),
            plugins: core.plugins.clone(),
            auth: auth.as_ref().map(Value::from_json_untyped),
            validator: Validator::new(core.schema.clone()),
            gate: core.gate.clone(),
        })
    }

    /// Per-model operation handle.
    pub fn model(&self, name: &str) -> ModelClient {
        ModelClient {
            client: self.clone(),
            model: name.to_string(),
        }
    }

    /// Run `f` inside a single transaction; nested calls reuse the outer
    /// transaction. After-mutation hooks fire only once the commit lands.
    pub async fn transaction<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Client) -> Fut,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        if self.tx.is_some() {
            return f(self.clone()).await;
        }

        let guard = self.core.gate.clone().lock_owned().await;
        self.core.conn.begin().await?;
        log::debug!("[tx] begin");

        let scope = Arc::new(TxScope {
            state: TxState::new(),
        });
        let tx_client = Client {
            core: self.core.clone(),
            tx: Some(scope.clone()),
        };

        let mut cleanup = TxCleanup {
            inner: Some((self.core.conn.clone(), guard)),
        };

        match f(tx_client).await {
            Ok(value) => {
                let (conn, guard) = cleanup.disarm().expect("cleanup armed");
                conn.commit().await?;
                drop(guard);
                log::debug!("[tx] commit");

                let hooks: Vec<_> = scope
                    .state
                    .after_hooks
                    .lock()
                    .expect("after hook queue")
                    .drain(..)
                    .collect();
                for (plugin, event) in hooks {
                    plugin.after_entity_mutation(&event).await?;
                }
                Ok(value)
            }
            Err(e) => {
                let (conn, guard) = cleanup.disarm().expect("cleanup armed");
                if let Err(rollback_err) = conn.rollback().await {
                    log::warn!("[tx] rollback failed: {}", rollback_err);
                }
                drop(guard);
                log::debug!("[tx] rollback");
                Err(e)
            }
        }
    }

    /// Execute a hand-built statement, still passing `on_statement` hooks.
    pub async fn raw_statement(&self, stmt: Statement) -> Result<QueryResult> {
        self.executor().exec_statement(stmt).await
    }

    /// Create every table the schema describes. Dev-only bootstrap.
    pub async fn push_schema(&self) -> Result<()> {
        let statements = generate_schema_ddl(&self.core.schema, self.core.conn.dialect())?;
        for sql in statements {
            log::debug!("[ddl] {}", sql);
            self.core.conn.execute(&QueryRequest::new(sql)).await?;
        }
        Ok(())
    }

    /// Close the underlying connection.
    pub async fn disconnect(&self) -> Result<()> {
        if self.tx.is_some() {
            return Err(Error::Unsupported(
                "disconnect is not available inside a transaction".to_string(),
            ));
        }
        self.core.conn.close().await
    }

    fn executor(&self) -> Executor<'_> {
        Executor {
            core: &self.core,
            tx: self.tx.as_ref().map(|scope| &scope.state),
        }
    }

    /// Validate and dispatch one operation through the plugin pipeline.
    pub async fn operation(
        &self,
        model: &str,
        operation: Operation,
        args: Json,
    ) -> Result<Value> {
        self.core.validator.validate(model, operation, &args)?;

        let chain: Vec<Arc<dyn Plugin>> = self.core.plugins.iter().rev().cloned().collect();
        let client = self.clone();
        let base: Box<QueryHandlerFn<'_>> = Box::new(move |ctx: QueryCtx| {
            let client = client.clone();
            Box::pin(async move { client.execute_operation(ctx).await })
        });

        let next = QueryNext::new(&chain, &*base);
        let result = next
            .run(QueryCtx {
                model: model.to_string(),
                operation,
                args,
            })
            .await;
        result
    }

    fn execute_operation(&self, ctx: QueryCtx) -> BoxFuture<'static, Result<Value>> {
        let client = self.clone();
        async move {
            let QueryCtx {
                model,
                operation,
                args,
            } = ctx;
            let schema = client.core.schema.clone();
            let model_def = schema.model(&model)?;

            if operation.is_mutation() && client.tx.is_none() {
                // Every nested write executes inside a transaction.
                let model = model.clone();
                let args = args.clone();
                return client
                    .transaction(move |tx| async move {
                        tx.run_operation(&model, operation, &args).await
                    })
                    .await;
            }

            client.run_operation(&model_def.name, operation, &args).await
        }
        .boxed()
    }

    async fn run_operation(
        &self,
        model: &str,
        operation: Operation,
        args: &Json,
    ) -> Result<Value> {
        let schema = self.core.schema.clone();
        let model_def = schema.model(model)?;
        let executor = self.executor();
        let dialect = self.core.conn.dialect();
        let planner = QueryPlanner::new(&schema, dialect);

        match operation {
            Operation::FindMany => {
                let plan = planner.plan_find(model_def, args, false)?;
                let result = executor.exec_statement(plan.statement.clone()).await?;
                let rows = ResultProcessor::new(&schema).process(model_def, &result, &plan.post)?;
                Ok(Value::List(rows.into_iter().map(Value::Record).collect()))
            }
            Operation::FindUnique
            | Operation::FindUniqueOrThrow
            | Operation::FindFirst
            | Operation::FindFirstOrThrow => {
                let plan = planner.plan_find(model_def, args, true)?;
                let result = executor.exec_statement(plan.statement.clone()).await?;
                let rows = ResultProcessor::new(&schema).process(model_def, &result, &plan.post)?;
                match rows.into_iter().next() {
                    Some(row) => Ok(Value::Record(row)),
                    None if operation.throws_if_not_found() => {
                        Err(Error::not_found(&model_def.name))
                    }
                    None => Ok(Value::Null),
                }
            }
            Operation::Count => {
                let stmt = planner.plan_count(model_def, args)?;
                let result = executor.exec_statement(stmt).await?;
                let row = result
                    .rows
                    .first()
                    .ok_or_else(|| Error::internal("count returned no row"))?;
                let select_is_map = args
                    .get("select")
                    .map(Json::is_object)
                    .unwrap_or(false);
                if select_is_map {
                    Ok(nest_aggregate_row(&result.columns, row))
                } else {
                    Ok(row.first().cloned().unwrap_or(Value::Int(0)))
                }
            }
            Operation::Aggregate => {
                let stmt = planner.plan_aggregate(model_def, args)?;
                let result = executor.exec_statement(stmt).await?;
                let row = result
                    .rows
                    .first()
                    .ok_or_else(|| Error::internal("aggregate returned no row"))?;
                Ok(nest_aggregate_row(&result.columns, row))
            }
            Operation::GroupBy => {
                let stmt = planner.plan_group_by(model_def, args)?;
                let result = executor.exec_statement(stmt).await?;
                Ok(Value::List(process_group_by(&schema, model_def, &result)?))
            }

            Operation::Create => {
                let mutations = self.mutations(&executor, dialect);
                let data = args.get("data").cloned().unwrap_or(Json::Null);
                let ids = mutations.create_row(model_def, &data, None).await?;
                self.read_back_one(model_def, ids, args).await
            }
            Operation::CreateMany => {
                let mutations = self.mutations(&executor, dialect);
                let rows = data_rows(args)?;
                let skip = args
                    .get("skipDuplicates")
                    .and_then(Json::as_bool)
                    .unwrap_or(false);
                let (count, _) = mutations.create_many(model_def, &rows, skip, None).await?;
                Ok(count_record(count))
            }
            Operation::CreateManyAndReturn => {
                let mutations = self.mutations(&executor, dialect);
                let rows = data_rows(args)?;
                let skip = args
                    .get("skipDuplicates")
                    .and_then(Json::as_bool)
                    .unwrap_or(false);
                let (_, ids) = mutations.create_many(model_def, &rows, skip, None).await?;
                self.read_back_many(model_def, ids, args).await
            }
            Operation::Update => {
                let mutations = self.mutations(&executor, dialect);
                let data = args.get("data").cloned().unwrap_or(Json::Null);
                let affected = mutations
                    .update_rows(model_def, args.get("where"), &data, None, true, false, None)
                    .await?;
                let ids = affected
                    .into_iter()
                    .next()
                    .ok_or_else(|| Error::not_found(&model_def.name))?;
                self.read_back_one(model_def, ids, args).await
            }
            Operation::UpdateMany | Operation::UpdateManyAndReturn => {
                let mutations = self.mutations(&executor, dialect);
                let data = args.get("data").cloned().unwrap_or(Json::Null);
                let limit = args.get("limit").and_then(Json::as_u64);
                let affected = mutations
                    .update_rows(model_def, args.get("where"), &data, None, false, true, limit)
                    .await?;
                if operation == Operation::UpdateMany {
                    Ok(count_record(affected.len() as u64))
                } else {
                    self.read_back_many(model_def, affected, args).await
                }
            }
            Operation::Upsert => {
                let mutations = self.mutations(&executor, dialect);
                let ids = mutations
                    .upsert_row(
                        model_def,
                        args.get("where").unwrap_or(&Json::Null),
                        args.get("create").unwrap_or(&Json::Null),
                        args.get("update").unwrap_or(&Json::Null),
                    )
                    .await?;
                self.read_back_one(model_def, ids, args).await
            }
            Operation::Delete => {
                // The row must be captured before it disappears.
                let read_args = projection_args(args, args.get("where"));
                let plan = planner.plan_find(model_def, &read_args, true)?;
                let result = executor.exec_statement(plan.statement.clone()).await?;
                let rows =
                    ResultProcessor::new(&schema).process(model_def, &result, &plan.post)?;
                let row = rows
                    .into_iter()
                    .next()
                    .ok_or_else(|| Error::not_found(&model_def.name))?;

                let mutations = self.mutations(&executor, dialect);
                mutations
                    .delete_rows(model_def, args.get("where"), None, true, false, None)
                    .await?;
                Ok(Value::Record(row))
            }
            Operation::DeleteMany => {
                let mutations = self.mutations(&executor, dialect);
                let limit = args.get("limit").and_then(Json::as_u64);
                let deleted = mutations
                    .delete_rows(model_def, args.get("where"), None, false, true, limit)
                    .await?;
                Ok(count_record(deleted.len() as u64))
            }
        }
    }

    fn mutations<'e>(
        &'e self,
        executor: &'e Executor<'e>,
        dialect: &'e dyn strata_core::SqlDialect,
    ) -> MutationEngine<'e> {
        MutationEngine {
            schema: &self.core.schema,
            dialect,
            exec: executor,
            auth: self.core.auth.as_ref(),
        }
    }

    async fn read_back_one(
        &self,
        model: &ModelDef,
        ids: IdValues,
        args: &Json,
    ) -> Result<Value> {
        let rows = self.read_back(model, &[ids], args).await?;
        rows.into_iter()
            .next()
            .map(Value::Record)
            .ok_or_else(|| self.read_back_failure(model))
    }

    async fn read_back_many(
        &self,
        model: &ModelDef,
        ids: Vec<IdValues>,
        args: &Json,
    ) -> Result<Value> {
        let expected = ids.len();
        let rows = self.read_back(model, &ids, args).await?;
        if rows.len() < expected && self.policy_constrains_read_back() {
            return Err(Error::rejected(
                &model.name,
                PolicyReason::CannotReadBack,
            ));
        }
        Ok(Value::List(rows.into_iter().map(Value::Record).collect()))
    }

    /// Post-mutation SELECT through the regular planner so relation
    /// projections behave identically to reads.
    async fn read_back(
        &self,
        model: &ModelDef,
        ids: &[IdValues],
        args: &Json,
    ) -> Result<Vec<Row>> {
        let where_json = ids_to_where(model, ids);
        let read_args = projection_args(args, Some(&where_json));

        let schema = self.core.schema.clone();
        let planner = QueryPlanner::new(&schema, self.core.conn.dialect());
        let plan = planner.plan_find(model, &read_args, false)?;
        let executor = self.executor();
        let result = executor.exec_statement(plan.statement.clone()).await?;
        ResultProcessor::new(&schema).process(model, &result, &plan.post)
    }

    fn policy_constrains_read_back(&self) -> bool {
        self.core.plugins.iter().any(|p| p.constrains_read_back())
    }

    fn read_back_failure(&self, model: &ModelDef) -> Error {
        if self.policy_constrains_read_back() {
            Error::rejected(&model.name, PolicyReason::CannotReadBack)
        } else {
            Error::internal(format!(
                "mutated {} row disappeared before read-back",
                model.name
            ))
        }
    }
}

/// Projection-only args (`select`/`include`/`omit`) with a replaced filter.
fn projection_args(args: &Json, where_json: Option<&Json>) -> Json {
    let mut map = serde_json::Map::new();
    for key in ["select", "include", "omit"] {
        if let Some(value) = args.get(key) {
            map.insert(key.to_string(), value.clone());
        }
    }
    if let Some(where_json) = where_json {
        map.insert("where".to_string(), where_json.clone());
    }
    Json::Object(map)
}

/// Synthesize a unique-rows filter from id tuples.
fn ids_to_where(model: &ModelDef, ids: &[IdValues]) -> Json {
    if model.id_fields.len() == 1 {
        let field = &model.id_fields[0];
        let values: Vec<Json> = ids
            .iter()
            .map(|row| {
                row.iter()
                    .find(|(name, _)| name == field)
                    .map(|(_, v)| v.to_json())
                    .unwrap_or(Json::Null)
            })
            .collect();
        return serde_json::json!({ field: { "in": values } });
    }

    let alternatives: Vec<Json> = ids
        .iter()
        .map(|row| {
            let mut map = serde_json::Map::new();
            for (name, value) in row {
                map.insert(name.clone(), value.to_json());
            }
            Json::Object(map)
        })
        .collect();
    serde_json::json!({ "OR": alternatives })
}

fn data_rows(args: &Json) -> Result<Vec<&Json>> {
    args.get("data")
        .and_then(Json::as_array)
        .map(|rows| rows.iter().collect())
        .ok_or_else(|| Error::internal("createMany requires a data array"))
}

fn count_record(count: u64) -> Value {
    let mut row = Row::new();
    row.insert("count".to_string(), Value::Int(count as i64));
    Value::Record(row)
}

/// Per-model operation surface.
#[derive(Clone)]
pub struct ModelClient {
    client: Client,
    model: String,
}

impl ModelClient {
    pub fn name(&self) -> &str {
        &self.model
    }

    async fn op(&self, operation: Operation, args: Json) -> Result<Value> {
        self.client.operation(&self.model, operation, args).await
    }

    pub async fn create(&self, args: Json) -> Result<Value> {
        self.op(Operation::Create, args).await
    }

    pub async fn create_many(&self, args: Json) -> Result<Value> {
        self.op(Operation::CreateMany, args).await
    }

    pub async fn create_many_and_return(&self, args: Json) -> Result<Value> {
        self.op(Operation::CreateManyAndReturn, args).await
    }

    pub async fn find_unique(&self, args: Json) -> Result<Value> {
        self.op(Operation::FindUnique, args).await
    }

    pub async fn find_unique_or_throw(&self, args: Json) -> Result<Value> {
        self.op(Operation::FindUniqueOrThrow, args).await
    }

    pub async fn find_first(&self, args: Json) -> Result<Value> {
        self.op(Operation::FindFirst, args).await
    }

    pub async fn find_first_or_throw(&self, args: Json) -> Result<Value> {
        self.op(Operation::FindFirstOrThrow, args).await
    }

    pub async fn find_many(&self, args: Json) -> Result<Value> {
        self.op(Operation::FindMany, args).await
    }

    pub async fn update(&self, args: Json) -> Result<Value> {
        self.op(Operation::Update, args).await
    }

    pub async fn update_many(&self, args: Json) -> Result<Value> {
        self.op(Operation::UpdateMany, args).await
    }

    pub async fn update_many_and_return(&self, args: Json) -> Result<Value> {
        self.op(Operation::UpdateManyAndReturn, args).await
    }

    pub async fn upsert(&self, args: Json) -> Result<Value> {
        self.op(Operation::Upsert, args).await
    }

    pub async fn delete(&self, args: Json) -> Result<Value> {
        self.op(Operation::Delete, args).await
    }

    pub async fn delete_many(&self, args: Json) -> Result<Value> {
        self.op(Operation::DeleteMany, args).await
    }

    pub async fn count(&self, args: Json) -> Result<Value> {
        self.op(Operation::Count, args).await
    }

    pub async fn aggregate(&self, args: Json) -> Result<Value> {
        self.op(Operation::Aggregate, args).await
    }

    pub async fn group_by(&self, args: Json) -> Result<Value> {
        self.op(Operation::GroupBy, args).await
    }
}
