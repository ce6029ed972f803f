use crate::ops::MutationAction;
use crate::pipeline::{
    InterceptionDecision, MutationHookEvent, Plugin, PluginContext, StatementHandlerFn,
    StatementNext,
};
use crate::validator::Validator;
use std::sync::Arc;
use strata_core::{
    render_statement, Connection, Error, ModelDef, QueryRequest, QueryResult, Result, Row,
    Schema, SelectItem, SelectStmt, SqlExpr, Statement, StatementContext, StatementKind,
    StatementOp, Value,
};

/// Shared, immutable engine state. Derived clients clone the `Arc`s and
/// extend the plugin list.
pub(crate) struct EngineCore {
    pub schema: Arc<Schema>,
    pub conn: Arc<dyn Connection>,
    /// Install order; the pipeline runs them reversed (last outermost).
    pub plugins: Vec<Arc<dyn Plugin>>,
    pub auth: Option<Value>,
    pub validator: Validator,
    /// Serializes transaction scopes against the single connection.
    pub gate: Arc<tokio::sync::Mutex<()>>,
}

/// Per-transaction state: after-mutation hooks deferred until commit.
pub(crate) struct TxState {
    pub after_hooks: std::sync::Mutex<Vec<(Arc<dyn Plugin>, MutationHookEvent)>>,
}

impl TxState {
    pub fn new() -> Self {
        Self {
            after_hooks: std::sync::Mutex::new(Vec::new()),
        }
    }
}

/// Executes statements for one operation, inside or outside a transaction.
pub(crate) struct Executor<'a> {
    pub core: &'a EngineCore,
    pub tx: Option<&'a TxState>,
}

impl<'a> Executor<'a> {
    /// Plugin chain in execution order (last installed outermost).
    fn chain(&self) -> Vec<Arc<dyn Plugin>> {
        self.core.plugins.iter().rev().cloned().collect()
    }

    /// Run a root statement through `on_statement` interceptors and the
    /// driver.
    pub async fn exec_statement(&self, stmt: Statement) -> Result<QueryResult> {
        // Outside a transaction each statement takes the gate on its own;
        // inside one, the transaction scope already holds it.
        let _guard = match self.tx {
            None => Some(self.core.gate.lock().await),
            Some(_) => None,
        };
        self.exec_statement_gated(stmt).await
    }

    async fn exec_statement_gated(&self, stmt: Statement) -> Result<QueryResult> {
        let chain = self.chain();
        let conn = self.core.conn.as_ref();
        let cx = PluginContext::new(&self.core.schema, self.core.auth.as_ref(), conn);

        let base: Box<StatementHandlerFn<'_>> = Box::new(move |stmt: Statement| {
            Box::pin(async move {
                let rendered = render_statement(&stmt, conn.dialect())?;
                log::debug!(
                    "[exec] {} (params: {})",
                    rendered.sql,
                    rendered.params.len()
                );
                let started = std::time::Instant::now();
                let result = conn
                    .execute(
                        &QueryRequest::new(rendered.sql.clone())
                            .with_params(rendered.params),
                    )
                    .await
                    .map_err(|e| e.with_sql(&rendered.sql))?;
                log::debug!(
                    "[exec] {} row(s) in {:.2}ms",
                    result.row_count(),
                    started.elapsed().as_secs_f64() * 1000.0
                );
                Ok(result)
            })
        });

        let next = StatementNext::new(&chain, &cx, &*base);
        let result = next.run(stmt).await;
        result
    }

    /// Execute a mutation statement with entity lifecycle hooks around it.
    ///
    /// The statement must return the model's id columns so after-entities can
    /// be reloaded.
    pub async fn exec_mutation(
        &self,
        action: MutationAction,
        model: &ModelDef,
        stmt: Statement,
    ) -> Result<QueryResult> {
        let _guard = match self.tx {
            None => Some(self.core.gate.lock().await),
            Some(_) => None,
        };

        let decisions: Vec<(Arc<dyn Plugin>, InterceptionDecision)> = self
            .chain()
            .into_iter()
            .map(|p| {
                let d = p.mutation_interception_filter(action, &model.name, &stmt);
                (p, d)
            })
            .filter(|(_, d)| d.intercept)
            .collect();

        let before_entities = if decisions
            .iter()
            .any(|(_, d)| d.load_before_mutation_entities)
        {
            self.load_affected(model, &stmt).await?
        } else {
            None
        };

        for (plugin, decision) in &decisions {
            let event = MutationHookEvent {
                action,
                model: model.name.clone(),
                statement: stmt.clone(),
                before_entities: if decision.load_before_mutation_entities {
                    before_entities.clone()
                } else {
                    None
                },
                after_entities: None,
            };
            plugin.before_entity_mutation(&event).await?;
        }

        let result = self.exec_statement_gated(stmt.clone()).await?;

        if decisions
            .iter()
            .any(|(_, d)| d.load_after_mutation_entities)
        {
            // Deletes have nothing left to load; zero-row mutations still
            // deliver an empty list.
            let after_entities = if action == MutationAction::Delete {
                Some(Vec::new())
            } else {
                Some(self.load_by_result_ids(model, &result).await?)
            };

            for (plugin, decision) in &decisions {
                if !decision.load_after_mutation_entities {
                    continue;
                }
                let event = MutationHookEvent {
                    action,
                    model: model.name.clone(),
                    statement: stmt.clone(),
                    before_entities: None,
                    after_entities: after_entities.clone(),
                };
                self.defer_or_run_after(plugin.clone(), event).await?;
            }
        } else {
            for (plugin, _) in &decisions {
                let event = MutationHookEvent {
                    action,
                    model: model.name.clone(),
                    statement: stmt.clone(),
                    before_entities: None,
                    after_entities: None,
                };
                self.defer_or_run_after(plugin.clone(), event).await?;
            }
        }

        Ok(result)
    }

    async fn defer_or_run_after(
        &self,
        plugin: Arc<dyn Plugin>,
        event: MutationHookEvent,
    ) -> Result<()> {
        match self.tx {
            Some(tx) => {
                tx.after_hooks
                    .lock()
                    .expect("after hook queue")
                    .push((plugin, event));
                Ok(())
            }
            // Without a transaction the mutation has already persisted; hook
            // errors surface but cannot undo it.
            None => plugin.after_entity_mutation(&event).await,
        }
    }

    /// Snapshot rows a mutation statement is about to touch.
    async fn load_affected(&self, model: &ModelDef, stmt: &Statement) -> Result<Option<Vec<Row>>> {
        let where_clause = match &stmt.kind {
            StatementKind::Update(u) => u.where_clause.clone(),
            StatementKind::Delete(d) => d.where_clause.clone(),
            _ => return Ok(None),
        };

        let mut select = SelectStmt::from_table(model.table_name(), model.name.clone());
        select.where_clause = where_clause;
        let result = self
            .exec_raw(Statement::select(
                select,
                StatementContext::new(&model.name, StatementOp::Read),
            ))
            .await?;
        Ok(Some(result_rows(&result)))
    }

    /// Reload rows by the ids a mutation returned.
    async fn load_by_result_ids(
        &self,
        model: &ModelDef,
        result: &QueryResult,
    ) -> Result<Vec<Row>> {
        let ids = result_id_values(model, result)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut select = SelectStmt::from_table(model.table_name(), model.name.clone());
        select.and_where(ids_predicate(&model.name, &model.id_fields, &ids));
        let result = self
            .exec_raw(Statement::select(
                select,
                StatementContext::new(&model.name, StatementOp::Read),
            ))
            .await?;
        Ok(result_rows(&result))
    }

    /// Render and execute without the plugin chain (engine-internal reads).
    pub async fn exec_raw(&self, stmt: Statement) -> Result<QueryResult> {
        let rendered = render_statement(&stmt, self.core.conn.dialect())?;
        log::debug!("[exec raw] {}", rendered.sql);
        self.core
            .conn
            .execute(&QueryRequest::new(rendered.sql.clone()).with_params(rendered.params))
            .await
            .map_err(|e| e.with_sql(&rendered.sql))
    }
}

/// Ordered id values of every row in a mutation result.
pub(crate) fn result_id_values(
    model: &ModelDef,
    result: &QueryResult,
) -> Result<Vec<Vec<(String, Value)>>> {
    let mut indices = Vec::new();
    for id in &model.id_fields {
        let idx = result
            .column_index(id)
            .ok_or_else(|| Error::internal(format!("mutation result missing id '{}'", id)))?;
        indices.push((id.clone(), idx));
    }

    Ok(result
        .rows
        .iter()
        .map(|row| {
            indices
                .iter()
                .map(|(name, idx)| (name.clone(), row[*idx].clone()))
                .collect()
        })
        .collect())
}

/// `WHERE` predicate matching exactly the given id tuples.
pub(crate) fn ids_predicate(
    alias: &str,
    id_fields: &[String],
    ids: &[Vec<(String, Value)>],
) -> SqlExpr {
    if id_fields.len() == 1 {
        let field = &id_fields[0];
        let list: Vec<SqlExpr> = ids
            .iter()
            .map(|row| {
                SqlExpr::Param(
                    row.iter()
                        .find(|(name, _)| name == field)
                        .map(|(_, v)| v.clone())
                        .unwrap_or(Value::Null),
                )
            })
            .collect();
        return SqlExpr::InList {
            expr: Box::new(SqlExpr::col(alias, field)),
            list,
            negated: false,
        };
    }

    SqlExpr::or_all(
        ids.iter()
            .map(|row| {
                SqlExpr::and_all(
                    row.iter()
                        .map(|(name, value)| {
                            SqlExpr::col(alias, name).eq(SqlExpr::Param(value.clone()))
                        })
                        .collect(),
                )
            })
            .collect(),
    )
}

/// Raw driver rows as name → value maps.
pub(crate) fn result_rows(result: &QueryResult) -> Vec<Row> {
    result
        .rows
        .iter()
        .map(|row| {
            let mut out = Row::new();
            for (i, column) in result.columns.iter().enumerate() {
                out.insert(column.name.clone(), row[i].clone());
            }
            out
        })
        .collect()
}

/// Select items projecting the model's id columns.
///
/// Unqualified so they stay valid inside RETURNING clauses on both backends.
pub(crate) fn id_returning(model: &ModelDef) -> Vec<SelectItem> {
    model
        .id_fields
        .iter()
        .map(|id| SelectItem::aliased(SqlExpr::col("", id), id.clone()))
        .collect()
}
