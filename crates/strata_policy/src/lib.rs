//! Row-level access control as a pipeline plugin.
//!
//! Extracts `@@allow` / `@@deny` rules from the schema, rewrites every SQL
//! statement to weave in the combined policy predicate, runs pre-mutation
//! admission checks, verifies post-update rules, and marks read-back as
//! policy-constrained so filtered results surface as rejections.

mod compile;
mod rewrite;
mod rules;

pub use compile::{CompileCtx, ExprCompiler};
pub use rewrite::Rewriter;
pub use rules::{ExternalRule, ModelRules, PolicyOp, RuleSet};

use async_trait::async_trait;
use rewrite::InsertTarget;
use std::sync::Arc;
use strata_core::{
    Error, QueryResult, Result, Schema, SelectItem, SqlExpr, Statement, StatementKind,
};
use strata_engine::{Client, Plugin, PluginContext, StatementNext};

/// The policy plugin.
pub struct PolicyPlugin {
    rules: RuleSet,
}

impl PolicyPlugin {
    pub fn from_schema(schema: &Schema) -> Result<Self> {
        Self::with_external_rules(schema, &[])
    }

    pub fn with_external_rules(schema: &Schema, external: &[ExternalRule]) -> Result<Self> {
        Ok(Self {
            rules: RuleSet::from_schema(schema, external)?,
        })
    }
}

#[async_trait]
impl Plugin for PolicyPlugin {
    fn id(&self) -> &str {
        "policy"
    }

    fn constrains_read_back(&self) -> bool {
        true
    }

    async fn on_statement(
        &self,
        stmt: Statement,
        cx: &PluginContext<'_>,
        next: StatementNext<'_>,
    ) -> Result<QueryResult> {
        let rewriter = Rewriter {
            schema: cx.schema,
            rules: &self.rules,
            cx,
        };

        match &stmt.kind {
            StatementKind::Select(_) => {
                let rewritten = rewriter.rewrite_reads(&stmt)?;
                next.run(rewritten).await
            }

            StatementKind::Insert(insert) => match rewriter
                .classify_insert_table(&insert.table)?
            {
                InsertTarget::Model(model) => {
                    rewriter.check_insert(insert, model).await?;

                    let mut insert = insert.clone();
                    rewriter.merge_conflict_update_policy(&mut insert, model)?;
                    narrow_returning(&mut insert.returning, model);
                    next.run(Statement {
                        kind: StatementKind::Insert(insert),
                        context: stmt.context.clone(),
                    })
                    .await
                }
                InsertTarget::JoinTable(a, b) => {
                    rewriter.check_join_table_insert(insert, a, b).await?;
                    next.run(stmt.clone()).await
                }
            },

            StatementKind::Update(_) => {
                let model = rewriter.statement_model(&stmt)?;

                // Read policies apply to subqueries inside the WHERE.
                let wrapped = rewriter.rewrite_reads(&stmt)?;
                let StatementKind::Update(mut update) = wrapped.kind else {
                    return Err(Error::internal("update statement changed kind"));
                };

                let filter = rewriter.policy_filter(
                    model,
                    model.table_name(),
                    PolicyOp::Update,
                    None,
                )?;
                if filter.is_trivially_false() {
                    log::debug!("[policy] update on {} denied outright", model.name);
                    return Ok(QueryResult::empty());
                }
                if !filter.is_trivially_true() {
                    update.where_clause = Some(match update.where_clause.take() {
                        Some(existing) => existing.and(filter),
                        None => filter,
                    });
                }
                narrow_returning(&mut update.returning, model);

                let snapshot = if rewriter.needs_post_update_check(model) {
                    Some(
                        rewriter
                            .snapshot_before_update(model, update.where_clause.as_ref())
                            .await?,
                    )
                } else {
                    None
                };

                let result = next
                    .run(Statement {
                        kind: StatementKind::Update(update),
                        context: stmt.context.clone(),
                    })
                    .await?;

                if let Some((fields, rows)) = snapshot {
                    rewriter
                        .verify_post_update(model, &fields, &rows, result.row_count())
                        .await?;
                }
                Ok(result)
            }

            StatementKind::Delete(delete_stmt) => {
                // Join-table deletes (m2m disconnect/set) carry no policies
                // of their own; the connect path checks both participants.
                if !cx.schema.models.contains_key(&delete_stmt.table) {
                    return next.run(stmt.clone()).await;
                }
                let model = rewriter.statement_model(&stmt)?;

                let wrapped = rewriter.rewrite_reads(&stmt)?;
                let StatementKind::Delete(mut delete) = wrapped.kind else {
                    return Err(Error::internal("delete statement changed kind"));
                };

                let filter = rewriter.policy_filter(
                    model,
                    model.table_name(),
                    PolicyOp::Delete,
                    None,
                )?;
                if filter.is_trivially_false() {
                    log::debug!("[policy] delete on {} denied outright", model.name);
                    return Ok(QueryResult::empty());
                }
                if !filter.is_trivially_true() {
                    delete.where_clause = Some(match delete.where_clause.take() {
                        Some(existing) => existing.and(filter),
                        None => filter,
                    });
                }
                narrow_returning(&mut delete.returning, model);

                next.run(Statement {
                    kind: StatementKind::Delete(delete),
                    context: stmt.context.clone(),
                })
                .await
            }
        }
    }
}

/// Mutations only surface id columns; the authorized projection comes from
/// the read-back SELECT.
fn narrow_returning(returning: &mut Vec<SelectItem>, model: &strata_core::ModelDef) {
    if returning.is_empty() {
        return;
    }
    *returning = model
        .id_fields
        .iter()
        .map(|id| SelectItem::aliased(SqlExpr::col("", id), id.clone()))
        .collect();
}

/// Policy feature configuration for `with_features`.
#[derive(Default)]
pub struct PolicyFeatures {
    /// Ambient caller identity.
    pub auth: Option<serde_json::Value>,
    /// Rules supplied outside the schema.
    pub external_rules: Vec<ExternalRule>,
}

/// Client extension installing the policy plugin.
pub trait PolicyClientExt: Sized {
    /// Derive a client with the policy feature (re)configured.
    fn with_features(&self, features: PolicyFeatures) -> Result<Client>;
}

impl PolicyClientExt for Client {
    fn with_features(&self, features: PolicyFeatures) -> Result<Client> {
        let mut client = self.clone();
        if features.auth.is_some() {
            client = client.set_auth(features.auth)?;
        }
        let plugin = PolicyPlugin::with_external_rules(client.schema(), &features.external_rules)?;
        client.use_plugin(Arc::new(plugin))
    }
}
