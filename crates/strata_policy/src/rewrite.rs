use crate::compile::{CompileCtx, ExprCompiler};
use crate::rules::{ModelRules, PolicyOp, RuleSet};
use strata_core::{
    transform_table_refs, BuiltinType, Error, FieldType, InsertSource, InsertStmt, ModelDef,
    OnConflict, PolicyReason, Result, Schema, SelectItem, SelectStmt, SqlDialect, SqlExpr,
    Statement, StatementContext, StatementKind, StatementOp, TableRef, Value,
};
use strata_engine::PluginContext;

/// Policy-aware statement rewriting and admission checks.
pub struct Rewriter<'a> {
    pub schema: &'a Schema,
    pub rules: &'a RuleSet,
    pub cx: &'a PluginContext<'a>,
}

impl<'a> Rewriter<'a> {
    fn compiler(&self) -> ExprCompiler<'a> {
        ExprCompiler {
            schema: self.schema,
            dialect: self.cx.dialect(),
            auth: self.cx.auth,
        }
    }

    fn dialect(&self) -> &dyn SqlDialect {
        self.cx.dialect()
    }

    /// Combined policy filter for (model, alias, op): allow-disjunction AND
    /// the conjunction of negated denies. CRUD defaults to deny; post-update
    /// defaults to allow.
    pub fn policy_filter(
        &self,
        model: &ModelDef,
        alias: &str,
        op: PolicyOp,
        before_alias: Option<&str>,
    ) -> Result<SqlExpr> {
        let empty = ModelRules::default();
        let rules = self.rules.model(&model.name).unwrap_or(&empty);
        let compiler = self.compiler();
        let cx = CompileCtx {
            model,
            alias,
            before_alias,
        };

        let allows = rules.allows_for(op);
        let allow = if allows.is_empty() {
            SqlExpr::Bool(op == PolicyOp::PostUpdate)
        } else {
            SqlExpr::or_all(
                allows
                    .iter()
                    .map(|e| compiler.compile(&cx, e))
                    .collect::<Result<_>>()?,
            )
        };

        let denies = rules.denies_for(op);
        let deny = SqlExpr::and_all(
            denies
                .iter()
                .map(|e| Ok(compiler.compile(&cx, e)?.negate()))
                .collect::<Result<_>>()?,
        );

        Ok(fold_and(allow, deny))
    }

    /// Wrap every model table reference in a filtered derived table so
    /// downstream operators see only authorized rows.
    pub fn rewrite_reads(&self, stmt: &Statement) -> Result<Statement> {
        let mut failure: Option<Error> = None;
        let rewritten = transform_table_refs(stmt, &mut |table| {
            if failure.is_some() {
                return None;
            }
            let TableRef::Table { name, alias } = table else {
                return None;
            };
            let Ok(model) = self.schema.model(name) else {
                // Implicit join tables carry no read policies.
                return None;
            };
            match self.policy_filter(model, alias, PolicyOp::Read, None) {
                Ok(filter) if filter.is_trivially_true() => None,
                Ok(filter) => {
                    let mut inner =
                        SelectStmt::from_table(name.clone(), alias.clone());
                    inner.and_where(filter);
                    Some(TableRef::derived(inner, alias.clone()))
                }
                Err(e) => {
                    failure = Some(e);
                    None
                }
            }
        });
        match failure {
            Some(e) => Err(e),
            None => Ok(rewritten),
        }
    }

    /// Pre-insert admission: evaluate the create policy over a constant
    /// table built from the inserted values.
    pub async fn check_insert(&self, insert: &InsertStmt, model: &ModelDef) -> Result<()> {
        let rules_filter = self.policy_filter(model, &model.name, PolicyOp::Create, None)?;
        if rules_filter.is_trivially_true() {
            return Ok(());
        }
        if rules_filter.is_trivially_false() {
            return Err(Error::rejected(&model.name, PolicyReason::Other));
        }

        let InsertSource::Values(rows) = &insert.source else {
            return Err(Error::internal("policy admission requires VALUES inserts"));
        };

        let constant = self.constant_table(model, &insert.columns, rows)?;
        let mut check = SelectStmt {
            from: Some(TableRef::derived(constant, model.name.clone())),
            ..Default::default()
        };
        check
            .projection
            .push(SelectItem::aliased(SqlExpr::CountStar, "allowed"));
        check.and_where(rules_filter);

        let result = self
            .cx
            .run_raw(&Statement::select(
                check,
                StatementContext::new(&model.name, StatementOp::Read),
            ))
            .await?;
        let allowed = result
            .scalar()
            .and_then(Value::as_i64)
            .unwrap_or_default();
        if allowed < rows.len() as i64 {
            return Err(Error::rejected(&model.name, PolicyReason::Other));
        }
        Ok(())
    }

    /// Both participants of an implicit join-table insert must satisfy their
    /// update policy.
    pub async fn check_join_table_insert(
        &self,
        insert: &InsertStmt,
        a_model: &ModelDef,
        b_model: &ModelDef,
    ) -> Result<()> {
        let InsertSource::Values(rows) = &insert.source else {
            return Ok(());
        };
        let a_idx = insert.columns.iter().position(|c| c == "A");
        let b_idx = insert.columns.iter().position(|c| c == "B");

        for row in rows {
            for (model, idx) in [(a_model, a_idx), (b_model, b_idx)] {
                let Some(idx) = idx else { continue };
                let Some(SqlExpr::Param(id_value)) = row.get(idx) else {
                    continue;
                };
                self.check_row_access(model, id_value, PolicyOp::Update)
                    .await?;
            }
        }
        Ok(())
    }

    /// The row must exist and satisfy the policy for `op`.
    async fn check_row_access(
        &self,
        model: &ModelDef,
        id_value: &Value,
        op: PolicyOp,
    ) -> Result<()> {
        let filter = self.policy_filter(model, &model.name, op, None)?;
        if filter.is_trivially_true() {
            return Ok(());
        }
        if filter.is_trivially_false() {
            return Err(Error::rejected(&model.name, PolicyReason::Other));
        }

        let id_field = model
            .id_fields
            .first()
            .ok_or_else(|| Error::internal("model without id"))?;
        let mut check = SelectStmt::from_table(model.table_name(), model.name.clone());
        check
            .projection
            .push(SelectItem::aliased(SqlExpr::CountStar, "allowed"));
        check.and_where(
            SqlExpr::col(model.name.clone(), id_field).eq(SqlExpr::Param(id_value.clone())),
        );
        check.and_where(filter);

        let result = self
            .cx
            .run_raw(&Statement::select(
                check,
                StatementContext::new(&model.name, StatementOp::Read),
            ))
            .await?;
        let allowed = result
            .scalar()
            .and_then(Value::as_i64)
            .unwrap_or_default();
        if allowed < 1 {
            return Err(Error::rejected(&model.name, PolicyReason::Other));
        }
        Ok(())
    }

    /// Merge the update policy into an `ON CONFLICT DO UPDATE` clause.
    pub fn merge_conflict_update_policy(
        &self,
        insert: &mut InsertStmt,
        model: &ModelDef,
    ) -> Result<()> {
        if let Some(OnConflict::DoUpdate { where_clause, .. }) = &mut insert.on_conflict {
            let filter =
                self.policy_filter(model, model.table_name(), PolicyOp::Update, None)?;
            if !filter.is_trivially_true() {
                *where_clause = Some(match where_clause.take() {
                    Some(existing) => existing.and(filter),
                    None => filter,
                });
            }
        }
        Ok(())
    }

    /// Snapshot rows referenced by a post-update rule: ids plus every field
    /// named under `before()`.
    pub async fn snapshot_before_update(
        &self,
        model: &ModelDef,
        where_clause: Option<&SqlExpr>,
    ) -> Result<(Vec<String>, Vec<Vec<Value>>)> {
        let empty = ModelRules::default();
        let rules = self.rules.model(&model.name).unwrap_or(&empty);

        let mut fields: Vec<String> = Vec::new();
        for expr in rules
            .allows_for(PolicyOp::PostUpdate)
            .iter()
            .chain(rules.denies_for(PolicyOp::PostUpdate))
        {
            expr.before_fields(&mut fields);
        }
        for id in &model.id_fields {
            if !fields.contains(id) {
                fields.insert(0, id.clone());
            }
        }

        let mut select = SelectStmt::from_table(model.table_name(), model.name.clone());
        select.where_clause = where_clause.cloned();
        for field in &fields {
            select.projection.push(SelectItem::aliased(
                SqlExpr::col(model.name.clone(), field),
                field.clone(),
            ));
        }
        let result = self
            .cx
            .run_raw(&Statement::select(
                select,
                StatementContext::new(&model.name, StatementOp::Read),
            ))
            .await?;
        Ok((fields, result.rows))
    }

    /// Whether an update of `model` needs post-update verification: explicit
    /// post-update rules, or update rules that read across row boundaries
    /// (relation members / collection predicates evaluate against the state
    /// the update produced).
    pub fn needs_post_update_check(&self, model: &ModelDef) -> bool {
        let Some(rules) = self.rules.model(&model.name) else {
            return false;
        };
        if rules.has_post_update() {
            return true;
        }
        rules
            .allows_for(PolicyOp::Update)
            .iter()
            .chain(rules.denies_for(PolicyOp::Update))
            .any(|e| references_relation(model, e))
    }

    /// Combined post-update predicate: explicit post-update rules plus the
    /// cross-row portion of the update rules.
    fn post_update_filter(&self, model: &ModelDef, before_alias: &str) -> Result<SqlExpr> {
        let empty = ModelRules::default();
        let rules = self.rules.model(&model.name).unwrap_or(&empty);
        let compiler = self.compiler();
        let cx = CompileCtx {
            model,
            alias: &model.name,
            before_alias: Some(before_alias),
        };

        let mut allows: Vec<&strata_core::Expr> =
            rules.allows_for(PolicyOp::PostUpdate).iter().collect();
        allows.extend(
            rules
                .allows_for(PolicyOp::Update)
                .iter()
                .filter(|e| references_relation(model, e)),
        );
        let mut denies: Vec<&strata_core::Expr> =
            rules.denies_for(PolicyOp::PostUpdate).iter().collect();
        denies.extend(
            rules
                .denies_for(PolicyOp::Update)
                .iter()
                .filter(|e| references_relation(model, e)),
        );

        let allow = if allows.is_empty() {
            SqlExpr::Bool(true)
        } else {
            SqlExpr::or_all(
                allows
                    .iter()
                    .map(|e| compiler.compile(&cx, e))
                    .collect::<Result<_>>()?,
            )
        };
        let deny = SqlExpr::and_all(
            denies
                .iter()
                .map(|e| Ok(compiler.compile(&cx, e)?.negate()))
                .collect::<Result<_>>()?,
        );
        Ok(fold_and(allow, deny))
    }

    /// Verify the post-update policy against the snapshot; the count of
    /// satisfying rows must reach the number actually updated.
    pub async fn verify_post_update(
        &self,
        model: &ModelDef,
        snapshot_fields: &[String],
        snapshot_rows: &[Vec<Value>],
        updated: usize,
    ) -> Result<()> {
        if updated == 0 || snapshot_rows.is_empty() {
            return Ok(());
        }

        let filter = self.post_update_filter(model, "before")?;
        if filter.is_trivially_true() {
            return Ok(());
        }

        // Constant table of the snapshot, joined back by id.
        let snapshot =
            self.values_table(model, snapshot_fields, snapshot_rows)?;
        let mut check = SelectStmt::from_table(model.table_name(), model.name.clone());
        check
            .projection
            .push(SelectItem::aliased(SqlExpr::CountStar, "satisfied"));
        check.joins.push(strata_core::Join {
            kind: strata_core::JoinKind::Inner,
            table: TableRef::derived(snapshot, "before".to_string()),
            on: SqlExpr::and_all(
                model
                    .id_fields
                    .iter()
                    .map(|id| {
                        SqlExpr::col(model.name.clone(), id)
                            .eq(SqlExpr::col("before", id))
                    })
                    .collect(),
            ),
        });
        check.and_where(filter);

        let result = self
            .cx
            .run_raw(&Statement::select(
                check,
                StatementContext::new(&model.name, StatementOp::Read),
            ))
            .await?;
        let satisfied = result
            .scalar()
            .and_then(Value::as_i64)
            .unwrap_or_default();
        if (satisfied as usize) < updated {
            return Err(Error::rejected(&model.name, PolicyReason::NoAccess));
        }
        Ok(())
    }

    /// One-row-per-entry constant table via `SELECT CAST(... ) UNION ALL`.
    fn values_table(
        &self,
        model: &ModelDef,
        fields: &[String],
        rows: &[Vec<Value>],
    ) -> Result<SelectStmt> {
        if rows.is_empty() {
            return Err(Error::internal("constant table requires at least one row"));
        }
        let mut selects: Vec<SelectStmt> = rows
            .iter()
            .map(|row| {
                let mut select = SelectStmt::default();
                for (i, field_name) in fields.iter().enumerate() {
                    let ty = self.cast_type(model, field_name);
                    select.projection.push(SelectItem::aliased(
                        SqlExpr::Cast {
                            expr: Box::new(SqlExpr::Param(row[i].clone())),
                            ty,
                        },
                        field_name.clone(),
                    ));
                }
                select
            })
            .collect();

        let mut first = selects.remove(0);
        first.union_all = selects;
        Ok(first)
    }

    /// Constant table matching the model's full scalar shape; columns absent
    /// from the insert are NULL.
    fn constant_table(
        &self,
        model: &ModelDef,
        columns: &[String],
        rows: &[Vec<SqlExpr>],
    ) -> Result<SelectStmt> {
        if rows.is_empty() {
            return Err(Error::internal("constant table requires at least one row"));
        }
        let mut selects: Vec<SelectStmt> = Vec::with_capacity(rows.len());
        for row in rows {
            let mut select = SelectStmt::default();
            for field in model.fields.values() {
                if field.is_relation() || field.computed || field.origin_model.is_some() {
                    continue;
                }
                let ty = self.cast_type(model, &field.name);
                let value = columns
                    .iter()
                    .position(|c| c == &field.name)
                    .and_then(|idx| row.get(idx).cloned())
                    .unwrap_or(SqlExpr::Param(Value::Null));
                select.projection.push(SelectItem::aliased(
                    SqlExpr::Cast {
                        expr: Box::new(value),
                        ty,
                    },
                    field.name.clone(),
                ));
            }
            selects.push(select);
        }

        let mut first = selects.remove(0);
        first.union_all = selects;
        Ok(first)
    }

    fn cast_type(&self, model: &ModelDef, field_name: &str) -> String {
        let builtin = model
            .field(field_name)
            .and_then(|f| match &f.field_type {
                FieldType::Builtin(b) => Some(*b),
                FieldType::Enum(_) => Some(BuiltinType::String),
                FieldType::TypeDef(_) => Some(BuiltinType::Json),
                FieldType::Model(_) => None,
            })
            .unwrap_or(BuiltinType::String);
        let array = model.field(field_name).map(|f| f.array).unwrap_or(false);
        self.dialect().field_sql_type(builtin, array)
    }

    /// Resolve an insert's table to either a model or a join-table pair.
    pub fn classify_insert_table(
        &self,
        table: &str,
    ) -> Result<InsertTarget<'_>> {
        if let Ok(model) = self.schema.model(table) {
            return Ok(InsertTarget::Model(model));
        }
        for model in self.schema.models.values() {
            for field in model.relation_fields() {
                if self.schema.is_many_to_many(model, field)? {
                    let join = self.schema.join_table(model, field)?;
                    if join.table == table {
                        let a = self.schema.model(&join.a_model)?;
                        let b = self.schema.model(&join.b_model)?;
                        return Ok(InsertTarget::JoinTable(a, b));
                    }
                }
            }
        }
        Err(Error::internal(format!(
            "insert into unknown table '{}'",
            table
        )))
    }

    /// Look up the mutation statement's target model.
    pub fn statement_model(&self, stmt: &Statement) -> Result<&'a ModelDef> {
        let table = match &stmt.kind {
            StatementKind::Insert(i) => &i.table,
            StatementKind::Update(u) => &u.table,
            StatementKind::Delete(d) => &d.table,
            StatementKind::Select(_) => &stmt.context.model,
        };
        self.schema.model(table)
    }
}

/// Target of an INSERT: a model table or an implicit join table.
pub enum InsertTarget<'a> {
    Model(&'a ModelDef),
    JoinTable(&'a ModelDef, &'a ModelDef),
}

/// Whether an expression reads beyond the current row: a member access on a
/// relation field or a collection predicate.
fn references_relation(model: &ModelDef, expr: &strata_core::Expr) -> bool {
    use strata_core::Expr;
    match expr {
        Expr::Collection(..) => true,
        Expr::Member(base, _) => match base.as_ref() {
            Expr::Field(name) => model
                .field(name)
                .map(|f| f.is_relation())
                .unwrap_or(false),
            other => references_relation(model, other),
        },
        Expr::Binary(_, lhs, rhs) => {
            references_relation(model, lhs) || references_relation(model, rhs)
        }
        Expr::Unary(_, inner) => references_relation(model, inner),
        Expr::Call(_, args) | Expr::Array(args) => {
            args.iter().any(|a| references_relation(model, a))
        }
        _ => false,
    }
}

fn fold_and(lhs: SqlExpr, rhs: SqlExpr) -> SqlExpr {
    if lhs.is_trivially_false() || rhs.is_trivially_false() {
        return SqlExpr::Bool(false);
    }
    if lhs.is_trivially_true() {
        return rhs;
    }
    if rhs.is_trivially_true() {
        return lhs;
    }
    lhs.and(rhs)
}
