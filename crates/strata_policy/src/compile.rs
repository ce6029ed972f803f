use strata_core::{
    BinaryOp, CollectionOp, Error, Expr, ModelDef, Result, Schema, SqlDialect, SqlExpr,
    UnaryOp, Value,
};
use strata_engine::FilterBuilder;

/// Compiles policy expressions to SQL predicates.
///
/// Field references become columns bound to the current alias, `auth()`
/// becomes parameterized literals of the ambient auth value, and collection
/// predicates become correlated EXISTS subqueries.
pub struct ExprCompiler<'a> {
    pub schema: &'a Schema,
    pub dialect: &'a dyn SqlDialect,
    pub auth: Option<&'a Value>,
}

/// Where the expression's references resolve.
pub struct CompileCtx<'a> {
    pub model: &'a ModelDef,
    pub alias: &'a str,
    /// Alias of the pre-mutation snapshot table for `before()` access.
    pub before_alias: Option<&'a str>,
}

impl<'a> ExprCompiler<'a> {
    fn filters(&self) -> FilterBuilder<'a> {
        FilterBuilder::new(self.schema, self.dialect)
    }

    fn auth_value(&self, path: &[String]) -> Value {
        match self.auth {
            Some(auth) => auth.walk_path(path),
            None => Value::Null,
        }
    }

    pub fn compile(&self, cx: &CompileCtx<'_>, expr: &Expr) -> Result<SqlExpr> {
        match expr {
            Expr::Literal(Value::Bool(b)) => Ok(SqlExpr::Bool(*b)),
            Expr::Literal(value) => Ok(SqlExpr::Param(value.clone())),
            Expr::Null => Ok(SqlExpr::Param(Value::Null)),

            Expr::Field(name) => {
                let field = cx.model.field(name).ok_or_else(|| {
                    Error::internal(format!(
                        "policy on '{}' references unknown field '{}'",
                        cx.model.name, name
                    ))
                })?;
                if field.is_relation() {
                    return Err(Error::internal(format!(
                        "bare relation reference '{}' in policy expression",
                        name
                    )));
                }
                Ok(self.filters().column_expr(cx.model, cx.alias, field))
            }

            Expr::Before(name) => {
                let before_alias = cx.before_alias.ok_or_else(|| {
                    Error::internal("before() is only valid in post-update rules")
                })?;
                Ok(SqlExpr::col(before_alias, name))
            }

            Expr::Member(base, path) => self.compile_member(cx, base, path),

            Expr::Binary(op, lhs, rhs) => self.compile_binary(cx, *op, lhs, rhs),

            Expr::Unary(UnaryOp::Not, inner) => {
                Ok(self.compile(cx, inner)?.negate())
            }
            Expr::Unary(UnaryOp::Neg, inner) => {
                Ok(SqlExpr::Neg(Box::new(self.compile(cx, inner)?)))
            }

            Expr::Collection(op, relation, predicate) => {
                self.compile_collection(cx, *op, relation, predicate.as_deref())
            }

            Expr::Auth => {
                // A bare auth() only makes sense against null/this; those are
                // folded in compile_binary.
                Err(Error::internal(
                    "auth() must be compared or accessed via members",
                ))
            }
            Expr::This => Err(Error::internal(
                "`this` must be compared against auth() or a relation",
            )),
            Expr::Call(name, _) => Err(Error::Unsupported(format!(
                "policy function '{}' is not supported",
                name
            ))),
            Expr::Array(items) => Ok(SqlExpr::Tuple(
                items
                    .iter()
                    .map(|e| self.compile(cx, e))
                    .collect::<Result<_>>()?,
            )),
        }
    }

    fn compile_member(
        &self,
        cx: &CompileCtx<'_>,
        base: &Expr,
        path: &[String],
    ) -> Result<SqlExpr> {
        match base {
            Expr::Auth => Ok(SqlExpr::Param(self.auth_value(path))),
            Expr::This => {
                let (head, rest) = path
                    .split_first()
                    .ok_or_else(|| Error::internal("empty member path"))?;
                if rest.is_empty() {
                    self.compile(cx, &Expr::Field(head.clone()))
                } else {
                    self.compile_member(cx, &Expr::Field(head.clone()), rest)
                }
            }
            Expr::Field(relation_name) => {
                // Relation member access: correlated scalar subquery.
                let field = cx.model.field(relation_name).ok_or_else(|| {
                    Error::internal(format!("unknown field '{}'", relation_name))
                })?;
                if !field.is_relation() || field.is_to_many() {
                    return Err(Error::internal(format!(
                        "member access requires a to-one relation, got '{}'",
                        relation_name
                    )));
                }
                let (target, _) = self.schema.opposite_relation(cx.model, field)?;
                let target_alias = format!("{}${}", cx.alias, relation_name);
                let mut sub = self.filters().related_subquery(
                    cx.model,
                    cx.alias,
                    field,
                    &target_alias,
                )?;
                let inner_cx = CompileCtx {
                    model: target,
                    alias: &target_alias,
                    before_alias: cx.before_alias,
                };
                let (head, rest) = path
                    .split_first()
                    .ok_or_else(|| Error::internal("empty member path"))?;
                let projected = if rest.is_empty() {
                    self.compile(&inner_cx, &Expr::Field(head.clone()))?
                } else {
                    self.compile_member(&inner_cx, &Expr::Field(head.clone()), rest)?
                };
                sub.projection
                    .push(strata_core::SelectItem::new(projected));
                sub.limit = Some(1);
                Ok(SqlExpr::Subquery(Box::new(sub)))
            }
            other => Err(Error::internal(format!(
                "unsupported member base: {:?}",
                other
            ))),
        }
    }

    fn compile_binary(
        &self,
        cx: &CompileCtx<'_>,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<SqlExpr> {
        use strata_core::BinOp;

        // auth()/this identity comparisons fold before generic compilation.
        if matches!(op, BinaryOp::Eq | BinaryOp::Ne) {
            if let Some(folded) = self.fold_identity_comparison(cx, op, lhs, rhs)? {
                return Ok(folded);
            }
            // Null comparisons become IS [NOT] NULL.
            if matches!(rhs, Expr::Null) {
                return Ok(self
                    .compile(cx, lhs)?
                    .is_null_check(op == BinaryOp::Ne));
            }
            if matches!(lhs, Expr::Null) {
                return Ok(self
                    .compile(cx, rhs)?
                    .is_null_check(op == BinaryOp::Ne));
            }
        }

        let bin = match op {
            BinaryOp::Eq => BinOp::Eq,
            BinaryOp::Ne => BinOp::Ne,
            BinaryOp::Lt => BinOp::Lt,
            BinaryOp::Le => BinOp::Le,
            BinaryOp::Gt => BinOp::Gt,
            BinaryOp::Ge => BinOp::Ge,
            BinaryOp::And => BinOp::And,
            BinaryOp::Or => BinOp::Or,
            BinaryOp::Add => BinOp::Add,
            BinaryOp::Sub => BinOp::Sub,
            BinaryOp::Mul => BinOp::Mul,
            BinaryOp::Div => BinOp::Div,
        };

        let left = self.compile(cx, lhs)?;
        let right = self.compile(cx, rhs)?;

        // Keep constants foldable for trivial-filter short-circuits.
        if bin == BinOp::And {
            if left.is_trivially_false() || right.is_trivially_false() {
                return Ok(SqlExpr::Bool(false));
            }
            if left.is_trivially_true() {
                return Ok(right);
            }
            if right.is_trivially_true() {
                return Ok(left);
            }
        }
        if bin == BinOp::Or {
            if left.is_trivially_true() || right.is_trivially_true() {
                return Ok(SqlExpr::Bool(true));
            }
            if left.is_trivially_false() {
                return Ok(right);
            }
            if right.is_trivially_false() {
                return Ok(left);
            }
        }

        Ok(SqlExpr::binary(bin, left, right))
    }

    /// `auth() == this`, `auth() == null`, and their negations.
    fn fold_identity_comparison(
        &self,
        cx: &CompileCtx<'_>,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<Option<SqlExpr>> {
        let negate = op == BinaryOp::Ne;

        let (auth_side, other) = match (lhs, rhs) {
            (Expr::Auth, other) => (true, other),
            (other, Expr::Auth) => (true, other),
            _ => (false, lhs),
        };
        if !auth_side {
            return Ok(None);
        }

        match other {
            Expr::Null => {
                let is_null = self.auth.is_none();
                Ok(Some(SqlExpr::Bool(is_null != negate)))
            }
            Expr::This => {
                // Compare the auth value's id members to this row's ids.
                let mut terms = Vec::new();
                for id in &cx.model.id_fields {
                    let auth_id = self.auth_value(&[id.clone()]);
                    if auth_id.is_null() {
                        return Ok(Some(SqlExpr::Bool(negate)));
                    }
                    let field = cx.model.field(id).ok_or_else(|| {
                        Error::internal(format!("missing id field '{}'", id))
                    })?;
                    terms.push(
                        self.filters()
                            .column_expr(cx.model, cx.alias, field)
                            .eq(SqlExpr::Param(auth_id)),
                    );
                }
                let combined = SqlExpr::and_all(terms);
                Ok(Some(if negate { combined.negate() } else { combined }))
            }
            _ => Ok(None),
        }
    }

    fn compile_collection(
        &self,
        cx: &CompileCtx<'_>,
        op: CollectionOp,
        relation: &str,
        predicate: Option<&Expr>,
    ) -> Result<SqlExpr> {
        let field = cx.model.field(relation).ok_or_else(|| {
            Error::internal(format!("unknown relation '{}'", relation))
        })?;
        if !field.is_relation() {
            return Err(Error::internal(format!(
                "collection predicate on non-relation '{}'",
                relation
            )));
        }

        let (target, _) = self.schema.opposite_relation(cx.model, field)?;
        let target_alias = format!("{}${}", cx.alias, relation);
        let mut sub = self
            .filters()
            .related_subquery(cx.model, cx.alias, field, &target_alias)?;
        sub.projection.push(strata_core::SelectItem::new(
            SqlExpr::Raw(vec![strata_core::RawPiece::Sql("1".to_string())]),
        ));

        let inner_cx = CompileCtx {
            model: target,
            alias: &target_alias,
            before_alias: cx.before_alias,
        };

        match op {
            CollectionOp::Any => {
                if let Some(predicate) = predicate {
                    let compiled = self.compile(&inner_cx, predicate)?;
                    sub.and_where(compiled);
                }
                Ok(SqlExpr::Exists {
                    query: Box::new(sub),
                    negated: false,
                })
            }
            CollectionOp::None => {
                if let Some(predicate) = predicate {
                    let compiled = self.compile(&inner_cx, predicate)?;
                    sub.and_where(compiled);
                }
                Ok(SqlExpr::Exists {
                    query: Box::new(sub),
                    negated: true,
                })
            }
            CollectionOp::All => {
                // No member may violate the predicate.
                let predicate = predicate.ok_or_else(|| {
                    Error::internal("`all` collection predicate requires an expression")
                })?;
                let compiled = self.compile(&inner_cx, predicate)?;
                sub.and_where(compiled.negate());
                Ok(SqlExpr::Exists {
                    query: Box::new(sub),
                    negated: true,
                })
            }
        }
    }
}
