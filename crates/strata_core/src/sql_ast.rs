use crate::Value;

/// Operation class recorded in the trailing `$$context` comment of every
/// root statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementOp {
    Read,
    Create,
    Update,
    Delete,
}

impl StatementOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatementOp::Read => "read",
            StatementOp::Create => "create",
            StatementOp::Update => "update",
            StatementOp::Delete => "delete",
        }
    }
}

/// Origin of a root statement, for observers and the policy plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementContext {
    pub model: String,
    pub operation: StatementOp,
}

impl StatementContext {
    pub fn new(model: impl Into<String>, operation: StatementOp) -> Self {
        Self {
            model: model.into(),
            operation,
        }
    }
}

/// A root SQL statement plus its origin context.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub kind: StatementKind,
    pub context: StatementContext,
}

impl Statement {
    pub fn select(stmt: SelectStmt, context: StatementContext) -> Self {
        Self {
            kind: StatementKind::Select(stmt),
            context,
        }
    }

    pub fn insert(stmt: InsertStmt, context: StatementContext) -> Self {
        Self {
            kind: StatementKind::Insert(stmt),
            context,
        }
    }

    pub fn update(stmt: UpdateStmt, context: StatementContext) -> Self {
        Self {
            kind: StatementKind::Update(stmt),
            context,
        }
    }

    pub fn delete(stmt: DeleteStmt, context: StatementContext) -> Self {
        Self {
            kind: StatementKind::Delete(stmt),
            context,
        }
    }

    pub fn is_mutation(&self) -> bool {
        !matches!(self.kind, StatementKind::Select(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatementKind {
    Select(SelectStmt),
    Insert(InsertStmt),
    Update(UpdateStmt),
    Delete(DeleteStmt),
}

/// DISTINCT handling on a SELECT.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Distinct {
    #[default]
    None,
    All,
    /// `DISTINCT ON (...)`; availability is a dialect capability.
    On(Vec<SqlExpr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectItem {
    pub expr: SqlExpr,
    pub alias: Option<String>,
}

impl SelectItem {
    pub fn new(expr: SqlExpr) -> Self {
        Self { expr, alias: None }
    }

    pub fn aliased(expr: SqlExpr, alias: impl Into<String>) -> Self {
        Self {
            expr,
            alias: Some(alias.into()),
        }
    }
}

/// A table source: a named table or a derived subquery.
#[derive(Debug, Clone, PartialEq)]
pub enum TableRef {
    Table { name: String, alias: String },
    Derived { query: Box<SelectStmt>, alias: String },
}

impl TableRef {
    pub fn table(name: impl Into<String>, alias: impl Into<String>) -> Self {
        TableRef::Table {
            name: name.into(),
            alias: alias.into(),
        }
    }

    pub fn derived(query: SelectStmt, alias: impl Into<String>) -> Self {
        TableRef::Derived {
            query: Box::new(query),
            alias: alias.into(),
        }
    }

    pub fn alias(&self) -> &str {
        match self {
            TableRef::Table { alias, .. } | TableRef::Derived { alias, .. } => alias,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub kind: JoinKind,
    pub table: TableRef,
    pub on: SqlExpr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderTerm {
    pub expr: SqlExpr,
    pub desc: bool,
}

impl OrderTerm {
    pub fn asc(expr: SqlExpr) -> Self {
        Self { expr, desc: false }
    }

    pub fn desc(expr: SqlExpr) -> Self {
        Self { expr, desc: true }
    }

    pub fn negated(mut self) -> Self {
        self.desc = !self.desc;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectStmt {
    pub projection: Vec<SelectItem>,
    pub from: Option<TableRef>,
    pub joins: Vec<Join>,
    pub where_clause: Option<SqlExpr>,
    pub group_by: Vec<SqlExpr>,
    pub having: Option<SqlExpr>,
    pub order_by: Vec<OrderTerm>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub distinct: Distinct,
    /// Additional selects merged with UNION ALL (constant tables).
    pub union_all: Vec<SelectStmt>,
}

impl SelectStmt {
    pub fn from_table(name: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            from: Some(TableRef::table(name, alias)),
            ..Default::default()
        }
    }

    pub fn and_where(&mut self, predicate: SqlExpr) {
        self.where_clause = Some(match self.where_clause.take() {
            Some(existing) => existing.and(predicate),
            None => predicate,
        });
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InsertSource {
    Values(Vec<Vec<SqlExpr>>),
    Select(Box<SelectStmt>),
    DefaultValues,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OnConflict {
    DoNothing {
        targets: Vec<String>,
    },
    DoUpdate {
        targets: Vec<String>,
        set: Vec<(String, SqlExpr)>,
        where_clause: Option<SqlExpr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertStmt {
    pub table: String,
    pub columns: Vec<String>,
    pub source: InsertSource,
    pub on_conflict: Option<OnConflict>,
    pub returning: Vec<SelectItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStmt {
    pub table: String,
    pub set: Vec<(String, SqlExpr)>,
    pub where_clause: Option<SqlExpr>,
    pub returning: Vec<SelectItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStmt {
    pub table: String,
    pub where_clause: Option<SqlExpr>,
    pub returning: Vec<SelectItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
    /// String / array concatenation (`||`).
    Concat,
}

impl BinOp {
    pub fn sql(&self) -> &'static str {
        match self {
            BinOp::Eq => "=",
            BinOp::Ne => "<>",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "AND",
            BinOp::Or => "OR",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Concat => "||",
        }
    }
}

/// A raw SQL fragment piece: literal SQL, a bound parameter, or an embedded
/// expression rendered in place.
#[derive(Debug, Clone, PartialEq)]
pub enum RawPiece {
    Sql(String),
    Param(Value),
    Expr(Box<SqlExpr>),
}

/// One JSON object member in a JSON projection.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonPair {
    pub key: String,
    pub expr: SqlExpr,
    /// The value is itself JSON text and must not be double-encoded.
    pub is_json: bool,
}

/// SQL expression nodes.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlExpr {
    /// `"alias"."column"`.
    Column { table: String, column: String },
    /// Bound parameter.
    Param(Value),
    /// Constant boolean; kept symbolic so rewriters can detect trivial
    /// filters.
    Bool(bool),
    Binary {
        op: BinOp,
        lhs: Box<SqlExpr>,
        rhs: Box<SqlExpr>,
    },
    Not(Box<SqlExpr>),
    Neg(Box<SqlExpr>),
    Like {
        expr: Box<SqlExpr>,
        pattern: Box<SqlExpr>,
        insensitive: bool,
        negated: bool,
        escape: Option<char>,
    },
    InList {
        expr: Box<SqlExpr>,
        list: Vec<SqlExpr>,
        negated: bool,
    },
    InSubquery {
        expr: Box<SqlExpr>,
        query: Box<SelectStmt>,
        negated: bool,
    },
    IsNull {
        expr: Box<SqlExpr>,
        negated: bool,
    },
    Exists {
        query: Box<SelectStmt>,
        negated: bool,
    },
    /// Scalar subquery.
    Subquery(Box<SelectStmt>),
    Tuple(Vec<SqlExpr>),
    Func {
        name: String,
        args: Vec<SqlExpr>,
    },
    CountStar,
    Cast {
        expr: Box<SqlExpr>,
        ty: String,
    },
    JsonObject(Vec<JsonPair>),
    JsonArrayAgg(Box<SqlExpr>),
    /// Dialect-specific fragment assembled from SQL pieces and parameters.
    Raw(Vec<RawPiece>),
}

impl SqlExpr {
    pub fn col(table: impl Into<String>, column: impl Into<String>) -> Self {
        SqlExpr::Column {
            table: table.into(),
            column: column.into(),
        }
    }

    pub fn param(value: Value) -> Self {
        SqlExpr::Param(value)
    }

    pub fn binary(op: BinOp, lhs: SqlExpr, rhs: SqlExpr) -> Self {
        SqlExpr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn eq(self, rhs: SqlExpr) -> Self {
        SqlExpr::binary(BinOp::Eq, self, rhs)
    }

    pub fn and(self, rhs: SqlExpr) -> Self {
        SqlExpr::binary(BinOp::And, self, rhs)
    }

    pub fn or(self, rhs: SqlExpr) -> Self {
        SqlExpr::binary(BinOp::Or, self, rhs)
    }

    pub fn negate(self) -> Self {
        match self {
            SqlExpr::Bool(b) => SqlExpr::Bool(!b),
            SqlExpr::Not(inner) => *inner,
            other => SqlExpr::Not(Box::new(other)),
        }
    }

    pub fn is_null_check(self, negated: bool) -> Self {
        SqlExpr::IsNull {
            expr: Box::new(self),
            negated,
        }
    }

    pub fn func(name: impl Into<String>, args: Vec<SqlExpr>) -> Self {
        SqlExpr::Func {
            name: name.into(),
            args,
        }
    }

    /// Conjunction of all terms; empty input is `TRUE`.
    pub fn and_all(terms: Vec<SqlExpr>) -> SqlExpr {
        let mut iter = terms.into_iter();
        match iter.next() {
            None => SqlExpr::Bool(true),
            Some(first) => iter.fold(first, |acc, t| acc.and(t)),
        }
    }

    /// Disjunction of all terms; empty input is `FALSE`.
    pub fn or_all(terms: Vec<SqlExpr>) -> SqlExpr {
        let mut iter = terms.into_iter();
        match iter.next() {
            None => SqlExpr::Bool(false),
            Some(first) => iter.fold(first, |acc, t| acc.or(t)),
        }
    }

    pub fn is_trivially_true(&self) -> bool {
        matches!(self, SqlExpr::Bool(true))
    }

    pub fn is_trivially_false(&self) -> bool {
        matches!(self, SqlExpr::Bool(false))
    }
}

// ---------------------------------------------------------------------------
// Table-reference transformation
// ---------------------------------------------------------------------------

/// Rewrites table references throughout a statement tree.
///
/// The callback receives each `TableRef` after its own subtree has been
/// transformed and may replace it; replacement nodes are not revisited, so a
/// callback that wraps tables in filtered derived tables terminates.
pub fn transform_table_refs<F>(stmt: &Statement, f: &mut F) -> Statement
where
    F: FnMut(&TableRef) -> Option<TableRef>,
{
    let kind = match &stmt.kind {
        StatementKind::Select(s) => StatementKind::Select(transform_select(s, f)),
        StatementKind::Insert(i) => {
            let source = match &i.source {
                InsertSource::Select(q) => {
                    InsertSource::Select(Box::new(transform_select(q, f)))
                }
                other => other.clone(),
            };
            StatementKind::Insert(InsertStmt {
                source,
                ..i.clone()
            })
        }
        StatementKind::Update(u) => StatementKind::Update(UpdateStmt {
            where_clause: u.where_clause.as_ref().map(|e| transform_expr(e, f)),
            ..u.clone()
        }),
        StatementKind::Delete(d) => StatementKind::Delete(DeleteStmt {
            where_clause: d.where_clause.as_ref().map(|e| transform_expr(e, f)),
            ..d.clone()
        }),
    };
    Statement {
        kind,
        context: stmt.context.clone(),
    }
}

fn transform_table_ref<F>(table: &TableRef, f: &mut F) -> TableRef
where
    F: FnMut(&TableRef) -> Option<TableRef>,
{
    let walked = match table {
        TableRef::Table { .. } => table.clone(),
        TableRef::Derived { query, alias } => TableRef::Derived {
            query: Box::new(transform_select(query, f)),
            alias: alias.clone(),
        },
    };
    f(&walked).unwrap_or(walked)
}

fn transform_select<F>(stmt: &SelectStmt, f: &mut F) -> SelectStmt
where
    F: FnMut(&TableRef) -> Option<TableRef>,
{
    SelectStmt {
        projection: stmt
            .projection
            .iter()
            .map(|item| SelectItem {
                expr: transform_expr(&item.expr, f),
                alias: item.alias.clone(),
            })
            .collect(),
        from: stmt.from.as_ref().map(|t| transform_table_ref(t, f)),
        joins: stmt
            .joins
            .iter()
            .map(|j| Join {
                kind: j.kind,
                table: transform_table_ref(&j.table, f),
                on: transform_expr(&j.on, f),
            })
            .collect(),
        where_clause: stmt.where_clause.as_ref().map(|e| transform_expr(e, f)),
        group_by: stmt.group_by.iter().map(|e| transform_expr(e, f)).collect(),
        having: stmt.having.as_ref().map(|e| transform_expr(e, f)),
        order_by: stmt
            .order_by
            .iter()
            .map(|o| OrderTerm {
                expr: transform_expr(&o.expr, f),
                desc: o.desc,
            })
            .collect(),
        limit: stmt.limit,
        offset: stmt.offset,
        distinct: stmt.distinct.clone(),
        union_all: stmt
            .union_all
            .iter()
            .map(|s| transform_select(s, f))
            .collect(),
    }
}

fn transform_expr<F>(expr: &SqlExpr, f: &mut F) -> SqlExpr
where
    F: FnMut(&TableRef) -> Option<TableRef>,
{
    match expr {
        SqlExpr::Binary { op, lhs, rhs } => SqlExpr::Binary {
            op: *op,
            lhs: Box::new(transform_expr(lhs, f)),
            rhs: Box::new(transform_expr(rhs, f)),
        },
        SqlExpr::Not(e) => SqlExpr::Not(Box::new(transform_expr(e, f))),
        SqlExpr::Neg(e) => SqlExpr::Neg(Box::new(transform_expr(e, f))),
        SqlExpr::Like {
            expr,
            pattern,
            insensitive,
            negated,
            escape,
        } => SqlExpr::Like {
            expr: Box::new(transform_expr(expr, f)),
            pattern: Box::new(transform_expr(pattern, f)),
            insensitive: *insensitive,
            negated: *negated,
            escape: *escape,
        },
        SqlExpr::InList {
            expr,
            list,
            negated,
        } => SqlExpr::InList {
            expr: Box::new(transform_expr(expr, f)),
            list: list.iter().map(|e| transform_expr(e, f)).collect(),
            negated: *negated,
        },
        SqlExpr::InSubquery {
            expr,
            query,
            negated,
        } => SqlExpr::InSubquery {
            expr: Box::new(transform_expr(expr, f)),
            query: Box::new(transform_select(query, f)),
            negated: *negated,
        },
        SqlExpr::IsNull { expr, negated } => SqlExpr::IsNull {
            expr: Box::new(transform_expr(expr, f)),
            negated: *negated,
        },
        SqlExpr::Exists { query, negated } => SqlExpr::Exists {
            query: Box::new(transform_select(query, f)),
            negated: *negated,
        },
        SqlExpr::Subquery(query) => SqlExpr::Subquery(Box::new(transform_select(query, f))),
        SqlExpr::Tuple(items) => {
            SqlExpr::Tuple(items.iter().map(|e| transform_expr(e, f)).collect())
        }
        SqlExpr::Func { name, args } => SqlExpr::Func {
            name: name.clone(),
            args: args.iter().map(|e| transform_expr(e, f)).collect(),
        },
        SqlExpr::Cast { expr, ty } => SqlExpr::Cast {
            expr: Box::new(transform_expr(expr, f)),
            ty: ty.clone(),
        },
        SqlExpr::JsonObject(pairs) => SqlExpr::JsonObject(
            pairs
                .iter()
                .map(|p| JsonPair {
                    key: p.key.clone(),
                    expr: transform_expr(&p.expr, f),
                    is_json: p.is_json,
                })
                .collect(),
        ),
        SqlExpr::JsonArrayAgg(e) => SqlExpr::JsonArrayAgg(Box::new(transform_expr(e, f))),
        SqlExpr::Raw(pieces) => SqlExpr::Raw(
            pieces
                .iter()
                .map(|p| match p {
                    RawPiece::Expr(e) => RawPiece::Expr(Box::new(transform_expr(e, f))),
                    other => other.clone(),
                })
                .collect(),
        ),
        SqlExpr::Column { .. }
        | SqlExpr::Param(_)
        | SqlExpr::Bool(_)
        | SqlExpr::CountStar => expr.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn and_all_of_empty_is_true() {
        assert!(SqlExpr::and_all(vec![]).is_trivially_true());
        assert!(SqlExpr::or_all(vec![]).is_trivially_false());
    }

    #[test]
    fn transform_wraps_nested_from_once() {
        let inner = SelectStmt::from_table("Post", "Post");
        let mut outer = SelectStmt::from_table("User", "User");
        outer.projection.push(SelectItem::new(SqlExpr::Subquery(Box::new(inner))));
        let stmt = Statement::select(outer, StatementContext::new("User", StatementOp::Read));

        let mut wrapped = 0;
        let out = transform_table_refs(&stmt, &mut |t| match t {
            TableRef::Table { name, alias } => {
                wrapped += 1;
                let mut filtered = SelectStmt::from_table(name.clone(), alias.clone());
                filtered.and_where(SqlExpr::Bool(false));
                Some(TableRef::derived(filtered, alias.clone()))
            }
            TableRef::Derived { .. } => None,
        });

        assert_eq!(wrapped, 2);
        match out.kind {
            StatementKind::Select(s) => {
                assert!(matches!(s.from, Some(TableRef::Derived { .. })));
            }
            _ => panic!("expected select"),
        }
    }
}
