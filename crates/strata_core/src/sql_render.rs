use crate::schema::SqlProvider;
use crate::sql_ast::*;
use crate::sql_dialect::{PlaceholderStyle, SqlDialect};
use crate::{Error, Result, Value};

/// A rendered root statement: final SQL plus bound parameters in placeholder
/// order.
#[derive(Debug, Clone)]
pub struct RenderedStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Render a root statement, appending the trailing `$$context` comment that
/// observers use to classify queries.
pub fn render_statement(
    stmt: &Statement,
    dialect: &dyn SqlDialect,
) -> Result<RenderedStatement> {
    let mut renderer = Renderer {
        dialect,
        params: Vec::new(),
    };

    let body = match &stmt.kind {
        StatementKind::Select(s) => renderer.select(s)?,
        StatementKind::Insert(i) => renderer.insert(i)?,
        StatementKind::Update(u) => renderer.update(u)?,
        StatementKind::Delete(d) => renderer.delete(d)?,
    };

    let context = serde_json::json!({
        "model": stmt.context.model,
        "operation": stmt.context.operation.as_str(),
    });
    let sql = format!("{}\n-- $$context:{}", body, context);

    Ok(RenderedStatement {
        sql,
        params: renderer.params,
    })
}

struct Renderer<'a> {
    dialect: &'a dyn SqlDialect,
    params: Vec<Value>,
}

impl<'a> Renderer<'a> {
    fn quote(&self, name: &str) -> String {
        self.dialect.quote_identifier(name)
    }

    fn placeholder(&mut self, value: Value) -> String {
        self.params.push(value);
        match self.dialect.placeholder_style() {
            PlaceholderStyle::QuestionMark => "?".to_string(),
            PlaceholderStyle::DollarNumber => format!("${}", self.params.len()),
        }
    }

    fn select(&mut self, stmt: &SelectStmt) -> Result<String> {
        let mut sql = String::from("SELECT ");

        match &stmt.distinct {
            Distinct::None => {}
            Distinct::All => sql.push_str("DISTINCT "),
            Distinct::On(exprs) => {
                let rendered = self.expr_list(exprs)?;
                sql.push_str(&format!("DISTINCT ON ({}) ", rendered));
            }
        }

        if stmt.projection.is_empty() {
            sql.push('*');
        } else {
            let items: Vec<String> = stmt
                .projection
                .iter()
                .map(|item| {
                    let rendered = self.expr(&item.expr)?;
                    Ok(match &item.alias {
                        Some(alias) => format!("{} AS {}", rendered, self.quote(alias)),
                        None => rendered,
                    })
                })
                .collect::<Result<_>>()?;
            sql.push_str(&items.join(", "));
        }

        if let Some(from) = &stmt.from {
            sql.push_str(" FROM ");
            sql.push_str(&self.table_ref(from)?);
        }

        for join in &stmt.joins {
            let keyword = match join.kind {
                JoinKind::Inner => "JOIN",
                JoinKind::Left => "LEFT JOIN",
            };
            let table = self.table_ref(&join.table)?;
            let on = self.expr(&join.on)?;
            sql.push_str(&format!(" {} {} ON {}", keyword, table, on));
        }

        if let Some(where_clause) = &stmt.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(&self.expr(where_clause)?);
        }

        if !stmt.group_by.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&self.expr_list(&stmt.group_by)?);
        }

        if let Some(having) = &stmt.having {
            sql.push_str(" HAVING ");
            sql.push_str(&self.expr(having)?);
        }

        for part in &stmt.union_all {
            sql.push_str(" UNION ALL ");
            sql.push_str(&self.select(part)?);
        }

        if !stmt.order_by.is_empty() {
            let terms: Vec<String> = stmt
                .order_by
                .iter()
                .map(|term| {
                    let rendered = self.expr(&term.expr)?;
                    Ok(format!(
                        "{} {}",
                        rendered,
                        if term.desc { "DESC" } else { "ASC" }
                    ))
                })
                .collect::<Result<_>>()?;
            sql.push_str(" ORDER BY ");
            sql.push_str(&terms.join(", "));
        }

        match (stmt.limit, stmt.offset) {
            (Some(limit), Some(offset)) => {
                sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset));
            }
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {}", limit)),
            (None, Some(offset)) => {
                // SQLite requires LIMIT when OFFSET is present.
                if self.dialect.provider() == SqlProvider::Sqlite {
                    sql.push_str(&format!(" LIMIT -1 OFFSET {}", offset));
                } else {
                    sql.push_str(&format!(" OFFSET {}", offset));
                }
            }
            (None, None) => {}
        }

        Ok(sql)
    }

    fn insert(&mut self, stmt: &InsertStmt) -> Result<String> {
        let mut sql = format!("INSERT INTO {}", self.quote(&stmt.table));

        if stmt.columns.is_empty() {
            sql.push_str(" DEFAULT VALUES");
        } else {
            let columns: Vec<String> = stmt.columns.iter().map(|c| self.quote(c)).collect();
            sql.push_str(&format!(" ({})", columns.join(", ")));

            match &stmt.source {
                InsertSource::Values(rows) => {
                    let rendered: Vec<String> = rows
                        .iter()
                        .map(|row| Ok(format!("({})", self.expr_list(row)?)))
                        .collect::<Result<_>>()?;
                    sql.push_str(&format!(" VALUES {}", rendered.join(", ")));
                }
                InsertSource::Select(query) => {
                    sql.push(' ');
                    sql.push_str(&self.select(query)?);
                }
                InsertSource::DefaultValues => {
                    return Err(Error::internal(
                        "DEFAULT VALUES insert cannot list columns",
                    ));
                }
            }
        }

        if let Some(conflict) = &stmt.on_conflict {
            match conflict {
                OnConflict::DoNothing { targets } => {
                    if targets.is_empty() {
                        sql.push_str(" ON CONFLICT DO NOTHING");
                    } else {
                        let cols: Vec<String> = targets.iter().map(|c| self.quote(c)).collect();
                        sql.push_str(&format!(
                            " ON CONFLICT ({}) DO NOTHING",
                            cols.join(", ")
                        ));
                    }
                }
                OnConflict::DoUpdate {
                    targets,
                    set,
                    where_clause,
                } => {
                    let cols: Vec<String> = targets.iter().map(|c| self.quote(c)).collect();
                    let assignments: Vec<String> = set
                        .iter()
                        .map(|(col, expr)| {
                            Ok(format!("{} = {}", self.quote(col), self.expr(expr)?))
                        })
                        .collect::<Result<_>>()?;
                    sql.push_str(&format!(
                        " ON CONFLICT ({}) DO UPDATE SET {}",
                        cols.join(", "),
                        assignments.join(", ")
                    ));
                    if let Some(where_clause) = where_clause {
                        sql.push_str(" WHERE ");
                        sql.push_str(&self.expr(where_clause)?);
                    }
                }
            }
        }

        self.render_returning(&mut sql, &stmt.returning)?;
        Ok(sql)
    }

    fn update(&mut self, stmt: &UpdateStmt) -> Result<String> {
        if stmt.set.is_empty() {
            return Err(Error::internal("UPDATE with empty SET clause"));
        }

        let assignments: Vec<String> = stmt
            .set
            .iter()
            .map(|(col, expr)| Ok(format!("{} = {}", self.quote(col), self.expr(expr)?)))
            .collect::<Result<_>>()?;

        let mut sql = format!(
            "UPDATE {} SET {}",
            self.quote(&stmt.table),
            assignments.join(", ")
        );

        if let Some(where_clause) = &stmt.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(&self.expr(where_clause)?);
        }

        self.render_returning(&mut sql, &stmt.returning)?;
        Ok(sql)
    }

    fn delete(&mut self, stmt: &DeleteStmt) -> Result<String> {
        let mut sql = format!("DELETE FROM {}", self.quote(&stmt.table));

        if let Some(where_clause) = &stmt.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(&self.expr(where_clause)?);
        }

        self.render_returning(&mut sql, &stmt.returning)?;
        Ok(sql)
    }

    fn render_returning(&mut self, sql: &mut String, returning: &[SelectItem]) -> Result<()> {
        if returning.is_empty() {
            return Ok(());
        }
        let items: Vec<String> = returning
            .iter()
            .map(|item| {
                let rendered = self.expr(&item.expr)?;
                Ok(match &item.alias {
                    Some(alias) => format!("{} AS {}", rendered, self.quote(alias)),
                    None => rendered,
                })
            })
            .collect::<Result<_>>()?;
        sql.push_str(&format!(" RETURNING {}", items.join(", ")));
        Ok(())
    }

    fn table_ref(&mut self, table: &TableRef) -> Result<String> {
        match table {
            TableRef::Table { name, alias } => {
                if name == alias {
                    Ok(self.quote(name))
                } else {
                    Ok(format!("{} AS {}", self.quote(name), self.quote(alias)))
                }
            }
            TableRef::Derived { query, alias } => {
                let inner = self.select(query)?;
                Ok(format!("({}) AS {}", inner, self.quote(alias)))
            }
        }
    }

    fn expr_list(&mut self, exprs: &[SqlExpr]) -> Result<String> {
        let rendered: Vec<String> = exprs.iter().map(|e| self.expr(e)).collect::<Result<_>>()?;
        Ok(rendered.join(", "))
    }

    fn expr(&mut self, expr: &SqlExpr) -> Result<String> {
        match expr {
            SqlExpr::Column { table, column } => {
                if table.is_empty() {
                    Ok(self.quote(column))
                } else {
                    Ok(format!("{}.{}", self.quote(table), self.quote(column)))
                }
            }
            SqlExpr::Param(value) => Ok(self.placeholder(value.clone())),
            SqlExpr::Bool(b) => Ok(if *b { "TRUE" } else { "FALSE" }.to_string()),
            SqlExpr::Binary { op, lhs, rhs } => {
                let l = self.expr(lhs)?;
                let r = self.expr(rhs)?;
                Ok(format!("({} {} {})", l, op.sql(), r))
            }
            SqlExpr::Not(inner) => Ok(format!("NOT ({})", self.expr(inner)?)),
            SqlExpr::Neg(inner) => Ok(format!("-({})", self.expr(inner)?)),
            SqlExpr::Like {
                expr,
                pattern,
                insensitive,
                negated,
                escape,
            } => {
                let casing = self.dialect.string_casing();
                let not = if *negated { "NOT " } else { "" };
                let lhs = self.expr(expr)?;
                let rhs = self.expr(pattern)?;
                let escape_clause = match escape {
                    Some(c) => format!(" ESCAPE '{}'", c),
                    None => String::new(),
                };
                if *insensitive {
                    if casing.supports_ilike {
                        Ok(format!("({} {}ILIKE {}{})", lhs, not, rhs, escape_clause))
                    } else if !casing.like_case_sensitive {
                        // LIKE already folds case on this backend.
                        Ok(format!("({} {}LIKE {}{})", lhs, not, rhs, escape_clause))
                    } else {
                        Ok(format!(
                            "(LOWER({}) {}LIKE LOWER({}){})",
                            lhs, not, rhs, escape_clause
                        ))
                    }
                } else {
                    Ok(format!("({} {}LIKE {}{})", lhs, not, rhs, escape_clause))
                }
            }
            SqlExpr::InList {
                expr,
                list,
                negated,
            } => {
                if list.is_empty() {
                    return Ok(if *negated { "TRUE" } else { "FALSE" }.to_string());
                }
                let lhs = self.expr(expr)?;
                let items = self.expr_list(list)?;
                let not = if *negated { "NOT " } else { "" };
                Ok(format!("({} {}IN ({}))", lhs, not, items))
            }
            SqlExpr::InSubquery {
                expr,
                query,
                negated,
            } => {
                let lhs = self.expr(expr)?;
                let inner = self.select(query)?;
                let not = if *negated { "NOT " } else { "" };
                Ok(format!("({} {}IN ({}))", lhs, not, inner))
            }
            SqlExpr::IsNull { expr, negated } => {
                let inner = self.expr(expr)?;
                Ok(format!(
                    "({} IS {}NULL)",
                    inner,
                    if *negated { "NOT " } else { "" }
                ))
            }
            SqlExpr::Exists { query, negated } => {
                let inner = self.select(query)?;
                let not = if *negated { "NOT " } else { "" };
                Ok(format!("{}EXISTS ({})", not, inner))
            }
            SqlExpr::Subquery(query) => Ok(format!("({})", self.select(query)?)),
            SqlExpr::Tuple(items) => Ok(format!("({})", self.expr_list(items)?)),
            SqlExpr::Func { name, args } => {
                Ok(format!("{}({})", name, self.expr_list(args)?))
            }
            SqlExpr::CountStar => Ok("count(*)".to_string()),
            SqlExpr::Cast { expr, ty } => {
                let inner = self.expr(expr)?;
                Ok(format!("CAST({} AS {})", inner, ty))
            }
            SqlExpr::JsonObject(pairs) => {
                let rendered: Vec<(String, String, bool)> = pairs
                    .iter()
                    .map(|p| Ok((p.key.clone(), self.expr(&p.expr)?, p.is_json)))
                    .collect::<Result<_>>()?;
                Ok(self.dialect.render_json_object(&rendered))
            }
            SqlExpr::JsonArrayAgg(inner) => {
                let is_json = matches!(
                    inner.as_ref(),
                    SqlExpr::JsonObject(_) | SqlExpr::Subquery(_)
                );
                let element = self.expr(inner)?;
                Ok(self.dialect.render_json_array_agg(&element, is_json))
            }
            SqlExpr::Raw(pieces) => {
                let mut out = String::new();
                for piece in pieces {
                    match piece {
                        RawPiece::Sql(sql) => out.push_str(sql),
                        RawPiece::Param(value) => {
                            let placeholder = self.placeholder(value.clone());
                            out.push_str(&placeholder);
                        }
                        RawPiece::Expr(e) => out.push_str(&self.expr(e)?),
                    }
                }
                Ok(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::BuiltinType;
    use crate::sql_dialect::{
        DialectCapabilities, PlaceholderStyle, SqlDialect, StringCasingBehavior,
    };

    struct AnsiDialect;

    impl SqlDialect for AnsiDialect {
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

        fn transform_primitive(
            &self,
            value: Value,
            _builtin: BuiltinType,
            _array: bool,
        ) -> Value {
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

        fn array_has(&self, _c: SqlExpr, _i: Value, _b: BuiltinType) -> SqlExpr {
            SqlExpr::Bool(true)
        }

        fn array_has_every(&self, _c: SqlExpr, _i: Vec<Value>, _b: BuiltinType) -> SqlExpr {
            SqlExpr::Bool(true)
        }

        fn array_has_some(&self, _c: SqlExpr, _i: Vec<Value>, _b: BuiltinType) -> SqlExpr {
            SqlExpr::Bool(true)
        }

        fn array_is_empty(&self, _c: SqlExpr) -> SqlExpr {
            SqlExpr::Bool(false)
        }

        fn array_append(&self, c: SqlExpr, _i: Vec<Value>, _b: BuiltinType) -> SqlExpr {
            c
        }
    }

    #[test]
    fn renders_select_with_context_comment() {
        let mut stmt = SelectStmt::from_table("User", "User");
        stmt.projection
            .push(SelectItem::new(SqlExpr::col("User", "id")));
        stmt.and_where(SqlExpr::col("User", "email").eq(SqlExpr::param(Value::Text(
            "a@b.c".into(),
        ))));
        stmt.limit = Some(10);

        let rendered = render_statement(
            &Statement::select(stmt, StatementContext::new("User", StatementOp::Read)),
            &AnsiDialect,
        )
        .unwrap();

        assert_eq!(
            rendered.sql,
            "SELECT \"User\".\"id\" FROM \"User\" WHERE (\"User\".\"email\" = $1) LIMIT 10\n-- $$context:{\"model\":\"User\",\"operation\":\"read\"}"
        );
        assert_eq!(rendered.params, vec![Value::Text("a@b.c".into())]);
    }

    #[test]
    fn empty_in_list_is_constant() {
        let mut stmt = SelectStmt::from_table("User", "User");
        stmt.and_where(SqlExpr::InList {
            expr: Box::new(SqlExpr::col("User", "id")),
            list: vec![],
            negated: false,
        });
        let rendered = render_statement(
            &Statement::select(stmt, StatementContext::new("User", StatementOp::Read)),
            &AnsiDialect,
        )
        .unwrap();
        assert!(rendered.sql.contains("WHERE FALSE"));
    }

    #[test]
    fn insert_renders_on_conflict_do_nothing() {
        let stmt = InsertStmt {
            table: "Post_Tag".into(),
            columns: vec!["A".into(), "B".into()],
            source: InsertSource::Values(vec![vec![
                SqlExpr::param(Value::Int(1)),
                SqlExpr::param(Value::Int(2)),
            ]]),
            on_conflict: Some(OnConflict::DoNothing { targets: vec![] }),
            returning: vec![],
        };
        let rendered = render_statement(
            &Statement::insert(stmt, StatementContext::new("Post", StatementOp::Update)),
            &AnsiDialect,
        )
        .unwrap();
        assert!(rendered
            .sql
            .starts_with("INSERT INTO \"Post_Tag\" (\"A\", \"B\") VALUES ($1, $2) ON CONFLICT DO NOTHING"));
    }
}
