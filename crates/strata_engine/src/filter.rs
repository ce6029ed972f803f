use crate::convert::coerce_scalar;
use serde_json::Value as Json;
use strata_core::{
    BuiltinType, Error, FieldDef, FieldType, JoinKind, ModelDef, RawPiece, Result, Schema,
    SelectStmt, SqlDialect, SqlExpr, UniqueKey, Value,
};

/// Compiles a validated `where` tree into a SQL predicate against `alias`.
pub struct FilterBuilder<'a> {
    pub schema: &'a Schema,
    pub dialect: &'a dyn SqlDialect,
}

impl<'a> FilterBuilder<'a> {
    pub fn new(schema: &'a Schema, dialect: &'a dyn SqlDialect) -> Self {
        Self { schema, dialect }
    }

    /// Column reference for `field`, routing delegate-inherited fields
    /// through their declaring base table.
    pub fn column_expr(&self, model: &ModelDef, alias: &str, field: &FieldDef) -> SqlExpr {
        match &field.origin_model {
            None => SqlExpr::col(alias, &field.name),
            Some(base_name) => {
                // Correlated lookup on the base table by shared id.
                let base_alias = format!("{}$base", alias);
                let mut sub = SelectStmt::from_table(base_name.clone(), base_alias.clone());
                sub.projection.push(strata_core::SelectItem::new(
                    SqlExpr::col(base_alias.clone(), &field.name),
                ));
                let join = join_on_ids(model, alias, &base_alias);
                sub.and_where(join);
                SqlExpr::Subquery(Box::new(sub))
            }
        }
    }

    /// Bound parameter for a JSON scalar typed by `field`.
    pub fn param(&self, field: &FieldDef, json: &Json) -> Result<SqlExpr> {
        let value = coerce_scalar(self.schema, field, json)?;
        Ok(SqlExpr::Param(self.bind(field, value)))
    }

    fn bind(&self, field: &FieldDef, value: Value) -> Value {
        let builtin = scalar_builtin(field);
        self.dialect.transform_primitive(value, builtin, field.array)
    }

    fn bind_element(&self, field: &FieldDef, value: Value) -> Value {
        let builtin = scalar_builtin(field);
        self.dialect.transform_primitive(value, builtin, false)
    }

    /// Compile a whole `where` object.
    pub fn build(&self, model: &ModelDef, alias: &str, where_args: &Json) -> Result<SqlExpr> {
        let Some(map) = where_args.as_object() else {
            return Ok(SqlExpr::Bool(true));
        };

        let mut terms = Vec::new();
        for (key, value) in map {
            terms.push(self.build_entry(model, alias, key, value)?);
        }
        Ok(SqlExpr::and_all(terms))
    }

    fn build_entry(
        &self,
        model: &ModelDef,
        alias: &str,
        key: &str,
        value: &Json,
    ) -> Result<SqlExpr> {
        match key {
            "AND" => {
                let parts = self.build_group(model, alias, value)?;
                Ok(SqlExpr::and_all(parts))
            }
            "OR" => {
                let parts = self.build_group(model, alias, value)?;
                Ok(SqlExpr::or_all(parts))
            }
            "NOT" => {
                let parts = self.build_group(model, alias, value)?;
                Ok(SqlExpr::and_all(parts).negate())
            }
            "$expr" => self.build_raw(value),
            _ => {
                // Compound unique selectors expand to their component fields.
                if let Some(UniqueKey::Compound(components)) = model.unique_fields.get(key) {
                    if let Some(group) = value.as_object() {
                        let mut terms = Vec::new();
                        for component in components {
                            let field = model.field(component).ok_or_else(|| {
                                Error::internal(format!("missing field '{}'", component))
                            })?;
                            let json = group.get(component).ok_or_else(|| {
                                Error::internal(format!(
                                    "compound key missing component '{}'",
                                    component
                                ))
                            })?;
                            let column = self.column_expr(model, alias, field);
                            terms.push(column.eq(self.param(field, json)?));
                        }
                        return Ok(SqlExpr::and_all(terms));
                    }
                }

                let field = model
                    .field(key)
                    .ok_or_else(|| Error::internal(format!("unknown filter field '{}'", key)))?;
                if field.is_relation() {
                    self.build_relation_filter(model, alias, field, value)
                } else {
                    self.build_scalar_filter(model, alias, field, value)
                }
            }
        }
    }

    fn build_group(&self, model: &ModelDef, alias: &str, value: &Json) -> Result<Vec<SqlExpr>> {
        match value {
            Json::Array(items) => items
                .iter()
                .map(|item| self.build(model, alias, item))
                .collect(),
            other => Ok(vec![self.build(model, alias, other)?]),
        }
    }

    fn build_raw(&self, value: &Json) -> Result<SqlExpr> {
        let map = value
            .as_object()
            .ok_or_else(|| Error::internal("$expr payload must be an object"))?;
        let sql = map
            .get("sql")
            .and_then(Json::as_str)
            .ok_or_else(|| Error::internal("$expr.sql must be a string"))?;

        let mut pieces = Vec::new();
        let params: Vec<Value> = map
            .get("params")
            .and_then(Json::as_array)
            .map(|items| items.iter().map(Value::from_json_untyped).collect())
            .unwrap_or_default();

        // Split on `?` markers, interleaving parameters.
        let mut segments = sql.split('?');
        if let Some(first) = segments.next() {
            pieces.push(RawPiece::Sql(format!("({}", first)));
        }
        for (param, segment) in params.into_iter().zip(segments) {
            pieces.push(RawPiece::Param(param));
            pieces.push(RawPiece::Sql(segment.to_string()));
        }
        pieces.push(RawPiece::Sql(")".to_string()));
        Ok(SqlExpr::Raw(pieces))
    }

    // -- scalar filters ------------------------------------------------------

    fn build_scalar_filter(
        &self,
        model: &ModelDef,
        alias: &str,
        field: &FieldDef,
        value: &Json,
    ) -> Result<SqlExpr> {
        let column = self.column_expr(model, alias, field);

        if field.array {
            return self.build_list_filter(field, column, value);
        }

        match value {
            Json::Object(map) => {
                let insensitive = map
                    .get("mode")
                    .and_then(Json::as_str)
                    .is_some_and(|m| m == "insensitive");
                let mut terms = Vec::new();
                for (op, operand) in map {
                    if op == "mode" {
                        continue;
                    }
                    terms.push(self.build_scalar_op(
                        model,
                        alias,
                        field,
                        column.clone(),
                        op,
                        operand,
                        insensitive,
                    )?);
                }
                Ok(SqlExpr::and_all(terms))
            }
            Json::Null => Ok(column.is_null_check(false)),
            other => Ok(column.eq(self.param(field, other)?)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_scalar_op(
        &self,
        model: &ModelDef,
        alias: &str,
        field: &FieldDef,
        column: SqlExpr,
        op: &str,
        operand: &Json,
        insensitive: bool,
    ) -> Result<SqlExpr> {
        use strata_core::BinOp;

        match op {
            "equals" => {
                if operand.is_null() {
                    Ok(column.is_null_check(false))
                } else if insensitive {
                    Ok(SqlExpr::func("LOWER", vec![column])
                        .eq(SqlExpr::func("LOWER", vec![self.param(field, operand)?])))
                } else {
                    Ok(column.eq(self.param(field, operand)?))
                }
            }
            "in" | "notIn" => {
                let items = operand
                    .as_array()
                    .ok_or_else(|| Error::internal("in/notIn expects an array"))?;
                let list: Vec<SqlExpr> = items
                    .iter()
                    .map(|item| self.param(field, item))
                    .collect::<Result<_>>()?;
                Ok(SqlExpr::InList {
                    expr: Box::new(column),
                    list,
                    negated: op == "notIn",
                })
            }
            "lt" | "lte" | "gt" | "gte" => {
                let bin = match op {
                    "lt" => BinOp::Lt,
                    "lte" => BinOp::Le,
                    "gt" => BinOp::Gt,
                    _ => BinOp::Ge,
                };
                Ok(SqlExpr::binary(bin, column, self.param(field, operand)?))
            }
            "not" => {
                let inner = self.build_scalar_filter(model, alias, field, operand)?;
                Ok(inner.negate())
            }
            "startsWith" | "endsWith" | "contains" => {
                let needle = operand
                    .as_str()
                    .ok_or_else(|| Error::internal("string operator expects a string"))?;
                let escaped = escape_like(needle);
                let pattern = match op {
                    "startsWith" => format!("{}%", escaped),
                    "endsWith" => format!("%{}", escaped),
                    _ => format!("%{}%", escaped),
                };
                Ok(SqlExpr::Like {
                    expr: Box::new(column),
                    pattern: Box::new(SqlExpr::Param(Value::Text(pattern))),
                    insensitive,
                    negated: false,
                    escape: Some('\\'),
                })
            }
            other => Err(Error::internal(format!("unknown filter operator '{}'", other))),
        }
    }

    fn build_list_filter(
        &self,
        field: &FieldDef,
        column: SqlExpr,
        value: &Json,
    ) -> Result<SqlExpr> {
        let builtin = scalar_builtin(field);

        let coerce_items = |items: &Vec<Json>| -> Result<Vec<Value>> {
            items
                .iter()
                .map(|item| {
                    let v = crate::convert::coerce_builtin(builtin, &field.name, item)?;
                    Ok(self.bind_element(field, v))
                })
                .collect()
        };

        match value {
            Json::Array(items) => {
                let bound = Value::List(coerce_items(items)?);
                let literal = self
                    .dialect
                    .transform_primitive(bound, builtin, true);
                Ok(column.eq(SqlExpr::Param(literal)))
            }
            Json::Object(map) => {
                let mut terms = Vec::new();
                for (op, operand) in map {
                    let term = match op.as_str() {
                        "equals" => {
                            let items = operand
                                .as_array()
                                .ok_or_else(|| Error::internal("equals expects an array"))?;
                            let bound = Value::List(coerce_items(items)?);
                            let literal =
                                self.dialect.transform_primitive(bound, builtin, true);
                            column.clone().eq(SqlExpr::Param(literal))
                        }
                        "has" => {
                            let item = crate::convert::coerce_builtin(
                                builtin,
                                &field.name,
                                operand,
                            )?;
                            self.dialect.array_has(
                                column.clone(),
                                self.bind_element(field, item),
                                builtin,
                            )
                        }
                        "hasEvery" => {
                            let items = operand
                                .as_array()
                                .ok_or_else(|| Error::internal("hasEvery expects an array"))?;
                            self.dialect
                                .array_has_every(column.clone(), coerce_items(items)?, builtin)
                        }
                        "hasSome" => {
                            let items = operand
                                .as_array()
                                .ok_or_else(|| Error::internal("hasSome expects an array"))?;
                            self.dialect
                                .array_has_some(column.clone(), coerce_items(items)?, builtin)
                        }
                        "isEmpty" => {
                            let empty = self.dialect.array_is_empty(column.clone());
                            if operand.as_bool() == Some(false) {
                                empty.negate()
                            } else {
                                empty
                            }
                        }
                        other => {
                            return Err(Error::internal(format!(
                                "unknown list operator '{}'",
                                other
                            )))
                        }
                    };
                    terms.push(term);
                }
                Ok(SqlExpr::and_all(terms))
            }
            _ => Err(Error::internal("list filter must be an array or object")),
        }
    }

    // -- relation filters ----------------------------------------------------

    fn build_relation_filter(
        &self,
        model: &ModelDef,
        alias: &str,
        field: &FieldDef,
        value: &Json,
    ) -> Result<SqlExpr> {
        if field.is_to_many() {
            let map = value
                .as_object()
                .ok_or_else(|| Error::internal("to-many filter must be an object"))?;
            let mut terms = Vec::new();
            for (op, operand) in map {
                let term = match op.as_str() {
                    "some" => self.related_exists(model, alias, field, Some(operand), false)?,
                    "none" => self.related_exists(model, alias, field, Some(operand), true)?,
                    "every" => {
                        // No related row may violate the predicate.
                        let negated = serde_json::json!({ "NOT": operand });
                        self.related_exists(model, alias, field, Some(&negated), true)?
                    }
                    other => {
                        return Err(Error::internal(format!(
                            "unknown relation operator '{}'",
                            other
                        )))
                    }
                };
                terms.push(term);
            }
            return Ok(SqlExpr::and_all(terms));
        }

        // To-one relations.
        match value {
            Json::Null => self.to_one_null_check(model, alias, field, false),
            Json::Object(map) if map.contains_key("is") || map.contains_key("isNot") => {
                let mut terms = Vec::new();
                if let Some(operand) = map.get("is") {
                    terms.push(if operand.is_null() {
                        self.to_one_null_check(model, alias, field, false)?
                    } else {
                        self.related_exists(model, alias, field, Some(operand), false)?
                    });
                }
                if let Some(operand) = map.get("isNot") {
                    terms.push(if operand.is_null() {
                        self.to_one_null_check(model, alias, field, true)?
                    } else {
                        self.related_exists(model, alias, field, Some(operand), true)?
                    });
                }
                Ok(SqlExpr::and_all(terms))
            }
            other => self.related_exists(model, alias, field, Some(other), false),
        }
    }

    fn to_one_null_check(
        &self,
        model: &ModelDef,
        alias: &str,
        field: &FieldDef,
        negated: bool,
    ) -> Result<SqlExpr> {
        let relation = field
            .relation
            .as_ref()
            .ok_or_else(|| Error::internal("relation field without relation def"))?;

        if relation.is_owner() {
            let mut terms = Vec::new();
            for fk in &relation.fields {
                let fk_field = model
                    .field(fk)
                    .ok_or_else(|| Error::internal(format!("missing FK field '{}'", fk)))?;
                terms.push(
                    self.column_expr(model, alias, fk_field)
                        .is_null_check(negated),
                );
            }
            Ok(SqlExpr::and_all(terms))
        } else {
            self.related_exists(model, alias, field, None, !negated)
        }
    }

    /// Correlated EXISTS over the related rows, optionally filtered.
    pub fn related_exists(
        &self,
        model: &ModelDef,
        alias: &str,
        field: &FieldDef,
        where_args: Option<&Json>,
        negated: bool,
    ) -> Result<SqlExpr> {
        let (target, _) = self.schema.opposite_relation(model, field)?;
        let target_alias = format!("{}${}", alias, field.name);

        let mut sub = self.related_subquery(model, alias, field, &target_alias)?;
        if let Some(where_args) = where_args {
            let predicate = self.build(target, &target_alias, where_args)?;
            sub.and_where(predicate);
        }
        sub.projection.push(strata_core::SelectItem::new(SqlExpr::Raw(vec![
            RawPiece::Sql("1".to_string()),
        ])));

        Ok(SqlExpr::Exists {
            query: Box::new(sub),
            negated,
        })
    }

    /// FROM clause + correlation predicate for rows related via `field`.
    pub fn related_subquery(
        &self,
        model: &ModelDef,
        alias: &str,
        field: &FieldDef,
        target_alias: &str,
    ) -> Result<SelectStmt> {
        let (target, opposite) = self.schema.opposite_relation(model, field)?;
        let mut sub = SelectStmt::from_table(target.table_name(), target_alias.to_string());

        if self.schema.is_many_to_many(model, field)? {
            let join = self.schema.join_table(model, field)?;
            let this_col = self.schema.join_column_for_side(model, field)?;
            let other_col = if this_col == "A" { "B" } else { "A" };
            let join_alias = format!("{}$jt", target_alias);

            let target_id = single_id(target)?;
            let model_id = single_id(model)?;

            sub.joins.push(strata_core::Join {
                kind: JoinKind::Inner,
                table: strata_core::TableRef::table(join.table.clone(), join_alias.clone()),
                on: SqlExpr::col(join_alias.clone(), other_col)
                    .eq(SqlExpr::col(target_alias, &target_id.name)),
            });
            sub.and_where(
                SqlExpr::col(join_alias, this_col).eq(SqlExpr::col(alias, &model_id.name)),
            );
            return Ok(sub);
        }

        let relation = field
            .relation
            .as_ref()
            .ok_or_else(|| Error::internal("relation field without relation def"))?;

        let correlation = if relation.is_owner() {
            // This model carries the FK columns.
            let pairs = relation.fields.iter().zip(relation.references.iter());
            SqlExpr::and_all(
                pairs
                    .map(|(fk, reference)| {
                        SqlExpr::col(alias, fk).eq(SqlExpr::col(target_alias, reference))
                    })
                    .collect(),
            )
        } else {
            let opposite_rel = opposite
                .relation
                .as_ref()
                .ok_or_else(|| Error::internal("opposite relation without def"))?;
            let pairs = opposite_rel.fields.iter().zip(opposite_rel.references.iter());
            SqlExpr::and_all(
                pairs
                    .map(|(fk, reference)| {
                        SqlExpr::col(target_alias, fk).eq(SqlExpr::col(alias, reference))
                    })
                    .collect(),
            )
        };
        sub.and_where(correlation);
        Ok(sub)
    }
}

pub(crate) fn scalar_builtin(field: &FieldDef) -> BuiltinType {
    match &field.field_type {
        FieldType::Builtin(b) => *b,
        FieldType::Enum(_) => BuiltinType::String,
        FieldType::TypeDef(_) => BuiltinType::Json,
        FieldType::Model(_) => BuiltinType::Unsupported,
    }
}

fn single_id<'a>(model: &'a ModelDef) -> Result<&'a FieldDef> {
    if model.id_fields.len() != 1 {
        return Err(Error::Unsupported(format!(
            "operation requires a single-column id on '{}'",
            model.name
        )));
    }
    model
        .field(&model.id_fields[0])
        .ok_or_else(|| Error::internal(format!("missing id field on '{}'", model.name)))
}

/// Equality on all id columns between two aliases of delegate-related tables.
fn join_on_ids(model: &ModelDef, alias: &str, other_alias: &str) -> SqlExpr {
    SqlExpr::and_all(
        model
            .id_fields
            .iter()
            .map(|id| SqlExpr::col(alias, id).eq(SqlExpr::col(other_alias, id)))
            .collect(),
    )
}

fn escape_like(needle: &str) -> String {
    needle
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strata_core::{
        render_statement, FieldBuilder, ModelBuilder, SchemaBuilder, SqlProvider, Statement,
        StatementContext, StatementOp,
    };

    struct TestDialect;

    impl SqlDialect for TestDialect {
        fn provider(&self) -> SqlProvider {
            SqlProvider::Postgres
        }
        fn quote_identifier(&self, name: &str) -> String {
            format!("\"{}\"", name)
        }
        fn placeholder_style(&self) -> strata_core::PlaceholderStyle {
            strata_core::PlaceholderStyle::QuestionMark
        }
        fn capabilities(&self) -> strata_core::DialectCapabilities {
            strata_core::DialectCapabilities::RETURNING
        }
        fn string_casing(&self) -> strata_core::StringCasingBehavior {
            strata_core::StringCasingBehavior {
                supports_ilike: true,
                like_case_sensitive: true,
            }
        }
        fn field_sql_type(&self, _b: BuiltinType, _a: bool) -> String {
            "TEXT".into()
        }
        fn transform_primitive(&self, value: Value, _b: BuiltinType, _a: bool) -> Value {
            value
        }
        fn render_json_object(&self, _p: &[(String, String, bool)]) -> String {
            "json_object()".into()
        }
        fn render_json_array_agg(&self, e: &str, _j: bool) -> String {
            format!("json_agg({})", e)
        }
        fn array_literal(&self, items: Vec<Value>, _b: BuiltinType) -> SqlExpr {
            SqlExpr::Param(Value::List(items))
        }
        fn array_has(&self, c: SqlExpr, i: Value, _b: BuiltinType) -> SqlExpr {
            c.eq(SqlExpr::Param(i))
        }
        fn array_has_every(&self, c: SqlExpr, i: Vec<Value>, _b: BuiltinType) -> SqlExpr {
            c.eq(SqlExpr::Param(Value::List(i)))
        }
        fn array_has_some(&self, c: SqlExpr, i: Vec<Value>, _b: BuiltinType) -> SqlExpr {
            c.eq(SqlExpr::Param(Value::List(i)))
        }
        fn array_is_empty(&self, c: SqlExpr) -> SqlExpr {
            c.is_null_check(false)
        }
        fn array_append(&self, c: SqlExpr, _i: Vec<Value>, _b: BuiltinType) -> SqlExpr {
            c
        }
    }

    fn schema() -> Schema {
        SchemaBuilder::new(SqlProvider::Postgres)
            .model(
                ModelBuilder::new("User")
                    .field(FieldBuilder::id_cuid("id"))
                    .field(FieldBuilder::string("email").unique())
                    .field(FieldBuilder::int("age").optional())
                    .field(FieldBuilder::relation_many("posts", "Post", "author")),
            )
            .model(
                ModelBuilder::new("Post")
                    .field(FieldBuilder::id_cuid("id"))
                    .field(FieldBuilder::string("title"))
                    .field(FieldBuilder::boolean("published"))
                    .field(FieldBuilder::string("authorId"))
                    .field(FieldBuilder::relation_owner(
                        "author",
                        "User",
                        "posts",
                        &["authorId"],
                        &["id"],
                    )),
            )
            .build()
            .unwrap()
    }

    fn render(filter: SqlExpr) -> String {
        let mut stmt = SelectStmt::from_table("User", "User");
        stmt.and_where(filter);
        render_statement(
            &Statement::select(stmt, StatementContext::new("User", StatementOp::Read)),
            &TestDialect,
        )
        .unwrap()
        .sql
    }

    #[test]
    fn empty_logical_groups_follow_boundary_rules() {
        let schema = schema();
        let fb = FilterBuilder::new(&schema, &TestDialect);
        let user = schema.model("User").unwrap();

        let and_empty = fb.build(user, "User", &json!({ "AND": [] })).unwrap();
        assert!(and_empty.is_trivially_true());

        let or_empty = fb.build(user, "User", &json!({ "OR": [] })).unwrap();
        assert!(or_empty.is_trivially_false());

        let not_empty = fb.build(user, "User", &json!({ "NOT": [] })).unwrap();
        assert!(not_empty.is_trivially_false());
    }

    #[test]
    fn contains_builds_escaped_like() {
        let schema = schema();
        let fb = FilterBuilder::new(&schema, &TestDialect);
        let user = schema.model("User").unwrap();

        let filter = fb
            .build(user, "User", &json!({ "email": { "contains": "50%_off" } }))
            .unwrap();
        let sql = render(filter);
        assert!(sql.contains("LIKE"), "{}", sql);
        assert!(sql.contains("ESCAPE"), "{}", sql);
    }

    #[test]
    fn to_many_some_compiles_to_exists() {
        let schema = schema();
        let fb = FilterBuilder::new(&schema, &TestDialect);
        let user = schema.model("User").unwrap();

        let filter = fb
            .build(
                user,
                "User",
                &json!({ "posts": { "some": { "title": "P1" } } }),
            )
            .unwrap();
        let sql = render(filter);
        assert!(sql.contains("EXISTS"), "{}", sql);
        assert!(sql.contains("\"User$posts\""), "{}", sql);
        assert!(
            sql.contains("\"User$posts\".\"authorId\" = \"User\".\"id\""),
            "{}",
            sql
        );
    }

    #[test]
    fn every_is_not_exists_of_negation() {
        let schema = schema();
        let fb = FilterBuilder::new(&schema, &TestDialect);
        let user = schema.model("User").unwrap();

        let filter = fb
            .build(
                user,
                "User",
                &json!({ "posts": { "every": { "published": true } } }),
            )
            .unwrap();
        let sql = render(filter);
        assert!(sql.contains("NOT EXISTS"), "{}", sql);
    }
}
