use crate::filter::FilterBuilder;
use serde_json::Value as Json;
use strata_core::{
    DialectCapabilities, Distinct, Error, FieldDef, Join, JoinKind, JsonPair, ModelDef,
    OrderTerm, RawPiece, Result, Schema, SelectItem, SelectStmt, SqlDialect, SqlExpr,
    Statement, StatementContext, StatementOp, TableRef, Value,
};

/// Column prefix for delegate-descendant JSON payloads.
pub const DELEGATE_PREFIX: &str = "$delegate$";

/// In-memory work the result processor performs after the fetch.
#[derive(Debug, Clone, Default)]
pub struct PostPlan {
    /// Root list reversal for negative `take`.
    pub reverse: bool,
    /// Relation paths (field chains) whose lists are fetched reversed.
    pub relation_reversals: Vec<Vec<String>>,
    /// Fields to deduplicate on when the backend lacks DISTINCT ON.
    pub distinct_fields: Option<Vec<String>>,
}

/// A planned read: the statement plus its post-processing plan.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub statement: Statement,
    pub post: PostPlan,
}

/// Translates validated find/count/aggregate/groupBy args into SELECT ASTs.
pub struct QueryPlanner<'a> {
    pub schema: &'a Schema,
    pub dialect: &'a dyn SqlDialect,
}

impl<'a> QueryPlanner<'a> {
    pub fn new(schema: &'a Schema, dialect: &'a dyn SqlDialect) -> Self {
        Self { schema, dialect }
    }

    fn filters(&self) -> FilterBuilder<'a> {
        FilterBuilder::new(self.schema, self.dialect)
    }

    /// Plan a find-family read. `single` limits the result to one row.
    pub fn plan_find(&self, model: &ModelDef, args: &Json, single: bool) -> Result<QueryPlan> {
        let map = args.as_object();
        let alias = model.name.clone();
        let mut stmt = SelectStmt::from_table(model.table_name(), alias.clone());
        let mut post = PostPlan::default();

        if let Some(where_args) = map.and_then(|m| m.get("where")) {
            let predicate = self.filters().build(model, &alias, where_args)?;
            stmt.and_where(predicate);
        }

        // Negative take: fetch reversed, restore order after.
        let mut take = map.and_then(|m| m.get("take")).and_then(Json::as_i64);
        let mut negate_order = false;
        if let Some(t) = take {
            if t < 0 {
                negate_order = true;
                post.reverse = true;
                take = Some(-t);
            }
        }
        let skip = map.and_then(|m| m.get("skip")).and_then(Json::as_i64);

        let cursor = map.and_then(|m| m.get("cursor"));
        let order_by = map.and_then(|m| m.get("orderBy"));
        let ordering = self.resolve_ordering(model, order_by, cursor.is_some())?;

        for (field_name, desc) in &ordering {
            let field = model
                .field(field_name)
                .ok_or_else(|| Error::internal(format!("unknown order field '{}'", field_name)))?;
            let column = self.filters().column_expr(model, &alias, field);
            let mut term = if *desc {
                OrderTerm::desc(column)
            } else {
                OrderTerm::asc(column)
            };
            if negate_order {
                term = term.negated();
            }
            stmt.order_by.push(term);
        }

        if let Some(cursor_args) = cursor {
            let predicate =
                self.cursor_predicate(model, &alias, &ordering, negate_order, cursor_args)?;
            stmt.and_where(predicate);
        }

        if single {
            stmt.limit = Some(1);
        } else if let Some(t) = take {
            stmt.limit = Some(t as u64);
        }
        if let Some(s) = skip {
            stmt.offset = Some(s as u64);
        }

        // distinct
        if let Some(distinct) = map.and_then(|m| m.get("distinct")) {
            let fields: Vec<String> = match distinct {
                Json::Array(items) => items
                    .iter()
                    .filter_map(Json::as_str)
                    .map(str::to_string)
                    .collect(),
                Json::String(s) => vec![s.clone()],
                _ => Vec::new(),
            };
            if self.dialect.supports(DialectCapabilities::DISTINCT_ON) {
                let cols: Vec<SqlExpr> = fields
                    .iter()
                    .map(|f| SqlExpr::col(alias.clone(), f))
                    .collect();
                // DISTINCT ON requires its expressions to lead the ordering.
                let mut leading: Vec<OrderTerm> = cols
                    .iter()
                    .map(|c| OrderTerm::asc(c.clone()))
                    .collect();
                leading.extend(stmt.order_by.drain(..));
                stmt.order_by = leading;
                stmt.distinct = Distinct::On(cols);
            } else {
                post.distinct_fields = Some(fields);
            }
        }

        // Selection phase.
        let selection = SelectionArgs::from_args(map);
        let (items, joins) =
            self.projection(model, &alias, &selection, &mut post, &mut Vec::new())?;
        stmt.projection = items;
        stmt.joins.extend(joins);

        Ok(QueryPlan {
            statement: Statement::select(
                stmt,
                StatementContext::new(&model.name, StatementOp::Read),
            ),
            post,
        })
    }

    /// Ordering as (field, desc) pairs; defaults to the id fields when a
    /// cursor is present without an explicit orderBy.
    fn resolve_ordering(
        &self,
        model: &ModelDef,
        order_by: Option<&Json>,
        has_cursor: bool,
    ) -> Result<Vec<(String, bool)>> {
        let mut ordering = Vec::new();
        if let Some(order_by) = order_by {
            let entries: Vec<&Json> = match order_by {
                Json::Array(items) => items.iter().collect(),
                other => vec![other],
            };
            for entry in entries {
                let map = entry
                    .as_object()
                    .ok_or_else(|| Error::internal("orderBy entry must be an object"))?;
                for (field, dir) in map {
                    ordering.push((field.clone(), dir.as_str() == Some("desc")));
                }
            }
        }
        if ordering.is_empty() && has_cursor {
            for id in &model.id_fields {
                ordering.push((id.clone(), false));
            }
        }
        Ok(ordering)
    }

    /// Disjunction of tuple comparisons positioning the cursor row.
    ///
    /// Cursor field values are read with correlated scalar subqueries against
    /// the unique cursor filter, so callers only supply the unique key.
    fn cursor_predicate(
        &self,
        model: &ModelDef,
        alias: &str,
        ordering: &[(String, bool)],
        negate_order: bool,
        cursor_args: &Json,
    ) -> Result<SqlExpr> {
        use strata_core::BinOp;

        if ordering.is_empty() {
            return Err(Error::internal("cursor requires an ordering"));
        }

        let cursor_value = |field_name: &str| -> Result<SqlExpr> {
            let field = model
                .field(field_name)
                .ok_or_else(|| Error::internal(format!("unknown field '{}'", field_name)))?;
            let cursor_alias = format!("{}$cursor", alias);
            let mut sub = SelectStmt::from_table(model.table_name(), cursor_alias.clone());
            sub.projection.push(SelectItem::new(
                self.filters().column_expr(model, &cursor_alias, field),
            ));
            let unique = self.filters().build(model, &cursor_alias, cursor_args)?;
            sub.and_where(unique);
            sub.limit = Some(1);
            Ok(SqlExpr::Subquery(Box::new(sub)))
        };

        let mut alternatives = Vec::new();
        for i in 0..ordering.len() {
            let mut terms = Vec::new();
            for (j, (field_name, desc)) in ordering.iter().enumerate().take(i + 1) {
                let field = model
                    .field(field_name)
                    .ok_or_else(|| Error::internal(format!("unknown field '{}'", field_name)))?;
                let column = self.filters().column_expr(model, alias, field);
                let cursor = cursor_value(field_name)?;
                let effective_desc = *desc != negate_order;
                let op = if j < i {
                    BinOp::Eq
                } else if i == ordering.len() - 1 {
                    // Inclusive on the last alternative so the cursor row
                    // itself is part of the window.
                    if effective_desc { BinOp::Le } else { BinOp::Ge }
                } else if effective_desc {
                    BinOp::Lt
                } else {
                    BinOp::Gt
                };
                terms.push(SqlExpr::binary(op, column, cursor));
            }
            alternatives.push(SqlExpr::and_all(terms));
        }
        Ok(SqlExpr::or_all(alternatives))
    }

    // -- selection -----------------------------------------------------------

    /// Projection items plus the joins they require.
    fn projection(
        &self,
        model: &ModelDef,
        alias: &str,
        selection: &SelectionArgs,
        post: &mut PostPlan,
        path: &mut Vec<String>,
    ) -> Result<(Vec<SelectItem>, Vec<Join>)> {
        let mut items = Vec::new();
        let mut joins = Vec::new();

        match &selection.select {
            Some(select) => {
                let map = select
                    .as_object()
                    .ok_or_else(|| Error::internal("select must be an object"))?;

                let selects_relation = map.keys().any(|k| {
                    model.field(k).map(|f| f.is_relation()).unwrap_or(false) || k == "_count"
                });
                if selects_relation {
                    // Relations need the parent ids in the returned tree.
                    for id in &model.id_fields {
                        if !map.contains_key(id) {
                            let field = model.field(id).expect("id field exists");
                            self.push_scalar(model, alias, field, &mut items, &mut joins);
                        }
                    }
                }

                for (key, entry) in map {
                    if entry.as_bool() == Some(false) {
                        continue;
                    }
                    if key == "_count" {
                        items.push(SelectItem::aliased(
                            self.count_selection(model, alias, entry)?,
                            "_count",
                        ));
                        continue;
                    }
                    if let Some(computed) = model.computed_fields.get(key) {
                        let ctx = strata_core::ComputedFieldCtx { model_alias: alias };
                        items.push(SelectItem::aliased((computed.sql.as_ref())(&ctx), key.clone()));
                        continue;
                    }
                    let field = model.field(key).ok_or_else(|| {
                        Error::internal(format!("unknown selected field '{}'", key))
                    })?;

                    if field.is_relation() {
                        path.push(key.clone());
                        let expr =
                            self.relation_selection(model, alias, field, entry, post, path)?;
                        path.pop();
                        items.push(SelectItem::aliased(expr, key.clone()));
                    } else {
                        self.push_scalar(model, alias, field, &mut items, &mut joins);
                    }
                }
            }
            None => {
                // All scalars minus omit.
                let omitted: Vec<&str> = selection
                    .omit
                    .and_then(Json::as_object)
                    .map(|m| {
                        m.iter()
                            .filter(|(_, v)| v.as_bool() == Some(true))
                            .map(|(k, _)| k.as_str())
                            .collect()
                    })
                    .unwrap_or_default();

                for field in model.fields.values() {
                    if field.is_relation() || omitted.contains(&field.name.as_str()) {
                        continue;
                    }
                    self.push_scalar(model, alias, field, &mut items, &mut joins);
                }
                for computed in model.computed_fields.values() {
                    if omitted.contains(&computed.name.as_str()) {
                        continue;
                    }
                    let ctx = strata_core::ComputedFieldCtx { model_alias: alias };
                    items.push(SelectItem::aliased(
                        (computed.sql.as_ref())(&ctx),
                        computed.name.clone(),
                    ));
                }

                // Delegate descendants ride along as JSON-packed columns.
                for descendant in self.schema.descendants_of(&model.name) {
                    let (join, item) = self.delegate_join(model, alias, descendant)?;
                    joins.push(join);
                    items.push(item);
                }

                if let Some(include) = selection.include {
                    let map = include
                        .as_object()
                        .ok_or_else(|| Error::internal("include must be an object"))?;
                    for (key, entry) in map {
                        if entry.as_bool() == Some(false) {
                            continue;
                        }
                        if key == "_count" {
                            items.push(SelectItem::aliased(
                                self.count_selection(model, alias, entry)?,
                                "_count",
                            ));
                            continue;
                        }
                        let field = model.field(key).ok_or_else(|| {
                            Error::internal(format!("unknown included relation '{}'", key))
                        })?;
                        path.push(key.clone());
                        let expr =
                            self.relation_selection(model, alias, field, entry, post, path)?;
                        path.pop();
                        items.push(SelectItem::aliased(expr, key.clone()));
                    }
                }
            }
        }

        Ok((items, joins))
    }

    /// Project one scalar column, joining the delegate base when inherited.
    fn push_scalar(
        &self,
        model: &ModelDef,
        alias: &str,
        field: &FieldDef,
        items: &mut Vec<SelectItem>,
        joins: &mut Vec<Join>,
    ) {
        match &field.origin_model {
            None => items.push(SelectItem::aliased(
                SqlExpr::col(alias, &field.name),
                field.name.clone(),
            )),
            Some(base_name) => {
                let base_alias = format!("{}$base${}", alias, base_name);
                if !joins.iter().any(|j| j.table.alias() == base_alias) {
                    joins.push(Join {
                        kind: JoinKind::Left,
                        table: TableRef::table(base_name.clone(), base_alias.clone()),
                        on: id_join(model, alias, &base_alias),
                    });
                }
                items.push(SelectItem::aliased(
                    SqlExpr::col(base_alias, &field.name),
                    field.name.clone(),
                ));
            }
        }
    }

    /// LEFT JOIN a delegate descendant and pack its own columns as JSON.
    fn delegate_join(
        &self,
        model: &ModelDef,
        alias: &str,
        descendant: &ModelDef,
    ) -> Result<(Join, SelectItem)> {
        let descendant_alias = format!("{}${}", alias, descendant.name);
        let join = Join {
            kind: JoinKind::Left,
            table: TableRef::table(descendant.table_name(), descendant_alias.clone()),
            on: id_join(model, alias, &descendant_alias),
        };

        let mut pairs = Vec::new();
        for field in descendant.fields.values() {
            if field.is_relation() || field.computed || field.origin_model.is_some() {
                continue;
            }
            pairs.push(JsonPair {
                key: field.name.clone(),
                expr: SqlExpr::col(descendant_alias.clone(), &field.name),
                is_json: field.field_type
                    == strata_core::FieldType::Builtin(strata_core::BuiltinType::Json),
            });
        }

        let item = SelectItem::aliased(
            SqlExpr::JsonObject(pairs),
            format!("{}{}", DELEGATE_PREFIX, descendant.name),
        );
        Ok((join, item))
    }

    /// `_count` selection: a JSON object of per-relation counts.
    fn count_selection(&self, model: &ModelDef, alias: &str, entry: &Json) -> Result<SqlExpr> {
        let requested: Vec<String> = match entry {
            Json::Bool(true) => model
                .relation_fields()
                .filter(|f| f.is_to_many())
                .map(|f| f.name.clone())
                .collect(),
            Json::Object(map) => match map.get("select").and_then(Json::as_object) {
                Some(select) => select
                    .iter()
                    .filter(|(_, v)| v.as_bool() == Some(true))
                    .map(|(k, _)| k.clone())
                    .collect(),
                None => map.keys().cloned().collect(),
            },
            _ => Vec::new(),
        };

        let mut pairs = Vec::new();
        for name in requested {
            let field = model
                .field(&name)
                .ok_or_else(|| Error::internal(format!("unknown relation '{}'", name)))?;
            let mut sub = self
                .filters()
                .related_subquery(model, alias, field, &format!("{}$count${}", alias, name))?;
            sub.projection.push(SelectItem::new(SqlExpr::CountStar));
            pairs.push(JsonPair {
                key: name,
                expr: SqlExpr::Subquery(Box::new(sub)),
                is_json: false,
            });
        }
        Ok(SqlExpr::JsonObject(pairs))
    }

    /// Correlated JSON subquery aggregating the requested relation subtree,
    /// so one round-trip fetches the entire tree.
    fn relation_selection(
        &self,
        model: &ModelDef,
        alias: &str,
        field: &FieldDef,
        entry: &Json,
        post: &mut PostPlan,
        path: &mut Vec<String>,
    ) -> Result<SqlExpr> {
        let (target, _) = self.schema.opposite_relation(model, field)?;
        let nested = entry.as_object();
        let target_alias = format!("{}${}", alias, field.name);

        let mut inner = self
            .filters()
            .related_subquery(model, alias, field, &target_alias)?;

        if let Some(where_args) = nested.and_then(|m| m.get("where")) {
            let predicate = self.filters().build(target, &target_alias, where_args)?;
            inner.and_where(predicate);
        }

        // Nested ordering / pagination.
        let mut take = nested
            .and_then(|m| m.get("take"))
            .and_then(Json::as_i64);
        let mut negate_order = false;
        if let Some(t) = take {
            if t < 0 {
                negate_order = true;
                take = Some(-t);
                post.relation_reversals.push(path.clone());
            }
        }
        if let Some(order_by) = nested.and_then(|m| m.get("orderBy")) {
            let ordering = self.resolve_ordering(target, Some(order_by), false)?;
            for (field_name, desc) in ordering {
                let order_field = target.field(&field_name).ok_or_else(|| {
                    Error::internal(format!("unknown order field '{}'", field_name))
                })?;
                let column = self
                    .filters()
                    .column_expr(target, &target_alias, order_field);
                let mut term = if desc {
                    OrderTerm::desc(column)
                } else {
                    OrderTerm::asc(column)
                };
                if negate_order {
                    term = term.negated();
                }
                inner.order_by.push(term);
            }
        }
        if field.is_to_many() {
            if let Some(t) = take {
                inner.limit = Some(t as u64);
            }
            if let Some(s) = nested.and_then(|m| m.get("skip")).and_then(Json::as_i64) {
                inner.offset = Some(s as u64);
            }
        } else {
            inner.limit = Some(1);
        }

        // Project the nested tree inside the subquery.
        let selection = SelectionArgs::from_args(nested);
        let (nested_items, nested_joins) =
            self.projection(target, &target_alias, &selection, post, path)?;
        inner.joins.extend(nested_joins);

        let mut pairs = Vec::new();
        for item in &nested_items {
            let key = item
                .alias
                .clone()
                .ok_or_else(|| Error::internal("nested projection item without alias"))?;
            let is_json = matches!(
                item.expr,
                SqlExpr::JsonObject(_) | SqlExpr::Subquery(_) | SqlExpr::JsonArrayAgg(_)
            ) || key.starts_with(DELEGATE_PREFIX);
            pairs.push(JsonPair {
                key: key.clone(),
                expr: SqlExpr::col(target_alias.clone(), key),
                is_json,
            });
        }
        inner.projection = nested_items;

        // Wrap: the inner query computes the rows, the outer aggregates them
        // into a JSON payload.
        let mut outer = SelectStmt {
            from: Some(TableRef::derived(inner, target_alias.clone())),
            ..Default::default()
        };
        let object = SqlExpr::JsonObject(pairs);
        if field.is_to_many() {
            outer.projection.push(SelectItem::new(SqlExpr::JsonArrayAgg(
                Box::new(object),
            )));
        } else {
            outer.projection.push(SelectItem::new(object));
        }

        Ok(SqlExpr::Subquery(Box::new(outer)))
    }

    // -- count / aggregate / groupBy ----------------------------------------

    pub fn plan_count(&self, model: &ModelDef, args: &Json) -> Result<Statement> {
        let map = args.as_object();
        let alias = model.name.clone();

        let mut inner = SelectStmt::from_table(model.table_name(), alias.clone());
        if let Some(where_args) = map.and_then(|m| m.get("where")) {
            let predicate = self.filters().build(model, &alias, where_args)?;
            inner.and_where(predicate);
        }
        if let Some(t) = map.and_then(|m| m.get("take")).and_then(Json::as_i64) {
            inner.limit = Some(t.unsigned_abs());
        }
        if let Some(s) = map.and_then(|m| m.get("skip")).and_then(Json::as_i64) {
            inner.offset = Some(s as u64);
        }

        let select = map.and_then(|m| m.get("select"));
        let mut outer_projection: Vec<SelectItem> = Vec::new();

        match select {
            None | Some(Json::Bool(true)) => {
                outer_projection.push(SelectItem::aliased(SqlExpr::CountStar, "_all"));
            }
            Some(Json::Object(fields)) => {
                // Counted columns must exist in the inner projection.
                for key in fields.keys() {
                    if key == "_all" {
                        outer_projection
                            .push(SelectItem::aliased(SqlExpr::CountStar, "_all"));
                        continue;
                    }
                    let field = model
                        .field(key)
                        .ok_or_else(|| Error::internal(format!("unknown field '{}'", key)))?;
                    inner.projection.push(SelectItem::aliased(
                        self.filters().column_expr(model, &alias, field),
                        key.clone(),
                    ));
                    outer_projection.push(SelectItem::aliased(
                        SqlExpr::func("count", vec![SqlExpr::col(alias.clone(), key)]),
                        key.clone(),
                    ));
                }
            }
            _ => return Err(Error::internal("invalid count select")),
        }

        if inner.projection.is_empty() {
            inner.projection.push(SelectItem::aliased(
                SqlExpr::Raw(vec![RawPiece::Sql("1".into())]),
                "one",
            ));
        }

        let outer = SelectStmt {
            from: Some(TableRef::derived(inner, alias)),
            projection: outer_projection,
            ..Default::default()
        };

        Ok(Statement::select(
            outer,
            StatementContext::new(&model.name, StatementOp::Read),
        ))
    }

    pub fn plan_aggregate(&self, model: &ModelDef, args: &Json) -> Result<Statement> {
        let map = args
            .as_object()
            .ok_or_else(|| Error::internal("aggregate args must be an object"))?;
        let alias = model.name.clone();

        let mut stmt = SelectStmt::from_table(model.table_name(), alias.clone());
        if let Some(where_args) = map.get("where") {
            let predicate = self.filters().build(model, &alias, where_args)?;
            stmt.and_where(predicate);
        }

        for item in self.aggregate_items(model, &alias, map)? {
            stmt.projection.push(item);
        }
        if stmt.projection.is_empty() {
            stmt.projection
                .push(SelectItem::aliased(SqlExpr::CountStar, "_count._all"));
        }

        Ok(Statement::select(
            stmt,
            StatementContext::new(&model.name, StatementOp::Read),
        ))
    }

    /// Aggregate projections named `<group>.<field>` for later re-nesting.
    fn aggregate_items(
        &self,
        model: &ModelDef,
        alias: &str,
        map: &serde_json::Map<String, Json>,
    ) -> Result<Vec<SelectItem>> {
        let mut items = Vec::new();
        for (group, func) in [
            ("_count", "count"),
            ("_avg", "avg"),
            ("_sum", "sum"),
            ("_min", "min"),
            ("_max", "max"),
        ] {
            let Some(requested) = map.get(group) else { continue };
            match requested {
                Json::Bool(true) if group == "_count" => {
                    items.push(SelectItem::aliased(SqlExpr::CountStar, "_count._all"));
                }
                Json::Object(fields) => {
                    for (key, on) in fields {
                        if on.as_bool() != Some(true) {
                            continue;
                        }
                        let expr = if group == "_count" && key == "_all" {
                            SqlExpr::CountStar
                        } else {
                            let field = model.field(key).ok_or_else(|| {
                                Error::internal(format!("unknown field '{}'", key))
                            })?;
                            let agg = SqlExpr::func(
                                func,
                                vec![self.filters().column_expr(model, alias, field)],
                            );
                            // Averages and sums come back as extended-width
                            // types on some backends; pin them down.
                            match group {
                                "_avg" => SqlExpr::Cast {
                                    expr: Box::new(agg),
                                    ty: "DOUBLE PRECISION".to_string(),
                                },
                                "_sum" => {
                                    let builtin = field
                                        .field_type
                                        .as_builtin()
                                        .unwrap_or(strata_core::BuiltinType::Int);
                                    SqlExpr::Cast {
                                        expr: Box::new(agg),
                                        ty: self.dialect.field_sql_type(builtin, false),
                                    }
                                }
                                _ => agg,
                            }
                        };
                        items.push(SelectItem::aliased(expr, format!("{}.{}", group, key)));
                    }
                }
                _ => {}
            }
        }
        Ok(items)
    }

    pub fn plan_group_by(&self, model: &ModelDef, args: &Json) -> Result<Statement> {
        let map = args
            .as_object()
            .ok_or_else(|| Error::internal("groupBy args must be an object"))?;
        let alias = model.name.clone();

        let by_fields: Vec<String> = match map.get("by") {
            Some(Json::String(f)) => vec![f.clone()],
            Some(Json::Array(items)) => items
                .iter()
                .filter_map(Json::as_str)
                .map(str::to_string)
                .collect(),
            _ => return Err(Error::internal("groupBy requires `by`")),
        };

        let mut stmt = SelectStmt::from_table(model.table_name(), alias.clone());
        if let Some(where_args) = map.get("where") {
            let predicate = self.filters().build(model, &alias, where_args)?;
            stmt.and_where(predicate);
        }

        for by in &by_fields {
            let field = model
                .field(by)
                .ok_or_else(|| Error::internal(format!("unknown field '{}'", by)))?;
            let column = self.filters().column_expr(model, &alias, field);
            stmt.group_by.push(column.clone());
            stmt.projection.push(SelectItem::aliased(column, by.clone()));
        }
        for item in self.aggregate_items(model, &alias, map)? {
            stmt.projection.push(item);
        }

        if let Some(having) = map.get("having") {
            let predicate = self.having_predicate(model, &alias, having)?;
            stmt.having = Some(predicate);
        }

        if let Some(order_by) = map.get("orderBy") {
            let entries: Vec<&Json> = match order_by {
                Json::Array(items) => items.iter().collect(),
                other => vec![other],
            };
            for entry in entries {
                let emap = entry
                    .as_object()
                    .ok_or_else(|| Error::internal("orderBy entry must be an object"))?;
                for (key, dir) in emap {
                    let expr = if key.starts_with('_') {
                        let fields = dir
                            .as_object()
                            .ok_or_else(|| Error::internal("aggregate orderBy takes a map"))?;
                        let (inner_field, inner_dir) = fields
                            .iter()
                            .next()
                            .ok_or_else(|| Error::internal("empty aggregate orderBy"))?;
                        let term = self.aggregate_expr(model, &alias, key, inner_field)?;
                        stmt.order_by.push(if inner_dir.as_str() == Some("desc") {
                            OrderTerm::desc(term)
                        } else {
                            OrderTerm::asc(term)
                        });
                        continue;
                    } else {
                        SqlExpr::col(alias.clone(), key)
                    };
                    stmt.order_by.push(if dir.as_str() == Some("desc") {
                        OrderTerm::desc(expr)
                    } else {
                        OrderTerm::asc(expr)
                    });
                }
            }
        }

        if let Some(t) = map.get("take").and_then(Json::as_i64) {
            stmt.limit = Some(t.unsigned_abs());
        }
        if let Some(s) = map.get("skip").and_then(Json::as_i64) {
            stmt.offset = Some(s as u64);
        }

        Ok(Statement::select(
            stmt,
            StatementContext::new(&model.name, StatementOp::Read),
        ))
    }

    fn aggregate_expr(
        &self,
        model: &ModelDef,
        alias: &str,
        group: &str,
        field_name: &str,
    ) -> Result<SqlExpr> {
        let func = match group {
            "_count" => "count",
            "_avg" => "avg",
            "_sum" => "sum",
            "_min" => "min",
            "_max" => "max",
            other => return Err(Error::internal(format!("unknown aggregate '{}'", other))),
        };
        if group == "_count" && field_name == "_all" {
            return Ok(SqlExpr::CountStar);
        }
        let field = model
            .field(field_name)
            .ok_or_else(|| Error::internal(format!("unknown field '{}'", field_name)))?;
        Ok(SqlExpr::func(
            func,
            vec![self.filters().column_expr(model, alias, field)],
        ))
    }

    fn having_predicate(&self, model: &ModelDef, alias: &str, having: &Json) -> Result<SqlExpr> {
        use strata_core::BinOp;

        let map = having
            .as_object()
            .ok_or_else(|| Error::internal("having must be an object"))?;
        let mut terms = Vec::new();

        for (key, value) in map {
            if key.starts_with('_') {
                let fields = value
                    .as_object()
                    .ok_or_else(|| Error::internal("aggregate having takes a map"))?;
                for (field_name, condition) in fields {
                    let agg = self.aggregate_expr(model, alias, key, field_name)?;
                    let conditions = condition
                        .as_object()
                        .ok_or_else(|| Error::internal("aggregate condition takes operators"))?;
                    for (op, operand) in conditions {
                        let bin = match op.as_str() {
                            "equals" => BinOp::Eq,
                            "lt" => BinOp::Lt,
                            "lte" => BinOp::Le,
                            "gt" => BinOp::Gt,
                            "gte" => BinOp::Ge,
                            "not" => BinOp::Ne,
                            other => {
                                return Err(Error::internal(format!(
                                    "unknown having operator '{}'",
                                    other
                                )))
                            }
                        };
                        terms.push(SqlExpr::binary(
                            bin,
                            agg.clone(),
                            SqlExpr::Param(Value::from_json_untyped(operand)),
                        ));
                    }
                }
            } else {
                let field = model
                    .field(key)
                    .ok_or_else(|| Error::internal(format!("unknown field '{}'", key)))?;
                let entry = serde_json::json!({ field.name.clone(): value });
                terms.push(self.filters().build(model, alias, &entry)?);
            }
        }
        Ok(SqlExpr::and_all(terms))
    }
}

/// Selection-related args extracted from a find-args object.
pub struct SelectionArgs<'j> {
    pub select: Option<&'j Json>,
    pub include: Option<&'j Json>,
    pub omit: Option<&'j Json>,
}

impl<'j> SelectionArgs<'j> {
    pub fn from_args(map: Option<&'j serde_json::Map<String, Json>>) -> Self {
        Self {
            select: map.and_then(|m| m.get("select")),
            include: map.and_then(|m| m.get("include")),
            omit: map.and_then(|m| m.get("omit")),
        }
    }
}

/// Equality on all id columns between two table aliases.
fn id_join(model: &ModelDef, alias: &str, other_alias: &str) -> SqlExpr {
    SqlExpr::and_all(
        model
            .id_fields
            .iter()
            .map(|id| SqlExpr::col(alias, id).eq(SqlExpr::col(other_alias, id)))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strata_core::{
        render_statement, FieldBuilder, ModelBuilder, SchemaBuilder, SqlProvider,
    };

    struct PgLikeDialect;

    impl SqlDialect for PgLikeDialect {
        fn provider(&self) -> SqlProvider {
            SqlProvider::Postgres
        }
        fn quote_identifier(&self, name: &str) -> String {
            format!("\"{}\"", name)
        }
        fn placeholder_style(&self) -> strata_core::PlaceholderStyle {
            strata_core::PlaceholderStyle::DollarNumber
        }
        fn capabilities(&self) -> DialectCapabilities {
            DialectCapabilities::RETURNING | DialectCapabilities::DISTINCT_ON
        }
        fn string_casing(&self) -> strata_core::StringCasingBehavior {
            strata_core::StringCasingBehavior {
                supports_ilike: true,
                like_case_sensitive: true,
            }
        }
        fn field_sql_type(&self, _b: strata_core::BuiltinType, _a: bool) -> String {
            "TEXT".into()
        }
        fn transform_primitive(
            &self,
            value: Value,
            _b: strata_core::BuiltinType,
            _a: bool,
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
        fn render_json_array_agg(&self, element: &str, _is_json: bool) -> String {
            format!("coalesce(json_agg({}), '[]')", element)
        }
        fn array_literal(&self, items: Vec<Value>, _b: strata_core::BuiltinType) -> SqlExpr {
            SqlExpr::Param(Value::List(items))
        }
        fn array_has(&self, c: SqlExpr, i: Value, _b: strata_core::BuiltinType) -> SqlExpr {
            c.eq(SqlExpr::Param(i))
        }
        fn array_has_every(
            &self,
            c: SqlExpr,
            i: Vec<Value>,
            _b: strata_core::BuiltinType,
        ) -> SqlExpr {
            c.eq(SqlExpr::Param(Value::List(i)))
        }
        fn array_has_some(
            &self,
            c: SqlExpr,
            i: Vec<Value>,
            _b: strata_core::BuiltinType,
        ) -> SqlExpr {
            c.eq(SqlExpr::Param(Value::List(i)))
        }
        fn array_is_empty(&self, c: SqlExpr) -> SqlExpr {
            c.is_null_check(false)
        }
        fn array_append(&self, c: SqlExpr, _i: Vec<Value>, _b: strata_core::BuiltinType) -> SqlExpr {
            c
        }
    }

    fn schema() -> Schema {
        SchemaBuilder::new(SqlProvider::Postgres)
            .model(
                ModelBuilder::new("User")
                    .field(FieldBuilder::id_cuid("id"))
                    .field(FieldBuilder::string("email").unique())
                    .field(FieldBuilder::relation_many("posts", "Post", "author")),
            )
            .model(
                ModelBuilder::new("Post")
                    .field(FieldBuilder::id_cuid("id"))
                    .field(FieldBuilder::string("title"))
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

    #[test]
    fn negative_take_reverses_order_and_schedules_reversal() {
        let schema = schema();
        let planner = QueryPlanner::new(&schema, &PgLikeDialect);
        let user = schema.model("User").unwrap();

        let plan = planner
            .plan_find(
                user,
                &json!({ "orderBy": { "email": "asc" }, "take": -2 }),
                false,
            )
            .unwrap();

        assert!(plan.post.reverse);
        let sql = render_statement(&plan.statement, &PgLikeDialect).unwrap().sql;
        assert!(sql.contains("ORDER BY \"User\".\"email\" DESC"), "{}", sql);
        assert!(sql.contains("LIMIT 2"), "{}", sql);
    }

    #[test]
    fn include_builds_json_subquery() {
        let schema = schema();
        let planner = QueryPlanner::new(&schema, &PgLikeDialect);
        let user = schema.model("User").unwrap();

        let plan = planner
            .plan_find(user, &json!({ "include": { "posts": true } }), false)
            .unwrap();
        let sql = render_statement(&plan.statement, &PgLikeDialect).unwrap().sql;
        assert!(sql.contains("json_agg"), "{}", sql);
        assert!(sql.contains("\"User$posts\""), "{}", sql);
        assert!(sql.contains("AS \"posts\""), "{}", sql);
    }

    #[test]
    fn cursor_synthesizes_id_ordering() {
        let schema = schema();
        let planner = QueryPlanner::new(&schema, &PgLikeDialect);
        let user = schema.model("User").unwrap();

        let plan = planner
            .plan_find(
                user,
                &json!({ "cursor": { "id": "u2" }, "skip": 1, "take": 2 }),
                false,
            )
            .unwrap();
        let sql = render_statement(&plan.statement, &PgLikeDialect).unwrap().sql;
        assert!(sql.contains("ORDER BY \"User\".\"id\" ASC"), "{}", sql);
        assert!(sql.contains(">="), "{}", sql);
        assert!(sql.contains("OFFSET 1"), "{}", sql);
    }

    #[test]
    fn count_with_field_select_counts_non_null() {
        let schema = schema();
        let planner = QueryPlanner::new(&schema, &PgLikeDialect);
        let user = schema.model("User").unwrap();

        let stmt = planner
            .plan_count(user, &json!({ "select": { "_all": true, "email": true } }))
            .unwrap();
        let sql = render_statement(&stmt, &PgLikeDialect).unwrap().sql;
        assert!(sql.contains("count(*) AS \"_all\""), "{}", sql);
        assert!(sql.contains("count(\"User\".\"email\") AS \"email\""), "{}", sql);
    }
}
