use crate::convert::coerce_scalar;
use crate::executor::{id_returning, ids_predicate, result_id_values, Executor};
use crate::filter::{scalar_builtin, FilterBuilder};
use crate::ops::MutationAction;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use indexmap::IndexMap;
use serde_json::Value as Json;
use strata_core::{
    BinOp, DefaultValue, DeleteStmt, Error, FieldDef, InsertSource, InsertStmt, ModelDef,
    OnConflict, Result, Schema, SelectItem, SelectStmt, SqlDialect, SqlExpr, Statement,
    StatementContext, StatementOp, UpdateStmt, UuidVersion, Value,
};

/// Ordered id (or referenced-column) values identifying one row.
pub(crate) type IdValues = Vec<(String, Value)>;

/// Link from a nested write back to the row that initiated it.
pub(crate) struct ParentLink<'a> {
    /// The initiating model.
    pub model: &'a ModelDef,
    /// The initiating model's relation field pointing at the child.
    pub field: &'a FieldDef,
    /// Parent column values known at link time (ids plus inserted scalars).
    pub values: IdValues,
}

impl<'a> ParentLink<'a> {
    fn value_of(&self, column: &str) -> Result<Value> {
        self.values
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| {
                Error::internal(format!(
                    "parent link for {}.{} is missing column '{}'",
                    self.model.name, self.field.name, column
                ))
            })
    }
}

/// Plans and executes create/update/upsert/delete trees.
///
/// Every entry point assumes the caller already scoped a transaction; nested
/// writes run sequentially against it.
pub(crate) struct MutationEngine<'a> {
    pub schema: &'a Schema,
    pub dialect: &'a dyn SqlDialect,
    pub exec: &'a Executor<'a>,
    pub auth: Option<&'a Value>,
}

impl<'a> MutationEngine<'a> {
    fn filters(&self) -> FilterBuilder<'a> {
        FilterBuilder::new(self.schema, self.dialect)
    }

    fn bind_json(&self, field: &FieldDef, json: &Json) -> Result<Value> {
        let value = coerce_scalar(self.schema, field, json)?;
        Ok(self.bind_value(field, value))
    }

    fn bind_value(&self, field: &FieldDef, value: Value) -> Value {
        self.dialect
            .transform_primitive(value, scalar_builtin(field), field.array)
    }

    /// Evaluate a generated default.
    fn eval_default(&self, field: &FieldDef) -> Result<Option<Value>> {
        if field.updated_at {
            return Ok(Some(Value::DateTime(Utc::now())));
        }
        let Some(default) = &field.default else {
            return Ok(None);
        };
        let value = match default {
            DefaultValue::Constant(v) => v.clone(),
            DefaultValue::Cuid => Value::Text(cuid2::create_id()),
            DefaultValue::Uuid(UuidVersion::V4) => {
                Value::Text(uuid::Uuid::new_v4().to_string())
            }
            DefaultValue::Uuid(UuidVersion::V7) => {
                Value::Text(uuid::Uuid::now_v7().to_string())
            }
            DefaultValue::Nanoid(len) => Value::Text(nanoid::format(
                nanoid::rngs::default,
                &nanoid::alphabet::SAFE,
                len.map(usize::from).unwrap_or(21),
            )),
            DefaultValue::Ulid => Value::Text(ulid::Ulid::new().to_string()),
            DefaultValue::Now => Value::DateTime(Utc::now()),
            DefaultValue::AuthMember(path) => match self.auth {
                Some(auth) => auth.walk_path(path),
                None => Value::Null,
            },
        };
        Ok(Some(value))
    }

    /// Table that physically declares `field` for `model`.
    fn declaring_table(&self, model: &ModelDef, field: &FieldDef) -> String {
        field
            .origin_model
            .clone()
            .unwrap_or_else(|| model.name.clone())
    }

    // =========================================================================
    // create
    // =========================================================================

    /// Create one row tree; returns the new row's id values.
    pub fn create_row<'b>(
        &'b self,
        model: &'b ModelDef,
        data: &'b Json,
        parent: Option<ParentLink<'b>>,
    ) -> BoxFuture<'b, Result<IdValues>> {
        async move {
            let map = data
                .as_object()
                .ok_or_else(|| Error::internal("create data must be an object"))?;

            let chain = self.schema.delegate_chain(&model.name)?;

            // Delegate bases insert first, sharing generated id values.
            let mut ids: IdValues = Vec::new();
            let mut link_values: IdValues = Vec::new();
            for (depth, table) in chain.iter().enumerate() {
                let is_first = depth == 0;

                let mut slice: IndexMap<&str, &Json> = IndexMap::new();
                for (key, value) in map {
                    let field = model
                        .field(key)
                        .ok_or_else(|| Error::internal(format!("unknown field '{}'", key)))?;
                    // Id columns exist physically on every chain table.
                    if field.is_id || self.declaring_table(model, field) == table.name {
                        slice.insert(key.as_str(), value);
                    }
                }

                let discriminator = table
                    .discriminator
                    .as_deref()
                    .filter(|_| table.is_delegate)
                    .map(|d| (d.to_string(), model.name.clone()));

                let (table_ids, inserted) = self
                    .insert_table_row(
                        table,
                        model,
                        &slice,
                        parent.as_ref(),
                        if is_first { None } else { Some(&ids) },
                        discriminator,
                    )
                    .await?;
                if is_first {
                    ids = table_ids;
                }
                link_values.extend(inserted);
            }

            for (name, value) in &ids {
                if !link_values.iter().any(|(n, _)| n == name) {
                    link_values.push((name.clone(), value.clone()));
                }
            }

            // Non-owned relation payloads run after the row exists.
            for (key, value) in map {
                let field = model.field(key).expect("validated field");
                if !field.is_relation() {
                    continue;
                }
                let relation = field
                    .relation
                    .as_ref()
                    .ok_or_else(|| Error::internal("relation without def"))?;
                if relation.is_owner() {
                    continue; // consumed by insert_table_row
                }
                let link = ParentLink {
                    model,
                    field,
                    values: link_values.clone(),
                };
                self.apply_relation_payload_after_write(link, value).await?;
            }

            Ok(ids)
        }
        .boxed()
    }

    /// Insert one physical table row. Returns (id values, inserted columns).
    async fn insert_table_row(
        &self,
        table: &ModelDef,
        concrete: &ModelDef,
        data: &IndexMap<&str, &Json>,
        parent: Option<&ParentLink<'_>>,
        known_ids: Option<&IdValues>,
        discriminator: Option<(String, String)>,
    ) -> Result<(IdValues, IdValues)> {
        let mut columns: IndexMap<String, Value> = IndexMap::new();

        // Scalars straight from the payload.
        for (key, value) in data {
            let field = concrete.field(key).expect("validated field");
            if field.is_relation() {
                continue;
            }
            columns.insert((*key).to_string(), self.bind_json(field, value)?);
        }

        // Owned to-one relations resolve to FK values before the insert.
        for (key, value) in data {
            let field = concrete.field(key).expect("validated field");
            let Some(relation) = &field.relation else { continue };
            if !field.is_relation() || !relation.is_owner() {
                continue;
            }
            let fk_values = self.resolve_owned_relation(concrete, field, value).await?;
            for (column, fk_value) in fk_values {
                let fk_field = concrete
                    .field(&column)
                    .ok_or_else(|| Error::internal(format!("missing FK field '{}'", column)))?;
                columns.insert(column, self.bind_value(fk_field, fk_value));
            }
        }

        // FK columns fed by the initiating parent.
        if let Some(link) = parent {
            let (_, opposite) = self.schema.opposite_relation(link.model, link.field)?;
            if let Some(opp_rel) = &opposite.relation {
                if opp_rel.is_owner() {
                    for (fk, reference) in
                        opp_rel.fields.iter().zip(opp_rel.references.iter())
                    {
                        if table.field(fk).map(|f| f.origin_model.is_none()).unwrap_or(false)
                            || concrete
                                .field(fk)
                                .map(|f| {
                                    self.declaring_table(concrete, f) == table.name
                                })
                                .unwrap_or(false)
                        {
                            let fk_field =
                                concrete.field(fk).expect("FK field exists");
                            columns.insert(
                                fk.clone(),
                                self.bind_value(fk_field, link.value_of(reference)?),
                            );
                        }
                    }
                }
            }
        }

        if let Some((column, value)) = discriminator {
            columns.insert(column, Value::Text(value));
        }

        // Ids: shared with the base row, generated, or backend-assigned.
        match known_ids {
            Some(ids) => {
                for (name, value) in ids {
                    columns.insert(name.clone(), value.clone());
                }
            }
            None => {
                for id_name in &table.id_fields {
                    if columns.contains_key(id_name) {
                        continue;
                    }
                    let field = concrete.field(id_name).expect("id field exists");
                    if let Some(value) = self.eval_default(field)? {
                        columns.insert(id_name.clone(), self.bind_value(field, value));
                    }
                    // Single integer ids without a default stay absent; the
                    // backend assigns them and RETURNING reports the value.
                }
            }
        }

        // Remaining generated defaults and updatedAt stamps.
        for field in concrete.fields.values() {
            if field.is_relation()
                || field.computed
                || columns.contains_key(&field.name)
                || self.declaring_table(concrete, field) != table.name
            {
                continue;
            }
            if let Some(value) = self.eval_default(field)? {
                columns.insert(field.name.clone(), self.bind_value(field, value));
            }
        }

        let stmt = InsertStmt {
            table: table.table_name().to_string(),
            columns: columns.keys().cloned().collect(),
            source: InsertSource::Values(vec![columns
                .values()
                .map(|v| SqlExpr::Param(v.clone()))
                .collect()]),
            on_conflict: None,
            returning: id_returning(table),
        };
        let result = self
            .exec
            .exec_mutation(
                MutationAction::Create,
                table,
                Statement::insert(
                    stmt,
                    StatementContext::new(&table.name, StatementOp::Create),
                ),
            )
            .await?;

        let ids = result_id_values(table, &result)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::internal("insert returned no row"))?;

        let inserted: IdValues = columns.into_iter().collect();
        Ok((ids, inserted))
    }

    /// Resolve an owned to-one relation payload into FK column values.
    async fn resolve_owned_relation(
        &self,
        model: &ModelDef,
        field: &FieldDef,
        payload: &Json,
    ) -> Result<Vec<(String, Value)>> {
        let relation = field.relation.as_ref().expect("owned relation");
        let (target, _) = self.schema.opposite_relation(model, field)?;
        let map = payload
            .as_object()
            .ok_or_else(|| Error::internal("relation payload must be an object"))?;

        let referenced = if let Some(connect) = map.get("connect") {
            self.resolve_connect_values(target, &relation.references, connect)
                .await?
        } else if let Some(create) = map.get("create") {
            self.created_reference_values(target, &relation.references, create)
                .await?
        } else if let Some(coc) = map.get("connectOrCreate") {
            let entry = coc
                .as_object()
                .ok_or_else(|| Error::internal("connectOrCreate payload"))?;
            let where_args = entry.get("where").expect("validated");
            match self
                .try_resolve_unique(target, &relation.references, where_args)
                .await?
            {
                Some(values) => values,
                None => {
                    self.created_reference_values(
                        target,
                        &relation.references,
                        entry.get("create").expect("validated"),
                    )
                    .await?
                }
            }
        } else {
            return Err(Error::internal(format!(
                "unsupported owned-relation actions: {:?}",
                map.keys().collect::<Vec<_>>()
            )));
        };

        Ok(relation
            .fields
            .iter()
            .zip(referenced.into_iter())
            .map(|(fk, (_, value))| (fk.clone(), value))
            .collect())
    }

    /// Create the target row, then read the referenced column values.
    async fn created_reference_values(
        &self,
        target: &ModelDef,
        references: &[String],
        create: &Json,
    ) -> Result<IdValues> {
        let ids = self.create_row(target, create, None).await?;
        if references == target.id_fields.as_slice() {
            return Ok(ids);
        }
        // References point at non-id unique columns; fetch them.
        let mut select = SelectStmt::from_table(target.table_name(), target.name.clone());
        select.and_where(ids_predicate(&target.name, &target.id_fields, &[ids]));
        for reference in references {
            select.projection.push(SelectItem::aliased(
                SqlExpr::col(target.name.clone(), reference),
                reference.clone(),
            ));
        }
        let result = self
            .exec
            .exec_raw(Statement::select(
                select,
                StatementContext::new(&target.name, StatementOp::Read),
            ))
            .await?;
        let row = result
            .rows
            .first()
            .ok_or_else(|| Error::internal("created row vanished"))?;
        Ok(references
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), row[i].clone()))
            .collect())
    }

    /// `connect`: use the referenced values directly when present in the
    /// filter, otherwise probe the backend.
    async fn resolve_connect_values(
        &self,
        target: &ModelDef,
        references: &[String],
        connect: &Json,
    ) -> Result<IdValues> {
        self.try_resolve_unique(target, references, connect)
            .await?
            .ok_or_else(|| Error::not_found(&target.name))
    }

    async fn try_resolve_unique(
        &self,
        target: &ModelDef,
        references: &[String],
        unique_where: &Json,
    ) -> Result<Option<IdValues>> {
        let map = unique_where
            .as_object()
            .ok_or_else(|| Error::internal("unique filter must be an object"))?;

        // All referenced columns supplied directly: no round-trip needed.
        if references.iter().all(|r| {
            map.get(r)
                .is_some_and(|v| !v.is_null() && !v.is_object())
        }) {
            let mut values = Vec::new();
            for reference in references {
                let field = target
                    .field(reference)
                    .ok_or_else(|| Error::internal(format!("missing field '{}'", reference)))?;
                values.push((reference.clone(), self.bind_json(field, &map[reference])?));
            }
            return Ok(Some(values));
        }

        let mut select = SelectStmt::from_table(target.table_name(), target.name.clone());
        let predicate = self.filters().build(target, &target.name, unique_where)?;
        select.and_where(predicate);
        for reference in references {
            select.projection.push(SelectItem::aliased(
                SqlExpr::col(target.name.clone(), reference),
                reference.clone(),
            ));
        }
        select.limit = Some(1);

        let result = self
            .exec
            .exec_raw(Statement::select(
                select,
                StatementContext::new(&target.name, StatementOp::Read),
            ))
            .await?;
        Ok(result.rows.first().map(|row| {
            references
                .iter()
                .enumerate()
                .map(|(i, name)| (name.clone(), row[i].clone()))
                .collect()
        }))
    }

    // =========================================================================
    // nested relation payloads (child-side and many-to-many)
    // =========================================================================

    /// Apply a relation payload whose effects land on the child or the join
    /// table, after the initiating row exists.
    fn apply_relation_payload_after_write<'b>(
        &'b self,
        link: ParentLink<'b>,
        payload: &'b Json,
    ) -> BoxFuture<'b, Result<()>> {
        async move {
            let map = payload
                .as_object()
                .ok_or_else(|| Error::internal("relation payload must be an object"))?;
            let (target, _) = self.schema.opposite_relation(link.model, link.field)?;
            let is_m2m = self.schema.is_many_to_many(link.model, link.field)?;

            for (action, entry) in map {
                let items = payload_items(link.field, entry);
                match action.as_str() {
                    "create" => {
                        for item in items {
                            if is_m2m {
                                let ids = self.create_row(target, item, None).await?;
                                self.m2m_connect(&link, &[ids]).await?;
                            } else {
                                let child_link = ParentLink {
                                    model: link.model,
                                    field: link.field,
                                    values: link.values.clone(),
                                };
                                self.create_row(target, item, Some(child_link)).await?;
                            }
                        }
                    }
                    "connect" => {
                        if is_m2m {
                            let targets = self.resolve_target_ids(target, &items).await?;
                            self.m2m_connect(&link, &targets).await?;
                        } else {
                            for item in items {
                                self.connect_child(&link, target, item).await?;
                            }
                        }
                    }
                    "connectOrCreate" => {
                        for item in items {
                            let entry = item
                                .as_object()
                                .ok_or_else(|| Error::internal("connectOrCreate payload"))?;
                            let where_args = entry.get("where").expect("validated");
                            let exists = self
                                .try_resolve_unique(
                                    target,
                                    &target.id_fields.clone(),
                                    where_args,
                                )
                                .await?;
                            match exists {
                                Some(ids) if is_m2m => {
                                    self.m2m_connect(&link, &[ids]).await?
                                }
                                Some(_) => self.connect_child(&link, target, where_args).await?,
                                None => {
                                    let create = entry.get("create").expect("validated");
                                    if is_m2m {
                                        let ids =
                                            self.create_row(target, create, None).await?;
                                        self.m2m_connect(&link, &[ids]).await?;
                                    } else {
                                        let child_link = ParentLink {
                                            model: link.model,
                                            field: link.field,
                                            values: link.values.clone(),
                                        };
                                        self.create_row(target, create, Some(child_link))
                                            .await?;
                                    }
                                }
                            }
                        }
                    }
                    "createMany" => {
                        let rows = entry
                            .as_object()
                            .and_then(|e| e.get("data"))
                            .and_then(Json::as_array)
                            .ok_or_else(|| Error::internal("createMany payload"))?;
                        let skip_duplicates = entry
                            .as_object()
                            .and_then(|e| e.get("skipDuplicates"))
                            .and_then(Json::as_bool)
                            .unwrap_or(false);
                        let row_refs: Vec<&Json> = rows.iter().collect();
                        self.create_many(target, &row_refs, skip_duplicates, Some(&link))
                            .await?;
                    }
                    "disconnect" => {
                        if is_m2m {
                            let targets = self.resolve_target_ids(target, &items).await?;
                            self.m2m_disconnect(&link, &targets).await?;
                        } else {
                            self.disconnect_children(&link, target, &items).await?;
                        }
                    }
                    "set" => {
                        if is_m2m {
                            let targets = self.resolve_target_ids(target, &items).await?;
                            self.m2m_set(&link, &targets).await?;
                        } else {
                            // Null out every current link, then connect anew.
                            self.disconnect_all_children(&link, target).await?;
                            for item in items {
                                self.connect_child(&link, target, item).await?;
                            }
                        }
                    }
                    "update" => {
                        for item in items {
                            let (where_args, data) = split_update_payload(item)?;
                            let child_link = ParentLink {
                                model: link.model,
                                field: link.field,
                                values: link.values.clone(),
                            };
                            self.update_rows(
                                target,
                                where_args,
                                data,
                                Some(child_link),
                                true,
                                false,
                                None,
                            )
                            .await?;
                        }
                    }
                    "updateMany" => {
                        for item in items {
                            let entry = item
                                .as_object()
                                .ok_or_else(|| Error::internal("updateMany payload"))?;
                            let child_link = ParentLink {
                                model: link.model,
                                field: link.field,
                                values: link.values.clone(),
                            };
                            self.update_rows(
                                target,
                                entry.get("where"),
                                entry.get("data").expect("validated"),
                                Some(child_link),
                                false,
                                true,
                                None,
                            )
                            .await?;
                        }
                    }
                    "upsert" => {
                        for item in items {
                            let entry = item
                                .as_object()
                                .ok_or_else(|| Error::internal("upsert payload"))?;
                            let where_args = entry.get("where");
                            let child_link = ParentLink {
                                model: link.model,
                                field: link.field,
                                values: link.values.clone(),
                            };
                            let updated = self
                                .update_rows(
                                    target,
                                    where_args,
                                    entry.get("update").expect("validated"),
                                    Some(child_link),
                                    false,
                                    false,
                                    None,
                                )
                                .await?;
                            if updated.is_empty() {
                                let create = entry.get("create").expect("validated");
                                if is_m2m {
                                    let ids = self.create_row(target, create, None).await?;
                                    self.m2m_connect(&link, &[ids]).await?;
                                } else {
                                    let child_link = ParentLink {
                                        model: link.model,
                                        field: link.field,
                                        values: link.values.clone(),
                                    };
                                    self.create_row(target, create, Some(child_link)).await?;
                                }
                            }
                        }
                    }
                    "delete" => {
                        for item in items {
                            let where_args = if item.is_boolean() { None } else { Some(item) };
                            let child_link = ParentLink {
                                model: link.model,
                                field: link.field,
                                values: link.values.clone(),
                            };
                            self.delete_rows(
                                target,
                                where_args,
                                Some(child_link),
                                true,
                                false,
                                None,
                            )
                            .await?;
                        }
                    }
                    "deleteMany" => {
                        for item in items {
                            let child_link = ParentLink {
                                model: link.model,
                                field: link.field,
                                values: link.values.clone(),
                            };
                            self.delete_rows(
                                target,
                                Some(item),
                                Some(child_link),
                                false,
                                true,
                                None,
                            )
                            .await?;
                        }
                    }
                    other => {
                        return Err(Error::internal(format!(
                            "unsupported relation action '{}'",
                            other
                        )))
                    }
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// Point an existing child row's FK at the parent.
    async fn connect_child(
        &self,
        link: &ParentLink<'_>,
        target: &ModelDef,
        unique_where: &Json,
    ) -> Result<()> {
        let (_, opposite) = self.schema.opposite_relation(link.model, link.field)?;
        let opp_rel = opposite
            .relation
            .as_ref()
            .filter(|r| r.is_owner())
            .ok_or_else(|| Error::internal("connect on a relation without a child FK"))?;

        let mut set = Vec::new();
        for (fk, reference) in opp_rel.fields.iter().zip(opp_rel.references.iter()) {
            let fk_field = target
                .field(fk)
                .ok_or_else(|| Error::internal(format!("missing FK field '{}'", fk)))?;
            set.push((
                fk.clone(),
                SqlExpr::Param(self.bind_value(fk_field, link.value_of(reference)?)),
            ));
        }

        let predicate = self.filters().build(target, target.table_name(), unique_where)?;
        let stmt = UpdateStmt {
            table: target.table_name().to_string(),
            set,
            where_clause: Some(predicate),
            returning: id_returning(target),
        };
        let result = self
            .exec
            .exec_mutation(
                MutationAction::Update,
                target,
                Statement::update(
                    stmt,
                    StatementContext::new(&target.name, StatementOp::Update),
                ),
            )
            .await?;
        if result.rows.is_empty() {
            return Err(Error::not_found(&target.name));
        }
        Ok(())
    }

    /// Null out the child FK for the given children.
    async fn disconnect_children(
        &self,
        link: &ParentLink<'_>,
        target: &ModelDef,
        items: &[&Json],
    ) -> Result<()> {
        for item in items {
            if item.as_bool() == Some(false) {
                continue;
            }
            let where_args = if item.is_boolean() { None } else { Some(*item) };
            self.disconnect_where(link, target, where_args).await?;
        }
        Ok(())
    }

    async fn disconnect_all_children(
        &self,
        link: &ParentLink<'_>,
        target: &ModelDef,
    ) -> Result<()> {
        self.disconnect_where(link, target, None).await
    }

    async fn disconnect_where(
        &self,
        link: &ParentLink<'_>,
        target: &ModelDef,
        where_args: Option<&Json>,
    ) -> Result<()> {
        let (_, opposite) = self.schema.opposite_relation(link.model, link.field)?;
        let opp_rel = opposite
            .relation
            .as_ref()
            .filter(|r| r.is_owner())
            .ok_or_else(|| Error::internal("disconnect on a relation without a child FK"))?;

        let mut predicate = self.parent_predicate(target, link)?;
        if let Some(where_args) = where_args {
            let extra = self.filters().build(target, target.table_name(), where_args)?;
            predicate = predicate.and(extra);
        }

        let set = opp_rel
            .fields
            .iter()
            .map(|fk| (fk.clone(), SqlExpr::Param(Value::Null)))
            .collect();

        let stmt = UpdateStmt {
            table: target.table_name().to_string(),
            set,
            where_clause: Some(predicate),
            returning: id_returning(target),
        };
        self.exec
            .exec_mutation(
                MutationAction::Update,
                target,
                Statement::update(
                    stmt,
                    StatementContext::new(&target.name, StatementOp::Update),
                ),
            )
            .await?;
        Ok(())
    }

    /// Predicate selecting children that belong to the linked parent.
    fn parent_predicate(&self, target: &ModelDef, link: &ParentLink<'_>) -> Result<SqlExpr> {
        let (_, opposite) = self.schema.opposite_relation(link.model, link.field)?;

        if self.schema.is_many_to_many(link.model, link.field)? {
            // Membership through the join table.
            let join = self.schema.join_table(link.model, link.field)?;
            let parent_col = self.schema.join_column_for_side(link.model, link.field)?;
            let child_col = if parent_col == "A" { "B" } else { "A" };

            let parent_id = single_id(link.model)?;
            let child_id = single_id(target)?;
            let jt_alias = format!("{}$jt", target.name);

            let mut sub = SelectStmt::from_table(join.table.clone(), jt_alias.clone());
            sub.projection.push(SelectItem::new(SqlExpr::Raw(vec![
                strata_core::RawPiece::Sql("1".to_string()),
            ])));
            sub.and_where(
                SqlExpr::col(jt_alias.clone(), child_col)
                    .eq(SqlExpr::col(target.table_name(), &child_id.name)),
            );
            sub.and_where(
                SqlExpr::col(jt_alias, parent_col)
                    .eq(SqlExpr::Param(link.value_of(&parent_id.name)?)),
            );
            return Ok(SqlExpr::Exists {
                query: Box::new(sub),
                negated: false,
            });
        }

        if let Some(opp_rel) = opposite.relation.as_ref().filter(|r| r.is_owner()) {
            // Child carries the FK.
            let mut terms = Vec::new();
            for (fk, reference) in opp_rel.fields.iter().zip(opp_rel.references.iter()) {
                terms.push(
                    SqlExpr::col(target.table_name(), fk)
                        .eq(SqlExpr::Param(link.value_of(reference)?)),
                );
            }
            return Ok(SqlExpr::and_all(terms));
        }

        // Parent carries the FK: match children the parent row references,
        // correlated through the parent table since the FK values may not be
        // known at link time.
        let parent_rel = link
            .field
            .relation
            .as_ref()
            .filter(|r| r.is_owner())
            .ok_or_else(|| Error::internal("unowned relation on both sides"))?;

        let parent_alias = format!("{}$owner", target.name);
        let mut sub = SelectStmt::from_table(link.model.table_name(), parent_alias.clone());
        sub.projection.push(SelectItem::new(SqlExpr::Raw(vec![
            strata_core::RawPiece::Sql("1".to_string()),
        ])));
        for (fk, reference) in parent_rel.fields.iter().zip(parent_rel.references.iter()) {
            sub.and_where(
                SqlExpr::col(parent_alias.clone(), fk)
                    .eq(SqlExpr::col(target.table_name(), reference)),
            );
        }
        for id in &link.model.id_fields {
            sub.and_where(
                SqlExpr::col(parent_alias.clone(), id).eq(SqlExpr::Param(link.value_of(id)?)),
            );
        }
        Ok(SqlExpr::Exists {
            query: Box::new(sub),
            negated: false,
        })
    }

    /// Resolve unique filters to id tuples, skipping the round-trip when the
    /// filter already names the id columns.
    async fn resolve_target_ids(
        &self,
        target: &ModelDef,
        items: &[&Json],
    ) -> Result<Vec<IdValues>> {
        let mut out = Vec::new();
        for item in items {
            let ids = self
                .try_resolve_unique(target, &target.id_fields.clone(), item)
                .await?
                .ok_or_else(|| Error::not_found(&target.name))?;
            out.push(ids);
        }
        Ok(out)
    }

    // =========================================================================
    // many-to-many join table
    // =========================================================================

    /// Idempotent link insert: `ON CONFLICT DO NOTHING`.
    async fn m2m_connect(
        &self,
        link: &ParentLink<'_>,
        targets: &[IdValues],
    ) -> Result<()> {
        if targets.is_empty() {
            return Ok(());
        }
        let join = self.schema.join_table(link.model, link.field)?;
        let parent_col = self.schema.join_column_for_side(link.model, link.field)?;
        let parent_id = single_id(link.model)?;
        let parent_value = link.value_of(&parent_id.name)?;

        let rows: Vec<Vec<SqlExpr>> = targets
            .iter()
            .map(|ids| {
                let target_value = ids
                    .first()
                    .map(|(_, v)| v.clone())
                    .unwrap_or(Value::Null);
                // Column order is always (A, B).
                if parent_col == "A" {
                    vec![
                        SqlExpr::Param(parent_value.clone()),
                        SqlExpr::Param(target_value),
                    ]
                } else {
                    vec![
                        SqlExpr::Param(target_value),
                        SqlExpr::Param(parent_value.clone()),
                    ]
                }
            })
            .collect();

        let stmt = InsertStmt {
            table: join.table.clone(),
            columns: vec!["A".to_string(), "B".to_string()],
            source: InsertSource::Values(rows),
            on_conflict: Some(OnConflict::DoNothing { targets: vec![] }),
            returning: vec![],
        };
        self.exec
            .exec_statement(Statement::insert(
                stmt,
                StatementContext::new(&link.model.name, StatementOp::Update),
            ))
            .await?;
        Ok(())
    }

    /// Remove the links for the given targets.
    async fn m2m_disconnect(
        &self,
        link: &ParentLink<'_>,
        targets: &[IdValues],
    ) -> Result<()> {
        if targets.is_empty() {
            return Ok(());
        }
        let join = self.schema.join_table(link.model, link.field)?;
        let parent_col = self.schema.join_column_for_side(link.model, link.field)?;
        let child_col = if parent_col == "A" { "B" } else { "A" };
        let parent_id = single_id(link.model)?;

        let target_params: Vec<SqlExpr> = targets
            .iter()
            .map(|ids| {
                SqlExpr::Param(ids.first().map(|(_, v)| v.clone()).unwrap_or(Value::Null))
            })
            .collect();

        let predicate = SqlExpr::col(join.table.clone(), parent_col)
            .eq(SqlExpr::Param(link.value_of(&parent_id.name)?))
            .and(SqlExpr::InList {
                expr: Box::new(SqlExpr::col(join.table.clone(), child_col)),
                list: target_params,
                negated: false,
            });

        let stmt = DeleteStmt {
            table: join.table.clone(),
            where_clause: Some(predicate),
            returning: vec![],
        };
        self.exec
            .exec_statement(Statement::delete(
                stmt,
                StatementContext::new(&link.model.name, StatementOp::Update),
            ))
            .await?;
        Ok(())
    }

    /// Reset the link set for the parent, then connect the new targets.
    async fn m2m_set(&self, link: &ParentLink<'_>, targets: &[IdValues]) -> Result<()> {
        let join = self.schema.join_table(link.model, link.field)?;
        let parent_col = self.schema.join_column_for_side(link.model, link.field)?;
        let parent_id = single_id(link.model)?;

        let stmt = DeleteStmt {
            table: join.table.clone(),
            where_clause: Some(
                SqlExpr::col(join.table.clone(), parent_col)
                    .eq(SqlExpr::Param(link.value_of(&parent_id.name)?)),
            ),
            returning: vec![],
        };
        self.exec
            .exec_statement(Statement::delete(
                stmt,
                StatementContext::new(&link.model.name, StatementOp::Update),
            ))
            .await?;

        self.m2m_connect(link, targets).await
    }

    // =========================================================================
    // update / upsert / delete / createMany
    // =========================================================================

    /// Update matching rows; returns the affected id tuples.
    #[allow(clippy::too_many_arguments)]
    pub fn update_rows<'b>(
        &'b self,
        model: &'b ModelDef,
        where_args: Option<&'b Json>,
        data: &'b Json,
        parent: Option<ParentLink<'b>>,
        expect: bool,
        many: bool,
        limit: Option<u64>,
    ) -> BoxFuture<'b, Result<Vec<IdValues>>> {
        async move {
            let map = data
                .as_object()
                .ok_or_else(|| Error::internal("update data must be an object"))?;

            // Resolve the target rows first; limits and delegate routing both
            // need concrete ids.
            let ids = self
                .resolve_affected_ids(model, where_args, parent.as_ref(), many, limit)
                .await?;
            if ids.is_empty() {
                if expect {
                    return Err(Error::not_found(&model.name));
                }
                return Ok(Vec::new());
            }

            let chain = self.schema.delegate_chain(&model.name)?;

            // Scalar assignments per declaring table.
            let mut sets: IndexMap<String, Vec<(String, SqlExpr)>> = IndexMap::new();
            for (key, value) in map {
                let field = model
                    .field(key)
                    .ok_or_else(|| Error::internal(format!("unknown field '{}'", key)))?;
                if field.is_relation() {
                    continue;
                }
                let table = self.declaring_table(model, field);
                let assignment = self.scalar_assignment(model, field, value)?;
                sets.entry(table).or_default().push(assignment);
            }

            // updatedAt stamps ride along with any table already being set;
            // a data-only-relations update still stamps the declaring table.
            for field in model.fields.values() {
                if !field.updated_at {
                    continue;
                }
                let table = self.declaring_table(model, field);
                let entry = sets.entry(table).or_default();
                if !entry.iter().any(|(name, _)| name == &field.name) {
                    let stamp = self.bind_value(field, Value::DateTime(Utc::now()));
                    entry.push((field.name.clone(), SqlExpr::Param(stamp)));
                }
            }

            // Owned to-one relation actions: linking actions fold into FK
            // assignments; actions on the target row itself run afterwards.
            let mut deferred_owned: Vec<(&str, Json)> = Vec::new();
            for (key, value) in map {
                let field = model.field(key).expect("validated field");
                let Some(relation) = &field.relation else { continue };
                if !field.is_relation() || !relation.is_owner() {
                    continue;
                }
                let table = self.declaring_table(model, field);
                let payload = value
                    .as_object()
                    .ok_or_else(|| Error::internal("relation payload must be an object"))?;

                for (action, sub) in payload {
                    match action.as_str() {
                        "disconnect" => {
                            for fk in &relation.fields {
                                sets.entry(table.clone())
                                    .or_default()
                                    .push((fk.clone(), SqlExpr::Param(Value::Null)));
                            }
                        }
                        "connect" | "create" | "connectOrCreate" => {
                            let single = serde_json::json!({ action.clone(): sub.clone() });
                            let fk_values =
                                self.resolve_owned_relation(model, field, &single).await?;
                            for (column, fk_value) in fk_values {
                                let fk_field =
                                    model.field(&column).expect("FK field exists");
                                sets.entry(table.clone()).or_default().push((
                                    column,
                                    SqlExpr::Param(self.bind_value(fk_field, fk_value)),
                                ));
                            }
                        }
                        "update" | "upsert" | "delete" | "updateMany" | "deleteMany" => {
                            deferred_owned.push((
                                key.as_str(),
                                serde_json::json!({ action.clone(): sub.clone() }),
                            ));
                        }
                        other => {
                            return Err(Error::internal(format!(
                                "unsupported owned-relation action '{}'",
                                other
                            )))
                        }
                    }
                }
            }

            // One UPDATE per touched table, all keyed by the same ids.
            let mut affected = ids.clone();
            for table in &chain {
                let Some(set) = sets.shift_remove(&table.name) else {
                    continue;
                };
                if set.is_empty() {
                    continue;
                }
                let stmt = UpdateStmt {
                    table: table.table_name().to_string(),
                    set,
                    where_clause: Some(ids_predicate(
                        table.table_name(),
                        &table.id_fields,
                        &ids,
                    )),
                    returning: id_returning(table),
                };
                let result = self
                    .exec
                    .exec_mutation(
                        MutationAction::Update,
                        table,
                        Statement::update(
                            stmt,
                            StatementContext::new(&table.name, StatementOp::Update),
                        ),
                    )
                    .await?;
                if table.name == model.name {
                    affected = result_id_values(table, &result)?;
                }
            }

            if expect && affected.is_empty() {
                return Err(Error::not_found(&model.name));
            }

            // Relation actions on related rows, linked to the first affected
            // row.
            let has_non_owned_ops = map.iter().any(|(key, _)| {
                model
                    .field(key)
                    .map(|f| {
                        f.is_relation()
                            && f.relation
                                .as_ref()
                                .map(|r| !r.is_owner())
                                .unwrap_or(false)
                    })
                    .unwrap_or(false)
            });
            if has_non_owned_ops || !deferred_owned.is_empty() {
                let row_ids = affected
                    .first()
                    .or(ids.first())
                    .ok_or_else(|| Error::not_found(&model.name))?
                    .clone();
                for (key, value) in map {
                    let field = model.field(key).expect("validated field");
                    if !field.is_relation() {
                        continue;
                    }
                    let relation = field.relation.as_ref().expect("relation def");
                    if relation.is_owner() {
                        continue;
                    }
                    let link = ParentLink {
                        model,
                        field,
                        values: row_ids.clone(),
                    };
                    self.apply_relation_payload_after_write(link, value).await?;
                }
                for (key, payload) in &deferred_owned {
                    let field = model.field(key).expect("validated field");
                    let link = ParentLink {
                        model,
                        field,
                        values: row_ids.clone(),
                    };
                    self.apply_relation_payload_after_write(link, payload).await?;
                }
            }

            Ok(affected)
        }
        .boxed()
    }

    /// Scalar SET entry, interpreting numeric/list operator objects.
    fn scalar_assignment(
        &self,
        model: &ModelDef,
        field: &FieldDef,
        value: &Json,
    ) -> Result<(String, SqlExpr)> {
        let column = SqlExpr::col(model.table_name(), &field.name);

        if let Some(map) = value.as_object() {
            let (op, operand) = map
                .iter()
                .next()
                .ok_or_else(|| Error::internal("empty operator object"))?;
            let expr = match op.as_str() {
                "set" => SqlExpr::Param(self.bind_json(field, operand)?),
                "increment" => SqlExpr::binary(
                    BinOp::Add,
                    column,
                    SqlExpr::Param(self.bind_json(field, operand)?),
                ),
                "decrement" => SqlExpr::binary(
                    BinOp::Sub,
                    column,
                    SqlExpr::Param(self.bind_json(field, operand)?),
                ),
                "multiply" => SqlExpr::binary(
                    BinOp::Mul,
                    column,
                    SqlExpr::Param(self.bind_json(field, operand)?),
                ),
                "divide" => SqlExpr::binary(
                    BinOp::Div,
                    column,
                    SqlExpr::Param(self.bind_json(field, operand)?),
                ),
                "push" => {
                    let items: Vec<Value> = match operand {
                        Json::Array(list) => list
                            .iter()
                            .map(|item| {
                                let v = crate::convert::coerce_builtin(
                                    scalar_builtin(field),
                                    &field.name,
                                    item,
                                )?;
                                Ok(self
                                    .dialect
                                    .transform_primitive(v, scalar_builtin(field), false))
                            })
                            .collect::<Result<_>>()?,
                        single => {
                            let v = crate::convert::coerce_builtin(
                                scalar_builtin(field),
                                &field.name,
                                single,
                            )?;
                            vec![self
                                .dialect
                                .transform_primitive(v, scalar_builtin(field), false)]
                        }
                    };
                    self.dialect
                        .array_append(column, items, scalar_builtin(field))
                }
                other => {
                    return Err(Error::internal(format!(
                        "unknown update operator '{}'",
                        other
                    )))
                }
            };
            return Ok((field.name.clone(), expr));
        }

        Ok((
            field.name.clone(),
            SqlExpr::Param(self.bind_json(field, value)?),
        ))
    }

    /// Resolve the rows a mutation targets, honoring parent links and limits.
    async fn resolve_affected_ids(
        &self,
        model: &ModelDef,
        where_args: Option<&Json>,
        parent: Option<&ParentLink<'_>>,
        many: bool,
        limit: Option<u64>,
    ) -> Result<Vec<IdValues>> {
        let mut select = SelectStmt::from_table(model.table_name(), model.name.clone());
        if let Some(where_args) = where_args {
            let predicate = self.filters().build(model, &model.name, where_args)?;
            select.and_where(predicate);
        }
        if let Some(link) = parent {
            select.and_where(self.parent_predicate(model, link)?);
        }
        for id in &model.id_fields {
            select.projection.push(SelectItem::aliased(
                SqlExpr::col(model.name.clone(), id),
                id.clone(),
            ));
        }
        if !many {
            select.limit = Some(1);
        } else if let Some(limit) = limit {
            // Backends without UPDATE/DELETE LIMIT get the bound through the
            // id probe instead.
            select.limit = Some(limit);
        }

        let result = self
            .exec
            .exec_raw(Statement::select(
                select,
                StatementContext::new(&model.name, StatementOp::Read),
            ))
            .await?;
        result_id_values(model, &result)
    }

    /// Update-then-create upsert.
    pub async fn upsert_row(
        &self,
        model: &ModelDef,
        where_args: &Json,
        create: &Json,
        update: &Json,
    ) -> Result<IdValues> {
        let updated = self
            .update_rows(model, Some(where_args), update, None, false, false, None)
            .await?;
        match updated.into_iter().next() {
            Some(ids) => Ok(ids),
            None => self.create_row(model, create, None).await,
        }
    }

    /// Delete matching rows; returns the deleted id tuples.
    pub async fn delete_rows(
        &self,
        model: &ModelDef,
        where_args: Option<&Json>,
        parent: Option<ParentLink<'_>>,
        expect: bool,
        many: bool,
        limit: Option<u64>,
    ) -> Result<Vec<IdValues>> {
        let ids = self
            .resolve_affected_ids(model, where_args, parent.as_ref(), many, limit)
            .await?;
        if ids.is_empty() {
            if expect {
                return Err(Error::not_found(&model.name));
            }
            return Ok(Vec::new());
        }

        // Delegates delete through the base table; the FK cascade removes
        // descendant rows.
        let chain = self.schema.delegate_chain(&model.name)?;
        let table = chain.first().expect("chain non-empty");

        let stmt = DeleteStmt {
            table: table.table_name().to_string(),
            where_clause: Some(ids_predicate(table.table_name(), &table.id_fields, &ids)),
            returning: id_returning(table),
        };
        let result = self
            .exec
            .exec_mutation(
                MutationAction::Delete,
                table,
                Statement::delete(
                    stmt,
                    StatementContext::new(&table.name, StatementOp::Delete),
                ),
            )
            .await?;
        if expect && result.rows.is_empty() {
            return Err(Error::not_found(&model.name));
        }
        Ok(result_id_values(table, &result)?)
    }

    /// Batched scalar-only insert; returns (row count, ids).
    pub async fn create_many(
        &self,
        model: &ModelDef,
        rows: &[&Json],
        skip_duplicates: bool,
        parent: Option<&ParentLink<'_>>,
    ) -> Result<(u64, Vec<IdValues>)> {
        if model.base_model.is_some() {
            return Err(Error::Unsupported(
                "createMany on delegate descendants is not supported".to_string(),
            ));
        }
        if rows.is_empty() {
            return Ok((0, Vec::new()));
        }

        // FK columns injected by the initiating parent, if any.
        let mut parent_fk: Vec<(String, Value)> = Vec::new();
        if let Some(link) = parent {
            let (_, opposite) = self.schema.opposite_relation(link.model, link.field)?;
            if let Some(opp_rel) = opposite.relation.as_ref().filter(|r| r.is_owner()) {
                for (fk, reference) in opp_rel.fields.iter().zip(opp_rel.references.iter()) {
                    parent_fk.push((fk.clone(), link.value_of(reference)?));
                }
            }
        }

        // Union of columns across rows, preserving schema order.
        let mut row_maps: Vec<IndexMap<String, Value>> = Vec::new();
        for row in rows {
            let map = row
                .as_object()
                .ok_or_else(|| Error::internal("createMany row must be an object"))?;
            let mut columns: IndexMap<String, Value> = IndexMap::new();
            for (key, value) in map {
                let field = model
                    .field(key)
                    .ok_or_else(|| Error::internal(format!("unknown field '{}'", key)))?;
                columns.insert(key.clone(), self.bind_json(field, value)?);
            }
            for (fk, value) in &parent_fk {
                let field = model.field(fk).expect("FK field exists");
                columns.insert(fk.clone(), self.bind_value(field, value.clone()));
            }
            for field in model.fields.values() {
                if field.is_relation() || field.computed || columns.contains_key(&field.name)
                {
                    continue;
                }
                if let Some(value) = self.eval_default(field)? {
                    columns.insert(field.name.clone(), self.bind_value(field, value));
                }
            }
            row_maps.push(columns);
        }

        let mut all_columns: Vec<String> = Vec::new();
        for field in model.fields.values() {
            if row_maps.iter().any(|m| m.contains_key(&field.name)) {
                all_columns.push(field.name.clone());
            }
        }

        let values: Vec<Vec<SqlExpr>> = row_maps
            .iter()
            .map(|m| {
                all_columns
                    .iter()
                    .map(|c| SqlExpr::Param(m.get(c).cloned().unwrap_or(Value::Null)))
                    .collect()
            })
            .collect();

        let stmt = InsertStmt {
            table: model.table_name().to_string(),
            columns: all_columns,
            source: InsertSource::Values(values),
            on_conflict: skip_duplicates.then(|| OnConflict::DoNothing { targets: vec![] }),
            returning: id_returning(model),
        };
        let result = self
            .exec
            .exec_mutation(
                MutationAction::Create,
                model,
                Statement::insert(
                    stmt,
                    StatementContext::new(&model.name, StatementOp::Create),
                ),
            )
            .await?;

        let ids = result_id_values(model, &result)?;
        Ok((ids.len() as u64, ids))
    }
}

/// Normalize a to-many payload to a list of entries.
fn payload_items<'j>(field: &FieldDef, entry: &'j Json) -> Vec<&'j Json> {
    match entry {
        Json::Array(items) if field.is_to_many() => items.iter().collect(),
        other => vec![other],
    }
}

/// Split a nested `update` payload into (where, data).
fn split_update_payload(item: &Json) -> Result<(Option<&Json>, &Json)> {
    let map = item
        .as_object()
        .ok_or_else(|| Error::internal("update payload must be an object"))?;
    match map.get("data") {
        Some(data) => Ok((map.get("where"), data)),
        None => Ok((None, item)),
    }
}

fn single_id<'m>(model: &'m ModelDef) -> Result<&'m FieldDef> {
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
