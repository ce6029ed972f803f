use crate::convert::json_fits_builtin;
use crate::ops::Operation;
use serde_json::Value as Json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use strata_core::{
    BuiltinType, Error, FieldDef, FieldType, ModelDef, Result, Schema, ValidationIssue,
};

/// Validates client arguments against the shape each operation accepts.
///
/// Shapes are derived from the schema and memoized per model; the rest of
/// the engine assumes validated args. Failures carry the full issue list.
pub struct Validator {
    schema: Arc<Schema>,
    shapes: RwLock<HashMap<String, Arc<ModelShape>>>,
}

/// Precomputed per-model field classification.
struct ModelShape {
    scalars: HashSet<String>,
    relations: HashSet<String>,
    computed: HashSet<String>,
    /// Unique selectors: key name -> component fields.
    uniques: Vec<(String, Vec<String>)>,
    /// Discriminator of the delegate base chain, excluded from writes.
    discriminators: HashSet<String>,
}

impl Validator {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            shapes: RwLock::new(HashMap::new()),
        }
    }

    fn shape(&self, model: &ModelDef) -> Arc<ModelShape> {
        if let Some(shape) = self.shapes.read().expect("shape cache").get(&model.name) {
            return shape.clone();
        }

        let mut scalars = HashSet::new();
        let mut relations = HashSet::new();
        for field in model.fields.values() {
            if field.is_relation() {
                relations.insert(field.name.clone());
            } else if !field.computed {
                scalars.insert(field.name.clone());
            }
        }
        let computed: HashSet<String> = model.computed_fields.keys().cloned().collect();

        let uniques = model
            .unique_fields
            .iter()
            .map(|(name, key)| {
                (
                    name.clone(),
                    key.fields().iter().map(|f| f.to_string()).collect(),
                )
            })
            .collect();

        let mut discriminators = HashSet::new();
        if let Ok(chain) = self.schema.delegate_chain(&model.name) {
            for ancestor in chain {
                if let Some(d) = &ancestor.discriminator {
                    discriminators.insert(d.clone());
                }
            }
        }

        let shape = Arc::new(ModelShape {
            scalars,
            relations,
            computed,
            uniques,
            discriminators,
        });
        // Insertion is idempotent; a racing builder produces the same shape.
        self.shapes
            .write()
            .expect("shape cache")
            .insert(model.name.clone(), shape.clone());
        shape
    }

    /// Validate `args` for `operation` on `model`.
    pub fn validate(&self, model: &str, operation: Operation, args: &Json) -> Result<()> {
        let model_def = self.schema.model(model)?;
        let mut cx = Cx {
            schema: &self.schema,
            validator: self,
            issues: Vec::new(),
        };

        cx.check_operation(model_def, operation, args);

        if cx.issues.is_empty() {
            Ok(())
        } else {
            Err(Error::validation(model, operation.as_str(), cx.issues))
        }
    }
}

struct Cx<'a> {
    schema: &'a Schema,
    validator: &'a Validator,
    issues: Vec<ValidationIssue>,
}

impl<'a> Cx<'a> {
    fn issue(&mut self, path: &str, message: impl Into<String>) {
        self.issues.push(ValidationIssue::new(path, message));
    }

    fn check_operation(&mut self, model: &ModelDef, operation: Operation, args: &Json) {
        let Some(map) = args.as_object() else {
            self.issue("", "arguments must be an object");
            return;
        };

        let allowed: &[&str] = match operation {
            Operation::FindUnique
            | Operation::FindUniqueOrThrow
            | Operation::FindFirst
            | Operation::FindFirstOrThrow
            | Operation::FindMany => &[
                "where", "select", "include", "omit", "orderBy", "cursor", "distinct",
                "skip", "take",
            ],
            Operation::Create => &["data", "select", "include", "omit"],
            Operation::CreateMany => &["data", "skipDuplicates"],
            Operation::CreateManyAndReturn => {
                &["data", "skipDuplicates", "select", "include", "omit"]
            }
            Operation::Update => &["where", "data", "select", "include", "omit"],
            Operation::UpdateMany => &["where", "data", "limit"],
            Operation::UpdateManyAndReturn => {
                &["where", "data", "limit", "select", "include", "omit"]
            }
            Operation::Upsert => &["where", "create", "update", "select", "include", "omit"],
            Operation::Delete => &["where", "select", "include", "omit"],
            Operation::DeleteMany => &["where", "limit"],
            Operation::Count => &["where", "skip", "take", "orderBy", "select"],
            Operation::Aggregate => &[
                "where", "skip", "take", "orderBy", "cursor", "_count", "_avg", "_sum",
                "_min", "_max",
            ],
            Operation::GroupBy => &[
                "by", "where", "having", "orderBy", "skip", "take", "_count", "_avg",
                "_sum", "_min", "_max",
            ],
        };

        for key in map.keys() {
            if !allowed.contains(&key.as_str()) {
                self.issue(key, format!("unknown argument for {}", operation));
            }
        }

        if map.contains_key("select") && map.contains_key("include") {
            self.issue("select", "`select` and `include` are mutually exclusive");
        }
        if map.contains_key("select") && map.contains_key("omit") {
            self.issue("select", "`select` and `omit` are mutually exclusive");
        }

        match operation {
            Operation::FindUnique | Operation::FindUniqueOrThrow => {
                match map.get("where") {
                    Some(where_args) => self.check_unique_where(model, "where", where_args),
                    None => self.issue("where", "`where` is required"),
                }
            }
            Operation::Update | Operation::Delete | Operation::Upsert => {
                match map.get("where") {
                    Some(where_args) => self.check_unique_where(model, "where", where_args),
                    None => self.issue("where", "`where` is required"),
                }
            }
            _ => {
                if let Some(where_args) = map.get("where") {
                    self.check_where(model, "where", where_args);
                }
            }
        }

        match operation {
            Operation::Create => match map.get("data") {
                Some(data) => self.check_create_data(model, "data", data),
                None => self.issue("data", "`data` is required"),
            },
            Operation::CreateMany | Operation::CreateManyAndReturn => {
                match map.get("data") {
                    Some(Json::Array(rows)) => {
                        for (i, row) in rows.iter().enumerate() {
                            // Nested relation writes are not available in batch creates.
                            self.check_create_data_flat(
                                model,
                                &format!("data[{}]", i),
                                row,
                            );
                        }
                    }
                    Some(_) => self.issue("data", "`data` must be an array"),
                    None => self.issue("data", "`data` is required"),
                }
                if let Some(skip) = map.get("skipDuplicates") {
                    if !skip.is_boolean() {
                        self.issue("skipDuplicates", "must be a boolean");
                    }
                }
            }
            Operation::Update | Operation::UpdateMany | Operation::UpdateManyAndReturn => {
                match map.get("data") {
                    Some(data) => self.check_update_data(model, "data", data),
                    None => self.issue("data", "`data` is required"),
                }
            }
            Operation::Upsert => {
                match map.get("create") {
                    Some(data) => self.check_create_data(model, "create", data),
                    None => self.issue("create", "`create` is required"),
                }
                match map.get("update") {
                    Some(data) => self.check_update_data(model, "update", data),
                    None => self.issue("update", "`update` is required"),
                }
            }
            Operation::GroupBy => self.check_group_by(model, map),
            Operation::Count => {
                if let Some(select) = map.get("select") {
                    self.check_count_select(model, select);
                }
            }
            Operation::Aggregate => self.check_aggregate_selections(model, map),
            _ => {}
        }

        if let Some(select) = map.get("select") {
            if !matches!(operation, Operation::Count) {
                self.check_selection(model, "select", select, SelectionKind::Select);
            }
        }
        if let Some(include) = map.get("include") {
            self.check_selection(model, "include", include, SelectionKind::Include);
        }
        if let Some(omit) = map.get("omit") {
            self.check_selection(model, "omit", omit, SelectionKind::Omit);
        }
        if let Some(order_by) = map.get("orderBy") {
            // groupBy orders over grouped fields and aggregates; its own
            // check covers those.
            if operation != Operation::GroupBy {
                self.check_order_by(model, "orderBy", order_by);
            }
        }
        if let Some(cursor) = map.get("cursor") {
            self.check_unique_where(model, "cursor", cursor);
        }
        if let Some(distinct) = map.get("distinct") {
            self.check_distinct(model, distinct);
        }
        if let Some(skip) = map.get("skip") {
            match skip.as_i64() {
                Some(n) if n >= 0 => {}
                _ => self.issue("skip", "must be a non-negative integer"),
            }
        }
        if let Some(take) = map.get("take") {
            if take.as_i64().is_none() {
                self.issue("take", "must be an integer");
            }
        }
        if let Some(limit) = map.get("limit") {
            match limit.as_i64() {
                Some(n) if n >= 0 => {}
                _ => self.issue("limit", "must be a non-negative integer"),
            }
        }
    }

    // -- where ---------------------------------------------------------------

    fn check_where(&mut self, model: &ModelDef, path: &str, args: &Json) {
        let Some(map) = args.as_object() else {
            self.issue(path, "filter must be an object");
            return;
        };
        let shape = self.validator.shape(model);

        for (key, value) in map {
            let key_path = format!("{}.{}", path, key);
            match key.as_str() {
                "AND" | "OR" | "NOT" => match value {
                    Json::Array(items) => {
                        for (i, item) in items.iter().enumerate() {
                            self.check_where(model, &format!("{}[{}]", key_path, i), item);
                        }
                    }
                    Json::Object(_) => self.check_where(model, &key_path, value),
                    _ => self.issue(&key_path, "must be an object or array of objects"),
                },
                "$expr" => self.check_raw_expr(&key_path, value),
                _ => {
                    if shape.relations.contains(key.as_str()) {
                        let field = model.field(key).expect("relation exists");
                        self.check_relation_filter(model, field, &key_path, value);
                    } else if shape.scalars.contains(key.as_str())
                        || shape.computed.contains(key.as_str())
                    {
                        if let Some(field) = model.field(key) {
                            self.check_scalar_filter(field, &key_path, value);
                        }
                    } else {
                        self.issue(&key_path, format!("unknown field '{}'", key));
                    }
                }
            }
        }
    }

    fn check_raw_expr(&mut self, path: &str, value: &Json) {
        let Some(map) = value.as_object() else {
            self.issue(path, "$expr takes { sql, params? }");
            return;
        };
        if !map.get("sql").is_some_and(Json::is_string) {
            self.issue(path, "$expr.sql must be a string");
        }
        if let Some(params) = map.get("params") {
            if !params.is_array() {
                self.issue(path, "$expr.params must be an array");
            }
        }
        for key in map.keys() {
            if key != "sql" && key != "params" {
                self.issue(path, format!("unknown $expr key '{}'", key));
            }
        }
    }

    fn check_scalar_filter(&mut self, field: &FieldDef, path: &str, value: &Json) {
        if field.array {
            self.check_list_filter(field, path, value);
            return;
        }

        match value {
            Json::Object(map) => {
                for (op, operand) in map {
                    let op_path = format!("{}.{}", path, op);
                    match op.as_str() {
                        "equals" => self.check_scalar_value(field, &op_path, operand, true),
                        "lt" | "lte" | "gt" | "gte" => {
                            self.check_scalar_value(field, &op_path, operand, false)
                        }
                        "in" | "notIn" => match operand {
                            Json::Array(items) => {
                                for (i, item) in items.iter().enumerate() {
                                    self.check_scalar_value(
                                        field,
                                        &format!("{}[{}]", op_path, i),
                                        item,
                                        false,
                                    );
                                }
                            }
                            _ => self.issue(&op_path, "must be an array"),
                        },
                        "not" => {
                            // Recursive filter or direct value.
                            self.check_scalar_filter(field, &op_path, operand);
                        }
                        "startsWith" | "endsWith" | "contains" => {
                            if field.field_type.as_builtin() != Some(BuiltinType::String) {
                                self.issue(
                                    &op_path,
                                    "string operators require a String field",
                                );
                            } else if !operand.is_string() {
                                self.issue(&op_path, "must be a string");
                            }
                        }
                        "mode" => {
                            if operand.as_str() != Some("insensitive")
                                && operand.as_str() != Some("default")
                            {
                                self.issue(&op_path, "mode must be 'insensitive' or 'default'");
                            }
                        }
                        _ => self.issue(&op_path, format!("unknown filter operator '{}'", op)),
                    }
                }
            }
            other => self.check_scalar_value(field, path, other, true),
        }
    }

    fn check_list_filter(&mut self, field: &FieldDef, path: &str, value: &Json) {
        match value {
            Json::Object(map) => {
                for (op, operand) in map {
                    let op_path = format!("{}.{}", path, op);
                    match op.as_str() {
                        "equals" | "hasEvery" | "hasSome" => {
                            if !operand.is_array() {
                                self.issue(&op_path, "must be an array");
                            }
                        }
                        "has" => self.check_element_value(field, &op_path, operand),
                        "isEmpty" => {
                            if !operand.is_boolean() {
                                self.issue(&op_path, "must be a boolean");
                            }
                        }
                        _ => self.issue(&op_path, format!("unknown list operator '{}'", op)),
                    }
                }
            }
            Json::Array(_) => {}
            _ => self.issue(path, "list filter must be an array or operator object"),
        }
    }

    fn check_relation_filter(
        &mut self,
        model: &ModelDef,
        field: &FieldDef,
        path: &str,
        value: &Json,
    ) {
        let Ok((target, _)) = self.schema.opposite_relation(model, field) else {
            self.issue(path, "unresolvable relation");
            return;
        };

        if field.is_to_many() {
            let Some(map) = value.as_object() else {
                self.issue(path, "to-many filter takes { some | every | none }");
                return;
            };
            for (op, operand) in map {
                let op_path = format!("{}.{}", path, op);
                match op.as_str() {
                    "some" | "every" | "none" => self.check_where(target, &op_path, operand),
                    _ => self.issue(&op_path, format!("unknown relation operator '{}'", op)),
                }
            }
        } else {
            match value {
                Json::Null => {
                    let owns = field
                        .relation
                        .as_ref()
                        .is_some_and(|r| r.is_owner());
                    if !field.optional && owns {
                        self.issue(path, "relation is not nullable");
                    }
                }
                Json::Object(map) => {
                    let has_is = map.contains_key("is") || map.contains_key("isNot");
                    if has_is {
                        for (op, operand) in map {
                            let op_path = format!("{}.{}", path, op);
                            match op.as_str() {
                                "is" | "isNot" => {
                                    if operand.is_null() {
                                        continue;
                                    }
                                    self.check_where(target, &op_path, operand)
                                }
                                _ => self.issue(
                                    &op_path,
                                    "cannot mix `is`/`isNot` with direct fields",
                                ),
                            }
                        }
                    } else {
                        self.check_where(target, path, value);
                    }
                }
                _ => self.issue(path, "to-one filter must be an object or null"),
            }
        }
    }

    fn check_unique_where(&mut self, model: &ModelDef, path: &str, args: &Json) {
        let Some(map) = args.as_object() else {
            self.issue(path, "unique filter must be an object");
            return;
        };
        let shape = self.validator.shape(model);

        let mut satisfied = false;
        for (name, components) in &shape.uniques {
            if components.len() == 1 {
                if let Some(value) = map.get(&components[0]) {
                    if !value.is_null() && !value.is_object() {
                        satisfied = true;
                    }
                }
            } else if let Some(value) = map.get(name) {
                // Compound key: all component fields must be present.
                match value.as_object() {
                    Some(group) => {
                        let missing: Vec<&String> = components
                            .iter()
                            .filter(|c| !group.contains_key(*c))
                            .collect();
                        if missing.is_empty() {
                            satisfied = true;
                        } else {
                            self.issue(
                                &format!("{}.{}", path, name),
                                format!(
                                    "compound unique key is missing fields: {}",
                                    missing
                                        .iter()
                                        .map(|s| s.as_str())
                                        .collect::<Vec<_>>()
                                        .join(", ")
                                ),
                            );
                        }
                    }
                    None => self.issue(
                        &format!("{}.{}", path, name),
                        "compound unique key takes an object of its fields",
                    ),
                }
            }
        }

        // Remaining keys must still be valid filter fields.
        for (key, value) in map {
            if shape.uniques.iter().any(|(name, c)| name == key && c.len() > 1) {
                continue;
            }
            let key_path = format!("{}.{}", path, key);
            if shape.scalars.contains(key.as_str()) {
                if let Some(field) = model.field(key) {
                    self.check_scalar_filter(field, &key_path, value);
                }
            } else if shape.relations.contains(key.as_str()) {
                let field = model.field(key).expect("relation exists");
                self.check_relation_filter(model, field, &key_path, value);
            } else if key == "AND" || key == "OR" || key == "NOT" {
                match value {
                    Json::Array(items) => {
                        for (i, item) in items.iter().enumerate() {
                            self.check_where(model, &format!("{}[{}]", key_path, i), item);
                        }
                    }
                    Json::Object(_) => self.check_where(model, &key_path, value),
                    _ => self.issue(&key_path, "must be an object or array of objects"),
                }
            } else if key == "$expr" {
                self.check_raw_expr(&key_path, value);
            } else {
                self.issue(&key_path, format!("unknown field '{}'", key));
            }
        }

        if !satisfied {
            self.issue(
                path,
                "at least one unique field or compound unique group must be fully specified",
            );
        }
    }

    fn check_scalar_value(
        &mut self,
        field: &FieldDef,
        path: &str,
        value: &Json,
        allow_null: bool,
    ) {
        if value.is_null() {
            if !(allow_null && field.optional) {
                if !allow_null {
                    self.issue(path, "null is not allowed here");
                } else {
                    self.issue(path, "field is not nullable");
                }
            }
            return;
        }
        self.check_element_value(field, path, value);
    }

    fn check_element_value(&mut self, field: &FieldDef, path: &str, value: &Json) {
        match &field.field_type {
            FieldType::Builtin(builtin) => {
                if !json_fits_builtin(*builtin, value) {
                    self.issue(path, format!("expected {:?} value", builtin));
                }
            }
            FieldType::Enum(enum_name) => {
                let ok = value
                    .as_str()
                    .and_then(|m| self.schema.enum_def(enum_name).map(|e| e.has_member(m)))
                    .unwrap_or(false);
                if !ok {
                    self.issue(path, format!("expected member of enum '{}'", enum_name));
                }
            }
            FieldType::TypeDef(_) => {
                if !value.is_object() {
                    self.issue(path, "expected an object");
                }
            }
            FieldType::Model(_) => self.issue(path, "relation fields take relation filters"),
        }
    }

    // -- write data ----------------------------------------------------------

    fn check_create_data(&mut self, model: &ModelDef, path: &str, data: &Json) {
        let Some(map) = data.as_object() else {
            self.issue(path, "`data` must be an object");
            return;
        };
        let shape = self.validator.shape(model);

        for (key, value) in map {
            let key_path = format!("{}.{}", path, key);
            if shape.discriminators.contains(key.as_str()) {
                self.issue(&key_path, "the delegate discriminator is set by the engine");
            } else if shape.relations.contains(key.as_str()) {
                let field = model.field(key).expect("relation exists");
                self.check_nested_create(model, field, &key_path, value);
            } else if shape.scalars.contains(key.as_str()) {
                let field = model.field(key).expect("scalar exists");
                self.check_scalar_value(field, &key_path, value, true);
            } else {
                self.issue(&key_path, format!("unknown field '{}'", key));
            }
        }

        // Required scalars must be present unless generated or FK-backed.
        for field in model.scalar_fields() {
            if field.optional
                || field.default.is_some()
                || field.updated_at
                || !field.foreign_key_for.is_empty()
                || shape.discriminators.contains(&field.name)
            {
                continue;
            }
            if is_auto_generated_id(model, field) {
                continue;
            }
            if !map.contains_key(&field.name) {
                self.issue(
                    &format!("{}.{}", path, field.name),
                    "required field is missing",
                );
            }
        }
    }

    /// Batch-create rows: scalars only.
    fn check_create_data_flat(&mut self, model: &ModelDef, path: &str, data: &Json) {
        let Some(map) = data.as_object() else {
            self.issue(path, "each row must be an object");
            return;
        };
        let shape = self.validator.shape(model);
        for (key, value) in map {
            let key_path = format!("{}.{}", path, key);
            if shape.relations.contains(key.as_str()) {
                self.issue(&key_path, "nested relation writes are not allowed in createMany");
            } else if shape.scalars.contains(key.as_str())
                && !shape.discriminators.contains(key.as_str())
            {
                let field = model.field(key).expect("scalar exists");
                self.check_scalar_value(field, &key_path, value, true);
            } else {
                self.issue(&key_path, format!("unknown field '{}'", key));
            }
        }
    }

    fn check_update_data(&mut self, model: &ModelDef, path: &str, data: &Json) {
        let Some(map) = data.as_object() else {
            self.issue(path, "`data` must be an object");
            return;
        };
        let shape = self.validator.shape(model);

        for (key, value) in map {
            let key_path = format!("{}.{}", path, key);
            if shape.discriminators.contains(key.as_str()) {
                self.issue(&key_path, "the delegate discriminator cannot be updated");
            } else if shape.relations.contains(key.as_str()) {
                let field = model.field(key).expect("relation exists");
                self.check_nested_update(model, field, &key_path, value);
            } else if shape.scalars.contains(key.as_str()) {
                let field = model.field(key).expect("scalar exists");
                self.check_scalar_update(field, &key_path, value);
            } else {
                self.issue(&key_path, format!("unknown field '{}'", key));
            }
        }
    }

    fn check_scalar_update(&mut self, field: &FieldDef, path: &str, value: &Json) {
        let Some(map) = value.as_object() else {
            self.check_scalar_value(field, path, value, true);
            return;
        };

        let is_numeric = matches!(
            field.field_type.as_builtin(),
            Some(BuiltinType::Int)
                | Some(BuiltinType::Float)
                | Some(BuiltinType::BigInt)
                | Some(BuiltinType::Decimal)
        );

        let allowed: &[&str] = if field.array {
            &["set", "push"]
        } else if is_numeric {
            &["set", "increment", "decrement", "multiply", "divide"]
        } else {
            &["set"]
        };

        if map.len() != 1 {
            self.issue(path, "operator object must carry exactly one key");
            return;
        }
        let (op, operand) = map.iter().next().expect("one entry");
        if !allowed.contains(&op.as_str()) {
            self.issue(path, format!("operator '{}' is not valid for this field", op));
            return;
        }
        let op_path = format!("{}.{}", path, op);
        match op.as_str() {
            "set" => self.check_scalar_value(field, &op_path, operand, true),
            "push" => {
                // Single element or list of elements.
                if let Json::Array(items) = operand {
                    for (i, item) in items.iter().enumerate() {
                        self.check_element_value(field, &format!("{}[{}]", op_path, i), item);
                    }
                } else {
                    self.check_element_value(field, &op_path, operand);
                }
            }
            _ => {
                if !operand.is_number() && !operand.is_string() {
                    self.issue(&op_path, "must be a number");
                }
            }
        }
    }

    fn check_nested_create(
        &mut self,
        model: &ModelDef,
        field: &FieldDef,
        path: &str,
        value: &Json,
    ) {
        self.check_relation_actions(
            model,
            field,
            path,
            value,
            &["create", "connect", "connectOrCreate", "createMany"],
        );
    }

    fn check_nested_update(
        &mut self,
        model: &ModelDef,
        field: &FieldDef,
        path: &str,
        value: &Json,
    ) {
        self.check_relation_actions(
            model,
            field,
            path,
            value,
            &[
                "create",
                "connect",
                "connectOrCreate",
                "createMany",
                "disconnect",
                "delete",
                "update",
                "upsert",
                "set",
                "updateMany",
                "deleteMany",
            ],
        );
    }

    fn check_relation_actions(
        &mut self,
        model: &ModelDef,
        field: &FieldDef,
        path: &str,
        value: &Json,
        allowed: &[&str],
    ) {
        let Ok((target, _)) = self.schema.opposite_relation(model, field) else {
            self.issue(path, "unresolvable relation");
            return;
        };
        let Some(map) = value.as_object() else {
            self.issue(path, "relation payload must be an object of actions");
            return;
        };

        for (action, payload) in map {
            let action_path = format!("{}.{}", path, action);
            if !allowed.contains(&action.as_str()) {
                self.issue(
                    &action_path,
                    format!("relation action '{}' is not allowed here", action),
                );
                continue;
            }
            match action.as_str() {
                "create" => self.for_each_payload(field, &action_path, payload, |cx, p, v| {
                    cx.check_create_data(target, p, v)
                }),
                "connect" => self.for_each_payload(field, &action_path, payload, |cx, p, v| {
                    cx.check_unique_where(target, p, v)
                }),
                "connectOrCreate" => {
                    self.for_each_payload(field, &action_path, payload, |cx, p, v| {
                        let Some(entry) = v.as_object() else {
                            cx.issue(p, "connectOrCreate takes { where, create }");
                            return;
                        };
                        match entry.get("where") {
                            Some(w) => cx.check_unique_where(target, &format!("{}.where", p), w),
                            None => cx.issue(p, "`where` is required"),
                        }
                        match entry.get("create") {
                            Some(c) => cx.check_create_data(target, &format!("{}.create", p), c),
                            None => cx.issue(p, "`create` is required"),
                        }
                    })
                }
                "createMany" => {
                    if !field.is_to_many() {
                        self.issue(&action_path, "createMany requires a to-many relation");
                        continue;
                    }
                    let Some(entry) = payload.as_object() else {
                        self.issue(&action_path, "createMany takes { data, skipDuplicates? }");
                        continue;
                    };
                    match entry.get("data") {
                        Some(Json::Array(rows)) => {
                            for (i, row) in rows.iter().enumerate() {
                                self.check_create_data_flat(
                                    target,
                                    &format!("{}.data[{}]", action_path, i),
                                    row,
                                );
                            }
                        }
                        _ => self.issue(&action_path, "`data` must be an array"),
                    }
                }
                "disconnect" | "delete" => {
                    if field.is_to_many() {
                        self.for_each_payload(field, &action_path, payload, |cx, p, v| {
                            cx.check_unique_where(target, p, v)
                        });
                    } else if !payload.is_boolean() && !payload.is_object() {
                        self.issue(&action_path, "must be a boolean or a filter");
                    }
                }
                "set" => {
                    if !field.is_to_many() {
                        self.issue(&action_path, "set requires a to-many relation");
                    } else {
                        self.for_each_payload(field, &action_path, payload, |cx, p, v| {
                            cx.check_unique_where(target, p, v)
                        });
                    }
                }
                "update" => {
                    if field.is_to_many() {
                        self.for_each_payload(field, &action_path, payload, |cx, p, v| {
                            let Some(entry) = v.as_object() else {
                                cx.issue(p, "update takes { where, data }");
                                return;
                            };
                            match entry.get("where") {
                                Some(w) => {
                                    cx.check_unique_where(target, &format!("{}.where", p), w)
                                }
                                None => cx.issue(p, "`where` is required"),
                            }
                            match entry.get("data") {
                                Some(d) => {
                                    cx.check_update_data(target, &format!("{}.data", p), d)
                                }
                                None => cx.issue(p, "`data` is required"),
                            }
                        });
                    } else {
                        // To-one: bare data or { where?, data }.
                        let entry = payload.as_object();
                        match entry.and_then(|e| e.get("data")) {
                            Some(d) => {
                                self.check_update_data(target, &format!("{}.data", action_path), d)
                            }
                            None => self.check_update_data(target, &action_path, payload),
                        }
                    }
                }
                "upsert" => self.for_each_payload(field, &action_path, payload, |cx, p, v| {
                    let Some(entry) = v.as_object() else {
                        cx.issue(p, "upsert takes { create, update }");
                        return;
                    };
                    match entry.get("create") {
                        Some(c) => cx.check_create_data(target, &format!("{}.create", p), c),
                        None => cx.issue(p, "`create` is required"),
                    }
                    match entry.get("update") {
                        Some(u) => cx.check_update_data(target, &format!("{}.update", p), u),
                        None => cx.issue(p, "`update` is required"),
                    }
                }),
                "updateMany" => self.for_each_payload(field, &action_path, payload, |cx, p, v| {
                    let Some(entry) = v.as_object() else {
                        cx.issue(p, "updateMany takes { where, data }");
                        return;
                    };
                    if let Some(w) = entry.get("where") {
                        cx.check_where(target, &format!("{}.where", p), w);
                    }
                    match entry.get("data") {
                        Some(d) => cx.check_update_data(target, &format!("{}.data", p), d),
                        None => cx.issue(p, "`data` is required"),
                    }
                }),
                "deleteMany" => self.for_each_payload(field, &action_path, payload, |cx, p, v| {
                    cx.check_where(target, p, v)
                }),
                _ => unreachable!("allowed list is exhaustive"),
            }
        }
    }

    fn for_each_payload<F>(&mut self, field: &FieldDef, path: &str, payload: &Json, mut f: F)
    where
        F: FnMut(&mut Self, &str, &Json),
    {
        match payload {
            Json::Array(items) if field.is_to_many() => {
                for (i, item) in items.iter().enumerate() {
                    f(self, &format!("{}[{}]", path, i), item);
                }
            }
            Json::Array(_) => self.issue(path, "array payload requires a to-many relation"),
            other => f(self, path, other),
        }
    }

    // -- selection -----------------------------------------------------------

    fn check_selection(&mut self, model: &ModelDef, path: &str, value: &Json, kind: SelectionKind) {
        let Some(map) = value.as_object() else {
            self.issue(path, "must be an object");
            return;
        };
        let shape = self.validator.shape(model);

        for (key, entry) in map {
            let key_path = format!("{}.{}", path, key);
            if key == "_count" {
                if kind == SelectionKind::Omit {
                    self.issue(&key_path, "_count cannot be omitted");
                }
                continue;
            }
            if shape.relations.contains(key.as_str()) {
                if kind == SelectionKind::Omit {
                    self.issue(&key_path, "omit only applies to scalar fields");
                    continue;
                }
                let field = model.field(key).expect("relation exists");
                let Ok((target, _)) = self.schema.opposite_relation(model, field) else {
                    continue;
                };
                match entry {
                    Json::Bool(_) => {}
                    Json::Object(_) => {
                        self.check_nested_find_args(target, &key_path, entry);
                    }
                    _ => self.issue(&key_path, "must be true or a nested selection"),
                }
            } else if shape.scalars.contains(key.as_str())
                || shape.computed.contains(key.as_str())
            {
                match kind {
                    SelectionKind::Include => {
                        self.issue(&key_path, "include only applies to relations")
                    }
                    _ => {
                        if !entry.is_boolean() {
                            self.issue(&key_path, "must be a boolean");
                        }
                    }
                }
            } else {
                self.issue(&key_path, format!("unknown field '{}'", key));
            }
        }
    }

    fn check_nested_find_args(&mut self, model: &ModelDef, path: &str, args: &Json) {
        let Some(map) = args.as_object() else {
            self.issue(path, "must be an object");
            return;
        };
        for (key, value) in map {
            let key_path = format!("{}.{}", path, key);
            match key.as_str() {
                "where" => self.check_where(model, &key_path, value),
                "select" => self.check_selection(model, &key_path, value, SelectionKind::Select),
                "include" => {
                    self.check_selection(model, &key_path, value, SelectionKind::Include)
                }
                "omit" => self.check_selection(model, &key_path, value, SelectionKind::Omit),
                "orderBy" => self.check_order_by(model, &key_path, value),
                "cursor" => self.check_unique_where(model, &key_path, value),
                "distinct" => self.check_distinct(model, value),
                "skip" | "take" => {
                    if value.as_i64().is_none() {
                        self.issue(&key_path, "must be an integer");
                    }
                }
                _ => self.issue(&key_path, format!("unknown argument '{}'", key)),
            }
        }
        if map.contains_key("select") && map.contains_key("include") {
            self.issue(path, "`select` and `include` are mutually exclusive");
        }
    }

    fn check_order_by(&mut self, model: &ModelDef, path: &str, value: &Json) {
        match value {
            Json::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    self.check_order_by_entry(model, &format!("{}[{}]", path, i), item);
                }
            }
            other => self.check_order_by_entry(model, path, other),
        }
    }

    fn check_order_by_entry(&mut self, model: &ModelDef, path: &str, value: &Json) {
        let Some(map) = value.as_object() else {
            self.issue(path, "orderBy entries are { field: 'asc' | 'desc' }");
            return;
        };
        let shape = self.validator.shape(model);
        for (key, dir) in map {
            let key_path = format!("{}.{}", path, key);
            if !shape.scalars.contains(key.as_str()) && !shape.computed.contains(key.as_str()) {
                self.issue(&key_path, format!("unknown field '{}'", key));
                continue;
            }
            if dir.as_str() != Some("asc") && dir.as_str() != Some("desc") {
                self.issue(&key_path, "direction must be 'asc' or 'desc'");
            }
        }
    }

    fn check_distinct(&mut self, model: &ModelDef, value: &Json) {
        let shape = self.validator.shape(model);
        let mut check_one = |cx: &mut Self, entry: &Json| {
            if let Some(name) = entry.as_str() {
                if !shape.scalars.contains(name) {
                    cx.issue("distinct", format!("unknown field '{}'", name));
                }
            } else {
                cx.issue("distinct", "must name scalar fields");
            }
        };
        match value {
            Json::Array(items) => {
                for item in items {
                    check_one(self, item);
                }
            }
            other => check_one(self, other),
        }
    }

    fn check_count_select(&mut self, model: &ModelDef, value: &Json) {
        match value {
            Json::Bool(_) => {}
            Json::Object(map) => {
                let shape = self.validator.shape(model);
                for key in map.keys() {
                    if key != "_all" && !shape.scalars.contains(key.as_str()) {
                        self.issue(
                            &format!("select.{}", key),
                            format!("unknown field '{}'", key),
                        );
                    }
                }
            }
            _ => self.issue("select", "must be true or a field map"),
        }
    }

    fn check_aggregate_selections(
        &mut self,
        model: &ModelDef,
        map: &serde_json::Map<String, Json>,
    ) {
        let shape = self.validator.shape(model);
        for agg in ["_count", "_avg", "_sum", "_min", "_max"] {
            let Some(value) = map.get(agg) else { continue };
            match value {
                Json::Bool(_) if agg == "_count" => {}
                Json::Object(fields) => {
                    for key in fields.keys() {
                        if agg == "_count" && key == "_all" {
                            continue;
                        }
                        if !shape.scalars.contains(key.as_str()) {
                            self.issue(
                                &format!("{}.{}", agg, key),
                                format!("unknown field '{}'", key),
                            );
                        }
                    }
                }
                _ => self.issue(agg, "must be a field map"),
            }
        }
    }

    fn check_group_by(&mut self, model: &ModelDef, map: &serde_json::Map<String, Json>) {
        let shape = self.validator.shape(model);

        let mut by_fields: Vec<String> = Vec::new();
        match map.get("by") {
            Some(Json::String(field)) => by_fields.push(field.clone()),
            Some(Json::Array(items)) => {
                for item in items {
                    match item.as_str() {
                        Some(field) => by_fields.push(field.to_string()),
                        None => self.issue("by", "must name scalar fields"),
                    }
                }
            }
            Some(_) => self.issue("by", "must be a field name or array of field names"),
            None => self.issue("by", "`by` is required"),
        }
        for field in &by_fields {
            if !shape.scalars.contains(field.as_str()) {
                self.issue("by", format!("unknown field '{}'", field));
            }
        }

        self.check_aggregate_selections(model, map);

        // Any field referenced in having/orderBy must be grouped or aggregated.
        if let Some(having) = map.get("having") {
            if let Some(conditions) = having.as_object() {
                for key in conditions.keys() {
                    let is_aggregate = key.starts_with('_');
                    if !is_aggregate && !by_fields.iter().any(|f| f == key) {
                        self.issue(
                            &format!("having.{}", key),
                            "field must appear in `by` or be an aggregation",
                        );
                    }
                }
            } else {
                self.issue("having", "must be an object");
            }
        }
        if let Some(order_by) = map.get("orderBy") {
            let entries: Vec<&Json> = match order_by {
                Json::Array(items) => items.iter().collect(),
                other => vec![other],
            };
            for entry in entries {
                if let Some(keys) = entry.as_object() {
                    for key in keys.keys() {
                        let is_aggregate = key.starts_with('_');
                        if !is_aggregate && !by_fields.iter().any(|f| f == key) {
                            self.issue(
                                &format!("orderBy.{}", key),
                                "field must appear in `by` or be an aggregation",
                            );
                        }
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SelectionKind {
    Select,
    Include,
    Omit,
}

/// Single integer ids auto-generate at the backend.
fn is_auto_generated_id(model: &ModelDef, field: &FieldDef) -> bool {
    field.is_id
        && model.id_fields.len() == 1
        && field.field_type.as_builtin() == Some(BuiltinType::Int)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strata_core::{FieldBuilder, ModelBuilder, SchemaBuilder, SqlProvider};

    fn schema() -> Arc<Schema> {
        Arc::new(
            SchemaBuilder::new(SqlProvider::Sqlite)
                .model(
                    ModelBuilder::new("User")
                        .field(FieldBuilder::id_cuid("id"))
                        .field(FieldBuilder::string("email").unique())
                        .field(FieldBuilder::int("age").optional())
                        .field(FieldBuilder::string("org"))
                        .field(FieldBuilder::string("handle"))
                        .compound_unique(&["org", "handle"], None)
                        .field(FieldBuilder::relation_many("posts", "Post", "author")),
                )
                .model(
                    ModelBuilder::new("Post")
                        .field(FieldBuilder::id_cuid("id"))
                        .field(FieldBuilder::string("title"))
                        .field(FieldBuilder::boolean("published").default_value(
                            strata_core::Value::Bool(false),
                        ))
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
                .unwrap(),
        )
    }

    fn validator() -> Validator {
        Validator::new(schema())
    }

    #[test]
    fn accepts_basic_find_many() {
        let v = validator();
        let args = json!({
            "where": { "email": { "contains": "u1" } },
            "orderBy": { "email": "asc" },
            "take": 2
        });
        v.validate("User", Operation::FindMany, &args).unwrap();
    }

    #[test]
    fn rejects_select_with_include() {
        let v = validator();
        let args = json!({
            "select": { "id": true },
            "include": { "posts": true }
        });
        let err = v.validate("User", Operation::FindMany, &args).unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn find_unique_requires_complete_unique_filter() {
        let v = validator();
        v.validate("User", Operation::FindUnique, &json!({ "where": { "email": "a@b.c" } }))
            .unwrap();

        // Partial compound unique is a validation error, not an empty match.
        let err = v
            .validate(
                "User",
                Operation::FindUnique,
                &json!({ "where": { "org_handle": { "org": "acme" } } }),
            )
            .unwrap_err();
        assert!(err.to_string().contains("missing fields"));

        let err = v
            .validate("User", Operation::FindUnique, &json!({ "where": { "age": 3 } }))
            .unwrap_err();
        assert!(err.to_string().contains("unique"));
    }

    #[test]
    fn rejects_negative_skip_and_unknown_fields() {
        let v = validator();
        let err = v
            .validate("User", Operation::FindMany, &json!({ "skip": -1 }))
            .unwrap_err();
        assert!(err.to_string().contains("non-negative"));

        let err = v
            .validate("User", Operation::FindMany, &json!({ "where": { "nope": 1 } }))
            .unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn negative_take_is_accepted() {
        let v = validator();
        v.validate("User", Operation::FindMany, &json!({ "take": -2 }))
            .unwrap();
    }

    #[test]
    fn create_requires_required_scalars() {
        let v = validator();
        // `title` has no default and is not FK-backed.
        let err = v
            .validate("Post", Operation::Create, &json!({ "data": {} }))
            .unwrap_err();
        assert!(err.to_string().contains("required field is missing"));

        // FK-backed and defaulted fields may stay absent.
        v.validate(
            "Post",
            Operation::Create,
            &json!({ "data": { "title": "P" } }),
        )
        .unwrap();
    }

    #[test]
    fn update_operator_objects_take_one_key() {
        let v = validator();
        let err = v
            .validate(
                "User",
                Operation::Update,
                &json!({
                    "where": { "email": "a@b.c" },
                    "data": { "age": { "increment": 1, "set": 2 } }
                }),
            )
            .unwrap_err();
        assert!(err.to_string().contains("exactly one key"));
    }

    #[test]
    fn nested_create_payloads_are_validated() {
        let v = validator();
        v.validate(
            "User",
            Operation::Create,
            &json!({
                "data": {
                    "email": "a@b.c",
                    "org": "acme",
                    "handle": "a",
                    "posts": { "create": { "title": "P1" } }
                }
            }),
        )
        .unwrap();

        let err = v
            .validate(
                "User",
                Operation::Create,
                &json!({
                    "data": {
                        "email": "a@b.c",
                        "org": "acme",
                        "handle": "a",
                        "posts": { "explode": {} }
                    }
                }),
            )
            .unwrap_err();
        assert!(err.to_string().contains("explode"));
    }

    #[test]
    fn group_by_checks_coverage() {
        let v = validator();
        let err = v
            .validate(
                "User",
                Operation::GroupBy,
                &json!({ "by": "org", "orderBy": { "handle": "asc" } }),
            )
            .unwrap_err();
        assert!(err.to_string().contains("must appear in `by`"));
    }
}
