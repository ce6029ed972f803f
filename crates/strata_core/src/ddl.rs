use crate::schema::*;
use crate::sql_dialect::SqlDialect;
use crate::{Error, Result};
use std::collections::HashSet;

/// Generate `CREATE TABLE` DDL for every model and implicit join table.
///
/// Dev-only bootstrap behind `push_schema`; not a migration engine. Tables
/// are emitted referenced-before-referencing so inline FK clauses resolve.
pub fn generate_schema_ddl(schema: &Schema, dialect: &dyn SqlDialect) -> Result<Vec<String>> {
    let ordered = order_models(schema);
    let mut statements = Vec::new();

    for model in &ordered {
        statements.push(create_table(schema, model, dialect)?);
    }

    let mut seen_join_tables = HashSet::new();
    for model in &ordered {
        for field in model.relation_fields() {
            if schema.is_many_to_many(model, field)? {
                let join = schema.join_table(model, field)?;
                if seen_join_tables.insert(join.table.clone()) {
                    statements.push(create_join_table(schema, &join, dialect)?);
                }
            }
        }
    }

    log::debug!(
        "generated {} DDL statement(s) for {} model(s)",
        statements.len(),
        schema.models.len()
    );
    Ok(statements)
}

/// Emit bases before descendants and referenced models before owners;
/// falls back to declaration order on cycles.
fn order_models(schema: &Schema) -> Vec<&ModelDef> {
    let mut ordered: Vec<&ModelDef> = Vec::new();
    let mut placed: HashSet<&str> = HashSet::new();

    let mut remaining: Vec<&ModelDef> = schema.models.values().collect();
    while !remaining.is_empty() {
        let before = ordered.len();
        remaining.retain(|&model| {
            let deps_ready = model_dependencies(model)
                .iter()
                .all(|dep| dep == &model.name || placed.contains(dep.as_str()));
            if deps_ready {
                placed.insert(model.name.as_str());
                ordered.push(model);
                false
            } else {
                true
            }
        });
        if ordered.len() == before {
            // Cycle: append the rest in declaration order.
            ordered.extend(remaining.iter().copied());
            break;
        }
    }
    ordered
}

fn model_dependencies(model: &ModelDef) -> Vec<String> {
    let mut deps = Vec::new();
    if let Some(base) = &model.base_model {
        deps.push(base.clone());
    }
    for field in model.relation_fields() {
        if let Some(relation) = &field.relation {
            if relation.is_owner() {
                if let Some(target) = field.field_type.model_name() {
                    deps.push(target.to_string());
                }
            }
        }
    }
    deps
}

fn column_type(
    schema: &Schema,
    model: &ModelDef,
    field: &FieldDef,
    dialect: &dyn SqlDialect,
) -> Result<String> {
    let builtin = match &field.field_type {
        FieldType::Builtin(b) => *b,
        FieldType::Enum(_) => BuiltinType::String,
        FieldType::TypeDef(_) => BuiltinType::Json,
        FieldType::Model(_) => {
            return Err(Error::internal(format!(
                "relation field {}.{} has no column",
                model.name, field.name
            )))
        }
    };

    // Single integer ids auto-generate when no explicit default is set.
    if field.is_id
        && model.id_fields.len() == 1
        && builtin == BuiltinType::Int
        && field.default.is_none()
    {
        return Ok(match schema.provider {
            SqlProvider::Sqlite => "INTEGER".to_string(),
            SqlProvider::Postgres => "INTEGER GENERATED BY DEFAULT AS IDENTITY".to_string(),
        });
    }

    Ok(dialect.field_sql_type(builtin, field.array))
}

fn create_table(
    schema: &Schema,
    model: &ModelDef,
    dialect: &dyn SqlDialect,
) -> Result<String> {
    let quote = |name: &str| dialect.quote_identifier(name);
    let mut lines: Vec<String> = Vec::new();

    for field in model.fields.values() {
        if field.is_relation() || field.computed {
            continue;
        }
        // Inherited non-id columns live on the declaring base table.
        if field.origin_model.is_some() {
            continue;
        }
        let mut line = format!(
            "{} {}",
            quote(&field.name),
            column_type(schema, model, field, dialect)?
        );
        if !field.optional {
            line.push_str(" NOT NULL");
        }
        if field.unique && !field.is_id {
            line.push_str(" UNIQUE");
        }
        lines.push(line);
    }

    let id_cols: Vec<String> = model.id_fields.iter().map(|f| quote(f)).collect();
    lines.push(format!("PRIMARY KEY ({})", id_cols.join(", ")));

    for (_, key) in &model.unique_fields {
        if let UniqueKey::Compound(fields) = key {
            if fields == &model.id_fields {
                continue;
            }
            let cols: Vec<String> = fields.iter().map(|f| quote(f)).collect();
            lines.push(format!("UNIQUE ({})", cols.join(", ")));
        }
    }

    for field in model.relation_fields() {
        let Some(relation) = &field.relation else {
            continue;
        };
        if !relation.is_owner() || field.origin_model.is_some() {
            continue;
        }
        let target = schema.model(
            field
                .field_type
                .model_name()
                .expect("relation field has model type"),
        )?;
        let fk_cols: Vec<String> = relation.fields.iter().map(|f| quote(f)).collect();
        let ref_cols: Vec<String> = relation.references.iter().map(|f| quote(f)).collect();
        let mut line = format!(
            "FOREIGN KEY ({}) REFERENCES {} ({})",
            fk_cols.join(", "),
            quote(target.table_name()),
            ref_cols.join(", ")
        );
        if let Some(action) = relation.on_delete {
            line.push_str(&format!(" ON DELETE {}", action.sql_keyword()));
        }
        if let Some(action) = relation.on_update {
            line.push_str(&format!(" ON UPDATE {}", action.sql_keyword()));
        }
        lines.push(line);
    }

    // Delegate descendants share the base's ids.
    if let Some(base_name) = &model.base_model {
        let base = schema.model(base_name)?;
        let id_refs: Vec<String> = base.id_fields.iter().map(|f| quote(f)).collect();
        lines.push(format!(
            "FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE CASCADE",
            id_cols.join(", "),
            quote(base.table_name()),
            id_refs.join(", ")
        ));
    }

    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote(model.table_name()),
        lines.join(", ")
    ))
}

fn create_join_table(
    schema: &Schema,
    join: &JoinTable,
    dialect: &dyn SqlDialect,
) -> Result<String> {
    let quote = |name: &str| dialect.quote_identifier(name);
    let a_model = schema.model(&join.a_model)?;
    let b_model = schema.model(&join.b_model)?;

    let a_id = single_id_field(a_model)?;
    let b_id = single_id_field(b_model)?;

    let a_type = dialect.field_sql_type(id_builtin(a_id), false);
    let b_type = dialect.field_sql_type(id_builtin(b_id), false);

    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} ({} {} NOT NULL REFERENCES {} ({}) ON DELETE CASCADE, {} {} NOT NULL REFERENCES {} ({}) ON DELETE CASCADE, PRIMARY KEY ({}, {}))",
        quote(&join.table),
        quote("A"),
        a_type,
        quote(a_model.table_name()),
        quote(&a_id.name),
        quote("B"),
        b_type,
        quote(b_model.table_name()),
        quote(&b_id.name),
        quote("A"),
        quote("B"),
    ))
}

fn single_id_field<'a>(model: &'a ModelDef) -> Result<&'a FieldDef> {
    if model.id_fields.len() != 1 {
        return Err(Error::Unsupported(format!(
            "implicit many-to-many requires a single-column id on '{}'",
            model.name
        )));
    }
    model
        .field(&model.id_fields[0])
        .ok_or_else(|| Error::internal(format!("missing id field on '{}'", model.name)))
}

fn id_builtin(field: &FieldDef) -> BuiltinType {
    field.field_type.as_builtin().unwrap_or(BuiltinType::String)
}
