use crate::expr::Expr;
use crate::schema::*;
use crate::{Error, Result, Value};
use indexmap::IndexMap;
use std::collections::HashMap;

/// Fluent construction of a `Schema`.
///
/// The engine consumes a pre-built schema object; this builder is how
/// embedding code (and tests) produce one. `build` checks the structural
/// invariants the rest of the engine relies on.
pub struct SchemaBuilder {
    provider: SqlProvider,
    models: Vec<ModelBuilder>,
    enums: IndexMap<String, EnumDef>,
    type_defs: IndexMap<String, TypeDefDef>,
    auth_model: Option<String>,
    plugin_config: HashMap<String, serde_json::Value>,
}

impl SchemaBuilder {
    pub fn new(provider: SqlProvider) -> Self {
        Self {
            provider,
            models: Vec::new(),
            enums: IndexMap::new(),
            type_defs: IndexMap::new(),
            auth_model: None,
            plugin_config: HashMap::new(),
        }
    }

    pub fn model(mut self, model: ModelBuilder) -> Self {
        self.models.push(model);
        self
    }

    pub fn enum_def(mut self, name: impl Into<String>, members: &[&str]) -> Self {
        let name = name.into();
        self.enums.insert(
            name.clone(),
            EnumDef {
                name,
                members: members.iter().map(|m| m.to_string()).collect(),
            },
        );
        self
    }

    pub fn type_def(mut self, name: impl Into<String>, fields: Vec<FieldBuilder>) -> Self {
        let name = name.into();
        let mut map = IndexMap::new();
        for f in fields {
            let def = f.build();
            map.insert(def.name.clone(), def);
        }
        self.type_defs
            .insert(name.clone(), TypeDefDef { name, fields: map });
        self
    }

    pub fn auth_model(mut self, name: impl Into<String>) -> Self {
        self.auth_model = Some(name.into());
        self
    }

    pub fn plugin_config(
        mut self,
        plugin: impl Into<String>,
        config: serde_json::Value,
    ) -> Self {
        self.plugin_config.insert(plugin.into(), config);
        self
    }

    pub fn build(self) -> Result<Schema> {
        let mut models = IndexMap::new();
        for builder in self.models {
            let model = builder.build()?;
            models.insert(model.name.clone(), model);
        }

        inherit_delegate_fields(&mut models)?;
        link_foreign_keys(&mut models);

        let schema = Schema {
            provider: self.provider,
            models,
            enums: self.enums,
            type_defs: self.type_defs,
            auth_model: self.auth_model,
            plugin_config: self.plugin_config,
        };
        validate_schema(&schema)?;
        Ok(schema)
    }
}

/// Copy delegate-base fields down into each descendant.
///
/// Id fields become physical columns on the descendant; every other
/// inherited field keeps `origin_model` pointing at the declaring base so
/// the planner routes access through the base table.
fn inherit_delegate_fields(models: &mut IndexMap<String, ModelDef>) -> Result<()> {
    let names: Vec<String> = models.keys().cloned().collect();
    for name in names {
        let mut chain = Vec::new();
        let mut current = name.clone();
        while let Some(base_name) = models
            .get(&current)
            .and_then(|m| m.base_model.clone())
        {
            if chain.contains(&base_name) || base_name == name {
                return Err(Error::internal(format!(
                    "delegate cycle through model '{}'",
                    base_name
                )));
            }
            chain.push(base_name.clone());
            current = base_name;
        }

        for base_name in chain {
            let base = models
                .get(&base_name)
                .ok_or_else(|| Error::internal(format!("unknown base model '{}'", base_name)))?
                .clone();
            let target = models.get_mut(&name).expect("model exists");

            for (field_name, field) in &base.fields {
                if target.fields.contains_key(field_name) {
                    continue;
                }
                let mut inherited = field.clone();
                if field.is_id {
                    inherited.origin_model = None;
                } else {
                    inherited.origin_model = Some(base.name.clone());
                }
                target.fields.insert(field_name.clone(), inherited);
            }
            if target.id_fields.is_empty() {
                target.id_fields = base.id_fields.clone();
            }
        }
    }
    Ok(())
}

/// Mark scalar columns that back relation FK fields.
fn link_foreign_keys(models: &mut IndexMap<String, ModelDef>) {
    let names: Vec<String> = models.keys().cloned().collect();
    for name in names {
        let model = models.get(&name).expect("model exists").clone();
        let mut backing: Vec<(String, String)> = Vec::new();
        for field in model.relation_fields() {
            if let Some(relation) = &field.relation {
                for fk in &relation.fields {
                    backing.push((fk.clone(), field.name.clone()));
                }
            }
        }
        let target = models.get_mut(&name).expect("model exists");
        for (fk, relation_field) in backing {
            if let Some(scalar) = target.fields.get_mut(&fk) {
                if !scalar.foreign_key_for.contains(&relation_field) {
                    scalar.foreign_key_for.push(relation_field);
                }
            }
        }
    }
}

fn validate_schema(schema: &Schema) -> Result<()> {
    for model in schema.models.values() {
        if model.id_fields.is_empty() {
            return Err(Error::internal(format!(
                "model '{}' has no id fields",
                model.name
            )));
        }
        for id_field in &model.id_fields {
            if model.field(id_field).is_none() {
                return Err(Error::internal(format!(
                    "model '{}' id field '{}' is not declared",
                    model.name, id_field
                )));
            }
        }
        for field in model.relation_fields() {
            let target = field
                .field_type
                .model_name()
                .expect("relation field has model type");
            if !schema.models.contains_key(target) {
                return Err(Error::internal(format!(
                    "relation {}.{} targets unknown model '{}'",
                    model.name, field.name, target
                )));
            }
            schema.opposite_relation(model, field)?;
        }
        if model.is_delegate && model.discriminator.is_none() {
            return Err(Error::internal(format!(
                "delegate model '{}' has no discriminator",
                model.name
            )));
        }
    }
    Ok(())
}

/// Builds one model.
pub struct ModelBuilder {
    name: String,
    fields: Vec<FieldBuilder>,
    compound_id: Option<Vec<String>>,
    compound_uniques: Vec<(Option<String>, Vec<String>)>,
    base_model: Option<String>,
    is_delegate: bool,
    discriminator: Option<String>,
    attributes: Vec<Attribute>,
    computed_fields: IndexMap<String, ComputedFieldDef>,
}

impl ModelBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            compound_id: None,
            compound_uniques: Vec::new(),
            base_model: None,
            is_delegate: false,
            discriminator: None,
            attributes: Vec::new(),
            computed_fields: IndexMap::new(),
        }
    }

    pub fn field(mut self, field: FieldBuilder) -> Self {
        self.fields.push(field);
        self
    }

    /// `@@id([a, b])`.
    pub fn compound_id(mut self, fields: &[&str]) -> Self {
        self.compound_id = Some(fields.iter().map(|f| f.to_string()).collect());
        self
    }

    /// `@@unique([a, b], name?)`.
    pub fn compound_unique(mut self, fields: &[&str], name: Option<&str>) -> Self {
        self.compound_uniques.push((
            name.map(|n| n.to_string()),
            fields.iter().map(|f| f.to_string()).collect(),
        ));
        self
    }

    /// `@@delegate(discriminator)`.
    pub fn delegate(mut self, discriminator: impl Into<String>) -> Self {
        self.is_delegate = true;
        self.discriminator = Some(discriminator.into());
        self
    }

    /// Declare this model a delegate descendant of `base`.
    pub fn extends(mut self, base: impl Into<String>) -> Self {
        self.base_model = Some(base.into());
        self
    }

    /// `@@allow('<ops>', expr)`.
    pub fn allow(mut self, ops: &str, expr: Expr) -> Self {
        self.attributes.push(Attribute::new(
            "@@allow",
            vec![Expr::string(ops), expr],
        ));
        self
    }

    /// `@@deny('<ops>', expr)`.
    pub fn deny(mut self, ops: &str, expr: Expr) -> Self {
        self.attributes.push(Attribute::new(
            "@@deny",
            vec![Expr::string(ops), expr],
        ));
        self
    }

    pub fn attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn computed(mut self, def: ComputedFieldDef) -> Self {
        self.computed_fields.insert(def.name.clone(), def);
        self
    }

    fn build(self) -> Result<ModelDef> {
        let mut fields = IndexMap::new();
        for builder in self.fields {
            let def = builder.build();
            fields.insert(def.name.clone(), def);
        }

        let id_fields: Vec<String> = match self.compound_id {
            Some(compound) => compound,
            None => fields
                .values()
                .filter(|f| f.is_id)
                .map(|f| f.name.clone())
                .collect(),
        };

        let mut unique_fields = IndexMap::new();
        for field in fields.values() {
            if field.unique || field.is_id {
                unique_fields.insert(
                    field.name.clone(),
                    UniqueKey::Single(field.name.clone()),
                );
            }
        }
        if id_fields.len() > 1 {
            unique_fields.insert(
                UniqueKey::synthesized_name(&id_fields),
                UniqueKey::Compound(id_fields.clone()),
            );
        }
        for (name, group) in self.compound_uniques {
            let key_name = name.unwrap_or_else(|| UniqueKey::synthesized_name(&group));
            unique_fields.insert(key_name, UniqueKey::Compound(group));
        }

        Ok(ModelDef {
            name: self.name,
            fields,
            id_fields,
            unique_fields,
            base_model: self.base_model,
            is_delegate: self.is_delegate,
            discriminator: self.discriminator,
            attributes: self.attributes,
            computed_fields: self.computed_fields,
        })
    }
}

/// Builds one field.
pub struct FieldBuilder {
    def: FieldDef,
}

impl FieldBuilder {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            def: FieldDef {
                name: name.into(),
                field_type,
                is_id: false,
                unique: false,
                array: false,
                optional: false,
                updated_at: false,
                computed: false,
                default: None,
                relation: None,
                foreign_key_for: Vec::new(),
                origin_model: None,
            },
        }
    }

    // -- scalar conveniences --

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Builtin(BuiltinType::String))
    }

    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Builtin(BuiltinType::Int))
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Builtin(BuiltinType::Float))
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Builtin(BuiltinType::Boolean))
    }

    pub fn date_time(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Builtin(BuiltinType::DateTime))
    }

    pub fn big_int(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Builtin(BuiltinType::BigInt))
    }

    pub fn decimal(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Builtin(BuiltinType::Decimal))
    }

    pub fn bytes(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Builtin(BuiltinType::Bytes))
    }

    pub fn json(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Builtin(BuiltinType::Json))
    }

    pub fn enum_field(name: impl Into<String>, enum_name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Enum(enum_name.into()))
    }

    /// Int id.
    pub fn id_int(name: impl Into<String>) -> Self {
        Self::int(name).id()
    }

    /// String id with a `cuid()` default.
    pub fn id_cuid(name: impl Into<String>) -> Self {
        Self::string(name).id().default(DefaultValue::Cuid)
    }

    // -- relation conveniences --

    /// Owner side of a to-one relation: this model carries the FK columns.
    pub fn relation_owner(
        name: impl Into<String>,
        target: impl Into<String>,
        opposite: impl Into<String>,
        fk_fields: &[&str],
        references: &[&str],
    ) -> Self {
        let mut builder = Self::new(name, FieldType::Model(target.into()));
        builder.def.relation = Some(RelationDef {
            name: None,
            fields: fk_fields.iter().map(|f| f.to_string()).collect(),
            references: references.iter().map(|f| f.to_string()).collect(),
            opposite: Some(opposite.into()),
            on_delete: None,
            on_update: None,
        });
        builder
    }

    /// Non-owner to-one back-reference.
    pub fn relation_one(
        name: impl Into<String>,
        target: impl Into<String>,
        opposite: impl Into<String>,
    ) -> Self {
        let mut builder = Self::new(name, FieldType::Model(target.into()));
        builder.def.optional = true;
        builder.def.relation = Some(RelationDef {
            opposite: Some(opposite.into()),
            ..RelationDef::default()
        });
        builder
    }

    /// To-many relation side.
    pub fn relation_many(
        name: impl Into<String>,
        target: impl Into<String>,
        opposite: impl Into<String>,
    ) -> Self {
        let mut builder = Self::new(name, FieldType::Model(target.into()));
        builder.def.array = true;
        builder.def.relation = Some(RelationDef {
            opposite: Some(opposite.into()),
            ..RelationDef::default()
        });
        builder
    }

    // -- flags --

    pub fn id(mut self) -> Self {
        self.def.is_id = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.def.unique = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.def.optional = true;
        self
    }

    pub fn array(mut self) -> Self {
        self.def.array = true;
        self
    }

    pub fn updated_at(mut self) -> Self {
        self.def.updated_at = true;
        self
    }

    pub fn default(mut self, default: DefaultValue) -> Self {
        self.def.default = Some(default);
        self
    }

    pub fn default_value(self, value: Value) -> Self {
        self.default(DefaultValue::Constant(value))
    }

    pub fn on_delete(mut self, action: ReferentialAction) -> Self {
        if let Some(relation) = &mut self.def.relation {
            relation.on_delete = Some(action);
        }
        self
    }

    pub fn relation_name(mut self, name: impl Into<String>) -> Self {
        if let Some(relation) = &mut self.def.relation {
            relation.name = Some(name.into());
        }
        self
    }

    fn build(self) -> FieldDef {
        self.def
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_unique_keys_and_ids() {
        let schema = SchemaBuilder::new(SqlProvider::Sqlite)
            .model(
                ModelBuilder::new("User")
                    .field(FieldBuilder::id_cuid("id"))
                    .field(FieldBuilder::string("email").unique())
                    .field(FieldBuilder::string("org"))
                    .field(FieldBuilder::string("handle"))
                    .compound_unique(&["org", "handle"], None),
            )
            .build()
            .unwrap();

        let user = schema.model("User").unwrap();
        assert_eq!(user.id_fields, vec!["id"]);
        assert!(user.unique_fields.contains_key("email"));
        assert_eq!(
            user.unique_fields.get("org_handle"),
            Some(&UniqueKey::Compound(vec!["org".into(), "handle".into()]))
        );
    }

    #[test]
    fn delegate_descendants_inherit_fields() {
        let schema = SchemaBuilder::new(SqlProvider::Sqlite)
            .model(
                ModelBuilder::new("Content")
                    .field(FieldBuilder::id_cuid("id"))
                    .field(FieldBuilder::string("contentType"))
                    .field(FieldBuilder::string("title"))
                    .delegate("contentType"),
            )
            .model(
                ModelBuilder::new("Video")
                    .field(FieldBuilder::int("duration"))
                    .extends("Content"),
            )
            .build()
            .unwrap();

        let video = schema.model("Video").unwrap();
        assert_eq!(video.id_fields, vec!["id"]);
        let title = video.field("title").unwrap();
        assert_eq!(title.origin_model.as_deref(), Some("Content"));
        let id = video.field("id").unwrap();
        assert_eq!(id.origin_model, None);
    }

    #[test]
    fn fk_backing_links_are_recorded() {
        let schema = SchemaBuilder::new(SqlProvider::Sqlite)
            .model(
                ModelBuilder::new("User")
                    .field(FieldBuilder::id_cuid("id"))
                    .field(FieldBuilder::relation_many("posts", "Post", "author")),
            )
            .model(
                ModelBuilder::new("Post")
                    .field(FieldBuilder::id_cuid("id"))
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
            .unwrap();

        let post = schema.model("Post").unwrap();
        assert_eq!(
            post.field("authorId").unwrap().foreign_key_for,
            vec!["author".to_string()]
        );
    }
}
