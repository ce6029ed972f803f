use crate::expr::Expr;
use crate::sql_ast::SqlExpr;
use crate::{Error, Result, Value};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;

/// Supported SQL backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlProvider {
    Sqlite,
    Postgres,
}

/// Builtin scalar field types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinType {
    String,
    Boolean,
    Int,
    Float,
    BigInt,
    Decimal,
    DateTime,
    Bytes,
    Json,
    Unsupported,
}

/// The declared type of a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Builtin(BuiltinType),
    /// Relation to another model.
    Model(String),
    Enum(String),
    /// Struct-like typed JSON column.
    TypeDef(String),
}

impl FieldType {
    pub fn as_builtin(&self) -> Option<BuiltinType> {
        match self {
            FieldType::Builtin(t) => Some(*t),
            _ => None,
        }
    }

    pub fn model_name(&self) -> Option<&str> {
        match self {
            FieldType::Model(name) => Some(name),
            _ => None,
        }
    }
}

/// Foreign-key referential actions, delegated to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferentialAction {
    Cascade,
    Restrict,
    SetNull,
    SetDefault,
    NoAction,
}

impl ReferentialAction {
    pub fn sql_keyword(&self) -> &'static str {
        match self {
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::SetDefault => "SET DEFAULT",
            ReferentialAction::NoAction => "NO ACTION",
        }
    }
}

/// Relation metadata attached to a model-typed field.
///
/// Exactly one side of a relation carries `fields`/`references`; a
/// many-to-many relation has both sides as arrays with no FK fields.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RelationDef {
    /// Disambiguating relation name when two models share several relations.
    pub name: Option<String>,
    /// FK columns on this model (owner side only).
    pub fields: Vec<String>,
    /// Referenced columns on the target model (owner side only).
    pub references: Vec<String>,
    /// Back-reference field name on the target model.
    pub opposite: Option<String>,
    pub on_delete: Option<ReferentialAction>,
    pub on_update: Option<ReferentialAction>,
}

impl RelationDef {
    pub fn is_owner(&self) -> bool {
        !self.fields.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UuidVersion {
    V4,
    V7,
}

/// Field default: a constant or a generator evaluated at insert time.
#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValue {
    Constant(Value),
    Cuid,
    Uuid(UuidVersion),
    Nanoid(Option<u8>),
    Ulid,
    Now,
    /// Member access on the ambient auth value, e.g. `auth().id`.
    AuthMember(Vec<String>),
}

/// A single field of a model.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub is_id: bool,
    pub unique: bool,
    pub array: bool,
    pub optional: bool,
    pub updated_at: bool,
    pub computed: bool,
    pub default: Option<DefaultValue>,
    pub relation: Option<RelationDef>,
    /// Relation fields this scalar column backs.
    pub foreign_key_for: Vec<String>,
    /// Delegate base model that originally declared this field.
    pub origin_model: Option<String>,
}

impl FieldDef {
    pub fn is_relation(&self) -> bool {
        matches!(self.field_type, FieldType::Model(_))
    }

    pub fn is_to_many(&self) -> bool {
        self.is_relation() && self.array
    }

    pub fn is_scalar(&self) -> bool {
        !self.is_relation() && !self.computed
    }
}

/// A named unique constraint: one field or a compound group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UniqueKey {
    Single(String),
    Compound(Vec<String>),
}

impl UniqueKey {
    pub fn fields(&self) -> Vec<&str> {
        match self {
            UniqueKey::Single(f) => vec![f.as_str()],
            UniqueKey::Compound(fs) => fs.iter().map(|s| s.as_str()).collect(),
        }
    }

    /// Stable synthesized key name: component field names joined with `_`.
    pub fn synthesized_name(fields: &[String]) -> String {
        fields.join("_")
    }
}

/// A named attribute application (`@@allow`, `@@deny`, `@@index`, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub args: Vec<Expr>,
}

impl Attribute {
    pub fn new(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// Context handed to a computed-field SQL generator.
pub struct ComputedFieldCtx<'a> {
    /// Alias of the model's table in the current statement.
    pub model_alias: &'a str,
}

type ComputedSqlFn = dyn Fn(&ComputedFieldCtx) -> SqlExpr + Send + Sync;

/// A computed field: projected as a named column from a user-supplied SQL
/// fragment generator.
#[derive(Clone)]
pub struct ComputedFieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub sql: Arc<ComputedSqlFn>,
}

impl std::fmt::Debug for ComputedFieldDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputedFieldDef")
            .field("name", &self.name)
            .field("field_type", &self.field_type)
            .finish_non_exhaustive()
    }
}

/// A model definition: an ordered field map plus identity and metadata.
#[derive(Debug, Clone)]
pub struct ModelDef {
    pub name: String,
    pub fields: IndexMap<String, FieldDef>,
    /// Ordered list used for row identity.
    pub id_fields: Vec<String>,
    /// Unique constraints by stable key name.
    pub unique_fields: IndexMap<String, UniqueKey>,
    /// Delegate polymorphism: the base model this one extends.
    pub base_model: Option<String>,
    pub is_delegate: bool,
    /// Discriminator column name, set on delegate bases.
    pub discriminator: Option<String>,
    pub attributes: Vec<Attribute>,
    pub computed_fields: IndexMap<String, ComputedFieldDef>,
}

impl ModelDef {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.get(name)
    }

    pub fn scalar_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.values().filter(|f| f.is_scalar())
    }

    pub fn relation_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.values().filter(|f| f.is_relation())
    }

    /// Table name in SQL; models map to tables of the same name.
    pub fn table_name(&self) -> &str {
        &self.name
    }

    pub fn has_id_field(&self, name: &str) -> bool {
        self.id_fields.iter().any(|f| f == name)
    }

    /// The policy attributes (`@@allow` / `@@deny`) declared on this model.
    pub fn policy_attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes
            .iter()
            .filter(|a| a.name == "@@allow" || a.name == "@@deny")
    }
}

/// Enum definition: ordered member names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumDef {
    pub name: String,
    pub members: Vec<String>,
}

impl EnumDef {
    pub fn has_member(&self, member: &str) -> bool {
        self.members.iter().any(|m| m == member)
    }
}

/// Struct-like type used for typed JSON columns.
#[derive(Debug, Clone)]
pub struct TypeDefDef {
    pub name: String,
    pub fields: IndexMap<String, FieldDef>,
}

/// Identifies both columns of an implicit many-to-many join table.
///
/// The pair is ordered by participant model name (ties broken by field name)
/// so `A` is deterministic regardless of which side initiated the write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTable {
    pub table: String,
    /// Model whose id the `A` column references.
    pub a_model: String,
    /// Model whose id the `B` column references.
    pub b_model: String,
}

/// Process-wide immutable schema.
#[derive(Debug, Clone)]
pub struct Schema {
    pub provider: SqlProvider,
    pub models: IndexMap<String, ModelDef>,
    pub enums: IndexMap<String, EnumDef>,
    pub type_defs: IndexMap<String, TypeDefDef>,
    /// Model name used as the caller-identity shape.
    pub auth_model: Option<String>,
    /// Opaque per-plugin configuration.
    pub plugin_config: HashMap<String, serde_json::Value>,
}

impl Schema {
    pub fn model(&self, name: &str) -> Result<&ModelDef> {
        self.models
            .get(name)
            .ok_or_else(|| Error::internal(format!("unknown model '{}'", name)))
    }

    pub fn enum_def(&self, name: &str) -> Option<&EnumDef> {
        self.enums.get(name)
    }

    /// Direct delegate descendants of `base`.
    pub fn descendants_of(&self, base: &str) -> Vec<&ModelDef> {
        self.models
            .values()
            .filter(|m| m.base_model.as_deref() == Some(base))
            .collect()
    }

    /// Delegate chain from the base-most ancestor down to `model` itself.
    pub fn delegate_chain(&self, model: &str) -> Result<Vec<&ModelDef>> {
        let mut chain = Vec::new();
        let mut current = self.model(model)?;
        chain.push(current);
        while let Some(base) = &current.base_model {
            current = self.model(base)?;
            if chain.iter().any(|m| m.name == current.name) {
                return Err(Error::internal(format!(
                    "delegate cycle through model '{}'",
                    current.name
                )));
            }
            chain.push(current);
        }
        chain.reverse();
        Ok(chain)
    }

    /// Resolve the relation opposite to `field` on `model`.
    pub fn opposite_relation<'a>(
        &'a self,
        model: &ModelDef,
        field: &FieldDef,
    ) -> Result<(&'a ModelDef, &'a FieldDef)> {
        let target_name = field.field_type.model_name().ok_or_else(|| {
            Error::internal(format!("field '{}' is not a relation", field.name))
        })?;
        let target = self.model(target_name)?;
        let relation = field
            .relation
            .as_ref()
            .ok_or_else(|| Error::internal(format!("relation '{}' missing def", field.name)))?;

        let opposite_name = match &relation.opposite {
            Some(name) => name.clone(),
            None => {
                // Single unnamed back-reference.
                target
                    .relation_fields()
                    .find(|f| {
                        f.field_type.model_name() == Some(model.name.as_str())
                            && f.relation.as_ref().map(|r| r.name.clone()).unwrap_or(None)
                                == relation.name
                    })
                    .map(|f| f.name.clone())
                    .ok_or_else(|| {
                        Error::internal(format!(
                            "no opposite relation for {}.{}",
                            model.name, field.name
                        ))
                    })?
            }
        };

        let opposite = target.field(&opposite_name).ok_or_else(|| {
            Error::internal(format!(
                "opposite relation field '{}' missing on '{}'",
                opposite_name, target.name
            ))
        })?;
        Ok((target, opposite))
    }

    /// Whether a relation field is an implicit many-to-many side.
    pub fn is_many_to_many(&self, model: &ModelDef, field: &FieldDef) -> Result<bool> {
        if !field.is_to_many() {
            return Ok(false);
        }
        let (_, opposite) = self.opposite_relation(model, field)?;
        Ok(opposite.is_to_many())
    }

    /// Join table for an implicit many-to-many relation, with deterministic
    /// `A`/`B` column assignment.
    pub fn join_table(&self, model: &ModelDef, field: &FieldDef) -> Result<JoinTable> {
        let (target, opposite) = self.opposite_relation(model, field)?;

        let this_side = (model.name.as_str(), field.name.as_str());
        let other_side = (target.name.as_str(), opposite.name.as_str());
        let (a, b) = if this_side <= other_side {
            (this_side, other_side)
        } else {
            (other_side, this_side)
        };

        Ok(JoinTable {
            table: format!("{}_{}", a.0, b.0),
            a_model: a.0.to_string(),
            b_model: b.0.to_string(),
        })
    }

    /// Which join-table column holds this side's ids.
    ///
    /// Resolved by side rather than model name so self-relations stay
    /// deterministic.
    pub fn join_column_for_side(
        &self,
        model: &ModelDef,
        field: &FieldDef,
    ) -> Result<&'static str> {
        let (target, opposite) = self.opposite_relation(model, field)?;
        let this_side = (model.name.as_str(), field.name.as_str());
        let other_side = (target.name.as_str(), opposite.name.as_str());
        Ok(if this_side <= other_side { "A" } else { "B" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema_builder::{FieldBuilder, ModelBuilder, SchemaBuilder};

    fn post_tag_schema() -> Schema {
        SchemaBuilder::new(SqlProvider::Sqlite)
            .model(
                ModelBuilder::new("Post")
                    .field(FieldBuilder::id_int("id"))
                    .field(FieldBuilder::relation_many("tags", "Tag", "posts")),
            )
            .model(
                ModelBuilder::new("Tag")
                    .field(FieldBuilder::id_int("id"))
                    .field(FieldBuilder::relation_many("posts", "Post", "tags")),
            )
            .build()
            .expect("valid schema")
    }

    #[test]
    fn join_table_orders_by_model_name() {
        let schema = post_tag_schema();
        let post = schema.model("Post").unwrap();
        let tags = post.field("tags").unwrap();

        let join = schema.join_table(post, tags).unwrap();
        assert_eq!(join.table, "Post_Tag");
        assert_eq!(join.a_model, "Post");
        assert_eq!(join.b_model, "Tag");
        assert_eq!(schema.join_column_for_side(post, tags).unwrap(), "A");

        let tag = schema.model("Tag").unwrap();
        let posts = tag.field("posts").unwrap();
        let join_b = schema.join_table(tag, posts).unwrap();
        assert_eq!(join_b.table, "Post_Tag");
        assert_eq!(schema.join_column_for_side(tag, posts).unwrap(), "B");
    }

    #[test]
    fn many_to_many_detection() {
        let schema = post_tag_schema();
        let post = schema.model("Post").unwrap();
        let tags = post.field("tags").unwrap();
        assert!(schema.is_many_to_many(post, tags).unwrap());
    }
}
