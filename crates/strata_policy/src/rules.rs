use std::collections::HashMap;
use strata_core::{Error, Expr, Result, Schema, Value};

/// Operations a policy rule can apply to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyOp {
    Create,
    Read,
    Update,
    Delete,
    PostUpdate,
}

impl PolicyOp {
    fn parse(token: &str) -> Result<Vec<PolicyOp>> {
        Ok(match token.trim() {
            "create" => vec![PolicyOp::Create],
            "read" => vec![PolicyOp::Read],
            "update" => vec![PolicyOp::Update],
            "delete" => vec![PolicyOp::Delete],
            "post-update" => vec![PolicyOp::PostUpdate],
            // `all` covers the four CRUD operations, never post-update.
            "all" => vec![
                PolicyOp::Create,
                PolicyOp::Read,
                PolicyOp::Update,
                PolicyOp::Delete,
            ],
            other => {
                return Err(Error::internal(format!(
                    "unknown policy operation '{}'",
                    other
                )))
            }
        })
    }
}

/// A rule supplied from outside the schema (`with_features`).
#[derive(Debug, Clone)]
pub struct ExternalRule {
    pub model: String,
    pub allow: bool,
    /// Comma-separated operation list, as in `@@allow`.
    pub operations: String,
    pub expr: Expr,
}

/// Allow/deny expressions per model and operation.
#[derive(Debug, Clone, Default)]
pub struct ModelRules {
    pub allows: HashMap<PolicyOp, Vec<Expr>>,
    pub denies: HashMap<PolicyOp, Vec<Expr>>,
}

impl ModelRules {
    pub fn allows_for(&self, op: PolicyOp) -> &[Expr] {
        self.allows.get(&op).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn denies_for(&self, op: PolicyOp) -> &[Expr] {
        self.denies.get(&op).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_post_update(&self) -> bool {
        !self.allows_for(PolicyOp::PostUpdate).is_empty()
            || !self.denies_for(PolicyOp::PostUpdate).is_empty()
    }
}

/// Every model's policy rules, extracted once at plugin construction.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    models: HashMap<String, ModelRules>,
}

impl RuleSet {
    pub fn from_schema(schema: &Schema, external: &[ExternalRule]) -> Result<RuleSet> {
        let mut models: HashMap<String, ModelRules> = HashMap::new();

        for model in schema.models.values() {
            let rules = models.entry(model.name.clone()).or_default();
            for attribute in model.policy_attributes() {
                let allow = attribute.name == "@@allow";
                let (ops, expr) = parse_rule_args(&attribute.args)?;
                for op in ops {
                    let bucket = if allow {
                        rules.allows.entry(op).or_default()
                    } else {
                        rules.denies.entry(op).or_default()
                    };
                    bucket.push(expr.clone());
                }
            }
        }

        for rule in external {
            let entry = models.entry(rule.model.clone()).or_default();
            for token in rule.operations.split(',') {
                for op in PolicyOp::parse(token)? {
                    let bucket = if rule.allow {
                        entry.allows.entry(op).or_default()
                    } else {
                        entry.denies.entry(op).or_default()
                    };
                    bucket.push(rule.expr.clone());
                }
            }
        }

        Ok(RuleSet { models })
    }

    pub fn model(&self, name: &str) -> Option<&ModelRules> {
        self.models.get(name)
    }

    /// Whether any model carries rules at all.
    pub fn is_empty(&self) -> bool {
        self.models
            .values()
            .all(|m| m.allows.is_empty() && m.denies.is_empty())
    }
}

fn parse_rule_args(args: &[Expr]) -> Result<(Vec<PolicyOp>, Expr)> {
    let [ops_arg, expr] = args else {
        return Err(Error::internal(
            "policy attributes take (operations, expression)",
        ));
    };
    let Expr::Literal(Value::Text(ops)) = ops_arg else {
        return Err(Error::internal(
            "policy operations must be a string literal",
        ));
    };

    let mut parsed = Vec::new();
    for token in ops.split(',') {
        parsed.extend(PolicyOp::parse(token)?);
    }
    Ok((parsed, expr.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{FieldBuilder, ModelBuilder, SchemaBuilder, SqlProvider};

    #[test]
    fn all_excludes_post_update() {
        let schema = SchemaBuilder::new(SqlProvider::Sqlite)
            .model(
                ModelBuilder::new("User")
                    .field(FieldBuilder::id_cuid("id"))
                    .allow("all", Expr::bool(true))
                    .deny("post-update", Expr::bool(false)),
            )
            .build()
            .unwrap();

        let rules = RuleSet::from_schema(&schema, &[]).unwrap();
        let user = rules.model("User").unwrap();
        assert_eq!(user.allows_for(PolicyOp::Read).len(), 1);
        assert_eq!(user.allows_for(PolicyOp::Delete).len(), 1);
        assert!(user.allows_for(PolicyOp::PostUpdate).is_empty());
        assert_eq!(user.denies_for(PolicyOp::PostUpdate).len(), 1);
    }
}
