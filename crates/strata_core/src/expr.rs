use crate::Value;

/// Binary operators usable in policy and computed-field expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
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
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// Collection predicate operators over to-many relations.
///
/// `Any` is spelled `?` in the policy surface language, `All` is `!`,
/// and `None` is `^`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionOp {
    Any,
    All,
    None,
}

/// Policy / computed-field expression AST.
///
/// Tagged sum type; transformations build new nodes rather than mutate.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Reference to a field of the current model.
    Field(String),
    /// Member access chain on a base expression (`auth().profile.role`,
    /// `author.age`).
    Member(Box<Expr>, Vec<String>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Call(String, Vec<Expr>),
    Array(Vec<Expr>),
    /// The current row.
    This,
    Null,
    /// The ambient caller identity.
    Auth,
    /// Collection predicate: `relation?[pred]`, `relation![pred]`,
    /// `relation^[pred]`.
    Collection(CollectionOp, String, Option<Box<Expr>>),
    /// Pre-mutation snapshot of a field, only valid in post-update rules.
    Before(String),
}

impl Expr {
    pub fn literal(value: Value) -> Self {
        Expr::Literal(value)
    }

    pub fn bool(value: bool) -> Self {
        Expr::Literal(Value::Bool(value))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Expr::Literal(Value::Text(value.into()))
    }

    pub fn int(value: i64) -> Self {
        Expr::Literal(Value::Int(value))
    }

    pub fn field(name: impl Into<String>) -> Self {
        Expr::Field(name.into())
    }

    pub fn auth_member(path: &[&str]) -> Self {
        Expr::Member(
            Box::new(Expr::Auth),
            path.iter().map(|s| s.to_string()).collect(),
        )
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    pub fn eq(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(BinaryOp::Eq, lhs, rhs)
    }

    pub fn and(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(BinaryOp::And, lhs, rhs)
    }

    pub fn or(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(BinaryOp::Or, lhs, rhs)
    }

    pub fn not(operand: Expr) -> Self {
        Expr::Unary(UnaryOp::Not, Box::new(operand))
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Expr::Literal(_) | Expr::Null)
    }

    pub fn is_call(&self) -> bool {
        matches!(self, Expr::Call(..))
    }

    pub fn is_true_literal(&self) -> bool {
        matches!(self, Expr::Literal(Value::Bool(true)))
    }

    pub fn is_false_literal(&self) -> bool {
        matches!(self, Expr::Literal(Value::Bool(false)))
    }

    /// Whether the expression reads the ambient auth value anywhere.
    pub fn is_auth_access(&self) -> bool {
        match self {
            Expr::Auth => true,
            Expr::Member(base, _) => base.is_auth_access(),
            Expr::Binary(_, l, r) => l.is_auth_access() || r.is_auth_access(),
            Expr::Unary(_, e) => e.is_auth_access(),
            Expr::Call(_, args) | Expr::Array(args) => args.iter().any(Expr::is_auth_access),
            Expr::Collection(_, _, pred) => {
                pred.as_ref().is_some_and(|p| p.is_auth_access())
            }
            _ => false,
        }
    }

    /// Collect every field named under a `before()` access.
    pub fn before_fields(&self, out: &mut Vec<String>) {
        match self {
            Expr::Before(field) => {
                if !out.contains(field) {
                    out.push(field.clone());
                }
            }
            Expr::Member(base, _) => base.before_fields(out),
            Expr::Binary(_, l, r) => {
                l.before_fields(out);
                r.before_fields(out);
            }
            Expr::Unary(_, e) => e.before_fields(out),
            Expr::Call(_, args) | Expr::Array(args) => {
                for a in args {
                    a.before_fields(out);
                }
            }
            Expr::Collection(_, _, Some(pred)) => pred.before_fields(out),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_access_detection() {
        let expr = Expr::eq(Expr::auth_member(&["id"]), Expr::field("ownerId"));
        assert!(expr.is_auth_access());
        assert!(!Expr::field("ownerId").is_auth_access());
    }

    #[test]
    fn before_fields_are_collected_once() {
        let expr = Expr::and(
            Expr::binary(BinaryOp::Gt, Expr::field("age"), Expr::Before("age".into())),
            Expr::binary(BinaryOp::Ne, Expr::Before("age".into()), Expr::int(0)),
        );
        let mut fields = Vec::new();
        expr.before_fields(&mut fields);
        assert_eq!(fields, vec!["age".to_string()]);
    }
}
