use crate::schema::{BuiltinType, SqlProvider};
use crate::sql_ast::SqlExpr;
use crate::Value;
use bitflags::bitflags;

/// Placeholder style for parameterized queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `?` placeholders (SQLite).
    QuestionMark,
    /// `$1`, `$2`, etc. (PostgreSQL).
    DollarNumber,
}

bitflags! {
    /// SQL features a dialect supports natively.
    ///
    /// The engine queries these instead of branching on backend name; absent
    /// capabilities are emulated (in-memory distinct, id-subquery limits,
    /// LOWER()-based case folding).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DialectCapabilities: u32 {
        const DISTINCT_ON = 1 << 0;
        const UPDATE_WITH_LIMIT = 1 << 1;
        const DELETE_WITH_LIMIT = 1 << 2;
        const RETURNING = 1 << 3;
        const NATIVE_ARRAYS = 1 << 4;
    }
}

/// How the backend compares strings in `LIKE` and friends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StringCasingBehavior {
    pub supports_ilike: bool,
    pub like_case_sensitive: bool,
}

/// Database-specific SQL construction primitives.
///
/// Implemented once per backend in its driver crate; consumed by the planner,
/// mutation orchestrator, and renderer through `&dyn SqlDialect`.
pub trait SqlDialect: Send + Sync {
    fn provider(&self) -> SqlProvider;

    /// Quote an identifier (table/column/alias name).
    fn quote_identifier(&self, name: &str) -> String;

    fn placeholder_style(&self) -> PlaceholderStyle;

    fn capabilities(&self) -> DialectCapabilities;

    fn supports(&self, capability: DialectCapabilities) -> bool {
        self.capabilities().contains(capability)
    }

    fn string_casing(&self) -> StringCasingBehavior;

    /// SQL column type for a builtin field type.
    fn field_sql_type(&self, builtin: BuiltinType, array: bool) -> String;

    /// Normalize a value for binding on this backend.
    ///
    /// SQLite has no native decimal/datetime/boolean/array storage classes;
    /// PostgreSQL binds most of these natively.
    fn transform_primitive(&self, value: Value, builtin: BuiltinType, array: bool) -> Value;

    /// Render a JSON object projection. `pairs` are (key literal, rendered
    /// value SQL, value-is-json).
    fn render_json_object(&self, pairs: &[(String, String, bool)]) -> String;

    /// Render a JSON array aggregate over the rendered element SQL,
    /// producing `[]` (not NULL) for an empty input set.
    fn render_json_array_agg(&self, element: &str, element_is_json: bool) -> String;

    /// Cast rendered SQL to text.
    fn cast_text(&self, inner: &str) -> String {
        format!("CAST({} AS TEXT)", inner)
    }

    // -- Scalar-list operations ---------------------------------------------

    /// A literal/bound array of items, bindable where the column type is an
    /// array of `builtin`.
    fn array_literal(&self, items: Vec<Value>, builtin: BuiltinType) -> SqlExpr;

    /// `column` contains `item` as a member.
    fn array_has(&self, column: SqlExpr, item: Value, builtin: BuiltinType) -> SqlExpr;

    /// `column` contains every one of `items`.
    fn array_has_every(&self, column: SqlExpr, items: Vec<Value>, builtin: BuiltinType)
        -> SqlExpr;

    /// `column` shares at least one member with `items`.
    fn array_has_some(&self, column: SqlExpr, items: Vec<Value>, builtin: BuiltinType) -> SqlExpr;

    fn array_is_empty(&self, column: SqlExpr) -> SqlExpr;

    /// `column` with `items` appended (the `push` update operator).
    fn array_append(&self, column: SqlExpr, items: Vec<Value>, builtin: BuiltinType) -> SqlExpr;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_query() {
        let caps = DialectCapabilities::RETURNING | DialectCapabilities::DISTINCT_ON;
        assert!(caps.contains(DialectCapabilities::RETURNING));
        assert!(!caps.contains(DialectCapabilities::UPDATE_WITH_LIMIT));
    }
}
