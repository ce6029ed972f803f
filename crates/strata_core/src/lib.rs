mod ddl;
mod error;
mod expr;
mod query;
mod schema;
pub mod schema_builder;
mod sql_ast;
mod sql_dialect;
mod sql_render;
mod traits;
mod value;

pub use ddl::generate_schema_ddl;
pub use error::{Error, PolicyReason, Result, ValidationIssue};
pub use expr::{BinaryOp, CollectionOp, Expr, UnaryOp};
pub use query::{ColumnMeta, QueryRequest, QueryResult};
pub use schema::{
    Attribute, BuiltinType, ComputedFieldCtx, ComputedFieldDef, DefaultValue, EnumDef, FieldDef,
    FieldType, JoinTable, ModelDef, ReferentialAction, RelationDef, Schema, SqlProvider,
    TypeDefDef, UniqueKey, UuidVersion,
};
pub use schema_builder::{FieldBuilder, ModelBuilder, SchemaBuilder};
pub use sql_ast::{
    transform_table_refs, BinOp, DeleteStmt, Distinct, InsertSource, InsertStmt, Join, JoinKind,
    JsonPair, OnConflict, OrderTerm, RawPiece, SelectItem, SelectStmt, SqlExpr, Statement,
    StatementContext, StatementKind, StatementOp, TableRef, UpdateStmt,
};
pub use sql_dialect::{DialectCapabilities, PlaceholderStyle, SqlDialect, StringCasingBehavior};
pub use sql_render::{render_statement, RenderedStatement};
pub use traits::Connection;
pub use value::{Row, Value};

pub use chrono;
pub use indexmap;
