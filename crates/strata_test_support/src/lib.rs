mod fake_connection;
mod fixtures;

pub use fake_connection::{single_row, AnsiDialect, FakeConnection, FakeOutcome};
pub use fixtures::blog_schema;
