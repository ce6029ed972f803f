mod driver;

pub use driver::{PostgresConnection, PostgresDialect};
