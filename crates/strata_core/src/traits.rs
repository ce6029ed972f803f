use crate::query::{QueryRequest, QueryResult};
use crate::schema::SqlProvider;
use crate::sql_dialect::SqlDialect;
use crate::Result;
use async_trait::async_trait;

/// Active database connection.
///
/// The engine interacts exclusively through this trait, never through driver
/// internals. Implementations must be thread-safe; the engine serializes
/// transactional statement streams itself, so drivers only need per-statement
/// consistency.
#[async_trait]
pub trait Connection: Send + Sync {
    /// The backend this connection talks to.
    fn provider(&self) -> SqlProvider;

    /// The SQL dialect for statement rendering against this connection.
    fn dialect(&self) -> &dyn SqlDialect;

    /// Execute one statement and collect its full result set.
    async fn execute(&self, req: &QueryRequest) -> Result<QueryResult>;

    /// Check the connection is alive (`SELECT 1`).
    async fn ping(&self) -> Result<()> {
        self.execute(&QueryRequest::new("SELECT 1")).await?;
        Ok(())
    }

    /// Open a driver-level transaction.
    async fn begin(&self) -> Result<()> {
        self.execute(&QueryRequest::new("BEGIN")).await?;
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.execute(&QueryRequest::new("COMMIT")).await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.execute(&QueryRequest::new("ROLLBACK")).await?;
        Ok(())
    }

    /// Release the connection. Idempotent.
    async fn close(&self) -> Result<()>;
}
