//! Mediation hook invoked when a connection completes.

use async_trait::async_trait;
use didcomm_core::ConnectionRecord;

use crate::error::RouteError;

/// Registers routing for a newly completed connection.
///
/// Failures are logged; they never undo the completed connection.
#[async_trait]
pub trait RouteRegistrar: Send + Sync + 'static {
    /// Called once per connection, right after it reached `Completed`
    async fn register(&self, connection: &ConnectionRecord) -> Result<(), RouteError>;
}
