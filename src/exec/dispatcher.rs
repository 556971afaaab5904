//! Plan dispatch: where a plan node actually runs
//!
//! Non-leaf nodes hand each child to its dispatcher and await a
//! `QueryResponse`. The in-process dispatcher just drives `execute` on the
//! current runtime under the configured ask timeout; a remote dispatcher
//! would serialize the plan, ship it, and deserialize the response behind
//! the same trait.

use crate::config::QueryConfig;
use crate::error::QueryError;
use crate::exec::plan::{ExecPlan, QueryErrorResponse, QueryResponse, QuerySession};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Dispatches a plan to wherever it executes
#[async_trait]
pub trait PlanDispatcher: Send + Sync {
    /// Execute `plan` and return its response. Must not panic; transport
    /// failures are returned as error responses.
    async fn dispatch(&self, plan: Arc<dyn ExecPlan>, session: Arc<QuerySession>)
        -> QueryResponse;

    /// Short name for plan printing
    fn describe(&self) -> String;
}

/// Runs plans on the local runtime
#[derive(Debug, Clone)]
pub struct InProcessDispatcher {
    ask_timeout: Duration,
}

impl Default for InProcessDispatcher {
    fn default() -> Self {
        Self {
            ask_timeout: Duration::from_secs(30),
        }
    }
}

impl InProcessDispatcher {
    /// Dispatcher with the given ask timeout
    pub fn new(ask_timeout: Duration) -> Arc<Self> {
        Arc::new(Self { ask_timeout })
    }

    /// Dispatcher with the default 30s ask timeout
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Dispatcher using the configured ask timeout
    pub fn from_config(config: &QueryConfig) -> Arc<Self> {
        Self::new(config.ask_timeout)
    }
}

#[async_trait]
impl PlanDispatcher for InProcessDispatcher {
    async fn dispatch(
        &self,
        plan: Arc<dyn ExecPlan>,
        session: Arc<QuerySession>,
    ) -> QueryResponse {
        let query_id = plan.query_context().query_id.clone();
        debug!(query_id = %query_id, plan = plan.name(), "dispatching in-process");
        match tokio::time::timeout(self.ask_timeout, plan.execute(Arc::clone(&session))).await {
            Ok(response) => response,
            Err(_) => {
                let timeout_ms = self.ask_timeout.as_millis() as u64;
                QueryResponse::Error(QueryErrorResponse {
                    query_id,
                    stats: session.stats.snapshot(),
                    error: QueryError::Timeout {
                        elapsed_ms: timeout_ms,
                        timeout_ms,
                    },
                })
            }
        }
    }

    fn describe(&self) -> String {
        "InProcessDispatcher".to_string()
    }
}
