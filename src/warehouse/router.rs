//! Warehouse Router - selects a runner per request
//!
//! The router is the last line of enforcement before rows leave the runner
//! layer. Runners own the request deadline so they can interrupt or cancel the
//! statement themselves; the router only gives up after a grace period past it,
//! and truncates to the enforced limit regardless of what the backend returned.

use crate::config::AppConfig;
use crate::error::{BiError, Result};
use crate::warehouse::{
    BigQueryRunner, EmbeddedRunner, ExecutionRequest, ExecutionResult, Redactor, SnowflakeRunner, WarehouseRunner,
    WarehouseTarget,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Time a runner gets past the request deadline to cancel and clean up
const CANCEL_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct WarehouseRouter {
    runners: HashMap<WarehouseTarget, Arc<dyn WarehouseRunner>>,
    cancel_grace: Duration,
}

impl Default for WarehouseRouter {
    fn default() -> Self {
        Self {
            runners: HashMap::new(),
            cancel_grace: CANCEL_GRACE,
        }
    }
}

impl WarehouseRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// One runner per target whose settings are complete.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let redactor = Redactor::new(config.secrets());
        let mut router = Self::new();
        for target in config.available_warehouses() {
            let runner: Arc<dyn WarehouseRunner> = match target {
                WarehouseTarget::Embedded => {
                    Arc::new(EmbeddedRunner::new(&config.embedded, &config.pool, redactor.clone()))
                }
                WarehouseTarget::BigQuery => Arc::new(BigQueryRunner::new(&config.bigquery, redactor.clone())?),
                WarehouseTarget::Snowflake => Arc::new(SnowflakeRunner::new(&config.snowflake, redactor.clone())?),
            };
            router.register(runner);
        }
        Ok(router)
    }

    /// Register a runner under its own target, replacing any previous one.
    pub fn register(&mut self, runner: Arc<dyn WarehouseRunner>) {
        let target = runner.target();
        info!("Registered warehouse runner: {}", target);
        self.runners.insert(target, runner);
    }

    pub fn with_runner(mut self, runner: Arc<dyn WarehouseRunner>) -> Self {
        self.register(runner);
        self
    }

    pub fn targets(&self) -> Vec<WarehouseTarget> {
        WarehouseTarget::ALL
            .iter()
            .copied()
            .filter(|t| self.runners.contains_key(t))
            .collect()
    }

    pub fn runner(&self, target: WarehouseTarget) -> Result<Arc<dyn WarehouseRunner>> {
        self.runners.get(&target).cloned().ok_or_else(|| {
            BiError::InvalidRequest(format!("No runner configured for warehouse '{}'", target))
        })
    }

    pub async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        let runner = self.runner(request.warehouse_target)?;
        debug!(
            "Routing statement to {} (timeout {:?}, limit {})",
            request.warehouse_target, request.timeout, request.row_limit
        );

        let backstop = request.timeout + self.cancel_grace;
        let mut result = match tokio::time::timeout(backstop, runner.execute(request)).await {
            Ok(outcome) => outcome?,
            Err(_) => {
                warn!(
                    "{} runner did not stop within {:?} of its {:?} deadline",
                    request.warehouse_target, self.cancel_grace, request.timeout
                );
                return Err(BiError::QueryTimeout(request.timeout));
            }
        };

        let before = result.row_count;
        result.enforce_limit(request.row_limit);
        if result.truncated && before > result.row_count {
            warn!(
                "{} returned {} rows, truncated to {}",
                request.warehouse_target, before, result.row_count
            );
        }
        Ok(result)
    }

    pub async fn disconnect_all(&self) {
        for (target, runner) in &self.runners {
            if let Err(e) = runner.disconnect().await {
                warn!("Failed to disconnect {}: {}", target, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Ignores the SQL limit and returns a fixed number of rows.
    struct FloodRunner {
        rows: usize,
        delay: Duration,
    }

    #[async_trait]
    impl WarehouseRunner for FloodRunner {
        fn target(&self) -> WarehouseTarget {
            WarehouseTarget::Snowflake
        }

        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn execute(&self, _request: &ExecutionRequest) -> Result<ExecutionResult> {
            tokio::time::sleep(self.delay).await;
            let values = (0..self.rows).map(|i| vec![json!(i)]).collect();
            Ok(ExecutionResult::from_values(
                WarehouseTarget::Snowflake,
                vec!["n".to_string()],
                values,
                self.delay,
            ))
        }

        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
    }

    /// Honors its own deadline and cancels before reporting the timeout.
    struct CancellingRunner {
        cancelled: AtomicBool,
    }

    #[async_trait]
    impl WarehouseRunner for CancellingRunner {
        fn target(&self) -> WarehouseTarget {
            WarehouseTarget::BigQuery
        }

        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
            tokio::time::sleep(request.timeout).await;
            // the cancel call itself takes a moment
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.cancelled.store(true, Ordering::SeqCst);
            Err(BiError::QueryTimeout(request.timeout))
        }

        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
    }

    fn request(target: WarehouseTarget, limit: u64, timeout: Duration) -> ExecutionRequest {
        ExecutionRequest {
            sql: "SELECT n FROM t LIMIT 5".to_string(),
            warehouse_target: target,
            timeout,
            row_limit: limit,
        }
    }

    #[tokio::test]
    async fn test_truncates_when_backend_ignores_limit() {
        let router = WarehouseRouter::new().with_runner(Arc::new(FloodRunner {
            rows: 50,
            delay: Duration::ZERO,
        }));
        let result = router
            .execute(&request(WarehouseTarget::Snowflake, 5, Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(result.row_count, 5);
        assert_eq!(result.rows.len(), 5);
        assert!(result.truncated);
    }

    #[tokio::test]
    async fn test_timeout_is_enforced() {
        let router = WarehouseRouter::new()
            .with_cancel_grace(Duration::from_millis(20))
            .with_runner(Arc::new(FloodRunner {
                rows: 1,
                delay: Duration::from_millis(500),
            }));
        let err = router
            .execute(&request(WarehouseTarget::Snowflake, 5, Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, BiError::QueryTimeout(_)));
    }

    #[tokio::test]
    async fn test_runner_cancels_before_router_gives_up() {
        let runner = Arc::new(CancellingRunner {
            cancelled: AtomicBool::new(false),
        });
        let router = WarehouseRouter::new().with_runner(runner.clone());
        let err = router
            .execute(&request(WarehouseTarget::BigQuery, 5, Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, BiError::QueryTimeout(_)));
        assert!(runner.cancelled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_unregistered_target() {
        let router = WarehouseRouter::new();
        let err = router
            .execute(&request(WarehouseTarget::BigQuery, 5, Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, BiError::InvalidRequest(_)));
    }
}
