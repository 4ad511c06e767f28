use std::sync::Arc;

use flywheel_core::{JobQueue, PoolConfig};
use health::HealthHandle;
use sqlx::PgPool;
use tokio::sync::Semaphore;

use crate::config::AppConfig;
use crate::error::DispatcherError;

pub struct AppContext {
    pub queue: JobQueue,
    pub concurrency_limit: Arc<Semaphore>,
    pub liveness: HealthHandle,
    pub config: AppConfig,
}

impl AppContext {
    pub async fn create(
        config: AppConfig,
        pool_config: PoolConfig,
        liveness: HealthHandle,
    ) -> Result<Self, DispatcherError> {
        let queue = JobQueue::new(&pool_config, config.dialect).await?;
        let concurrency_limit = Arc::new(Semaphore::new(config.max_concurrent_jobs));

        Ok(Self {
            queue,
            concurrency_limit,
            liveness,
            config,
        })
    }

    // Designed mostly to be used for testing, but safe enough to expose publicly
    pub fn from_pool(pool: PgPool, config: AppConfig, liveness: HealthHandle) -> Self {
        let queue = JobQueue::from_pool(pool, config.dialect);
        let concurrency_limit = Arc::new(Semaphore::new(config.max_concurrent_jobs));

        Self {
            queue,
            concurrency_limit,
            liveness,
            config,
        }
    }

    pub fn metric_labels(&self) -> Vec<(String, String)> {
        vec![("worker_id".to_string(), self.config.worker_id.clone())]
    }
}
