use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::api::catalog::{self, CatalogService};
use crate::config::Config;
use crate::health::{CacheProbe, DatabaseProbe, FilesystemProbe, HealthAggregator, HealthProbe, MemoryProbe};
use crate::pool::{CatalogBreaker, SqliteConnector, SqlitePool};

/// Core shared by the server and the CLI commands
///
/// Clones share the same pool, breaker and health aggregator.
#[derive(Clone)]
pub struct Core {
    pub config: Arc<Config>,
    pub pool: Arc<SqlitePool>,
    /// `None` when the breaker is disabled in configuration
    pub breaker: Option<Arc<CatalogBreaker>>,
    pub health: Arc<HealthAggregator>,
    catalog: Arc<CatalogService>,
}

impl Core {
    pub async fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);

        let pool_config = config.pool_config();
        let connector = SqliteConnector::from_config(&pool_config);
        let pool = Arc::new(
            SqlitePool::new(pool_config, connector)
                .context(format!("Failed to open database {:?}", config.database.path))?,
        );

        pool.with_connection(|conn| catalog::init_schema(conn))
            .await?
            .context("Failed to initialize catalog schema")?;

        let breaker = config
            .breaker
            .enabled
            .then(|| Arc::new(CatalogBreaker::new(config.breaker_config())));

        let health = Arc::new(if config.health.enabled {
            HealthAggregator::new(
                Self::probes(&config, &pool),
                Duration::from_millis(config.health.interval_ms),
            )
        } else {
            HealthAggregator::disabled()
        });

        let catalog = Arc::new(CatalogService::new(Arc::clone(&pool), breaker.clone()));

        info!(
            environment = ?config.environment,
            breaker = breaker.is_some(),
            health_checks = health.is_enabled(),
            "Core initialized"
        );

        Ok(Self {
            config,
            pool,
            breaker,
            health,
            catalog,
        })
    }

    fn probes(config: &Config, pool: &Arc<SqlitePool>) -> Vec<Arc<dyn HealthProbe>> {
        let health = &config.health;
        vec![
            Arc::new(DatabaseProbe::new(
                Arc::clone(pool),
                Duration::from_millis(health.database_timeout_ms),
            )),
            Arc::new(CacheProbe::new(
                config.cache.enabled,
                config.cache.url.clone(),
                Duration::from_millis(health.cache_timeout_ms),
            )),
            Arc::new(FilesystemProbe::new(Duration::from_millis(health.filesystem_timeout_ms))),
            Arc::new(MemoryProbe::new(health.memory_threshold_ratio)),
        ]
    }

    /// Catalog reads guarded by the breaker
    pub fn catalog(&self) -> &CatalogService {
        &self.catalog
    }

    /// Start health polling (long-running server mode only)
    ///
    /// Skipped in the test environment.
    pub fn start_background_tasks(&self) {
        if self.config.is_test() {
            return;
        }
        self.health.start();
    }

    /// Stop polling and close the pool
    pub fn shutdown(&self) {
        self.health.stop();
        self.pool.close();
        info!("Core shut down");
    }
}
