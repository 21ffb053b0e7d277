use anyhow::{Context, Result};
use tracing::info;

use crate::api::catalog;
use crate::api::ApiServer;
use crate::core::Core;
use crate::health::HealthSnapshot;

/// Run the HTTP API until Ctrl-C
pub async fn cmd_serve(core: Core, listen: Option<String>) -> Result<()> {
    let listen = listen.unwrap_or_else(|| core.config.server.listen.clone());
    ApiServer::new(core, listen).run().await
}

/// Run the health probes once and print the snapshot as JSON
///
/// Fails when the snapshot is degraded so the exit status can drive scripts.
pub async fn cmd_health(core: &Core) -> Result<HealthSnapshot> {
    let snapshot = core.health.run_checks().await;
    println!("{}", serde_json::to_string_pretty(snapshot.as_ref())?);

    if snapshot.is_degraded() {
        let failed: Vec<&str> = snapshot
            .checks
            .iter()
            .filter(|c| !c.healthy)
            .map(|c| c.name.as_str())
            .collect();
        anyhow::bail!("Health checks degraded: {}", failed.join(", "));
    }
    Ok(snapshot.as_ref().clone())
}

/// Ensure the schema exists; with `sample`, seed an empty catalog
///
/// Returns the number of rows inserted.
pub async fn cmd_init_db(core: &Core, sample: bool) -> Result<usize> {
    let inserted = core
        .pool
        .with_connection(|conn| -> rusqlite::Result<usize> {
            catalog::init_schema(conn)?;
            if !sample {
                return Ok(0);
            }
            let existing: i64 = conn.query_row("SELECT COUNT(*) FROM products", [], |row| row.get(0))?;
            if existing > 0 {
                return Ok(0);
            }
            catalog::seed_sample(conn)
        })
        .await?
        .context("Failed to initialize database")?;

    info!(
        path = ?core.config.database.path,
        inserted,
        "Database initialized"
    );
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Environment};

    async fn test_core(dir: &tempfile::TempDir) -> Core {
        let mut config = Config::new();
        config.environment = Environment::Test;
        config.database.path = dir.path().join("catalog.sqlite");
        config.health.enabled = false;
        Core::new(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_init_db_seeds_once() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(&dir).await;

        assert_eq!(cmd_init_db(&core, true).await.unwrap(), 5);
        assert_eq!(cmd_init_db(&core, true).await.unwrap(), 0);
        assert_eq!(cmd_init_db(&core, false).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_health_with_no_probes_is_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(&dir).await;

        let snapshot = cmd_health(&core).await.unwrap();
        assert_eq!(snapshot.status, crate::health::HealthStatus::Disabled);
    }
}
