//! PostgreSQL pool backing the subscription store and delivery log.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::AppConfig;

/// Pool sizing taken from `DB_MAX_CONNECTIONS` and `DB_ACQUIRE_TIMEOUT_SECS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_connections: u32,
    /// How long a store call waits for a free connection before failing.
    pub acquire_timeout: Duration,
}

impl PoolSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_connections: config.db_max_connections,
            acquire_timeout: Duration::from_secs(config.db_acquire_timeout_secs),
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.max_connections == 0 {
            anyhow::bail!("DB_MAX_CONNECTIONS must be at least 1");
        }
        if self.acquire_timeout.is_zero() {
            anyhow::bail!("DB_ACQUIRE_TIMEOUT_SECS must be at least 1");
        }
        Ok(())
    }
}

/// Connect to PostgreSQL. Migrations are applied separately with [`run_migrations`].
pub async fn create_pool(database_url: &str, settings: &PoolSettings) -> anyhow::Result<PgPool> {
    settings.validate()?;

    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.acquire_timeout)
        .connect(database_url)
        .await?;

    tracing::info!(
        max_connections = settings.max_connections,
        acquire_timeout_secs = settings.acquire_timeout.as_secs(),
        "Connected to PostgreSQL"
    );
    Ok(pool)
}

/// Apply the schema in `migrations/` (subscriptions, delivery_records).
pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    tracing::info!("Database migrations applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_follow_config() {
        let config = AppConfig {
            db_max_connections: 7,
            db_acquire_timeout_secs: 12,
            ..AppConfig::default()
        };
        let settings = PoolSettings::from_config(&config);
        assert_eq!(settings.max_connections, 7);
        assert_eq!(settings.acquire_timeout, Duration::from_secs(12));
    }

    #[tokio::test]
    async fn test_empty_pool_rejected_before_connecting() {
        let settings = PoolSettings {
            max_connections: 0,
            acquire_timeout: Duration::from_secs(5),
        };
        let err = create_pool("postgres://unreachable.invalid/herald", &settings)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("DB_MAX_CONNECTIONS"));
    }
}
