use crate::constants;
use anyhow::{Context, Result};
use bb8::{Pool, PooledConnection};
use bb8_tiberius::ConnectionManager;
use std::env;
use std::time::Duration;
use tiberius::{AuthMethod, Config, EncryptionLevel, Query, Row};
use tokio::time;
use tracing::{error, info, warn};

pub mod ledger_db;
pub mod memory;
pub mod store;

pub use ledger_db::SqlServerLedgerStore;
pub use memory::MemoryLedgerStore;
pub use store::{LedgerStore, LedgerTx};

/// SQL Server connection settings
#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub server: String,
    pub database: String,
    pub username: String,
    pub password: String,
    pub port: u16,
}

/// Pooled SQL Server access
#[derive(Clone)]
pub struct Database {
    pool: Pool<ConnectionManager>,
    config: DatabaseConfig,
    max_pool_size: u32,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("database", &self.config.database)
            .field("server", &self.config.server)
            .field("max_pool_size", &self.max_pool_size)
            .finish()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Database {
    /// Initialize database with connection pooling
    pub async fn new() -> Result<Self> {
        info!("🔄 Initializing ledger database connection pool");

        let config = Self::load_database_config()?;
        let max_pool_size = env_parse("DATABASE_MAX_CONNECTIONS", constants::DEFAULT_MAX_CONNECTIONS);
        let min_pool_size = env_parse("DATABASE_MIN_CONNECTIONS", constants::DEFAULT_MIN_CONNECTIONS);
        let connection_timeout = env_parse(
            "DATABASE_CONNECTION_TIMEOUT_SECS",
            constants::DEFAULT_CONNECTION_TIMEOUT_SECS,
        );

        let pool = Self::create_pool(&config, max_pool_size, min_pool_size, connection_timeout).await?;

        info!(
            "✅ Connection pool initialized - Database: {}, Max connections: {}, Min idle: {}",
            config.database, max_pool_size, min_pool_size
        );

        Ok(Self {
            pool,
            config,
            max_pool_size,
        })
    }

    fn load_database_config() -> Result<DatabaseConfig> {
        let server = env::var("DATABASE_SERVER")
            .with_context(|| "Missing environment variable: DATABASE_SERVER")?;
        let database = env::var("DATABASE_NAME")
            .with_context(|| "Missing environment variable: DATABASE_NAME")?;
        let username = env::var("DATABASE_USERNAME")
            .with_context(|| "Missing environment variable: DATABASE_USERNAME")?;
        let password = env::var("DATABASE_PASSWORD")
            .with_context(|| "Missing environment variable: DATABASE_PASSWORD")?;
        let port = env_parse("DATABASE_PORT", constants::DEFAULT_DATABASE_PORT);

        Ok(DatabaseConfig {
            server,
            database,
            username,
            password,
            port,
        })
    }

    async fn create_pool(
        config: &DatabaseConfig,
        max_size: u32,
        min_idle: u32,
        connection_timeout_secs: u64,
    ) -> Result<Pool<ConnectionManager>> {
        let database_encryption = env_parse("DATABASE_ENCRYPTION", false);
        let database_trust_cert = env_parse("DATABASE_TRUST_CERT", false);

        let mut tiberius_config = Config::new();
        tiberius_config.host(&config.server);
        tiberius_config.port(config.port);
        tiberius_config.database(&config.database);
        tiberius_config.authentication(AuthMethod::sql_server(&config.username, &config.password));

        if database_encryption {
            info!("🔒 Database encryption enabled");
            tiberius_config.encryption(EncryptionLevel::Required);
        } else {
            warn!("⚠️  Database encryption disabled (not recommended for production)");
            tiberius_config.encryption(EncryptionLevel::NotSupported);
        }

        if database_trust_cert {
            warn!("⚠️  Database certificate trust enabled (accepting self-signed certificates)");
            tiberius_config.trust_cert();
        }

        let manager = ConnectionManager::new(tiberius_config);

        let pool = Pool::builder()
            .max_size(max_size)
            .min_idle(Some(min_idle))
            .connection_timeout(Duration::from_secs(connection_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(300)))
            .max_lifetime(Some(Duration::from_secs(1800)))
            .build(manager)
            .await
            .context("Failed to create connection pool")?;

        let test_conn = pool
            .get()
            .await
            .context("Failed to get test connection from pool")?;
        info!("✅ Connection pool test successful");
        drop(test_conn);

        Ok(pool)
    }

    /// Borrowed pooled connection for one-off queries
    pub async fn get_client(&self) -> Result<PooledConnection<'_, ConnectionManager>> {
        self.pool.get().await.with_context(|| {
            format!(
                "Failed to get connection from pool for database: {}",
                self.config.database
            )
        })
    }

    /// Connection that can outlive `&self`; transactions hold one of these
    pub async fn get_owned_client(&self) -> Result<PooledConnection<'static, ConnectionManager>> {
        self.pool.get_owned().await.with_context(|| {
            format!(
                "Failed to get connection from pool for database: {}",
                self.config.database
            )
        })
    }

    pub fn get_database_name(&self) -> &str {
        &self.config.database
    }

    pub async fn table_exists(&self, table_name: &str) -> Result<bool> {
        let mut client = self.get_client().await?;

        let query = r#"
            SELECT COUNT(*) as table_count
            FROM INFORMATION_SCHEMA.TABLES
            WHERE TABLE_NAME = @P1 AND TABLE_TYPE = 'BASE TABLE'
        "#;

        let mut query_builder = Query::new(query);
        query_builder.bind(table_name);

        let stream = query_builder.query(&mut *client).await?;
        let rows: Vec<Vec<Row>> = stream.into_results().await?;

        if let Some(row) = rows.first().and_then(|r| r.first()) {
            let count: i32 = row.get("table_count").unwrap_or(0);
            Ok(count > 0)
        } else {
            Ok(false)
        }
    }

    /// Warns for every ledger table that is missing; returns the missing names
    pub async fn verify_ledger_schema(&self) -> Result<Vec<&'static str>> {
        let mut missing = Vec::new();
        for table in ledger_db::LEDGER_TABLES {
            if !self.table_exists(table).await? {
                warn!("⚠️ Ledger table {} not found in {}", table, self.config.database);
                missing.push(table);
            }
        }
        if missing.is_empty() {
            info!("✅ All {} ledger tables present", ledger_db::LEDGER_TABLES.len());
        }
        Ok(missing)
    }

    pub fn get_pool_status(&self) -> PoolStatus {
        let state = self.pool.state();
        PoolStatus {
            total_connections: state.connections,
            idle_connections: state.idle_connections,
            max_size: self.max_pool_size,
        }
    }
}

/// Connection pool status for monitoring
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStatus {
    pub total_connections: u32,
    pub idle_connections: u32,
    pub max_size: u32,
}

impl PoolStatus {
    pub fn usage_percent(&self) -> f64 {
        if self.max_size == 0 {
            return 0.0;
        }
        (self.total_connections as f64 / self.max_size as f64) * 100.0
    }
}

/// Periodically logs pool pressure; runs until the task is dropped
pub async fn monitor_pool_health(database: Database) {
    loop {
        time::sleep(Duration::from_secs(constants::POOL_MONITOR_INTERVAL_SECS)).await;
        let pool_status = database.get_pool_status();
        let usage_percent = pool_status.usage_percent();

        if usage_percent >= constants::POOL_HIGH_USAGE_THRESHOLD {
            error!(
                connections = pool_status.total_connections,
                idle = pool_status.idle_connections,
                max = pool_status.max_size,
                utilization = %format!("{:.1}%", usage_percent),
                "⚠️ Connection pool utilization HIGH - consider increasing DATABASE_MAX_CONNECTIONS"
            );
        } else if usage_percent >= constants::POOL_ELEVATED_USAGE_THRESHOLD {
            info!(
                connections = pool_status.total_connections,
                idle = pool_status.idle_connections,
                max = pool_status.max_size,
                utilization = %format!("{:.1}%", usage_percent),
                "⚡ Connection pool utilization elevated"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_usage_is_relative_to_max_size() {
        let status = PoolStatus {
            total_connections: 16,
            idle_connections: 4,
            max_size: 20,
        };
        assert!((status.usage_percent() - 80.0).abs() < f64::EPSILON);

        let empty = PoolStatus {
            total_connections: 0,
            idle_connections: 0,
            max_size: 0,
        };
        assert_eq!(empty.usage_percent(), 0.0);
    }
}
