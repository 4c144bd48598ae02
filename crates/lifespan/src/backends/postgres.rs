//! PostgreSQL backend built on `sqlx`.

use std::time::Duration;

use async_trait::async_trait;
use lifespan_pool::{Connector, PoolError};
use sqlx::{Connection, PgConnection};

use crate::config::ResourceConfig;
use crate::error::{Error, Result};
use crate::factory::ConnectionFactory;
use crate::transaction::Transactional;

/// Liveness check used when none is configured.
pub const DEFAULT_HEALTH_CHECK: &str = "SELECT 1";

/// Factory for PostgreSQL pools.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresFactory;

impl ConnectionFactory for PostgresFactory {
    type Connector = PostgresConnector;

    fn kind(&self) -> &'static str {
        "postgres"
    }

    fn default_health_check(&self) -> &'static str {
        DEFAULT_HEALTH_CHECK
    }

    fn connector(&self, config: &ResourceConfig) -> Result<PostgresConnector> {
        let url = config.connection_string.trim();
        if !(url.starts_with("postgres://") || url.starts_with("postgresql://")) {
            return Err(Error::Config(format!(
                "postgres connection string must use the postgres:// scheme, got '{}'",
                config.redacted_connection_string()
            )));
        }
        Ok(PostgresConnector {
            url: url.to_owned(),
            connect_timeout: config.acquire_timeout,
        })
    }
}

/// Opens single `PgConnection`s for the pool.
#[derive(Clone)]
pub struct PostgresConnector {
    url: String,
    connect_timeout: Duration,
}

impl std::fmt::Debug for PostgresConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresConnector")
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    type Connection = PgConnection;

    async fn connect(&self) -> std::result::Result<PgConnection, PoolError> {
        tokio::time::timeout(self.connect_timeout, PgConnection::connect(&self.url))
            .await
            .map_err(|_| {
                PoolError::ConnectionCreation(format!(
                    "connect timed out after {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(|e| PoolError::ConnectionCreation(e.to_string()))
    }

    async fn health_check(
        &self,
        conn: &mut PgConnection,
        query: &str,
    ) -> std::result::Result<(), PoolError> {
        sqlx::query(query)
            .execute(&mut *conn)
            .await
            .map(|_| ())
            .map_err(|e| PoolError::UnhealthyConnection(e.to_string()))
    }

    async fn close(&self, conn: PgConnection) -> std::result::Result<(), PoolError> {
        conn.close()
            .await
            .map_err(|e| PoolError::ConnectionCreation(e.to_string()))
    }
}

#[async_trait]
impl Transactional for PgConnection {
    type Error = sqlx::Error;

    async fn begin(&mut self) -> std::result::Result<(), sqlx::Error> {
        sqlx::Executor::execute(self, sqlx::raw_sql("BEGIN")).await.map(|_| ())
    }

    async fn commit(&mut self) -> std::result::Result<(), sqlx::Error> {
        sqlx::Executor::execute(self, sqlx::raw_sql("COMMIT")).await.map(|_| ())
    }

    async fn rollback(&mut self) -> std::result::Result<(), sqlx::Error> {
        sqlx::Executor::execute(self, sqlx::raw_sql("ROLLBACK")).await.map(|_| ())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_foreign_scheme() {
        let config = ResourceConfig::new("redis://localhost:6379/0");
        let err = PostgresFactory.connector(&config).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_accepts_both_schemes() {
        for dsn in ["postgres://app@db/app", "postgresql://app:pw@db:5432/app"] {
            assert!(PostgresFactory.connector(&ResourceConfig::new(dsn)).is_ok());
        }
    }

    #[test]
    fn test_connector_debug_hides_url() {
        let connector = PostgresFactory
            .connector(&ResourceConfig::new("postgres://app:s3cret@db/app"))
            .unwrap();
        assert!(!format!("{connector:?}").contains("s3cret"));
    }
}
