//! Redis backend built on the `redis` crate's multiplexed connection.

use std::time::Duration;

use async_trait::async_trait;
use lifespan_pool::{Connector, PoolError};
use redis::aio::MultiplexedConnection;

use crate::config::ResourceConfig;
use crate::error::{Error, Result};
use crate::factory::ConnectionFactory;

/// Liveness check used when none is configured.
pub const DEFAULT_HEALTH_CHECK: &str = "PING";

/// Factory for Redis pools.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedisFactory;

impl ConnectionFactory for RedisFactory {
    type Connector = RedisConnector;

    fn kind(&self) -> &'static str {
        "redis"
    }

    fn default_health_check(&self) -> &'static str {
        DEFAULT_HEALTH_CHECK
    }

    fn connector(&self, config: &ResourceConfig) -> Result<RedisConnector> {
        let client = redis::Client::open(config.connection_string.trim()).map_err(|e| {
            Error::Config(format!(
                "invalid redis connection string '{}': {e}",
                config.redacted_connection_string()
            ))
        })?;
        Ok(RedisConnector {
            client,
            connect_timeout: config.acquire_timeout,
        })
    }
}

/// Opens multiplexed Redis connections for the pool.
#[derive(Clone)]
pub struct RedisConnector {
    client: redis::Client,
    connect_timeout: Duration,
}

impl std::fmt::Debug for RedisConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConnector")
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connector for RedisConnector {
    type Connection = MultiplexedConnection;

    async fn connect(&self) -> std::result::Result<MultiplexedConnection, PoolError> {
        tokio::time::timeout(
            self.connect_timeout,
            self.client.get_multiplexed_async_connection(),
        )
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
        conn: &mut MultiplexedConnection,
        command: &str,
    ) -> std::result::Result<(), PoolError> {
        let cmd = health_command(command)
            .ok_or_else(|| PoolError::Configuration("empty health check command".into()))?;
        let _: redis::Value = cmd
            .query_async(conn)
            .await
            .map_err(|e| PoolError::UnhealthyConnection(e.to_string()))?;
        Ok(())
    }
}

/// Split a raw command line such as `PING` or `ECHO ok` into a command.
fn health_command(line: &str) -> Option<redis::Cmd> {
    let mut parts = line.split_whitespace();
    let mut cmd = redis::cmd(parts.next()?);
    for arg in parts {
        cmd.arg(arg);
    }
    Some(cmd)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_url() {
        let config = ResourceConfig::new("not a url");
        let err = RedisFactory.connector(&config).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_accepts_redis_url() {
        let config = ResourceConfig::new("redis://:pw@cache:6379/2");
        assert!(RedisFactory.connector(&config).is_ok());
    }

    #[test]
    fn test_health_command_parsing() {
        assert!(health_command("   ").is_none());
        let cmd = health_command("ECHO ok").unwrap();
        assert_eq!(cmd.args_iter().count(), 2);
    }
}
