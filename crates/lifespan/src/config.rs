//! Resource configuration.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use lifespan_pool::PoolConfig;
use url::Url;

use crate::error::{Error, Result};

/// Option key for the connection string.
pub const CONNECTION_STRING: &str = "connectionString";
/// Option key for the minimum pool size.
pub const MIN_POOL_SIZE: &str = "minPoolSize";
/// Option key for the maximum pool size.
pub const MAX_POOL_SIZE: &str = "maxPoolSize";
/// Option key for the acquisition timeout, in milliseconds.
pub const ACQUIRE_TIMEOUT_MS: &str = "acquireTimeoutMs";
/// Option key for the health check timeout, in milliseconds.
pub const HEALTH_CHECK_TIMEOUT_MS: &str = "healthCheckTimeoutMs";
/// Option key for the health check query or command.
pub const HEALTH_CHECK_COMMAND: &str = "healthCheckCommand";
/// Option key for checking idle connections before they are handed out.
pub const TEST_ON_CHECKOUT: &str = "testOnCheckout";

/// Shown instead of a connection string that cannot be parsed as a URL.
const UNPARSEABLE_DSN: &str = "<unparseable connection string>";

/// Immutable configuration for one resource type.
///
/// Built once at startup and shared (usually behind an `Arc`) for the life
/// of the process. [`validate`](Self::validate) runs before any connection
/// is attempted, so bad input fails at startup rather than on first use.
#[derive(Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct ResourceConfig {
    /// Connection string (DSN) for the backend.
    pub connection_string: String,

    /// Connections opened when the pool is built (at least one is always opened).
    pub min_pool_size: u32,

    /// Maximum number of pooled connections.
    pub max_pool_size: u32,

    /// Default time a caller waits for a handle.
    pub acquire_timeout: Duration,

    /// Time allowed for a liveness check.
    pub health_check_timeout: Duration,

    /// Query or command used as the liveness check.
    ///
    /// `None` uses the backend's default (`SELECT 1`, `PING`, ...).
    pub health_check_command: Option<String>,

    /// Run the liveness check on an idle connection before handing it out,
    /// replacing connections that fail it.
    pub test_on_checkout: bool,
}

impl ResourceConfig {
    /// Create a configuration with default pool sizing and timeouts.
    #[must_use]
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            min_pool_size: 1,
            max_pool_size: 10,
            acquire_timeout: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
            health_check_command: None,
            test_on_checkout: false,
        }
    }

    /// Parse the recognized options of a configuration mapping.
    ///
    /// `connectionString` is required; numeric options fall back to the
    /// defaults of [`ResourceConfig::new`] when absent but must parse when
    /// present. The result is validated.
    pub fn from_options(options: &HashMap<String, String>) -> Result<Self> {
        let connection_string = options
            .get(CONNECTION_STRING)
            .ok_or_else(|| Error::Config(format!("missing option '{CONNECTION_STRING}'")))?;

        let mut config = Self::new(connection_string.as_str());
        if let Some(min) = parse_option::<u32>(options, MIN_POOL_SIZE)? {
            config.min_pool_size = min;
        }
        if let Some(max) = parse_option::<u32>(options, MAX_POOL_SIZE)? {
            config.max_pool_size = max;
        }
        if let Some(ms) = parse_option::<u64>(options, ACQUIRE_TIMEOUT_MS)? {
            config.acquire_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_option::<u64>(options, HEALTH_CHECK_TIMEOUT_MS)? {
            config.health_check_timeout = Duration::from_millis(ms);
        }
        if let Some(command) = options.get(HEALTH_CHECK_COMMAND) {
            config.health_check_command = Some(command.clone());
        }
        if let Some(enabled) = parse_option::<bool>(options, TEST_ON_CHECKOUT)? {
            config.test_on_checkout = enabled;
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the minimum pool size.
    #[must_use]
    pub fn min_pool_size(mut self, size: u32) -> Self {
        self.min_pool_size = size;
        self
    }

    /// Set the maximum pool size.
    #[must_use]
    pub fn max_pool_size(mut self, size: u32) -> Self {
        self.max_pool_size = size;
        self
    }

    /// Set the default acquisition timeout.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the liveness check timeout.
    #[must_use]
    pub fn health_check_timeout(mut self, timeout: Duration) -> Self {
        self.health_check_timeout = timeout;
        self
    }

    /// Set the liveness check query or command.
    #[must_use]
    pub fn health_check_command(mut self, command: impl Into<String>) -> Self {
        self.health_check_command = Some(command.into());
        self
    }

    /// Check idle connections before handing them out.
    #[must_use]
    pub fn test_on_checkout(mut self, enabled: bool) -> Self {
        self.test_on_checkout = enabled;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.connection_string.trim().is_empty() {
            return Err(Error::Config("connection string must not be empty".into()));
        }
        if self.max_pool_size == 0 {
            return Err(Error::Config("max pool size must be greater than 0".into()));
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(Error::Config(format!(
                "min pool size ({}) cannot be greater than max pool size ({})",
                self.min_pool_size, self.max_pool_size
            )));
        }
        if self.acquire_timeout.is_zero() {
            return Err(Error::Config("acquire timeout must be greater than 0".into()));
        }
        if self.health_check_timeout.is_zero() {
            return Err(Error::Config(
                "health check timeout must be greater than 0".into(),
            ));
        }
        if matches!(&self.health_check_command, Some(command) if command.trim().is_empty()) {
            return Err(Error::Config("health check command must not be empty".into()));
        }
        Ok(())
    }

    /// Pool configuration for this resource.
    ///
    /// `default_health_check` is used when no command is configured.
    #[must_use]
    pub fn pool_config(&self, default_health_check: &str) -> PoolConfig {
        PoolConfig::new()
            .min_connections(self.min_pool_size)
            .max_connections(self.max_pool_size)
            .connection_timeout(self.acquire_timeout)
            .test_on_checkout(self.test_on_checkout)
            .health_check_query(
                self.health_check_command
                    .as_deref()
                    .unwrap_or(default_health_check),
            )
    }

    /// The connection string with any password replaced by `***`.
    ///
    /// A string that is not a URL is replaced entirely, since it may carry
    /// credentials in a form that cannot be located.
    #[must_use]
    pub fn redacted_connection_string(&self) -> String {
        let Ok(mut url) = Url::parse(&self.connection_string) else {
            return UNPARSEABLE_DSN.to_owned();
        };
        if url.password().is_some() && url.set_password(Some("***")).is_err() {
            return UNPARSEABLE_DSN.to_owned();
        }
        url.into()
    }
}

impl fmt::Debug for ResourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceConfig")
            .field("connection_string", &self.redacted_connection_string())
            .field("min_pool_size", &self.min_pool_size)
            .field("max_pool_size", &self.max_pool_size)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("health_check_timeout", &self.health_check_timeout)
            .field("health_check_command", &self.health_check_command)
            .field("test_on_checkout", &self.test_on_checkout)
            .finish()
    }
}

fn parse_option<T: FromStr>(options: &HashMap<String, String>, key: &str) -> Result<Option<T>> {
    options
        .get(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|_| Error::Config(format!("invalid value '{raw}' for option '{key}'")))
        })
        .transpose()
}
