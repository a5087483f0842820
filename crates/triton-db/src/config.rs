//! Persistence daemon configuration.

use std::time::Duration;

use triton_config::Config;

/// Connection and scheduling parameters for the persistence daemon.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database server endpoint, e.g. `tcp://localhost:3306`.
    pub server: String,
    /// Login user.
    pub username: String,
    /// Login password.
    pub password: String,
    /// Schema selected after connecting.
    pub schema: String,
    /// Time a pended save waits before it matures.
    pub save_delay: Duration,
    /// Upper bound on the reconnect backoff.
    pub max_reconn_delay: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            server: "tcp://localhost:3306".to_owned(),
            username: "root".to_owned(),
            password: "root".to_owned(),
            schema: "test".to_owned(),
            save_delay: Duration::from_millis(5000),
            max_reconn_delay: Duration::from_millis(60_000),
        }
    }
}

impl DbConfig {
    /// Reads the daemon's keys from the configuration collaborator, falling
    /// back to the defaults above for anything absent.
    pub fn from_config(config: &Config) -> Self {
        let defaults = Self::default();
        Self {
            server: config.get("database_server", defaults.server),
            username: config.get("database_username", defaults.username),
            password: config.get("database_password", defaults.password),
            schema: config.get("database_name", defaults.schema),
            save_delay: Duration::from_millis(
                config.get("database_save_delay", defaults.save_delay.as_millis() as u64),
            ),
            max_reconn_delay: Duration::from_millis(config.get(
                "database_max_reconn_delay",
                defaults.max_reconn_delay.as_millis() as u64,
            )),
        }
    }

    /// Sets the save delay.
    pub fn with_save_delay(mut self, delay: Duration) -> Self {
        self.save_delay = delay;
        self
    }

    /// Sets the backoff cap.
    pub fn with_max_reconn_delay(mut self, delay: Duration) -> Self {
        self.max_reconn_delay = delay;
        self
    }
}
