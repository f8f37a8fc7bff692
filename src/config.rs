use config::{Config, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

// Re-export ConfigError so it can be used in error.rs
pub use config::ConfigError;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub cache: CacheSettings,
    pub auth: AuthSettings,
    pub proxy: ProxySettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseSettings {
    /// DSN; the dialect is selected by its shape (postgres://, mysql://,
    /// anything else is treated as a SQLite file under `db_path`).
    pub dsn: String,
    /// Root directory for relative SQLite files.
    pub db_path: String,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheSettings {
    /// Redis URL for the networked backend; empty selects the in-process store.
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthSettings {
    /// Bearer secret protecting the admin surface and, when a group carries
    /// no proxy keys of its own, the proxy ingress.
    pub key: String,
    /// Passphrase for credential-at-rest encryption; empty disables it.
    pub encryption_key: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxySettings {
    /// Per-upstream-call timeout in seconds.
    pub request_timeout_secs: u64,
    /// Connect timeout for upstream dials, seconds.
    pub connect_timeout_secs: u64,
    /// Recuperation tick interval, seconds.
    pub recuperate_interval_secs: u64,
    /// Maximum cooldown credentials probed per tick.
    pub recuperate_batch: u32,
    /// Full pool refresh interval, seconds.
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3001)?
            .set_default("database.dsn", "gpt-load.db")?
            .set_default(
                "database.db_path",
                env::var("DB_PATH").unwrap_or_else(|_| "/tmp/data".to_string()),
            )?
            .set_default("database.max_connections", 50)?
            .set_default("cache.url", env::var("REDIS_DSN").unwrap_or_default())?
            .set_default("auth.key", env::var("AUTH_KEY").unwrap_or_default())?
            .set_default(
                "auth.encryption_key",
                env::var("ENCRYPTION_KEY").unwrap_or_default(),
            )?
            .set_default("proxy.request_timeout_secs", 600)?
            .set_default("proxy.connect_timeout_secs", 15)?
            .set_default("proxy.recuperate_interval_secs", 60)?
            .set_default("proxy.recuperate_batch", 10)?
            .set_default("proxy.refresh_interval_secs", 300)?
            .set_default("logging.level", "info")?
            // Add configuration file if it exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Add environment variables with prefix
            .add_source(Environment::with_prefix("GPT_LOAD").separator("__"))
            .build()?;

        let mut settings: Settings = config.try_deserialize()?;

        // Bare environment variables take precedence over file values; these
        // are the documented knobs and carry no prefix.
        if let Ok(dsn) = env::var("DATABASE_DSN") {
            if !dsn.is_empty() {
                settings.database.dsn = dsn;
            }
        }
        if let Ok(key) = env::var("AUTH_KEY") {
            if !key.is_empty() {
                settings.auth.key = key;
            }
        }
        if let Ok(key) = env::var("ENCRYPTION_KEY") {
            settings.auth.encryption_key = key;
        }

        Ok(settings)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy.connect_timeout_secs)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_can_be_loaded() {
        let settings = Settings::new();
        assert!(settings.is_ok());
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::new().unwrap();
        assert!(settings.server.port > 0);
        assert!(settings.proxy.request_timeout_secs > 0);
    }
}
