//! Layered configuration for the `jobmux` binary.
//!
//! Resolution chain, ascending precedence: compiled-in defaults ->
//! `jobmux.toml` in the current directory, if present -> environment
//! variable overrides -> explicit CLI flag.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use jobmux_db::config::DbConfig;

/// Default bind address and port for `jobmux serve` when nothing else
/// specifies one.
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub api: ApiSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ApiSection {
    pub bind: Option<String>,
    pub port: Option<u16>,
}

/// Path to the config file: `jobmux.toml` in the current directory.
pub fn config_path() -> PathBuf {
    Path::new("jobmux.toml").to_path_buf()
}

fn load_config_file() -> Option<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str(&contents) {
        Ok(config) => Some(config),
        Err(error) => {
            tracing::warn!(path = %path.display(), %error, "ignoring unparseable config file");
            None
        }
    }
}

/// Fully resolved configuration, ready for use.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_config: DbConfig,
    pub api_bind: String,
    pub api_port: u16,
}

impl AppConfig {
    /// Resolve configuration using the chain described at the module level.
    pub fn resolve(
        cli_database_url: Option<&str>,
        cli_bind: Option<&str>,
        cli_port: Option<u16>,
    ) -> Result<Self> {
        let file_config = load_config_file();

        let database_url = if let Some(url) = cli_database_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("JOBMUX_DATABASE_URL") {
            url
        } else if let Some(url) = file_config.as_ref().and_then(|c| c.database.url.clone()) {
            url
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };

        let api_bind = if let Some(bind) = cli_bind {
            bind.to_string()
        } else if let Ok(bind) = std::env::var("JOBMUX_API_BIND") {
            bind
        } else if let Some(bind) = file_config.as_ref().and_then(|c| c.api.bind.clone()) {
            bind
        } else {
            DEFAULT_BIND.to_string()
        };

        let api_port = if let Some(port) = cli_port {
            port
        } else if let Ok(port) = std::env::var("JOBMUX_API_PORT") {
            port
                .parse()
                .context("JOBMUX_API_PORT is not a valid port number")?
        } else if let Some(port) = file_config.as_ref().and_then(|c| c.api.port) {
            port
        } else {
            DEFAULT_PORT
        };

        Ok(Self {
            db_config: DbConfig::new(database_url),
            api_bind,
            api_port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
        LOCK.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    #[test]
    fn resolve_defaults_when_nothing_set() {
        let _lock = lock_env();
        unsafe { std::env::remove_var("JOBMUX_DATABASE_URL") };
        unsafe { std::env::remove_var("JOBMUX_API_BIND") };
        unsafe { std::env::remove_var("JOBMUX_API_PORT") };

        let config = AppConfig::resolve(None, None, None).unwrap();
        assert_eq!(config.db_config.database_url, DbConfig::DEFAULT_URL);
        assert_eq!(config.api_bind, DEFAULT_BIND);
        assert_eq!(config.api_port, DEFAULT_PORT);
    }

    #[test]
    fn cli_flag_overrides_env_var() {
        let _lock = lock_env();
        unsafe { std::env::set_var("JOBMUX_DATABASE_URL", "postgresql://env:5432/envdb") };

        let config = AppConfig::resolve(Some("postgresql://cli:5432/clidb"), None, None).unwrap();
        assert_eq!(config.db_config.database_url, "postgresql://cli:5432/clidb");

        unsafe { std::env::remove_var("JOBMUX_DATABASE_URL") };
    }

    #[test]
    fn env_var_overrides_default() {
        let _lock = lock_env();
        unsafe { std::env::set_var("JOBMUX_API_PORT", "9999") };

        let config = AppConfig::resolve(None, None, None).unwrap();
        assert_eq!(config.api_port, 9999);

        unsafe { std::env::remove_var("JOBMUX_API_PORT") };
    }
}
