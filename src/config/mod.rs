use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::models::Granularity;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub stats: StatsConfig,
    pub log_filter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    Memory,
    Sqlite,
    Postgres,
}

/// Defaults applied when a stats query leaves a parameter unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    pub default_granularity: Granularity,
    /// Minutes to subtract from UTC to get client-local time.
    pub default_tz_offset_minutes: i32,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            default_granularity: Granularity::Day,
            default_tz_offset_minutes: 0,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let backend_str = lookup("DATABASE_BACKEND").unwrap_or_else(|| "sqlite".to_string());

        let backend = match backend_str.to_lowercase().as_str() {
            "memory" | "mem" => DatabaseBackend::Memory,
            "postgres" | "postgresql" => DatabaseBackend::Postgres,
            "sqlite" => DatabaseBackend::Sqlite,
            other => {
                tracing::warn!(
                    "Unknown DATABASE_BACKEND '{other}', falling back to 'sqlite'. Supported values: memory, sqlite, postgres"
                );
                DatabaseBackend::Sqlite
            }
        };

        let database_url =
            lookup("DATABASE_URL").unwrap_or_else(|| "sqlite://./clickstats.db".to_string());

        let max_connections = lookup("DATABASE_MAX_CONNECTIONS")
            .unwrap_or_else(|| "10".to_string())
            .parse::<u32>()
            .context("DATABASE_MAX_CONNECTIONS must be a positive integer")?;

        let default_granularity = match lookup("STATS_DEFAULT_GRANULARITY") {
            Some(value) => value
                .parse::<Granularity>()
                .map_err(|e| anyhow::anyhow!("STATS_DEFAULT_GRANULARITY: {e}"))?,
            None => Granularity::Day,
        };

        let default_tz_offset_minutes = lookup("STATS_DEFAULT_TZ_OFFSET_MINUTES")
            .unwrap_or_else(|| "0".to_string())
            .parse::<i32>()
            .context("STATS_DEFAULT_TZ_OFFSET_MINUTES must be an integer")?;

        let log_filter = lookup("LOG_FILTER").unwrap_or_else(|| "info".to_string());

        Ok(Config {
            database: DatabaseConfig {
                backend,
                url: database_url,
                max_connections,
            },
            stats: StatsConfig {
                default_granularity,
                default_tz_offset_minutes,
            },
            log_filter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.database.backend, DatabaseBackend::Sqlite);
        assert_eq!(config.database.url, "sqlite://./clickstats.db");
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.stats.default_granularity, Granularity::Day);
        assert_eq!(config.stats.default_tz_offset_minutes, 0);
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("DATABASE_BACKEND", "PostgreSQL"),
            ("DATABASE_URL", "postgres://localhost/stats"),
            ("DATABASE_MAX_CONNECTIONS", "4"),
            ("STATS_DEFAULT_GRANULARITY", "month"),
            ("STATS_DEFAULT_TZ_OFFSET_MINUTES", "-180"),
        ])
        .unwrap();
        assert_eq!(config.database.backend, DatabaseBackend::Postgres);
        assert_eq!(config.database.max_connections, 4);
        assert_eq!(config.stats.default_granularity, Granularity::Month);
        assert_eq!(config.stats.default_tz_offset_minutes, -180);
    }

    #[test]
    fn test_unknown_backend_falls_back_to_sqlite() {
        let config = load(&[("DATABASE_BACKEND", "mongo")]).unwrap();
        assert_eq!(config.database.backend, DatabaseBackend::Sqlite);
    }

    #[test]
    fn test_malformed_numbers_are_rejected() {
        assert!(load(&[("DATABASE_MAX_CONNECTIONS", "lots")]).is_err());
        assert!(load(&[("STATS_DEFAULT_TZ_OFFSET_MINUTES", "utc")]).is_err());
        assert!(load(&[("STATS_DEFAULT_GRANULARITY", "week")]).is_err());
    }
}
