//! Engine-wide configuration: timeouts, pool sizing, retention
//! default, and fan-out width, loadable from an optional TOML file and
//! overridable by environment variables — the same layering the
//! teacher's `ConnectionConfig` uses.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::connection::{ConnectionDefaults, PoolConfig};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub connection: ConnectionDefaults,
    #[serde(with = "pool_config_serde")]
    pub pool: PoolConfig,
    /// Releases kept per site unless a site overrides it.
    pub default_keep_releases: u32,
    /// Bound on concurrent per-host workers (spec.md §9: "Coroutines /
    /// async ... bounded pool"), matching the teacher's `forks` default.
    pub max_forks: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionDefaults::default(),
            pool: PoolConfig::default(),
            default_keep_releases: 5,
            max_forks: 5,
        }
    }
}

impl EngineConfig {
    /// Loads from `path` if it exists (TOML), falling back to
    /// defaults, then applies `DEPLOYER_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let text = std::fs::read_to_string(p).map_err(|e| Error::io(p, e))?;
                toml::from_str(&text)
                    .map_err(|e| Error::Other(format!("invalid config at {}: {e}", p.display())))?
            }
            _ => EngineConfig::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_usize("DEPLOYER_MAX_FORKS") {
            self.max_forks = v;
        }
        if let Some(v) = env_u32("DEPLOYER_DEFAULT_KEEP_RELEASES") {
            self.default_keep_releases = v;
        }
        if let Some(v) = env_usize("DEPLOYER_POOL_MAX_PER_HOST") {
            self.pool.max_per_host = v;
        }
        if let Some(v) = env_duration("DEPLOYER_CONNECT_TIMEOUT") {
            self.connection.connect_timeout = v;
        }
        if let Some(v) = env_duration("DEPLOYER_COMMAND_TIMEOUT") {
            self.connection.command_timeout = v;
        }
        if let Some(v) = env_duration("DEPLOYER_PLAYBOOK_TIMEOUT") {
            self.connection.playbook_timeout = v;
        }
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_duration(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// `PoolConfig` has no `Serialize`/`Deserialize` of its own (it lives
/// in the connection layer, which doesn't need them); bridge it here
/// with a matching plain-field shape.
mod pool_config_serde {
    use super::*;

    #[derive(Serialize, Deserialize)]
    struct Shadow {
        max_per_host: usize,
        #[serde(with = "humantime_serde")]
        idle_timeout: Duration,
    }

    pub fn serialize<S: serde::Serializer>(
        value: &PoolConfig,
        s: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        Shadow {
            max_per_host: value.max_per_host,
            idle_timeout: value.idle_timeout,
        }
        .serialize(s)
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<PoolConfig, D::Error> {
        let shadow = Shadow::deserialize(d)?;
        Ok(PoolConfig {
            max_per_host: shadow.max_per_host,
            idle_timeout: shadow.idle_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = EngineConfig::default();
        assert_eq!(config.pool.max_per_host, 8);
        assert_eq!(config.default_keep_releases, 5);
        assert_eq!(config.max_forks, 5);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = EngineConfig::load(Some(Path::new("/nonexistent/deployer.toml"))).unwrap();
        assert_eq!(config.max_forks, 5);
    }
}
