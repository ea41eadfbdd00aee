//! Per-host connection configuration, adapted from the teacher's SSH
//! config layer (`connection/config.rs`) and narrowed to the fields the
//! spec actually names: host, port, user, key path, and the timeouts in
//! spec.md §5.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Connection defaults shared across all hosts unless overridden.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionDefaults {
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_command_timeout")]
    pub command_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_playbook_timeout")]
    pub playbook_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_transfer_timeout")]
    pub transfer_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_cancel_grace")]
    pub cancel_grace_period: Duration,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_command_timeout() -> Duration {
    Duration::from_secs(60)
}
fn default_playbook_timeout() -> Duration {
    Duration::from_secs(15 * 60)
}
fn default_transfer_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}
fn default_cancel_grace() -> Duration {
    Duration::from_secs(5)
}

impl Default for ConnectionDefaults {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            command_timeout: default_command_timeout(),
            playbook_timeout: default_playbook_timeout(),
            transfer_timeout: default_transfer_timeout(),
            cancel_grace_period: default_cancel_grace(),
        }
    }
}

/// Resolved configuration for one host's SSH connection.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub private_key_path: Option<PathBuf>,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

impl HostConfig {
    pub fn from_server(server: &crate::model::Server, defaults: &ConnectionDefaults) -> Self {
        Self {
            host: server.host.clone(),
            port: server.port,
            user: server.username.clone(),
            private_key_path: server.private_key_path.clone(),
            connect_timeout: defaults.connect_timeout,
            command_timeout: defaults.command_timeout,
        }
    }
}

/// Candidate identity files tried, in order, when no explicit key path
/// is configured (spec.md §4.1: "Key material comes from
/// `privateKeyPath` if set, otherwise the agent or default identity").
pub fn default_identity_files() -> Vec<PathBuf> {
    let home = dirs_home();
    vec![
        home.join(".ssh/id_ed25519"),
        home.join(".ssh/id_rsa"),
        home.join(".ssh/id_ecdsa"),
    ]
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/root"))
}
