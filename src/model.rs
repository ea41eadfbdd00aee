//! Core data model: `Server`, `Site`, `ServerInfo`, `Release`, and the
//! small value types that compose them (spec.md §3).
//!
//! These types are owned by the caller (the inventory layer) and handed
//! to the engine by value; the engine never mutates or persists them.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A managed host, as declared by the operator.
///
/// Identity is `name`, unique within the caller's inventory. Immutable
/// from the engine's point of view except for `tags`, which the caller
/// may update out of band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub name: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub instance_id: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

impl Server {
    /// The `(host, port, username)` triple that keys the connection pool.
    pub fn pool_key(&self) -> (String, u16, String) {
        (self.host.clone(), self.port, self.username.clone())
    }
}

/// Linux distribution family, as detected by the info playbook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distro {
    Ubuntu,
    Debian,
    Fedora,
    Centos,
    Rocky,
    Alma,
    Rhel,
    Amazon,
    Unknown,
}

impl Distro {
    pub fn family(self) -> Family {
        match self {
            Distro::Ubuntu | Distro::Debian => Family::Debian,
            Distro::Fedora => Family::Fedora,
            Distro::Centos | Distro::Rocky | Distro::Alma | Distro::Rhel => Family::Redhat,
            Distro::Amazon => Family::Amazon,
            Distro::Unknown => Family::Unknown,
        }
    }

    /// Whether this distro is supported for mutating playbooks
    /// (spec.md §1 Non-goals: "no support for non-apt distributions").
    pub fn is_apt_supported(self) -> bool {
        matches!(self.family(), Family::Debian)
    }

    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "ubuntu" => Distro::Ubuntu,
            "debian" => Distro::Debian,
            "fedora" => Distro::Fedora,
            "centos" => Distro::Centos,
            "rocky" => Distro::Rocky,
            "alma" | "almalinux" => Distro::Alma,
            "rhel" => Distro::Rhel,
            "amazon" | "amzn" => Distro::Amazon,
            _ => Distro::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Debian,
    Fedora,
    Redhat,
    Amazon,
    Unknown,
}

/// The privilege level the info playbook found it was running with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permissions {
    Root,
    Sudo,
    None,
}

impl Permissions {
    /// Invariant from spec.md §3: mutating playbooks require root or sudo.
    pub fn allows_mutation(self) -> bool {
        matches!(self, Permissions::Root | Permissions::Sudo)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskType {
    Ssd,
    Hdd,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hardware {
    pub cpu_cores: u32,
    pub ram_mb: u64,
    pub disk_type: DiskType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhpInstall {
    pub version: String,
    pub extensions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhpInfo {
    pub default: String,
    pub versions: Vec<PhpInstall>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteConfigEntry {
    pub php_version: String,
    pub www_mode: WwwMode,
    pub https_enabled: bool,
}

/// Transient, produced by the info playbook (spec.md §3 `ServerInfo`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub distro: Distro,
    pub permissions: Permissions,
    pub hardware: Hardware,
    pub php: PhpInfo,
    /// port -> process name
    pub ports: indexmap::IndexMap<u16, String>,
    /// domain -> site config
    pub sites_config: indexmap::IndexMap<String, SiteConfigEntry>,
}

impl ServerInfo {
    pub fn family(&self) -> Family {
        self.distro.family()
    }

    /// The engine-side validation gate from spec.md §3: mutating
    /// playbooks may only be selected for root/sudo targets.
    pub fn validate_for_mutation(&self) -> crate::error::Result<()> {
        if !self.distro.is_apt_supported() {
            return Err(crate::error::Error::DistroUnsupported(format!(
                "{:?}",
                self.distro
            )));
        }
        if !self.permissions.allows_mutation() {
            return Err(crate::error::Error::PermissionsInsufficient(
                self.permissions,
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WwwMode {
    RedirectToRoot,
    RedirectToWww,
}

/// `PlaybookInvocation.mode` (spec.md §3): whether the executor runs
/// the remote script silently and reports the result afterward, or
/// streams output lines to a [`crate::progress::Progress`] sink as
/// they arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvocationMode {
    #[default]
    Silent,
    Streaming,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronJob {
    /// Path relative to the site's deployed code.
    pub script: String,
    pub schedule: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorProgram {
    pub program: String,
    /// Path relative to the site's deployed code.
    pub script: String,
    pub autostart: bool,
    pub autorestart: bool,
    pub stopwaitsecs: u32,
    pub numprocs: u32,
}

/// A declared site (spec.md §3 `Site`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub domain: String,
    pub server_name: String,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    pub php_version: String,
    pub www_mode: WwwMode,
    #[serde(default)]
    pub crons: Vec<CronJob>,
    #[serde(default)]
    pub supervisors: Vec<SupervisorProgram>,
    #[serde(default = "default_keep_releases")]
    pub keep_releases: u32,
}

fn default_keep_releases() -> u32 {
    5
}

impl Site {
    /// `/home/deployer/sites/<domain>` (spec.md §4.5).
    pub fn remote_root(&self) -> String {
        format!("/home/deployer/sites/{}", self.domain)
    }

    pub fn releases_dir(&self) -> String {
        format!("{}/releases", self.remote_root())
    }

    pub fn shared_dir(&self) -> String {
        format!("{}/shared", self.remote_root())
    }

    pub fn repo_dir(&self) -> String {
        format!("{}/repo", self.remote_root())
    }

    pub fn current_path(&self) -> String {
        format!("{}/current", self.remote_root())
    }

    pub fn runner_path(&self) -> String {
        format!("{}/runner.sh", self.remote_root())
    }
}

/// Lifecycle status for a `Release`, internal orchestrator bookkeeping
/// (SPEC_FULL.md §3 supplement). Not persisted; derived fresh per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseStatus {
    Building,
    HooksRunning,
    Active,
    Superseded,
    Abandoned,
}

/// A release on the remote host (spec.md §3 `Release`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseName(pub String);

impl ReleaseName {
    /// `YYYYMMDD_HHMMSS`, with `_2`, `_3`, ... suffixes on collision
    /// (spec.md §4.5 step 4).
    pub fn matches_format(s: &str) -> bool {
        let base = s.split('_').take(2).collect::<Vec<_>>().join("_");
        base.len() == 15
            && base.as_bytes()[8] == b'_'
            && base[..8].bytes().all(|b| b.is_ascii_digit())
            && base[9..].bytes().all(|b| b.is_ascii_digit())
    }
}

impl std::fmt::Display for ReleaseName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod release_tests {
    use super::*;

    #[test]
    fn matches_format_accepts_timestamp_and_collision_suffix() {
        assert!(ReleaseName::matches_format("20260801_120000"));
        assert!(ReleaseName::matches_format("20260801_120000_2"));
    }

    #[test]
    fn matches_format_rejects_malformed_names() {
        assert!(!ReleaseName::matches_format("not-a-release"));
        assert!(!ReleaseName::matches_format("2026080_120000"));
    }

    #[test]
    fn release_status_transitions_are_distinct() {
        assert_ne!(ReleaseStatus::Building, ReleaseStatus::Active);
        assert_eq!(ReleaseStatus::Active, ReleaseStatus::Active);
    }
}
