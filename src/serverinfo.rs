//! Server-Info Aggregator (spec.md §4.8): drives the info playbook and
//! shapes its output into a typed [`ServerInfo`], then answers a small
//! set of derived queries over it.

use std::collections::HashMap;
use std::time::Duration;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::exec::run_playbook;
use crate::model::{DiskType, Distro, Family, Hardware, InvocationMode, Permissions, PhpInfo, PhpInstall, ServerInfo, SiteConfigEntry, WwwMode};
use crate::playbook::PlaybookSource;
use crate::progress::NoProgress;
use crate::yaml::Value;

const INFO_PLAYBOOK: &str = "info";

/// Runs the info playbook and parses its output into a [`ServerInfo`].
/// Fails with `MalformedOutput` if the playbook's output is missing
/// the expected shape.
pub async fn gather(
    connection: &dyn Connection,
    source: &dyn PlaybookSource,
    distro_hint: &str,
    permissions_hint: &str,
    timeout: Duration,
) -> Result<ServerInfo> {
    let mut env = HashMap::new();
    env.insert("DEPLOYER_DISTRO".to_string(), distro_hint.to_string());
    env.insert("DEPLOYER_PERMS".to_string(), permissions_hint.to_string());

    let report = run_playbook(
        connection,
        source,
        INFO_PLAYBOOK,
        &env,
        timeout,
        InvocationMode::Silent,
        &NoProgress,
    )
    .await?;
    parse_server_info(&report.output.data)
}

fn parse_server_info(data: &indexmap::IndexMap<String, Value>) -> Result<ServerInfo> {
    let distro = required_str(data, "distro")?;
    let distro = Distro::parse(distro);

    let permissions = match required_str(data, "permissions")? {
        "root" => Permissions::Root,
        "sudo" => Permissions::Sudo,
        "none" => Permissions::None,
        other => {
            return Err(Error::MalformedOutput(format!(
                "unknown permissions value '{other}'"
            )))
        }
    };

    let hardware_map = required_map(data, "hardware")?;
    let hardware = Hardware {
        cpu_cores: required_int(hardware_map, "cpuCores")? as u32,
        ram_mb: required_int(hardware_map, "ramMB")? as u64,
        disk_type: match required_str(hardware_map, "diskType")? {
            "ssd" => DiskType::Ssd,
            "hdd" => DiskType::Hdd,
            other => {
                return Err(Error::MalformedOutput(format!(
                    "unknown diskType value '{other}'"
                )))
            }
        },
    };

    let php_map = required_map(data, "php")?;
    let default_php = required_str(php_map, "default")?.to_string();
    let versions_seq = php_map
        .get("versions")
        .and_then(Value::as_seq)
        .ok_or_else(|| Error::MalformedOutput("'php.versions' must be a sequence".into()))?;
    let mut versions = Vec::with_capacity(versions_seq.len());
    for entry in versions_seq {
        let entry_map = entry
            .as_map()
            .ok_or_else(|| Error::MalformedOutput("php version entry must be a mapping".into()))?;
        let version = required_str(entry_map, "version")?.to_string();
        let extensions = entry_map
            .get("extensions")
            .and_then(Value::as_seq)
            .map(|seq| {
                seq.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        versions.push(PhpInstall { version, extensions });
    }
    let php = PhpInfo {
        default: default_php,
        versions,
    };

    let mut ports = indexmap::IndexMap::new();
    if let Some(ports_map) = data.get("ports").and_then(Value::as_map) {
        for (key, value) in ports_map {
            let port: u16 = key
                .parse()
                .map_err(|_| Error::MalformedOutput(format!("invalid port key '{key}'")))?;
            let process = value
                .as_str()
                .ok_or_else(|| Error::MalformedOutput("port value must be a string".into()))?;
            ports.insert(port, process.to_string());
        }
    }

    let mut sites_config = indexmap::IndexMap::new();
    if let Some(sites_map) = data.get("sitesConfig").and_then(Value::as_map) {
        for (domain, value) in sites_map {
            let entry_map = value.as_map().ok_or_else(|| {
                Error::MalformedOutput(format!("sitesConfig entry for '{domain}' must be a mapping"))
            })?;
            let www_mode = match required_str(entry_map, "wwwMode")? {
                "redirect-to-root" => WwwMode::RedirectToRoot,
                "redirect-to-www" => WwwMode::RedirectToWww,
                other => {
                    return Err(Error::MalformedOutput(format!(
                        "unknown wwwMode value '{other}'"
                    )))
                }
            };
            sites_config.insert(
                domain.clone(),
                SiteConfigEntry {
                    php_version: required_str(entry_map, "phpVersion")?.to_string(),
                    www_mode,
                    https_enabled: entry_map
                        .get("httpsEnabled")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                },
            );
        }
    }

    Ok(ServerInfo {
        distro,
        permissions,
        hardware,
        php,
        ports,
        sites_config,
    })
}

fn required_str<'a>(map: &'a indexmap::IndexMap<String, Value>, key: &str) -> Result<&'a str> {
    map.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::MalformedOutput(format!("missing or non-string field '{key}'")))
}

fn required_int(map: &indexmap::IndexMap<String, Value>, key: &str) -> Result<i64> {
    map.get(key)
        .and_then(Value::as_int)
        .ok_or_else(|| Error::MalformedOutput(format!("missing or non-integer field '{key}'")))
}

fn required_map<'a>(
    map: &'a indexmap::IndexMap<String, Value>,
    key: &str,
) -> Result<&'a indexmap::IndexMap<String, Value>> {
    map.get(key)
        .and_then(Value::as_map)
        .ok_or_else(|| Error::MalformedOutput(format!("missing or non-mapping field '{key}'")))
}

/// Family '-distro mismatch / insufficient permissions: typed errors
/// so callers can refuse before attempting mutation.
pub fn ensure_mutation_allowed(info: &ServerInfo) -> Result<()> {
    info.validate_for_mutation()
}

/// Whether an nginx process is observed among the detected ports.
pub fn has_nginx(info: &ServerInfo) -> bool {
    info.ports.values().any(|p| p.contains("nginx"))
}

/// Whether a caddy process is observed among the detected ports.
pub fn has_caddy(info: &ServerInfo) -> bool {
    info.ports.values().any(|p| p.contains("caddy"))
}

/// PHP versions (as reported) that have `extension` installed.
pub fn php_versions_with_extension<'a>(info: &'a ServerInfo, extension: &str) -> Vec<&'a str> {
    info.php
        .versions
        .iter()
        .filter(|v| v.extensions.iter().any(|e| e == extension))
        .map(|v| v.version.as_str())
        .collect()
}

/// Domains whose site config reports HTTPS enabled.
pub fn https_enabled_sites(info: &ServerInfo) -> Vec<&str> {
    info.sites_config
        .iter()
        .filter(|(_, cfg)| cfg.https_enabled)
        .map(|(domain, _)| domain.as_str())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::yaml::parse;

    fn sample_info_yaml() -> &'static str {
        "distro: ubuntu\n\
         permissions: sudo\n\
         hardware:\n  cpuCores: 4\n  ramMB: 8192\n  diskType: ssd\n\
         php:\n  default: \"8.3\"\n  versions:\n    - version: \"8.3\"\n      extensions: [mbstring, pdo]\n\
         ports:\n  80: nginx\n  443: nginx\n\
         sitesConfig:\n  example.com:\n    phpVersion: \"8.3\"\n    wwwMode: redirect-to-root\n    httpsEnabled: true\n"
    }

    #[test]
    fn parses_full_server_info() {
        let value = parse(sample_info_yaml()).unwrap();
        let map = value.as_map().unwrap().clone();
        let info = parse_server_info(&map).unwrap();
        assert_eq!(info.distro, Distro::Ubuntu);
        assert_eq!(info.permissions, Permissions::Sudo);
        assert_eq!(info.hardware.cpu_cores, 4);
        assert!(has_nginx(&info));
        assert!(!has_caddy(&info));
        assert_eq!(php_versions_with_extension(&info, "mbstring"), vec!["8.3"]);
        assert_eq!(https_enabled_sites(&info), vec!["example.com"]);
    }

    #[test]
    fn validate_for_mutation_rejects_none_permissions() {
        let mut value = parse(sample_info_yaml()).unwrap();
        if let Value::Map(ref mut map) = value {
            map.insert("permissions".to_string(), Value::String("none".into()));
        }
        let map = value.as_map().unwrap().clone();
        let info = parse_server_info(&map).unwrap();
        assert!(ensure_mutation_allowed(&info).is_err());
    }
}
