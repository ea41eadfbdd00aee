//! Assembles a playbook into one self-contained script by inlining
//! `helpers.sh` at its marker comment (spec.md §4.2).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use super::source::PlaybookSource;
use crate::error::{Error, Result};

/// The conventional marker line a playbook uses to request the shared
/// helpers be inlined: a comment immediately followed by
/// `source "$(dirname "$0")/helpers.sh"`.
const SOURCE_LINE: &str = "source \"$(dirname \"$0\")/helpers.sh\"";

/// The result of assembling one playbook: its rendered bytes, a
/// deterministic content hash, and the extra environment variables it
/// declares as required (via a `# DEPLOYER-REQUIRES: VAR ...` comment).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledScript {
    pub script: Vec<u8>,
    pub hash: u64,
    pub required_env: Vec<String>,
}

/// Assembles `name` from `source`, inlining `helpers.sh`.
///
/// Validates: the playbook exists; `helpers.sh` exists; no nested
/// `source` directives reference anything other than `helpers.sh` (an
/// unknown include fails with `UnknownInclude`).
pub fn assemble(source: &dyn PlaybookSource, name: &str) -> Result<AssembledScript> {
    if !source.playbook_exists(name) {
        return Err(Error::UnknownPlaybook(name.to_string()));
    }
    let playbook_bytes = source.read_playbook(name)?;
    let playbook_text = String::from_utf8_lossy(&playbook_bytes).into_owned();

    reject_unknown_includes(name, &playbook_text)?;

    let helpers_bytes = source.read_include("helpers.sh").map_err(|e| match e {
        Error::UnknownInclude { include, .. } => Error::UnknownInclude {
            playbook: name.to_string(),
            include,
        },
        other => other,
    })?;
    let helpers_text = String::from_utf8_lossy(&helpers_bytes).into_owned();

    let required_env = parse_requires(&playbook_text);
    let script_text = inline(&playbook_text, &helpers_text);
    let script = script_text.into_bytes();
    let hash = hash_bytes(&script);

    Ok(AssembledScript {
        script,
        hash,
        required_env,
    })
}

/// Computes the deterministic content hash of already-assembled bytes,
/// independent of `assemble`, for callers that cache by hash.
pub fn content_hash(script: &[u8]) -> u64 {
    hash_bytes(script)
}

fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

/// Scans for `source`/`.` directives outside the conventional helpers
/// marker and rejects any that don't reference `helpers.sh`.
fn reject_unknown_includes(playbook: &str, text: &str) -> Result<()> {
    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let rest = line
            .strip_prefix("source ")
            .or_else(|| line.strip_prefix(". "));
        let Some(rest) = rest else { continue };
        let rest = rest.trim();
        if rest == "\"$(dirname \"$0\")/helpers.sh\"" || rest.ends_with("/helpers.sh\"") {
            continue;
        }
        return Err(Error::UnknownInclude {
            playbook: playbook.to_string(),
            include: rest.to_string(),
        });
    }
    Ok(())
}

/// Parses a `# DEPLOYER-REQUIRES: VAR_A VAR_B` declaration line, if
/// present, returning the list of required environment variable names
/// this playbook expects beyond the mandatory contract
/// (`DEPLOYER_OUTPUT_FILE`, `DEPLOYER_DISTRO`, `DEPLOYER_PERMS`).
fn parse_requires(text: &str) -> Vec<String> {
    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("# DEPLOYER-REQUIRES:") {
            return rest.split_whitespace().map(str::to_string).collect();
        }
    }
    Vec::new()
}

/// Inlines `helpers` into `playbook` at the marker comment; if no
/// marker is found, inlines immediately after the shebang and any
/// top-level `set -o pipefail` line.
fn inline(playbook: &str, helpers: &str) -> String {
    let lines: Vec<&str> = playbook.lines().collect();

    if let Some(marker_idx) = lines.iter().position(|l| l.trim() == SOURCE_LINE) {
        let mut out = String::new();
        for line in &lines[..marker_idx] {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(helpers);
        if !helpers.ends_with('\n') {
            out.push('\n');
        }
        for line in &lines[marker_idx + 1..] {
            out.push_str(line);
            out.push('\n');
        }
        return out;
    }

    // No marker: inline after shebang + optional `set -o pipefail`.
    let mut insert_at = 0;
    if lines.first().map(|l| l.starts_with("#!")).unwrap_or(false) {
        insert_at = 1;
    }
    if lines
        .get(insert_at)
        .map(|l| l.trim() == "set -o pipefail")
        .unwrap_or(false)
    {
        insert_at += 1;
    }

    let mut out = String::new();
    for line in &lines[..insert_at] {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str(helpers);
    if !helpers.ends_with('\n') {
        out.push('\n');
    }
    for line in &lines[insert_at..] {
        out.push_str(line);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playbook::source::MapPlaybookSource;

    fn source_with_marker() -> MapPlaybookSource {
        MapPlaybookSource::default()
            .with_helpers("log() { echo \"[helper] $1\"; }\n")
            .with_playbook(
                "install_nginx",
                "#!/usr/bin/env bash\nset -o pipefail\n# include shared helpers\nsource \"$(dirname \"$0\")/helpers.sh\"\nlog start\n",
            )
    }

    #[test]
    fn inlines_at_marker() {
        let source = source_with_marker();
        let assembled = assemble(&source, "install_nginx").unwrap();
        let text = String::from_utf8(assembled.script).unwrap();
        assert!(text.contains("log() { echo"));
        assert!(text.contains("log start"));
        assert!(!text.contains("source \"$(dirname"));
    }

    #[test]
    fn inlines_after_shebang_when_no_marker() {
        let source = MapPlaybookSource::default()
            .with_helpers("HELPER=1\n")
            .with_playbook("noop", "#!/usr/bin/env bash\nset -o pipefail\necho done\n");
        let assembled = assemble(&source, "noop").unwrap();
        let text = String::from_utf8(assembled.script).unwrap();
        let helper_pos = text.find("HELPER=1").unwrap();
        let echo_pos = text.find("echo done").unwrap();
        assert!(helper_pos < echo_pos);
    }

    #[test]
    fn unknown_playbook_fails() {
        let source = MapPlaybookSource::default();
        let err = assemble(&source, "missing").unwrap_err();
        assert!(matches!(err, Error::UnknownPlaybook(_)));
    }

    #[test]
    fn missing_helpers_fails() {
        let source = MapPlaybookSource::default().with_playbook(
            "p",
            "#!/usr/bin/env bash\nsource \"$(dirname \"$0\")/helpers.sh\"\n",
        );
        let err = assemble(&source, "p").unwrap_err();
        assert!(matches!(err, Error::UnknownInclude { .. }));
    }

    #[test]
    fn unknown_nested_include_fails() {
        let source = MapPlaybookSource::default()
            .with_helpers("x=1\n")
            .with_playbook("p", "#!/usr/bin/env bash\nsource ./other.sh\necho hi\n");
        let err = assemble(&source, "p").unwrap_err();
        assert!(matches!(err, Error::UnknownInclude { .. }));
    }

    #[test]
    fn assembly_is_deterministic() {
        let source = source_with_marker();
        let a = assemble(&source, "install_nginx").unwrap();
        let b = assemble(&source, "install_nginx").unwrap();
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.script, b.script);
    }

    #[test]
    fn parses_required_env_declaration() {
        let source = MapPlaybookSource::default().with_helpers("x=1\n").with_playbook(
            "p",
            "#!/usr/bin/env bash\n# DEPLOYER-REQUIRES: SITE_DOMAIN PHP_VERSION\nsource \"$(dirname \"$0\")/helpers.sh\"\necho hi\n",
        );
        let assembled = assemble(&source, "p").unwrap();
        assert_eq!(assembled.required_env, vec!["SITE_DOMAIN", "PHP_VERSION"]);
    }
}
