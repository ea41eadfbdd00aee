//! Generates `runner.sh` (spec.md §6.3, format frozen).
//!
//! The runner is the only thing cron and supervisor fragments invoke
//! directly; it exists so neither has to bake in a path-validation
//! contract of its own.

use crate::model::Site;

/// Renders the runner script for one deployed release. The five
/// environment variables it exports are named without the `DEPLOYER_`
/// prefix, per the frozen contract — they are for the scripts the
/// runner dispatches, not for the hooks the orchestrator itself runs.
pub fn generate(site: &Site, release_path: &str, php_path: &str) -> String {
    let branch = site.branch.as_deref().unwrap_or("");
    format!(
        r#"#!/usr/bin/env bash
set -euo pipefail

RELEASE_PATH={release_path}
SHARED_PATH={shared_path}
CURRENT_PATH={current_path}
DOMAIN={domain}
BRANCH={branch}
PHP={php_path}

target="${{1:-}}"
if [[ -z "$target" ]]; then
  echo "runner: usage: runner.sh <path-relative-to-current>" >&2
  exit 2
fi
case "$target" in
  /*)
    echo "runner: absolute paths are not permitted" >&2
    exit 2
    ;;
esac
case "$target" in
  *..*)
    echo "runner: '..' is not permitted in the path" >&2
    exit 2
    ;;
esac

full_path="$(realpath -m "$CURRENT_PATH/$target")"
case "$full_path" in
  "$CURRENT_PATH"/*) ;;
  *)
    echo "runner: path escapes the current release" >&2
    exit 2
    ;;
esac

if [[ ! -f "$full_path" ]]; then
  echo "runner: $full_path is not a regular file" >&2
  exit 2
fi

chmod +x "$full_path" 2>/dev/null || true

export RELEASE_PATH SHARED_PATH CURRENT_PATH DOMAIN BRANCH PHP
cd "$CURRENT_PATH"
exec "$full_path"
"#,
        release_path = shell_literal(release_path),
        shared_path = shell_literal(&site.shared_dir()),
        current_path = shell_literal(&site.current_path()),
        domain = shell_literal(&site.domain),
        branch = shell_literal(branch),
        php_path = shell_literal(php_path),
    )
}

/// Double-quotes a value for embedding as a shell variable literal in
/// the generated script (these are baked-in constants, not user input
/// passed through at runtime).
fn shell_literal(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WwwMode;

    fn site() -> Site {
        Site {
            domain: "example.com".into(),
            server_name: "web1".into(),
            repo: Some("git@github.com:acme/app.git".into()),
            branch: Some("main".into()),
            php_version: "8.3".into(),
            www_mode: WwwMode::RedirectToRoot,
            crons: vec![],
            supervisors: vec![],
            keep_releases: 5,
        }
    }

    #[test]
    fn bakes_in_release_paths() {
        let script = generate(
            &site(),
            "/home/deployer/sites/example.com/releases/20260801_120000",
            "/usr/bin/php8.3",
        );
        assert!(script.contains("RELEASE_PATH=\"/home/deployer/sites/example.com/releases/20260801_120000\""));
        assert!(script.contains("DOMAIN=\"example.com\""));
        assert!(script.contains("BRANCH=\"main\""));
        assert!(script.contains("PHP=\"/usr/bin/php8.3\""));
    }

    #[test]
    fn rejects_absolute_and_traversal_paths_in_generated_script() {
        let script = generate(&site(), "/rel", "/usr/bin/php");
        assert!(script.contains("absolute paths are not permitted"));
        assert!(script.contains("'..' is not permitted"));
    }
}
