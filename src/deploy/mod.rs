//! Deployment Orchestrator (spec.md §4.5): atomic, release-based
//! deployments for a single site.

pub mod hooks;
pub mod runner;

use std::collections::HashMap;
use std::time::Duration;

use tracing::{info, info_span, warn, Instrument};

use crate::connection::retry::with_single_retry;
use crate::connection::{shell_quote, Connection, ExecuteOptions};
use crate::error::{Error, Result};
use crate::model::{ReleaseName, ReleaseStatus, Site};
use crate::progress::Progress;
use hooks::DEPLOYER_USER;

/// Remote directory layout root: `/home/deployer/sites/<domain>/...`
/// (see [`Site`]'s path helpers for the individual subpaths).
const RELEASE_TS_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone)]
pub struct DeployOptions {
    pub php_path: String,
    pub timeout: Duration,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            php_path: "/usr/bin/php".into(),
            timeout: Duration::from_secs(900),
        }
    }
}

/// Result payload from spec.md §4.5: `{status, domain, branch,
/// releaseName, releasePath, currentPath, keepReleases}`, plus any
/// post-activation warnings (supervisor/runner/cleanup failures).
#[derive(Debug, Clone)]
pub struct DeploymentResult {
    pub domain: String,
    pub branch: String,
    pub release_name: ReleaseName,
    pub release_path: String,
    pub current_path: String,
    pub keep_releases: u32,
    pub warnings: Vec<String>,
    /// Lifecycle status of `release_name` as observed at return time —
    /// `Active` on every successful deployment, since anything that
    /// fails before step 8 returns an `Err` instead of a result.
    pub status: ReleaseStatus,
}

/// Runs the full 13-step deployment sequence for `site` over
/// `connection`. Failures before step 8 (the symlink flip) clean up
/// the partial release directory and return an error; failures after
/// step 8 are collected as warnings on a still-successful result.
pub async fn deploy(
    connection: &dyn Connection,
    site: &Site,
    options: &DeployOptions,
    progress: &dyn Progress,
) -> Result<DeploymentResult> {
    let span = info_span!("deploy", domain = %site.domain, host = %connection.identifier());
    progress.host_started(connection.identifier());
    let result = deploy_inner(connection, site, options, progress)
        .instrument(span)
        .await;
    progress.host_finished(connection.identifier(), result.is_ok());
    result
}

async fn deploy_inner(
    connection: &dyn Connection,
    site: &Site,
    options: &DeployOptions,
    progress: &dyn Progress,
) -> Result<DeploymentResult> {
    let repo = site
        .repo
        .clone()
        .ok_or_else(|| Error::Other(format!("site '{}' has no repo configured", site.domain)))?;
    let branch = site
        .branch
        .clone()
        .ok_or_else(|| Error::Other(format!("site '{}' has no branch configured", site.domain)))?;
    let timeout = options.timeout;

    prepare_directories(connection, site, timeout).await?;
    ensure_git_host_known(connection, &repo, timeout).await?;
    clone_or_update(connection, site, &repo, &branch, timeout).await?;

    let release_name = build_release(connection, site, &branch, timeout).await?;
    let release_path = format!("{}/{}", site.releases_dir(), release_name);

    let hook_env = hook_environment(site, &release_path, &branch, &options.php_path);
    let mut status = ReleaseStatus::Building;
    info!(release = %release_name, ?status, "release built");

    status = ReleaseStatus::HooksRunning;
    info!(release = %release_name, ?status, "running release hooks");
    if let Err(e) = hooks::run_hook(connection, &release_path, "1-building", &hook_env, timeout)
        .await
    {
        cleanup_partial(connection, &release_path, timeout).await;
        warn!(release = %release_name, status = ?ReleaseStatus::Abandoned, "release abandoned");
        return Err(e);
    }

    if let Err(e) = link_shared(connection, site, &release_path, timeout).await {
        cleanup_partial(connection, &release_path, timeout).await;
        warn!(release = %release_name, status = ?ReleaseStatus::Abandoned, "release abandoned");
        return Err(e);
    }

    if let Err(e) = hooks::run_hook(connection, &release_path, "2-releasing", &hook_env, timeout)
        .await
    {
        cleanup_partial(connection, &release_path, timeout).await;
        warn!(release = %release_name, status = ?ReleaseStatus::Abandoned, "release abandoned");
        return Err(e);
    }

    // Step 8: the linearization point. Everything above is
    // recoverable by deleting the release directory; everything below
    // is reported as a warning, never rolled back.
    let previous_release = activate(connection, site, &release_path, timeout).await?;
    status = ReleaseStatus::Active;
    info!(release = %release_name, ?status, "release activated");
    if let Some(previous) = previous_release {
        info!(release = %previous, status = ?ReleaseStatus::Superseded, "previous release superseded");
    }

    let mut warnings = Vec::new();

    if let Err(e) =
        hooks::run_hook(connection, &release_path, "3-finishing", &hook_env, timeout).await
    {
        warnings.push(format!("3-finishing hook failed: {e}"));
    }

    if let Err(e) = reload_php(connection, &site.php_version, timeout).await {
        warnings.push(format!("failed to reload PHP pool: {e}"));
    }

    match cleanup_releases(connection, site, timeout).await {
        Ok(removed) if !removed.is_empty() => {
            info!(count = removed.len(), "pruned old releases");
        }
        Ok(_) => {}
        Err(e) => warnings.push(format!("release cleanup failed: {e}")),
    }

    if let Err(e) = create_runner(connection, site, &release_path, &options.php_path, timeout).await
    {
        warnings.push(format!("failed to write runner.sh: {e}"));
    }

    for supervisor in &site.supervisors {
        let name = format!("{}-{}", site.domain, supervisor.program);
        if let Err(e) = restart_supervisor(connection, &name, timeout).await {
            warnings.push(format!("failed to restart supervisor '{name}': {e}"));
        }
    }

    for warning in &warnings {
        warn!(%warning, "deployment warning");
        progress.warning(connection.identifier(), warning);
    }

    Ok(DeploymentResult {
        domain: site.domain.clone(),
        branch,
        release_name,
        release_path,
        current_path: site.current_path(),
        keep_releases: site.keep_releases,
        warnings,
        status,
    })
}

fn hook_environment(
    site: &Site,
    release_path: &str,
    branch: &str,
    php_path: &str,
) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("DEPLOYER_RELEASE_PATH".into(), release_path.to_string());
    env.insert("DEPLOYER_SHARED_PATH".into(), site.shared_dir());
    env.insert("DEPLOYER_CURRENT_PATH".into(), site.current_path());
    env.insert("DEPLOYER_REPO_PATH".into(), site.repo_dir());
    env.insert("DEPLOYER_DOMAIN".into(), site.domain.clone());
    env.insert("DEPLOYER_BRANCH".into(), branch.to_string());
    env.insert("DEPLOYER_PHP_VERSION".into(), site.php_version.clone());
    env.insert("DEPLOYER_PHP".into(), php_path.to_string());
    env.insert(
        "DEPLOYER_KEEP_RELEASES".into(),
        site.keep_releases.to_string(),
    );
    env
}

/// Step 1: create `releases/`, `shared/`, `repo/`; own by
/// `deployer:deployer`; remove `current` only if it exists and is not
/// a symlink.
async fn prepare_directories(connection: &dyn Connection, site: &Site, timeout: Duration) -> Result<()> {
    let root = site.remote_root();
    let opts = || ExecuteOptions::new().with_timeout(timeout);
    connection
        .execute(
            &format!(
                "mkdir -p {} {} {}",
                shell_quote(&site.releases_dir()),
                shell_quote(&site.shared_dir()),
                shell_quote(&site.repo_dir()),
            ),
            opts(),
        )
        .await?;
    connection
        .execute(
            &format!(
                "chown -R {DEPLOYER_USER}:{DEPLOYER_USER} {}",
                shell_quote(&root)
            ),
            opts(),
        )
        .await?;
    connection
        .execute(
            &format!(
                "if [ -e {current} ] && [ ! -L {current} ]; then rm -rf {current}; fi",
                current = shell_quote(&site.current_path())
            ),
            opts(),
        )
        .await?;
    Ok(())
}

/// Step 2: keyscan the git host into the deployer user's known_hosts
/// if it isn't already recorded there.
async fn ensure_git_host_known(connection: &dyn Connection, repo: &str, timeout: Duration) -> Result<()> {
    let Some(host) = git_host(repo) else {
        return Ok(());
    };
    let command = format!(
        "mkdir -p ~{user}/.ssh && touch ~{user}/.ssh/known_hosts && \
         grep -q {host_quoted} ~{user}/.ssh/known_hosts 2>/dev/null || \
         (ssh-keyscan -H {host_quoted} >> ~{user}/.ssh/known_hosts 2>/dev/null)",
        user = DEPLOYER_USER,
        host_quoted = shell_quote(&host),
    );
    connection
        .execute(&command, ExecuteOptions::new().with_timeout(timeout))
        .await?;
    Ok(())
}

/// Extracts the host from `git@host:path` or `ssh://user@host/path`
/// forms; returns `None` for other URL schemes (e.g. `https://`),
/// which don't need a known-hosts entry.
fn git_host(repo: &str) -> Option<String> {
    if let Some(rest) = repo.strip_prefix("ssh://") {
        let rest = rest.split('@').next_back()?;
        let host = rest.split('/').next()?;
        let host = host.split(':').next()?;
        return Some(host.to_string());
    }
    if let Some(at_pos) = repo.find('@') {
        if let Some(colon_pos) = repo[at_pos..].find(':') {
            return Some(repo[at_pos + 1..at_pos + colon_pos].to_string());
        }
    }
    None
}

/// Step 3: bare-clone or fetch-update the repo cache, then verify the
/// branch exists.
async fn clone_or_update(
    connection: &dyn Connection,
    site: &Site,
    repo: &str,
    branch: &str,
    timeout: Duration,
) -> Result<()> {
    let repo_dir = site.repo_dir();
    let objects_path = format!("{repo_dir}/objects");
    let objects_exists = with_single_retry(
        || connection.path_exists(&objects_path),
        || connection.reconnect(),
    )
    .await?;
    let opts = || ExecuteOptions::new().with_timeout(timeout);

    if !objects_exists {
        connection
            .execute(
                &format!(
                    "git clone --bare {} {}",
                    shell_quote(repo),
                    shell_quote(&repo_dir)
                ),
                opts(),
            )
            .await?;
    } else {
        connection
            .execute(
                &format!(
                    "git --git-dir={} remote set-url origin {}",
                    shell_quote(&repo_dir),
                    shell_quote(repo)
                ),
                opts(),
            )
            .await?;
        connection
            .execute(
                &format!(
                    "git --git-dir={} fetch --prune origin '+refs/heads/*:refs/heads/*'",
                    shell_quote(&repo_dir)
                ),
                opts(),
            )
            .await?;
    }

    let check = connection
        .execute(
            &format!(
                "git --git-dir={} show-ref --verify --quiet refs/heads/{}",
                shell_quote(&repo_dir),
                shell_words::quote(branch)
            ),
            opts(),
        )
        .await?;
    if !check.success() {
        return Err(Error::BranchMissing {
            repo: repo.to_string(),
            branch: branch.to_string(),
        });
    }
    Ok(())
}

/// Step 4: allocate a release directory name, export the branch into
/// it. Timestamp collisions within the same second get `_2`, `_3`, ...
/// suffixes.
async fn build_release(
    connection: &dyn Connection,
    site: &Site,
    branch: &str,
    timeout: Duration,
) -> Result<ReleaseName> {
    let opts = || ExecuteOptions::new().with_timeout(timeout);
    let ts_result = connection
        .execute(&format!("date +{RELEASE_TS_FORMAT}"), opts())
        .await?;
    let base_ts = ts_result.stdout.trim().to_string();

    let mut candidate = base_ts.clone();
    let mut suffix = 1;
    loop {
        let path = format!("{}/{}", site.releases_dir(), candidate);
        let exists = with_single_retry(
            || connection.path_exists(&path),
            || connection.reconnect(),
        )
        .await?;
        if !exists {
            break;
        }
        suffix += 1;
        candidate = format!("{base_ts}_{suffix}");
    }

    let release_path = format!("{}/{}", site.releases_dir(), candidate);
    connection
        .execute(&format!("mkdir -p {}", shell_quote(&release_path)), opts())
        .await?;
    connection
        .execute(
            &format!(
                "chown {DEPLOYER_USER}:{DEPLOYER_USER} {} && chmod 755 {}",
                shell_quote(&release_path),
                shell_quote(&release_path)
            ),
            opts(),
        )
        .await?;

    let archive_cmd = format!(
        "git --git-dir={} archive {} | tar -x -C {}",
        shell_quote(&site.repo_dir()),
        shell_words::quote(branch),
        shell_quote(&release_path),
    );
    let archive_result = connection.execute(&archive_cmd, opts()).await?;
    if !archive_result.success() {
        let _ = connection
            .execute(&format!("rm -rf {}", shell_quote(&release_path)), opts())
            .await;
        return Err(Error::RemoteExitNonZero {
            exit_code: archive_result.exit_code,
            stderr: archive_result.stderr,
            stdout_tail: archive_result.stdout,
        });
    }
    connection
        .execute(
            &format!(
                "chown -R {DEPLOYER_USER}:{DEPLOYER_USER} {}",
                shell_quote(&release_path)
            ),
            opts(),
        )
        .await?;
    normalize_modes(connection, &release_path, timeout).await?;

    Ok(ReleaseName(candidate))
}

/// Normalizes every extracted path's mode (spec.md §9's permission
/// policy): directories `755`, regular files `640`, except index pages
/// (`index.php`/`index.html`/`index.htm`) which stay world-readable at
/// `644` so the webserver can serve them directly.
async fn normalize_modes(connection: &dyn Connection, release_path: &str, timeout: Duration) -> Result<()> {
    let path = shell_quote(release_path);
    let command = format!(
        "find {path} -type d -exec chmod 755 {{}} + && \
         find {path} -type f \\( -name 'index.php' -o -name 'index.html' -o -name 'index.htm' \\) -exec chmod 644 {{}} + && \
         find {path} -type f -not \\( -name 'index.php' -o -name 'index.html' -o -name 'index.htm' \\) -exec chmod 640 {{}} +"
    );
    connection
        .execute(&command, ExecuteOptions::new().with_timeout(timeout))
        .await?;
    Ok(())
}

/// Step 6: symlink every entry of `shared/` into the release,
/// replacing whatever the export may have placed there.
async fn link_shared(
    connection: &dyn Connection,
    site: &Site,
    release_path: &str,
    timeout: Duration,
) -> Result<()> {
    let opts = || ExecuteOptions::new().with_timeout(timeout);
    let listing = connection
        .execute(
            &format!(
                "ls -A {} 2>/dev/null || true",
                shell_quote(&site.shared_dir())
            ),
            opts(),
        )
        .await?;
    for name in listing.stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let shared_entry = format!("{}/{name}", site.shared_dir());
        let release_entry = format!("{release_path}/{name}");
        connection
            .execute(
                &format!(
                    "rm -rf {} && ln -s {} {}",
                    shell_quote(&release_entry),
                    shell_quote(&shared_entry),
                    shell_quote(&release_entry),
                ),
                opts(),
            )
            .await?;
    }
    Ok(())
}

/// Step 8: the atomic symlink flip.
/// Flips the `current` symlink to `release_path`, returning the name
/// of whatever release it pointed at before (now superseded), if any.
async fn activate(
    connection: &dyn Connection,
    site: &Site,
    release_path: &str,
    timeout: Duration,
) -> Result<Option<String>> {
    let opts = || ExecuteOptions::new().with_timeout(timeout);
    let previous = connection
        .execute(
            &format!("readlink -f {}", shell_quote(&site.current_path())),
            opts(),
        )
        .await
        .ok()
        .map(|r| r.stdout.trim().to_string())
        .filter(|p| !p.is_empty());

    connection
        .execute(
            &format!(
                "ln -sfn {} {}",
                shell_quote(release_path),
                shell_quote(&site.current_path())
            ),
            opts(),
        )
        .await?;
    Ok(previous.filter(|p| p != release_path))
}

/// Step 10: reload the PHP-FPM pool so the opcode cache is cleared.
async fn reload_php(connection: &dyn Connection, php_version: &str, timeout: Duration) -> Result<()> {
    let service = format!("php{php_version}-fpm");
    let result = connection
        .execute(
            &format!("systemctl reload {}", shell_quote(&service)),
            ExecuteOptions::new().with_timeout(timeout),
        )
        .await?;
    if !result.success() {
        return Err(Error::RemoteExitNonZero {
            exit_code: result.exit_code,
            stderr: result.stderr,
            stdout_tail: result.stdout,
        });
    }
    Ok(())
}

/// Step 11: prune releases beyond `keepReleases`, oldest first,
/// never the one `current` points to.
async fn cleanup_releases(
    connection: &dyn Connection,
    site: &Site,
    timeout: Duration,
) -> Result<Vec<String>> {
    let opts = || ExecuteOptions::new().with_timeout(timeout);
    let listing = connection
        .execute(
            &format!("ls -1 {}", shell_quote(&site.releases_dir())),
            opts(),
        )
        .await?;
    let mut releases: Vec<String> = listing
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect();
    releases.sort();

    let current_target = connection
        .execute(
            &format!("readlink -f {}", shell_quote(&site.current_path())),
            opts(),
        )
        .await
        .map(|r| r.stdout.trim().to_string())
        .unwrap_or_default();

    let keep = site.keep_releases.max(1) as usize;
    let mut removed = Vec::new();
    while releases.len() > keep {
        let oldest = releases[0].clone();
        let oldest_path = format!("{}/{}", site.releases_dir(), oldest);
        if oldest_path == current_target {
            // Never remove the current release even if retention is tight.
            releases.remove(0);
            continue;
        }
        connection
            .execute(&format!("rm -rf {}", shell_quote(&oldest_path)), opts())
            .await?;
        removed.push(oldest);
        releases.remove(0);
    }
    Ok(removed)
}

/// Step 12: write the generated `runner.sh`.
async fn create_runner(
    connection: &dyn Connection,
    site: &Site,
    release_path: &str,
    php_path: &str,
    timeout: Duration,
) -> Result<()> {
    let script = runner::generate(site, release_path, php_path);
    let runner_path = site.runner_path();
    connection
        .upload_content(script.as_bytes(), &runner_path)
        .await?;
    connection
        .execute(
            &format!(
                "chmod 755 {} && chown {DEPLOYER_USER}:{DEPLOYER_USER} {}",
                shell_quote(&runner_path),
                shell_quote(&runner_path)
            ),
            ExecuteOptions::new().with_timeout(timeout),
        )
        .await?;
    Ok(())
}

/// Step 13: restart one supervisor program. Failures here are always
/// warnings — the deployment has already committed by this point.
async fn restart_supervisor(connection: &dyn Connection, name: &str, timeout: Duration) -> Result<()> {
    let result = connection
        .execute(
            &format!("supervisorctl restart {}", shell_quote(name)),
            ExecuteOptions::new().with_timeout(timeout),
        )
        .await?;
    if !result.success() {
        return Err(Error::RemoteExitNonZero {
            exit_code: result.exit_code,
            stderr: result.stderr,
            stdout_tail: result.stdout,
        });
    }
    Ok(())
}

/// Best-effort removal of a partial release directory on a
/// pre-activation failure (spec.md §7: "before step 8 ... wraps a
/// failure with best-effort cleanup of the partial release directory").
async fn cleanup_partial(connection: &dyn Connection, release_path: &str, timeout: Duration) {
    let result = connection
        .execute(
            &format!("rm -rf {}", shell_quote(release_path)),
            ExecuteOptions::new().with_timeout(timeout),
        )
        .await;
    if let Err(e) = result {
        warn!(error = %e, release_path, "failed to clean up partial release");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_host_from_scp_like_url() {
        assert_eq!(
            git_host("git@github.com:acme/app.git"),
            Some("github.com".to_string())
        );
    }

    #[test]
    fn extracts_host_from_ssh_url() {
        assert_eq!(
            git_host("ssh://git@example.org:2222/acme/app.git"),
            Some("example.org".to_string())
        );
    }

    #[test]
    fn https_urls_need_no_keyscan() {
        assert_eq!(git_host("https://github.com/acme/app.git"), None);
    }
}
