//! Cron Syncer (spec.md §4.6).

use std::path::Path;
use std::time::Duration;

use crate::connection::{shell_quote, Connection, ExecuteOptions};
use crate::error::Result;
use crate::model::Site;
use crate::progress::Progress;

fn start_marker(domain: &str) -> String {
    format!("# DEPLOYER-CRON-START {domain}")
}

fn end_marker(domain: &str) -> String {
    format!("# DEPLOYER-CRON-END {domain}")
}

/// Reconciles `site`'s declared crons with the deployer user's
/// crontab. Crontab replacement is a hard error on failure; per-script
/// log/logrotate bookkeeping failures are collected as warnings.
pub async fn sync(
    connection: &dyn Connection,
    site: &Site,
    timeout: Duration,
    progress: &dyn Progress,
) -> Result<Vec<String>> {
    let mut warnings = Vec::new();
    let mut warn = |msg: String| {
        progress.warning(connection.identifier(), &msg);
        warnings.push(msg);
    };

    let current = read_crontab(connection, timeout).await?;
    let stripped = strip_block(&current, &site.domain);
    let new_crontab = if site.crons.is_empty() {
        stripped
    } else {
        format!("{}{}", stripped, render_block(site))
    };
    write_crontab(connection, &new_crontab, timeout).await?;

    let mut expected_fragments = Vec::new();
    for cron in &site.crons {
        let base = script_base(&cron.script);
        let log_path = format!("/var/log/cron/{}-{base}.log", site.domain);
        if let Err(e) = ensure_log_file(connection, &log_path, timeout).await {
            warn(format!("failed to prepare log file for '{base}': {e}"));
        }
        let fragment = format!("cron-{}-{base}.conf", site.domain);
        if let Err(e) =
            write_logrotate_fragment(connection, &fragment, &log_path, timeout).await
        {
            warn(format!("failed to write logrotate fragment for '{base}': {e}"));
        }
        expected_fragments.push(fragment);
    }

    if let Err(e) = cleanup_orphan_fragments(connection, site, &expected_fragments, timeout).await {
        warn(format!("orphan logrotate cleanup failed: {e}"));
    }

    Ok(warnings)
}

fn script_base(script: &str) -> String {
    Path::new(script)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| script.to_string())
}

async fn read_crontab(connection: &dyn Connection, timeout: Duration) -> Result<String> {
    let result = connection
        .execute(
            "crontab -l 2>/dev/null || true",
            ExecuteOptions::new().with_timeout(timeout),
        )
        .await?;
    Ok(result.stdout)
}

async fn write_crontab(connection: &dyn Connection, content: &str, timeout: Duration) -> Result<()> {
    let mut body = content.to_string();
    if !body.is_empty() && !body.ends_with('\n') {
        body.push('\n');
    }
    let command = format!("crontab - <<'DEPLOYER_CRONTAB_EOF'\n{body}DEPLOYER_CRONTAB_EOF\n");
    connection
        .execute(&command, ExecuteOptions::new().with_timeout(timeout))
        .await?;
    Ok(())
}

/// Removes any existing marker-delimited block for `domain`, leaving
/// the rest of the crontab untouched.
fn strip_block(crontab: &str, domain: &str) -> String {
    let start = start_marker(domain);
    let end = end_marker(domain);
    let mut out = String::new();
    let mut inside = false;
    for line in crontab.lines() {
        if line.trim() == start {
            inside = true;
            continue;
        }
        if line.trim() == end {
            inside = false;
            continue;
        }
        if inside {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

fn render_block(site: &Site) -> String {
    let mut block = String::new();
    block.push_str(&start_marker(&site.domain));
    block.push('\n');
    for cron in &site.crons {
        let base = script_base(&cron.script);
        block.push_str(&format!(
            "{} {}/runner.sh .deployer/crons/{} >> /var/log/cron/{}-{base}.log 2>&1\n",
            cron.schedule,
            site.remote_root(),
            cron.script,
            site.domain,
        ));
    }
    block.push_str(&end_marker(&site.domain));
    block.push('\n');
    block
}

async fn ensure_log_file(connection: &dyn Connection, log_path: &str, timeout: Duration) -> Result<()> {
    let opts = || ExecuteOptions::new().with_timeout(timeout);
    connection
        .execute(
            &format!("mkdir -p $(dirname {})", shell_quote(log_path)),
            opts(),
        )
        .await?;
    connection
        .execute(&format!("touch {}", shell_quote(log_path)), opts())
        .await?;
    connection
        .execute(
            &format!(
                "chmod 644 {} && chown deployer:deployer {}",
                shell_quote(log_path),
                shell_quote(log_path)
            ),
            opts(),
        )
        .await?;
    Ok(())
}

async fn write_logrotate_fragment(
    connection: &dyn Connection,
    fragment_name: &str,
    log_path: &str,
    timeout: Duration,
) -> Result<()> {
    let content = format!(
        "{log_path} {{\n    weekly\n    rotate 4\n    compress\n    missingok\n    notifempty\n}}\n"
    );
    connection
        .upload_content(
            content.as_bytes(),
            &format!("/etc/logrotate.d/{fragment_name}"),
        )
        .await
}

/// Removes `cron-<domain>-*.conf` fragments for scripts no longer in
/// the current set.
async fn cleanup_orphan_fragments(
    connection: &dyn Connection,
    site: &Site,
    expected: &[String],
    timeout: Duration,
) -> Result<()> {
    let pattern = format!("/etc/logrotate.d/cron-{}-*.conf", site.domain);
    let listing = connection
        .execute(
            &format!("ls -1 {pattern} 2>/dev/null || true"),
            ExecuteOptions::new().with_timeout(timeout),
        )
        .await?;
    for path in listing.stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let name = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !expected.contains(&name) {
            connection
                .execute(
                    &format!("rm -f {}", shell_quote(path)),
                    ExecuteOptions::new().with_timeout(timeout),
                )
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_existing_block_only() {
        let crontab = "0 0 * * * /other\n# DEPLOYER-CRON-START example.com\n*/5 * * * * x\n# DEPLOYER-CRON-END example.com\n0 1 * * * /keep\n";
        let stripped = strip_block(crontab, "example.com");
        assert!(stripped.contains("/other"));
        assert!(stripped.contains("/keep"));
        assert!(!stripped.contains("DEPLOYER-CRON"));
    }

    #[test]
    fn renders_block_with_one_line_per_cron() {
        use crate::model::{CronJob, WwwMode};
        let site = Site {
            domain: "example.com".into(),
            server_name: "web1".into(),
            repo: None,
            branch: None,
            php_version: "8.3".into(),
            www_mode: WwwMode::RedirectToRoot,
            crons: vec![CronJob {
                script: "scheduler.sh".into(),
                schedule: "*/5 * * * *".into(),
            }],
            supervisors: vec![],
            keep_releases: 5,
        };
        let block = render_block(&site);
        assert!(block.starts_with("# DEPLOYER-CRON-START example.com\n"));
        assert!(block.contains("*/5 * * * * /home/deployer/sites/example.com/runner.sh .deployer/crons/scheduler.sh >> /var/log/cron/example.com-scheduler.log 2>&1\n"));
        assert!(block.ends_with("# DEPLOYER-CRON-END example.com\n"));
    }

    #[test]
    fn script_base_strips_extension() {
        assert_eq!(script_base("scheduler.sh"), "scheduler");
        assert_eq!(script_base("nested/path/job.sh"), "job");
    }
}
