//! Supervisor Syncer (spec.md §4.7).

use std::path::Path;
use std::time::Duration;

use crate::connection::{shell_quote, Connection, ExecuteOptions};
use crate::error::Result;
use crate::model::{Site, SupervisorProgram};
use crate::progress::Progress;

/// Reconciles `site`'s declared supervisor programs with
/// `/etc/supervisor/conf.d`. Orphan cleanup and logrotate fragments
/// failing are warnings; the final `reread`/`update` failing is also
/// a warning (per spec.md §7, supervisor operations never block the
/// caller from considering the sync "done").
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
    let mut expected = Vec::new();

    for program in &site.supervisors {
        let fragment_name = format!("{}-{}.conf", site.domain, program.program);
        let fragment_path = format!("/etc/supervisor/conf.d/{fragment_name}");
        if let Err(e) = write_fragment(connection, site, program, &fragment_path).await {
            warn(format!(
                "failed to write supervisor fragment for '{}': {e}",
                program.program
            ));
        }
        let logrotate_path = format!(
            "/etc/logrotate.d/supervisor-{}-{}.conf",
            site.domain, program.program
        );
        if let Err(e) = write_logrotate_fragment(connection, site, program, &logrotate_path).await
        {
            warn(format!(
                "failed to write logrotate fragment for '{}': {e}",
                program.program
            ));
        }
        expected.push(fragment_name);
    }

    if let Err(e) = cleanup_orphan_fragments(connection, site, &expected, timeout).await {
        warn(format!("orphan supervisor cleanup failed: {e}"));
    }

    if let Err(e) = reread_and_update(connection, timeout).await {
        warn(format!("supervisorctl reread/update failed: {e}"));
    }

    Ok(warnings)
}

async fn write_fragment(
    connection: &dyn Connection,
    site: &Site,
    program: &SupervisorProgram,
    fragment_path: &str,
) -> Result<()> {
    let log_path = format!("/var/log/supervisor/{}-{}.log", site.domain, program.program);
    let content = format!(
        "[program:{domain}-{name}]\n\
         command={root}/runner.sh .deployer/supervisors/{script}\n\
         directory={current}\n\
         user=deployer\n\
         autostart={autostart}\n\
         autorestart={autorestart}\n\
         stopwaitsecs={stopwaitsecs}\n\
         numprocs={numprocs}\n\
         stdout_logfile={log_path}\n\
         stderr_logfile={log_path}\n",
        domain = site.domain,
        name = program.program,
        root = site.remote_root(),
        script = program.script,
        current = site.current_path(),
        autostart = program.autostart,
        autorestart = program.autorestart,
        stopwaitsecs = program.stopwaitsecs,
        numprocs = program.numprocs,
        log_path = log_path,
    );
    connection.upload_content(content.as_bytes(), fragment_path).await
}

async fn write_logrotate_fragment(
    connection: &dyn Connection,
    site: &Site,
    program: &SupervisorProgram,
    fragment_path: &str,
) -> Result<()> {
    let log_path = format!("/var/log/supervisor/{}-{}.log", site.domain, program.program);
    let content = format!(
        "{log_path} {{\n    weekly\n    rotate 4\n    compress\n    missingok\n    notifempty\n    copytruncate\n}}\n"
    );
    connection.upload_content(content.as_bytes(), fragment_path).await
}

/// Removes `<domain>-*.conf` fragments for programs no longer
/// declared.
async fn cleanup_orphan_fragments(
    connection: &dyn Connection,
    site: &Site,
    expected: &[String],
    timeout: Duration,
) -> Result<()> {
    let pattern = format!("/etc/supervisor/conf.d/{}-*.conf", site.domain);
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

async fn reread_and_update(connection: &dyn Connection, timeout: Duration) -> Result<()> {
    let opts = || ExecuteOptions::new().with_timeout(timeout);
    connection.execute("supervisorctl reread", opts()).await?;
    connection.execute("supervisorctl update", opts()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WwwMode;

    fn site_with(programs: Vec<SupervisorProgram>) -> Site {
        Site {
            domain: "example.com".into(),
            server_name: "web1".into(),
            repo: None,
            branch: None,
            php_version: "8.3".into(),
            www_mode: WwwMode::RedirectToRoot,
            crons: vec![],
            supervisors: programs,
            keep_releases: 5,
        }
    }

    #[tokio::test]
    async fn writes_fragment_matching_declared_program() {
        use crate::connection::local::LocalConnection;
        let dir = tempfile::tempdir().unwrap();
        let conn = LocalConnection::new();
        let fragment_path = dir.path().join("example.com-worker.conf");
        let program = SupervisorProgram {
            program: "worker".into(),
            script: "worker.sh".into(),
            autostart: true,
            autorestart: true,
            stopwaitsecs: 10,
            numprocs: 2,
        };
        let site = site_with(vec![program.clone()]);
        write_fragment(&conn, &site, &program, fragment_path.to_str().unwrap())
            .await
            .unwrap();
        let content = tokio::fs::read_to_string(&fragment_path).await.unwrap();
        assert!(content.contains("[program:example.com-worker]"));
        assert!(content.contains("numprocs=2"));
        assert!(content.contains("autostart=true"));
    }
}
