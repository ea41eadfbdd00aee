//! Playbook Executor (spec.md §4.3): runs an assembled script against a
//! single connection end to end — upload, invoke, collect, clean up.

use std::collections::HashMap;

use rand::Rng;
use tracing::{info, info_span, warn, Instrument};

use crate::connection::{CommandResult, Connection, ExecuteOptions, LineSink};
use crate::error::{Error, Result};
use crate::model::InvocationMode;
use crate::playbook::{assemble, AssembledScript, PlaybookSource};
use crate::progress::{Progress, Stream};
use crate::yaml::{parse_playbook_output, PlaybookOutput, PlaybookStatus};

/// The fixed filenames the executor and every playbook agree on
/// (spec.md §4.3, §6.3).
const REMOTE_SCRIPT_NAME: &str = "run.sh";
const REMOTE_OUTPUT_NAME: &str = "output.yaml";

/// Outcome of one playbook invocation.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub output: PlaybookOutput,
    pub remote_exit_code: i32,
    pub stdout_tail: String,
}

impl ExecutionReport {
    pub fn succeeded(&self) -> bool {
        self.remote_exit_code == 0 && self.output.status == PlaybookStatus::Success
    }
}

/// A [`LineSink`] that forwards every line to a [`Progress`] sink as
/// it arrives, while also accumulating the full text so the streaming
/// path can build the same [`CommandResult`] shape the silent path
/// produces.
struct CollectingSink<'a> {
    host: &'a str,
    progress: &'a dyn Progress,
    stdout: String,
    stderr: String,
}

impl<'a> CollectingSink<'a> {
    fn new(host: &'a str, progress: &'a dyn Progress) -> Self {
        Self {
            host,
            progress,
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

impl LineSink for CollectingSink<'_> {
    fn on_stdout(&mut self, line: &str) {
        self.progress.line(self.host, Stream::Stdout, line);
        self.stdout.push_str(line);
        self.stdout.push('\n');
    }

    fn on_stderr(&mut self, line: &str) {
        self.progress.line(self.host, Stream::Stderr, line);
        self.stderr.push_str(line);
        self.stderr.push('\n');
    }
}

/// Runs `playbook_name` on `connection`, following the nine-step
/// sequence from spec.md §4.3:
///
/// 1. assemble the script
/// 2. compute an unguessable remote workdir
/// 3. verify required env vars are present, before any remote work
/// 4. `mkdir -p` the workdir
/// 5. upload and `chmod +x` the script
/// 6. execute it with its environment prefixed as `KEY=val ...`
/// 7. on success, download and parse `output.yaml`
/// 8. on failure, classify without attempting to parse partial output
/// 9. always best-effort clean up the workdir
pub async fn run_playbook(
    connection: &dyn Connection,
    source: &dyn PlaybookSource,
    playbook_name: &str,
    env: &HashMap<String, String>,
    timeout: std::time::Duration,
    mode: InvocationMode,
    progress: &dyn Progress,
) -> Result<ExecutionReport> {
    let span = info_span!("run_playbook", playbook = %playbook_name, host = %connection.identifier());
    run_playbook_inner(connection, source, playbook_name, env, timeout, mode, progress)
        .instrument(span)
        .await
}

async fn run_playbook_inner(
    connection: &dyn Connection,
    source: &dyn PlaybookSource,
    playbook_name: &str,
    env: &HashMap<String, String>,
    timeout: std::time::Duration,
    mode: InvocationMode,
    progress: &dyn Progress,
) -> Result<ExecutionReport> {
    let assembled: AssembledScript = assemble(source, playbook_name)?;

    for required in &assembled.required_env {
        if !env.contains_key(required) {
            return Err(Error::MissingEnv(
                required.clone(),
                playbook_name.to_string(),
            ));
        }
    }

    let workdir = remote_workdir();
    let script_path = format!("{workdir}/{REMOTE_SCRIPT_NAME}");
    let output_path = format!("{workdir}/{REMOTE_OUTPUT_NAME}");

    connection
        .execute(
            &format!("mkdir -p {}", crate::connection::shell_quote(&workdir)),
            ExecuteOptions::new().with_timeout(timeout),
        )
        .await?;

    if let Err(e) = connection
        .upload_content(&assembled.script, &script_path)
        .await
    {
        cleanup(connection, &workdir, timeout).await;
        return Err(e);
    }

    if let Err(e) = connection
        .execute(
            &format!("chmod +x {}", crate::connection::shell_quote(&script_path)),
            ExecuteOptions::new().with_timeout(timeout),
        )
        .await
    {
        cleanup(connection, &workdir, timeout).await;
        return Err(e);
    }

    let mut options = ExecuteOptions::new()
        .with_env("DEPLOYER_OUTPUT_FILE", &output_path)
        .with_timeout(timeout);
    for (k, v) in env {
        options = options.with_env(k, v);
    }

    let host = connection.identifier().to_string();
    let run_result = match mode {
        InvocationMode::Silent => connection.execute(&script_path, options).await,
        InvocationMode::Streaming => {
            let mut sink = CollectingSink::new(&host, progress);
            let exit_code = connection.stream(&script_path, options, &mut sink).await;
            exit_code.map(|exit_code| CommandResult {
                exit_code,
                stdout: sink.stdout,
                stderr: sink.stderr,
            })
        }
    };

    let report = match run_result {
        Ok(command_result) if command_result.success() => {
            match connection.download_content(&output_path).await {
                Ok(bytes) => {
                    let text = String::from_utf8_lossy(&bytes);
                    match parse_playbook_output(&text) {
                        Ok(output) => Ok(ExecutionReport {
                            output,
                            remote_exit_code: command_result.exit_code,
                            stdout_tail: tail(&command_result.stdout),
                        }),
                        Err(e) => Err(e),
                    }
                }
                Err(e) => Err(e),
            }
        }
        Ok(command_result) => {
            warn!(
                exit_code = command_result.exit_code,
                "playbook exited non-zero"
            );
            Err(Error::RemoteExitNonZero {
                exit_code: command_result.exit_code,
                stderr: command_result.stderr,
                stdout_tail: tail(&command_result.stdout),
            })
        }
        Err(e) => Err(e),
    };

    cleanup(connection, &workdir, timeout).await;

    if report.is_ok() {
        info!("playbook completed");
    }
    report
}

/// Best-effort removal of the remote scratch directory; failures here
/// are logged, never propagated (spec.md §4.3 step 9).
async fn cleanup(connection: &dyn Connection, workdir: &str, timeout: std::time::Duration) {
    let result = connection
        .execute(
            &format!("rm -rf {}", crate::connection::shell_quote(workdir)),
            ExecuteOptions::new().with_timeout(timeout),
        )
        .await;
    if let Err(e) = result {
        warn!(error = %e, workdir, "failed to clean up remote workdir");
    }
}

/// An unguessable per-invocation scratch directory under `/tmp`.
fn remote_workdir() -> String {
    let suffix: String = {
        let mut rng = rand::thread_rng();
        (0..16)
            .map(|_| {
                const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
                CHARS[rng.gen_range(0..CHARS.len())] as char
            })
            .collect()
    };
    format!("/tmp/deployer-{suffix}")
}

fn tail(output: &str) -> String {
    const MAX_LEN: usize = 4096;
    if output.len() <= MAX_LEN {
        output.to_string()
    } else {
        output[output.len() - MAX_LEN..].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::local::LocalConnection;
    use crate::playbook::source::MapPlaybookSource;
    use crate::progress::NoProgress;

    fn source() -> MapPlaybookSource {
        MapPlaybookSource::default()
            .with_helpers("")
            .with_playbook(
                "noop",
                "#!/usr/bin/env bash\nset -o pipefail\nsource \"$(dirname \"$0\")/helpers.sh\"\ncat > \"$DEPLOYER_OUTPUT_FILE\" <<'EOF'\nstatus: success\nEOF\n",
            )
    }

    #[tokio::test]
    async fn runs_a_playbook_end_to_end() {
        let conn = LocalConnection::new();
        let src = source();
        let report = run_playbook(
            &conn,
            &src,
            "noop",
            &HashMap::new(),
            std::time::Duration::from_secs(10),
            InvocationMode::Silent,
            &NoProgress,
        )
        .await
        .unwrap();
        assert!(report.succeeded());
    }

    #[tokio::test]
    async fn streaming_mode_collects_lines_into_the_same_report_shape() {
        let conn = LocalConnection::new();
        let src = MapPlaybookSource::default().with_helpers("").with_playbook(
            "chatty",
            "#!/usr/bin/env bash\necho line-one\necho line-two >&2\ncat > \"$DEPLOYER_OUTPUT_FILE\" <<'EOF'\nstatus: success\nEOF\n",
        );
        let report = run_playbook(
            &conn,
            &src,
            "chatty",
            &HashMap::new(),
            std::time::Duration::from_secs(10),
            InvocationMode::Streaming,
            &NoProgress,
        )
        .await
        .unwrap();
        assert!(report.succeeded());
        assert!(report.stdout_tail.contains("line-one"));
    }

    #[tokio::test]
    async fn missing_required_env_fails_before_any_remote_work() {
        let conn = LocalConnection::new();
        let src = MapPlaybookSource::default().with_helpers("").with_playbook(
            "needs_var",
            "#!/usr/bin/env bash\n# DEPLOYER-REQUIRES: SITE_DOMAIN\nsource \"$(dirname \"$0\")/helpers.sh\"\necho hi\n",
        );
        let err = run_playbook(
            &conn,
            &src,
            "needs_var",
            &HashMap::new(),
            std::time::Duration::from_secs(10),
            InvocationMode::Silent,
            &NoProgress,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::MissingEnv(_, _)));
    }

    #[tokio::test]
    async fn nonzero_exit_is_remote_error() {
        let conn = LocalConnection::new();
        let src = MapPlaybookSource::default()
            .with_helpers("")
            .with_playbook("fails", "#!/usr/bin/env bash\nexit 1\n");
        let err = run_playbook(
            &conn,
            &src,
            "fails",
            &HashMap::new(),
            std::time::Duration::from_secs(10),
            InvocationMode::Silent,
            &NoProgress,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::RemoteExitNonZero { .. }));
    }
}
