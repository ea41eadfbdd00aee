//! A `Connection` implementation that runs commands on the local host.
//!
//! This exists purely as a test double (adapted from the teacher's
//! `connection/local.rs`): it lets the executor, orchestrator and
//! syncers be exercised end-to-end in unit tests without a real SSH
//! session. It is not wired into the production CLI façade's host
//! fan-out, which always uses [`super::russh::RusshConnection`].

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;

use super::{CommandResult, Connection, ExecuteOptions, LineSink};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct LocalConnection {
    identifier: String,
}

impl LocalConnection {
    pub fn new() -> Self {
        Self {
            identifier: "localhost".to_string(),
        }
    }

    fn build_command(&self, command: &str, options: &ExecuteOptions) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &options.env {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

impl Default for LocalConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connection for LocalConnection {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn execute(&self, command: &str, options: ExecuteOptions) -> Result<CommandResult> {
        let mut cmd = self.build_command(command, &options);
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::TransportError(format!("failed to spawn local command: {e}")))?;
        let mut stdout = child.stdout.take().expect("piped stdout");
        let mut stderr = child.stderr.take().expect("piped stderr");

        // Shared with the timeout branch below: a cancelled run future
        // drops its reader tasks, so whatever was read so far has to
        // live outside them to survive the timeout (spec.md §4.1: a
        // timeout carries whatever output was captured).
        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));

        let run = {
            let stdout_buf = Arc::clone(&stdout_buf);
            let stderr_buf = Arc::clone(&stderr_buf);
            async move {
                let (stdout_res, stderr_res, status) = tokio::join!(
                    async { stdout.read_to_end(&mut *stdout_buf.lock().await).await },
                    async { stderr.read_to_end(&mut *stderr_buf.lock().await).await },
                    child.wait(),
                );
                stdout_res.map_err(|e| Error::TransportError(e.to_string()))?;
                stderr_res.map_err(|e| Error::TransportError(e.to_string()))?;
                let status = status.map_err(|e| Error::TransportError(e.to_string()))?;
                Ok(CommandResult {
                    exit_code: status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&stdout_buf.lock().await).into_owned(),
                    stderr: String::from_utf8_lossy(&stderr_buf.lock().await).into_owned(),
                })
            }
        };

        match options.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, run).await {
                Ok(result) => result,
                Err(_) => Err(Error::SshTimeout {
                    timeout_secs: timeout.as_secs(),
                    partial_stdout: String::from_utf8_lossy(&stdout_buf.lock().await).into_owned(),
                    partial_stderr: String::from_utf8_lossy(&stderr_buf.lock().await).into_owned(),
                }),
            },
            None => run.await,
        }
    }

    async fn stream(
        &self,
        command: &str,
        options: ExecuteOptions,
        sink: &mut dyn LineSink,
    ) -> Result<i32> {
        let mut cmd = self.build_command(command, &options);
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::TransportError(format!("failed to spawn: {e}")))?;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();

        loop {
            tokio::select! {
                line = stdout_lines.next_line() => {
                    match line {
                        Ok(Some(l)) => sink.on_stdout(&l),
                        Ok(None) => {}
                        Err(_) => {}
                    }
                }
                line = stderr_lines.next_line() => {
                    match line {
                        Ok(Some(l)) => sink.on_stderr(&l),
                        Ok(None) => {}
                        Err(_) => {}
                    }
                }
                status = child.wait() => {
                    let status = status.map_err(|e| Error::TransportError(e.to_string()))?;
                    return Ok(status.code().unwrap_or(-1));
                }
            }
        }
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        let content = tokio::fs::read(local_path)
            .await
            .map_err(|e| Error::io(local_path, e))?;
        self.upload_content(&content, remote_path).await
    }

    async fn upload_content(&self, content: &[u8], remote_path: &str) -> Result<()> {
        if let Some(parent) = Path::new(remote_path).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(parent, e))?;
        }
        let write = async {
            let mut file = tokio::fs::File::create(remote_path).await?;
            file.write_all(content).await?;
            file.flush().await
        };
        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(remote_path).await;
            return Err(Error::TransferFailed(format!(
                "failed writing {remote_path}: {e}"
            )));
        }
        Ok(())
    }

    async fn download(&self, remote_path: &str, local_path: &Path) -> Result<()> {
        let content = self.download_content(remote_path).await?;
        tokio::fs::write(local_path, content)
            .await
            .map_err(|e| Error::io(local_path, e))
    }

    async fn download_content(&self, remote_path: &str) -> Result<Vec<u8>> {
        tokio::fs::read(remote_path)
            .await
            .map_err(|_| Error::TransferFailed(format!("{remote_path} not found")))
    }

    async fn path_exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::metadata(path).await.is_ok())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn executes_and_captures_output() {
        let conn = LocalConnection::new();
        let result = conn
            .execute("echo hello && echo oops >&2", ExecuteOptions::new())
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout.trim(), "hello");
        assert_eq!(result.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_an_error() {
        let conn = LocalConnection::new();
        let result = conn
            .execute("exit 7", ExecuteOptions::new())
            .await
            .unwrap();
        assert_eq!(result.exit_code, 7);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn upload_and_download_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let remote = dir.path().join("out.txt");
        let conn = LocalConnection::new();
        conn.upload_content(b"payload", remote.to_str().unwrap())
            .await
            .unwrap();
        let content = conn
            .download_content(remote.to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(content, b"payload");
    }
}
