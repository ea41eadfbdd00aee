//! SSH Transport (spec.md §4.1).
//!
//! A unified interface for command execution and file transfer against a
//! remote host. [`Connection`] is the only trait the rest of the engine
//! depends on; [`russh::RusshConnection`] is the sole production
//! implementation, [`local::LocalConnection`] exists purely as a test
//! double so the rest of the crate can be exercised without a network.

pub mod config;
pub mod known_hosts;
pub mod local;
pub mod pool;
pub mod retry;
#[cfg(feature = "russh")]
pub mod russh;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

pub use config::{ConnectionDefaults, HostConfig};
pub use pool::{ConnectionPool, PoolConfig};

use crate::error::{Error, Result};

/// Result of executing a command on a connection.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Options for [`Connection::execute`] / [`Connection::stream`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
    pub timeout: Option<Duration>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// A sink that receives output lines as they arrive during
/// [`Connection::stream`] (spec.md §4.1 `streamCommand`).
pub trait LineSink: Send {
    fn on_stdout(&mut self, line: &str);
    fn on_stderr(&mut self, line: &str);
}

/// A `LineSink` that discards everything; used when the caller only
/// wants the final exit code.
pub struct NullSink;
impl LineSink for NullSink {
    fn on_stdout(&mut self, _line: &str) {}
    fn on_stderr(&mut self, _line: &str) {}
}

/// The transport abstraction every executor and orchestrator step is
/// built against.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Host/user identifier, used for logging and pool bookkeeping.
    fn identifier(&self) -> &str;

    /// `executeCommand` from spec.md §4.1: runs via the remote shell,
    /// no PTY, enforces `timeout` as a wall-clock deadline.
    async fn execute(&self, command: &str, options: ExecuteOptions) -> Result<CommandResult>;

    /// `streamCommand`: same as `execute` but delivers lines to `sink`
    /// as they arrive. Returns the exit code.
    async fn stream(
        &self,
        command: &str,
        options: ExecuteOptions,
        sink: &mut dyn LineSink,
    ) -> Result<i32>;

    /// `uploadFile`: byte-exact transfer; on failure the partial
    /// destination file must be removed.
    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<()>;

    /// Upload in-memory content directly to a remote path.
    async fn upload_content(&self, content: &[u8], remote_path: &str) -> Result<()>;

    /// `downloadFile`.
    async fn download(&self, remote_path: &str, local_path: &Path) -> Result<()>;

    /// Download remote file content into memory (used to fetch
    /// `output.yaml` after a playbook run).
    async fn download_content(&self, remote_path: &str) -> Result<Vec<u8>>;

    async fn path_exists(&self, path: &str) -> Result<bool>;

    async fn close(&self) -> Result<()>;

    /// Re-establishes the underlying session after a retryable transport
    /// failure, for use with [`retry::with_single_retry`] around
    /// idempotent operations. [`local::LocalConnection`] has nothing to
    /// redial and keeps the default no-op.
    async fn reconnect(&self) -> Result<()> {
        Ok(())
    }
}

/// Single-shell-quotes a value so it survives the `env KEY=val ...`
/// wrapper used by the executor (spec.md §4.3 step 6).
pub fn shell_quote(value: &str) -> String {
    shell_words::quote(value).into_owned()
}

pub(crate) fn classify_io(path: &str, err: std::io::Error) -> Error {
    Error::io(path, err)
}
