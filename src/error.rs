//! Error taxonomy for the deployment engine.
//!
//! Every error kind named in the specification's error-handling design
//! shows up here as a variant. Callers match on `Error::kind()` to decide
//! exit codes or retry behavior; the `Display` impl is the single
//! short imperative message shown to the user.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], independent of its message.
///
/// Mirrors the taxonomy in spec.md §7: Transport, Invocation, Remote,
/// Domain, State.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Invocation,
    Remote,
    Domain,
    State,
}

#[derive(Error, Debug)]
pub enum Error {
    // ---- Transport ---------------------------------------------------
    #[error("failed to connect to {host}:{port}: {message}")]
    ConnectFailed {
        host: String,
        port: u16,
        message: String,
    },

    #[error("authentication failed for {user}@{host}: {message}")]
    AuthFailed {
        host: String,
        user: String,
        message: String,
    },

    #[error("host key for {host} does not match the recorded key")]
    HostKeyMismatch { host: String },

    #[error("operation timed out after {timeout_secs}s")]
    SshTimeout {
        timeout_secs: u64,
        partial_stdout: String,
        partial_stderr: String,
    },

    #[error("file transfer failed: {0}")]
    TransferFailed(String),

    #[error("transport error: {0}")]
    TransportError(String),

    // ---- Invocation ----------------------------------------------------
    #[error("missing required environment variable '{0}' for playbook '{1}'")]
    MissingEnv(String, String),

    #[error("unknown playbook '{0}'")]
    UnknownPlaybook(String),

    #[error("playbook '{playbook}' references unknown include '{include}'")]
    UnknownInclude { playbook: String, include: String },

    // ---- Remote ---------------------------------------------------------
    #[error("remote command exited with status {exit_code}")]
    RemoteExitNonZero {
        exit_code: i32,
        stderr: String,
        stdout_tail: String,
    },

    #[error("malformed playbook output: {0}")]
    MalformedOutput(String),

    // ---- Domain -----------------------------------------------------
    #[error("branch '{branch}' does not exist in {repo}")]
    BranchMissing { repo: String, branch: String },

    #[error("distro '{0}' is not supported (ubuntu/debian family only)")]
    DistroUnsupported(String),

    #[error("insufficient permissions on target host: {0:?}")]
    PermissionsInsufficient(crate::model::Permissions),

    #[error("site '{0}' already exists on its server")]
    SiteAlreadyExists(String),

    #[error("site '{0}' not found")]
    SiteNotFound(String),

    #[error("PHP version '{0}' is not available on the target host")]
    PhpVersionUnavailable(String),

    // ---- State --------------------------------------------------------
    #[error("server '{0}' is unreachable")]
    StaleInventoryServer(String),

    #[error("site '{0}' no longer exists on its declared host")]
    StaleInventorySite(String),

    // ---- Internal / passthrough ---------------------------------------
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Classify this error into one of the five top-level kinds.
    pub fn kind(&self) -> ErrorKind {
        use Error::*;
        match self {
            ConnectFailed { .. }
            | AuthFailed { .. }
            | HostKeyMismatch { .. }
            | SshTimeout { .. }
            | TransferFailed(_)
            | TransportError(_) => ErrorKind::Transport,

            MissingEnv(..) | UnknownPlaybook(_) | UnknownInclude { .. } => ErrorKind::Invocation,

            RemoteExitNonZero { .. } | MalformedOutput(_) => ErrorKind::Remote,

            BranchMissing { .. }
            | DistroUnsupported(_)
            | PermissionsInsufficient(_)
            | SiteAlreadyExists(_)
            | SiteNotFound(_)
            | PhpVersionUnavailable(_) => ErrorKind::Domain,

            StaleInventoryServer(_) | StaleInventorySite(_) => ErrorKind::State,

            Io { .. } | Other(_) => ErrorKind::Remote,
        }
    }

    /// Whether an operation that failed with this error is safe to retry
    /// once, per spec.md §7 ("transport failures are retried once ... for
    /// idempotent operations").
    pub fn is_retryable_for_idempotent_ops(&self) -> bool {
        matches!(self, Error::ConnectFailed { .. } | Error::SshTimeout { .. })
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
