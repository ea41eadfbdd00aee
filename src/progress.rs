//! Progress & Logging Hooks (spec.md §2): a narrow interface to
//! whatever external UI drives the engine — a CLI, a web dashboard, a
//! test harness. The engine never assumes a terminal.

/// A stream a line of playbook output arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Narrow progress-reporting surface. All methods have a default no-op
/// body so callers implement only what they display.
pub trait Progress: Send + Sync {
    fn host_started(&self, _host: &str) {}
    fn host_finished(&self, _host: &str, _succeeded: bool) {}
    fn line(&self, _host: &str, _stream: Stream, _line: &str) {}
    fn warning(&self, _host: &str, _message: &str) {}
}

/// A `Progress` that reports nothing; the default when the caller
/// doesn't care to observe.
pub struct NoProgress;
impl Progress for NoProgress {}
