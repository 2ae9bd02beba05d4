//! Error taxonomy shared by every flock crate.
//!
//! Remote failures, port lock races and uptest failures are distinct
//! variants so callers can tell a race or a failing health check apart from
//! an ordinary transport problem.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Failure reported by the remote execution channel of a host.
///
/// `title` is a short human-readable summary suitable for an event title;
/// `output` is whatever the remote command captured.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub host: String,
    pub title: String,
    pub output: String,
}

impl RemoteError {
    pub fn new(
        host: impl Into<String>,
        title: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            title: title.into(),
            output: output.into(),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.title, self.host)
    }
}

/// The first failing uptest of an aggregation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UptestFailure {
    pub proc_name: String,
    pub test_name: String,
    pub output: String,
}

impl fmt::Display for UptestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} failed:{}",
            self.proc_name, self.test_name, self.output
        )
    }
}

/// Kernel-level error type.
#[derive(Debug, thiserror::Error)]
pub enum FlockError {
    #[error("store error: {0}")]
    Store(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// A lock for this exact (host, port) already exists. Port selection
    /// only offers free ports, so this always indicates a race.
    #[error("port lock already held for {host}:{port}")]
    DuplicateLock { host: String, port: u16 },
    #[error("remote error: {0}")]
    Remote(RemoteError),
    #[error("balancer error: {0}")]
    Balancer(String),
    #[error("build error: {0}")]
    Build(String),
    #[error("missing log: {0}")]
    MissingLog(String),
    #[error("failed uptest: {0}")]
    FailedUptest(UptestFailure),
    #[error("{stage} batch failed: {failed} of {total} subtasks raised")]
    BatchFailed {
        stage: &'static str,
        failed: usize,
        total: usize,
    },
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("task error: {0}")]
    Task(String),
}

impl FlockError {
    /// True for failures of the remote execution channel.
    pub fn is_remote(&self) -> bool {
        matches!(self, FlockError::Remote(_))
    }

    /// Event title for this error: the remote title when one exists.
    pub fn title(&self) -> String {
        match self {
            FlockError::Remote(err) => err.title.clone(),
            FlockError::FailedUptest(failure) => format!("{} failed uptest", failure.proc_name),
            other => other.to_string(),
        }
    }

    /// Event body for this error: captured remote output when one exists.
    pub fn detail(&self) -> String {
        match self {
            FlockError::Remote(err) => err.output.clone(),
            FlockError::FailedUptest(failure) => failure.to_string(),
            other => format!("{other:?}"),
        }
    }
}

impl From<RemoteError> for FlockError {
    fn from(err: RemoteError) -> Self {
        FlockError::Remote(err)
    }
}

impl From<UptestFailure> for FlockError {
    fn from(failure: UptestFailure) -> Self {
        FlockError::FailedUptest(failure)
    }
}

impl From<serde_json::Error> for FlockError {
    fn from(err: serde_json::Error) -> Self {
        FlockError::Store(format!("serde: {err}"))
    }
}
