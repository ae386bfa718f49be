//! Error taxonomy shared by every public operation.
//!
//! Public entry points return [`Result`]; nothing is allowed to panic across
//! the crate boundary.  Tool handlers and other internal helpers use
//! `anyhow::Result` and are folded into an [`Error`] at the nearest public
//! boundary.

use crate::api::RunStatus;

/// Every failure the crate surfaces to callers.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The cache retry budget was exhausted under contention.
    #[error("cache access failed: no access for {op} on key '{key}' after {attempts} attempts")]
    CacheAccess {
        op: &'static str,
        key: String,
        attempts: usize,
    },

    #[error("type resolution failed: {0}")]
    TypeResolution(String),

    #[error("method resolution failed: the method {method} was not found in the type {type_name}")]
    MethodResolution { type_name: String, method: String },

    #[error("tool name '{name}' is already bound to {bound}; cannot also bind {requested}")]
    ToolNameConflict {
        name: String,
        bound: String,
        requested: String,
    },

    /// Only ever produced to be rendered into a tool output string.
    #[error("tool '{name}' failed: {message}")]
    ToolInvocation { name: String, message: String },

    #[error("run {run_id} was ended with the status {status}")]
    RunNotCompleted { run_id: String, status: RunStatus },

    #[error("no answer was returned for thread {thread_id}")]
    NoAnswer { thread_id: String },

    #[error("run {run_id} reported an unrecognized status '{status}'")]
    UnknownRunStatus { run_id: String, status: String },

    #[error("run {run_id} did not settle: {reason}")]
    RunTimedOut { run_id: String, reason: String },

    #[error("run {run_id} was cancelled by the caller")]
    Cancelled { run_id: String },

    #[error("pilot '{0}' is not registered")]
    PilotNotFound(String),

    #[error("pilot names must be unique: '{0}' is already registered")]
    DuplicatePilot(String),

    #[error("field 'User' is missing in the metadata of thread {0}")]
    MissingThreadUser(String),

    #[error("no runs were found for thread {0}")]
    NoPreviousRun(String),

    #[error("remote API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config: {0}")]
    Config(String),

    /// Several independent failures collected from one operation.
    #[error("{}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Multiple(Vec<Error>),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// One human-readable line per underlying failure.
    pub fn messages(&self) -> Vec<String> {
        match self {
            Error::Multiple(errors) => errors.iter().flat_map(|e| e.messages()).collect(),
            other => vec![other.to_string()],
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<Error>() {
            Ok(e) => e,
            Err(other) => Error::Other(format!("{other:#}")),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
