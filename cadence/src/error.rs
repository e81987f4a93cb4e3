//! Engine error types.
//!
//! Configuration errors are returned synchronously from the call that set an
//! activity or scenario up; nothing is started when one is returned. Per-cycle
//! failures are [`OpError`]s and only become an [`Error`] when the activity's
//! error handler escalates them.

use std::sync::Arc;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid value '{value}' for parameter '{key}': {reason}")]
    InvalidParam {
        key: String,
        value: String,
        reason: String,
    },
    #[error("missing required parameter '{0}'")]
    MissingParam(String),
    #[error("unable to parse activity definition '{0}'")]
    ParseParams(String),
    #[error("op sequence for activity '{alias}' is empty but {cycles} cycles were requested")]
    EmptySequence { alias: String, cycles: u64 },
    #[error("no driver named '{name}' is registered (known: {known})")]
    UnknownDriver { name: String, known: String },
    #[error("unknown sequencer '{0}', expected one of bucket, interval, concat")]
    UnknownSequencer(String),
    #[error("invalid error handler spec '{spec}': {reason}")]
    ErrorSpec { spec: String, reason: String },
    #[error("invalid alias pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("scenario '{0}' is already defined, remove it first to reuse the name")]
    DuplicateScenario(String),
    #[error("could not {action} missing activity: {pattern}")]
    MissingActivity {
        action: &'static str,
        pattern: String,
    },
    #[error("unable to find scenario '{0}'")]
    MissingScenario(String),
    #[error("{0} is not accepting new work")]
    Closed(String),

    #[error(transparent)]
    Op(#[from] OpError),
    #[error("while binding cycle {cycle} for op '{op}': {source}")]
    Bind {
        cycle: u64,
        op: String,
        #[source]
        source: OpError,
    },
    #[error("activity '{alias}' failed: {source}")]
    Activity {
        alias: String,
        #[source]
        source: Arc<Error>,
    },
    #[error("{} activities failed: {}", .0.len(), join_errors(.0))]
    Multiple(Vec<Arc<Error>>),

    #[error("timed out after {millis}ms waiting for {what}")]
    Timeout { what: String, millis: u128 },
    #[error("unable to shut down cleanly: {0}")]
    Shutdown(String),
    #[error("motor task failed: {0}")]
    MotorPanic(String),
    #[error("control procedure failed: {0}")]
    Control(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn invalid(key: &str, value: &str, reason: impl Into<String>) -> Self {
        Error::InvalidParam {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    /// One error as itself, several as `Multiple`, none as `None`.
    pub(crate) fn collect(mut errors: Vec<Error>) -> Option<Error> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Error::Multiple(errors.into_iter().map(Arc::new).collect())),
        }
    }

    pub(crate) fn timeout(what: impl Into<String>, after: std::time::Duration) -> Self {
        Error::Timeout {
            what: what.into(),
            millis: after.as_millis(),
        }
    }
}

fn join_errors(errors: &[Arc<Error>]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// A failure of one attempt of one cycle's op.
///
/// `name` classifies the error for the activity's error handler mappings, the
/// way an exception class name would. Drivers choose their own names. `code`
/// is the cycle result code recorded when the error is not overridden by a
/// numeric handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{name}: {message}")]
pub struct OpError {
    pub name: String,
    pub message: String,
    pub code: i32,
}

impl OpError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            code: 1,
        }
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = code;
        self
    }

    /// Error raised when an op's result fails its verifier.
    pub fn verification(message: impl Into<String>) -> Self {
        Self::new("ResultVerificationError", message)
    }
}
