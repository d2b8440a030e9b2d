/// Error Taxonomy and Failure Classification
///
/// Every leaf operation returns a typed `Error`; the sync engine consults
/// `classify` to decide locally between retry, skip, abort and shutdown.
/// Only the supervisor translates surfaced errors into a process exit code.

use std::time::Duration;

use thiserror::Error;

/// Coarse failure class used for policy decisions and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Network,
    Rpc,
    Validation,
    Database,
    Critical,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Network => "network",
            ErrorClass::Rpc => "rpc",
            ErrorClass::Validation => "validation",
            ErrorClass::Database => "database",
            ErrorClass::Critical => "critical",
        }
    }
}

/// What the caller should do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    Retry,
    Skip,
    Abort,
    Shutdown,
}

#[derive(Debug, Error)]
pub enum Error {
    /// Connection-level failures: timeouts, resets, DNS.
    #[error("network error: {0}")]
    Network(String),

    /// The provider answered but unhelpfully: 429, 5xx, JSON-RPC error object.
    #[error("rpc error ({method}): {message}")]
    Rpc { method: String, message: String, retryable: bool },

    /// The provider answered with bytes we could not decode.
    #[error("malformed rpc response ({method}): {message}")]
    Malformed { method: String, message: String },

    /// A block or log failed schema/invariant validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Transient store failure: dropped connection, deadlock, pool timeout.
    #[error("database error (transient): {0}")]
    DatabaseTransient(String),

    /// Permanent store failure: constraint violation, schema drift, syntax.
    #[error("database error (permanent): {0}")]
    DatabasePermanent(String),

    /// Local state contradicts itself. Process must not keep writing.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// Chain discontinuity that the ancestor walk could not resolve.
    #[error("reorg out of bounds: {0}")]
    ReorgOutOfBounds(String),

    /// Invalid configuration, rejected at startup or construction.
    #[error("config error: {0}")]
    Config(String),

    /// Operation observed the shutdown signal and stopped early.
    #[error("shutting down")]
    Shutdown,

    /// Retries were exhausted; carries the final underlying error.
    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Map an error onto the five-way class plus its recovery action.
    pub fn classify(&self) -> (ErrorClass, RecoveryAction) {
        match self {
            Error::Network(_) => (ErrorClass::Network, RecoveryAction::Retry),
            Error::Rpc { retryable: true, .. } => (ErrorClass::Rpc, RecoveryAction::Retry),
            Error::Rpc { retryable: false, .. } => (ErrorClass::Rpc, RecoveryAction::Abort),
            Error::Malformed { .. } => (ErrorClass::Validation, RecoveryAction::Skip),
            Error::Validation(_) => (ErrorClass::Validation, RecoveryAction::Skip),
            Error::DatabaseTransient(_) => (ErrorClass::Database, RecoveryAction::Retry),
            Error::DatabasePermanent(_) => (ErrorClass::Database, RecoveryAction::Shutdown),
            Error::Corruption(_) => (ErrorClass::Critical, RecoveryAction::Shutdown),
            Error::ReorgOutOfBounds(_) => (ErrorClass::Critical, RecoveryAction::Shutdown),
            Error::Config(_) => (ErrorClass::Critical, RecoveryAction::Shutdown),
            Error::Shutdown => (ErrorClass::Critical, RecoveryAction::Shutdown),
            Error::RetriesExhausted { source, .. } => {
                let (class, _) = source.classify();
                (class, RecoveryAction::Abort)
            }
        }
    }

    /// True when another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.classify().1, RecoveryAction::Retry)
    }

    /// True when the process must stop rather than try the next batch.
    pub fn is_fatal(&self) -> bool {
        matches!(self.classify().1, RecoveryAction::Shutdown)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            return Error::Network(e.to_string());
        }
        if let Some(status) = e.status() {
            let retryable = status.as_u16() == 429 || status.is_server_error();
            return Error::Rpc {
                method: "http".to_string(),
                message: e.to_string(),
                retryable,
            };
        }
        Error::Network(e.to_string())
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) => {
                // SQLSTATE class 40 = transaction rollback (deadlock,
                // serialization failure); 08 = connection exception.
                let code = db.code().map(|c| c.to_string()).unwrap_or_default();
                if code.starts_with("40") || code.starts_with("08") {
                    Error::DatabaseTransient(db.to_string())
                } else {
                    Error::DatabasePermanent(db.to_string())
                }
            }
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Error::DatabaseTransient(e.to_string()),
            _ => Error::DatabasePermanent(e.to_string()),
        }
    }
}

/// Backoff schedule: exponential from `base`, capped at `max`.
/// Jitter is applied by the retry loop, not here, so the schedule is testable.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(16));
    exp.min(max)
}
