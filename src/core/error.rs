use crate::core::value::Invid;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum DbError {
    #[error("Login refused: {0}")]
    AdmissionDenied(String),

    /// Deliberately carries no detail about which credential was wrong.
    #[error("Bad username or password, login rejected")]
    AuthenticationFailed,

    #[error("Validation failed for {invid} field '{field}': {message}")]
    ValidationFailed {
        invid: Invid,
        field: String,
        message: String,
    },

    #[error("Commit vetoed: {0}")]
    CommitVetoed(String),

    #[error("Lock request cancelled")]
    LockCancelled,

    #[error("Lock request timed out")]
    LockTimedOut,

    #[error("Lock misuse: {0}")]
    LockMisuse(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("No transaction open")]
    NoTransaction,

    #[error("Transaction already open: {0}")]
    TransactionOpen(String),

    #[error("Checkpoint '{0}' not found")]
    CheckpointNotFound(String),

    #[error("Session closed: {0}")]
    SessionClosed(String),

    #[error("Object {0} not found")]
    ObjectNotFound(Invid),

    #[error("Object {invid} is checked out by {holder}")]
    ObjectBusy { invid: Invid, holder: String },

    #[error("Object {0} was changed by another transaction after it was checked out")]
    ObjectChanged(Invid),

    #[error("Object base {0} not found")]
    BaseNotFound(u16),

    #[error("Field '{0}' not found in base '{1}'")]
    FieldNotFound(String, String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Task error: {0}")]
    TaskError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server already running in this process")]
    ServerAlreadyRunning,

    #[error("Maintenance in progress: {0}")]
    MaintenanceInProgress(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Fatal error: {0}")]
    Fatal(String),
}

/// Coarse classification used by callers that branch on failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    Admission,
    Authentication,
    Validation,
    Cancelled,
    TimedOut,
    Fatal,
    Usage,
}

impl DbError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DbError::AdmissionDenied(_) | DbError::MaintenanceInProgress(_) => ErrorKind::Admission,
            DbError::AuthenticationFailed => ErrorKind::Authentication,
            DbError::ValidationFailed { .. } | DbError::CommitVetoed(_) | DbError::ObjectChanged(_) => {
                ErrorKind::Validation
            }
            DbError::LockCancelled | DbError::SessionClosed(_) => ErrorKind::Cancelled,
            DbError::LockTimedOut => ErrorKind::TimedOut,
            DbError::Fatal(_) | DbError::IoError(_) => ErrorKind::Fatal,
            _ => ErrorKind::Usage,
        }
    }

    /// Short title suitable for a client-side error dialog.
    pub fn title(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Admission => "No logins allowed",
            ErrorKind::Authentication => "Bad login attempt",
            ErrorKind::Validation => "Transaction error",
            ErrorKind::Cancelled => "Operation cancelled",
            ErrorKind::TimedOut => "Operation timed out",
            ErrorKind::Fatal => "Server error",
            ErrorKind::Usage => "Error",
        }
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}
