use crate::txn::CommitStatus;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidConfig,
    QueueFull,
    ShuttingDown,
    Timeout,
    CancellationUnsupported,
    MissingIdentifiers,
    UnknownCommitStatus,
    RetryLimitExceeded,
    Backend,
    TaskPanicked,
    TaskJoin,
    Runtime,
    Poisoned,
    ShutdownWithOutstandingWork,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidConfig => "invalid_config",
            ErrorCode::QueueFull => "queue_full",
            ErrorCode::ShuttingDown => "shutting_down",
            ErrorCode::Timeout => "timeout",
            ErrorCode::CancellationUnsupported => "cancellation_unsupported",
            ErrorCode::MissingIdentifiers => "missing_identifiers",
            ErrorCode::UnknownCommitStatus => "unknown_commit_status",
            ErrorCode::RetryLimitExceeded => "retry_limit_exceeded",
            ErrorCode::Backend => "backend",
            ErrorCode::TaskPanicked => "task_panicked",
            ErrorCode::TaskJoin => "task_join",
            ErrorCode::Runtime => "runtime",
            ErrorCode::Poisoned => "poisoned",
            ErrorCode::ShutdownWithOutstandingWork => "shutdown_with_outstanding_work",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("admission queue full")]
    QueueFull,
    #[error("engine is shutting down")]
    ShuttingDown,
    #[error("timeout")]
    Timeout,
    #[error("operation handles cannot be cancelled")]
    CancellationUnsupported,
    #[error("operation '{operation}' has no identifiers but its policy does not force a mode")]
    MissingIdentifiers { operation: String },
    #[error("backend returned unknown commit status {status}")]
    UnknownCommitStatus { status: CommitStatus },
    #[error("operation '{operation}' exceeded {attempts} conservative retries")]
    RetryLimitExceeded { operation: String, attempts: u32 },
    #[error("backend error: {0}")]
    Backend(String),
    #[error("task panicked: {0}")]
    TaskPanicked(String),
    #[error("task join failed: {0}")]
    TaskJoin(String),
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("engine permanently failed: {0}")]
    Poisoned(#[source] Arc<EngineError>),
    #[error("shutdown left {queued} queued and {active} active operations outstanding")]
    ShutdownWithOutstandingWork { queued: usize, active: usize },
}

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::InvalidConfig { .. } => ErrorCode::InvalidConfig,
            EngineError::QueueFull => ErrorCode::QueueFull,
            EngineError::ShuttingDown => ErrorCode::ShuttingDown,
            EngineError::Timeout => ErrorCode::Timeout,
            EngineError::CancellationUnsupported => ErrorCode::CancellationUnsupported,
            EngineError::MissingIdentifiers { .. } => ErrorCode::MissingIdentifiers,
            EngineError::UnknownCommitStatus { .. } => ErrorCode::UnknownCommitStatus,
            EngineError::RetryLimitExceeded { .. } => ErrorCode::RetryLimitExceeded,
            EngineError::Backend(_) => ErrorCode::Backend,
            EngineError::TaskPanicked(_) => ErrorCode::TaskPanicked,
            EngineError::TaskJoin(_) => ErrorCode::TaskJoin,
            EngineError::Runtime(_) => ErrorCode::Runtime,
            EngineError::Poisoned(_) => ErrorCode::Poisoned,
            EngineError::ShutdownWithOutstandingWork { .. } => {
                ErrorCode::ShutdownWithOutstandingWork
            }
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// The recorded permanent cause when this error reports a poisoned engine.
    pub fn root_cause(&self) -> &EngineError {
        match self {
            EngineError::Poisoned(cause) => cause.root_cause(),
            other => other,
        }
    }
}

impl From<BackendError> for EngineError {
    fn from(err: BackendError) -> Self {
        EngineError::Backend(err.to_string())
    }
}

/// Failure reported by a transaction backend outside of commit statuses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("transaction {0} is not pending")]
    UnknownTransaction(u64),
    #[error("transaction {0} was already started")]
    AlreadyStarted(u64),
    #[error("transaction {0} is closed")]
    Closed(u64),
}

/// Failure of a single read or write issued through a transaction view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReadError {
    #[error("read below retained history")]
    Expired,
    #[error("transaction not started")]
    NotStarted,
    #[error("transaction closed")]
    Closed,
}

/// Failure of an operation's transform body. Every variant is retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error("expired read")]
    ExpiredRead,
    #[error("view unavailable: {0}")]
    View(ReadError),
    #[error("transform failed: {0}")]
    Failed(String),
}

impl From<ReadError> for TransformError {
    fn from(err: ReadError) -> Self {
        match err {
            ReadError::Expired => TransformError::ExpiredRead,
            other => TransformError::View(other),
        }
    }
}
