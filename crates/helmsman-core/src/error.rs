//! Error taxonomy shared by the controller subsystems.

use thiserror::Error;

/// A specialized `Result` type for controller operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the recruitment, failure-detection, and supervision
/// paths.
///
/// Only `NoMoreServers` and `OperationFailed` are caught and re-thrown
/// selectively inside policy and recruiter code; everything else is fatal
/// to the current controller role.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The replication policy cannot be satisfied with the current workers.
    #[error("no more servers: the replication policy cannot be satisfied")]
    NoMoreServers,

    /// A placement exists but is not yet good enough under the startup
    /// grace window; the caller should retry.
    #[error("operation failed: placement not yet good enough")]
    OperationFailed,

    /// The peer holding the reply promise died.
    #[error("broken promise: peer endpoint dropped the reply")]
    BrokenPromise,

    /// A failure-monitoring requester claims a version newer than the
    /// server's; the requester must reset and resync.
    #[error("future version: requester is ahead of the failure-detection server")]
    FutureVersion,

    /// A storage recruitment deadline elapsed.
    #[error("timed out")]
    TimedOut,

    /// Local shutdown; propagated silently.
    #[error("canceled")]
    Canceled,

    /// A transaction-log set could not be rejoined during recovery.
    #[error("recruitment failed")]
    RecruitmentFailed,

    /// The system keyspace store reported an error.
    #[error("store error: {0}")]
    Store(String),

    /// Anything unexpected; fatal to the controller role.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for the two errors the recruiter treats as retryable.
    pub fn is_retryable_recruitment(&self) -> bool {
        matches!(self, Self::NoMoreServers | Self::OperationFailed)
    }
}
