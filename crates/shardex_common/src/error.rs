use thiserror::Error;

use crate::types::ShardTable;

/// Convenience alias for `Result<T, ShardexError>`.
pub type ShardexResult<T> = Result<T, ShardexError>;

/// Error classification for caller-side handling.
///
/// - `UserError`    — illegal query shape, rejected before any shard is contacted
/// - `Cancelled`    — caller cancelled or the caller-supplied deadline expired
/// - `ShardFailure` — a shard statement failed; the error names the shard
/// - `Transient`    — pool closed, buffer limit hit; caller MAY retry
/// - `InternalBug`  — should never happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Cancelled,
    ShardFailure,
    Transient,
    InternalBug,
}

/// Top-level error type of the sharding engine.
#[derive(Error, Debug)]
pub enum ShardexError {
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Routing error: {0}")]
    Routing(String),

    #[error("Compile error: {0}")]
    Compile(String),

    /// Failure of one shard's statement, tagged with the shard identity.
    #[error("Shard {table}@{data_source} failed: {reason}")]
    Shard {
        table: String,
        data_source: String,
        reason: String,
    },

    #[error("Query cancelled")]
    Cancelled,

    #[error("Query deadline exceeded")]
    DeadlineExceeded,

    #[error("Config error: {0}")]
    Config(String),

    /// Transient resource error.
    #[error("Transient: {0}")]
    Transient(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// Internal bug: always carries a unique `error_code` and `debug_context`.
    #[error("InternalBug [{error_code}]: {message} | context: {debug_context}")]
    InternalBug {
        error_code: &'static str,
        message: String,
        debug_context: String,
    },
}

/// Plan-build rejections. Raised synchronously while operators are folded in.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("Skip count could not be less than 0, got {0}")]
    NegativeSkip(i64),

    #[error("Take count could not be less than 0, got {0}")]
    NegativeTake(i64),

    #[error("Invalid page: index {page} (1-based), size {size}")]
    InvalidPage { page: i64, size: i64 },

    #[error("{operator} is not allowed after an aggregate has been fixed")]
    AggregateFrozen { operator: &'static str },

    #[error("ThenBy requires a preceding OrderBy")]
    ThenByWithoutOrderBy,

    #[error("Having requires a preceding GroupBy")]
    HavingWithoutGroupBy,

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Ordering column '{0}' is not part of the projection")]
    OrderColumnNotProjected(String),

    #[error("Count {0} does not fit in a 32-bit integer; use LongCount")]
    CountOverflow(i64),
}

/// Resource pool errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Pool '{0}' disposed")]
    Closed(String),

    #[error("No pool registered for data source '{0}'")]
    UnknownDataSource(String),
}

impl ShardexError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ShardexError::Plan(_) => ErrorKind::UserError,
            ShardexError::Config(_) => ErrorKind::UserError,
            ShardexError::Routing(_) => ErrorKind::UserError,
            ShardexError::Compile(_) => ErrorKind::UserError,
            ShardexError::Cancelled | ShardexError::DeadlineExceeded => ErrorKind::Cancelled,
            ShardexError::Shard { .. } => ErrorKind::ShardFailure,
            ShardexError::Pool(PoolError::Closed(_)) => ErrorKind::Transient,
            ShardexError::Pool(PoolError::UnknownDataSource(_)) => ErrorKind::UserError,
            ShardexError::Transient(_) => ErrorKind::Transient,
            ShardexError::Internal(_) | ShardexError::InternalBug { .. } => ErrorKind::InternalBug,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind(), ErrorKind::Cancelled)
    }

    pub fn is_user_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::UserError)
    }

    pub fn is_shard_failure(&self) -> bool {
        matches!(self.kind(), ErrorKind::ShardFailure)
    }

    pub fn is_pool_closed(&self) -> bool {
        matches!(self, ShardexError::Pool(PoolError::Closed(_)))
    }

    /// The physical table named by a shard failure.
    pub fn shard_table(&self) -> Option<&str> {
        match self {
            ShardexError::Shard { table, .. } => Some(table.as_str()),
            _ => None,
        }
    }

    pub fn shard_failure(table: &ShardTable, reason: impl Into<String>) -> Self {
        ShardexError::Shard {
            table: table.name.clone(),
            data_source: table.data_source.clone(),
            reason: reason.into(),
        }
    }

    /// Tag an error raised while running a statement against `table`.
    ///
    /// Cancellation, pool and already-tagged errors keep their identity so that
    /// callers can still tell "cancelled" from "shard error".
    pub fn tag_shard(self, table: &ShardTable) -> Self {
        match self {
            e @ (ShardexError::Cancelled
            | ShardexError::DeadlineExceeded
            | ShardexError::Pool(_)
            | ShardexError::Shard { .. }) => e,
            other => ShardexError::shard_failure(table, other.to_string()),
        }
    }

    pub fn internal_bug(
        error_code: &'static str,
        message: impl Into<String>,
        debug_context: impl Into<String>,
    ) -> Self {
        ShardexError::InternalBug {
            error_code,
            message: message.into(),
            debug_context: debug_context.into(),
        }
    }
}
