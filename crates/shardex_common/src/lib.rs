//! Shared data model, error types, configuration and cancellation for the
//! shardex sharded query engine.

pub mod cancel;
pub mod config;
pub mod datum;
pub mod error;
pub mod types;

pub use cancel::CancelToken;
pub use config::{ExecutionConfig, PoolConfig, ShardingConfig};
pub use datum::{Datum, OwnedRow};
pub use error::{ErrorKind, PlanError, PoolError, ShardexError, ShardexResult};
pub use types::{ShardRange, ShardTable, SortDirection};
