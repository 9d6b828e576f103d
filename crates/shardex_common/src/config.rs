use serde::{Deserialize, Serialize};

use crate::error::{ShardexError, ShardexResult};

/// Top-level engine configuration (`shardex.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardingConfig {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
}

/// Per-physical-store connection pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Connections opened per data source; also the cap on shard statements
    /// running concurrently against that store.
    pub max_connections_per_source: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_source: 12,
        }
    }
}

/// Coordinator-side execution limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Hard cap on rows materialized by a coordinator-side merge (0 = unlimited).
    #[serde(default)]
    pub max_rows_buffered: usize,
    /// Unordered paging materializes every matching row before windowing;
    /// above this many rows a warning is logged (0 = never warn).
    #[serde(default = "default_warn_rows_buffered")]
    pub warn_rows_buffered: usize,
    /// Deadline applied when the caller's token has none (0 = no timeout).
    #[serde(default)]
    pub default_timeout_ms: u64,
}

fn default_warn_rows_buffered() -> usize {
    100_000
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_rows_buffered: 0,
            warn_rows_buffered: default_warn_rows_buffered(),
            default_timeout_ms: 0,
        }
    }
}

impl ExecutionConfig {
    /// Fail if `rows` exceeds the configured buffer cap.
    pub fn check_buffered(&self, rows: usize) -> ShardexResult<()> {
        if self.max_rows_buffered > 0 && rows > self.max_rows_buffered {
            return Err(ShardexError::Transient(format!(
                "merge aborted: {} rows exceeds max_rows_buffered limit of {}",
                rows, self.max_rows_buffered,
            )));
        }
        Ok(())
    }
}

impl ShardingConfig {
    /// Parse and validate a TOML document. Missing sections take defaults.
    pub fn from_toml_str(text: &str) -> ShardexResult<Self> {
        let config: ShardingConfig =
            toml::from_str(text).map_err(|e| ShardexError::Config(e.to_string()))?;
        config.validate().map_err(ShardexError::Config)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.pool.max_connections_per_source == 0 {
            return Err("pool.max_connections_per_source must be > 0".into());
        }
        if self.execution.max_rows_buffered > 0
            && self.execution.warn_rows_buffered > self.execution.max_rows_buffered
        {
            return Err(format!(
                "execution.warn_rows_buffered ({}) exceeds execution.max_rows_buffered ({})",
                self.execution.warn_rows_buffered, self.execution.max_rows_buffered,
            ));
        }
        Ok(())
    }
}
