use serde::{Deserialize, Serialize};
use std::fmt;

use crate::datum::Datum;

/// Inclusive value range covered by one range-partitioned shard table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRange {
    pub min: Datum,
    pub max: Datum,
}

impl ShardRange {
    pub fn new(min: impl Into<Datum>, max: impl Into<Datum>) -> Self {
        Self {
            min: min.into(),
            max: max.into(),
        }
    }
}

/// One physical partition of a logical table, as resolved by the shard router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardTable {
    /// Physical table name, e.g. `orders_2024_01`.
    pub name: String,
    /// Physical store (connection pool key) holding the table.
    pub data_source: String,
    /// Value range, present only for range-ordered routes.
    #[serde(default)]
    pub range: Option<ShardRange>,
}

impl ShardTable {
    pub fn new(name: impl Into<String>, data_source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_source: data_source.into(),
            range: None,
        }
    }

    pub fn with_range(mut self, range: ShardRange) -> Self {
        self.range = Some(range);
        self
    }
}

impl fmt::Display for ShardTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.data_source)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    pub fn is_descending(self) -> bool {
        matches!(self, SortDirection::Descending)
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            SortDirection::Ascending => "ASC",
            SortDirection::Descending => "DESC",
        }
    }
}
