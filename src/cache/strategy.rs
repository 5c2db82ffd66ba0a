//! Write Strategies
//!
//! How a `set` propagates between the memory and distributed tiers.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Write strategy for `TieredCache::set`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStrategy {
    /// Memory first, then distributed. Returns false when the distributed
    /// write fails even though the value is readable locally.
    #[default]
    CacheAside,
    /// Distributed first; memory only on success, memory-only fallback
    /// (returning false) on failure
    WriteThrough,
    /// Memory synchronously, distributed in the background; always true
    WriteBehind,
}

impl WriteStrategy {
    /// Stable name for logs and metrics labels
    pub fn name(&self) -> &'static str {
        match self {
            WriteStrategy::CacheAside => "cache_aside",
            WriteStrategy::WriteThrough => "write_through",
            WriteStrategy::WriteBehind => "write_behind",
        }
    }
}

impl std::fmt::Display for WriteStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for WriteStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "cache_aside" => Ok(WriteStrategy::CacheAside),
            "write_through" => Ok(WriteStrategy::WriteThrough),
            "write_behind" => Ok(WriteStrategy::WriteBehind),
            other => Err(Error::Config(format!("unknown write strategy '{other}'"))),
        }
    }
}
