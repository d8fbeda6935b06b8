use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const DEFAULT_MAX_TRACKED_FAILURES: usize = 512;
pub const DEFAULT_SLOW_SEARCH_WARN_MS: u64 = 250;

/// Tuning knobs for a search executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorOptions {
    /// Upper bound on retained search failures; newer failures are only logged
    /// once the bound is reached.
    pub max_tracked_failures: usize,
    /// Evaluations that take longer than this are logged.
    pub slow_search_warn_ms: u64,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            max_tracked_failures: DEFAULT_MAX_TRACKED_FAILURES,
            slow_search_warn_ms: DEFAULT_SLOW_SEARCH_WARN_MS,
        }
    }
}

impl ExecutorOptions {
    /// Parses options from JSON; missing fields take their defaults.
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}
