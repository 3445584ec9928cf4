//! Engine configuration.
//!
//! Every knob has a serde default so a config file only needs to name what
//! it overrides:
//!
//! ```yaml
//! max_attempts: 3
//! backoff_base_ms: 500
//! backoff_multiplier: 2.0
//! backoff_ceiling_ms: 30000
//! concurrency_limit: 4
//! max_rework_rounds: 3
//! default_major_cap: 0
//! ```

use serde::{Deserialize, Serialize};

/// Tunable policy for one coordinator instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum execution attempts per step (first try included).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial retry backoff delay in milliseconds.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Multiplier applied to the delay after each failed attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound on a single backoff delay in milliseconds.
    #[serde(default = "default_backoff_ceiling_ms")]
    pub backoff_ceiling_ms: u64,

    /// How many dependency-satisfied steps may execute at once.
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,

    /// How many rework rounds a gate failure may trigger before the run
    /// halts instead of looping.
    #[serde(default = "default_max_rework_rounds")]
    pub max_rework_rounds: u32,

    /// Major-severity cap used by gates whose checklist does not set one.
    #[serde(default)]
    pub default_major_cap: u32,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_ceiling_ms() -> u64 {
    30_000
}

fn default_concurrency_limit() -> usize {
    4
}

fn default_max_rework_rounds() -> u32 {
    3
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_ceiling_ms: default_backoff_ceiling_ms(),
            concurrency_limit: default_concurrency_limit(),
            max_rework_rounds: default_max_rework_rounds(),
            default_major_cap: 0,
        }
    }
}

impl EngineConfig {
    /// Parse a config from a YAML string. Unknown keys are ignored.
    pub fn from_yaml(yaml: &str) -> Result<Self, crate::error::EngineError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| crate::error::EngineError::Internal(format!("bad engine config: {e}")))
    }
}
