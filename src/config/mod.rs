pub mod loader;
pub mod validator;
pub mod watcher;

use crate::fault::matcher::HeaderMatcherConfig;
use crate::fault::percent::FractionalPercent;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Complete application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Filter configuration (loaded from file)
    pub filter: FaultFilterConfigFile,

    /// Runtime override file (supports hot reload)
    pub runtime_overrides: Option<PathBuf>,
}

/// Fault filter configuration (loaded from JSON file)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultFilterConfigFile {
    /// Prefix used to label every stat emitted by this filter
    #[serde(default = "default_stat_prefix")]
    pub stat_prefix: String,

    /// Settings applied to routes without their own entry
    #[serde(flatten)]
    pub settings: FaultSettingsConfig,

    /// Route-specific settings keyed by route name
    #[serde(default)]
    pub routes: HashMap<String, FaultSettingsConfig>,

    /// Upper bound on response bytes held by a rate limiter before the
    /// upstream is paused
    #[serde(default = "default_response_buffer_limit")]
    pub response_buffer_limit_bytes: u64,
}

impl Default for FaultFilterConfigFile {
    fn default() -> Self {
        Self {
            stat_prefix: default_stat_prefix(),
            settings: FaultSettingsConfig::default(),
            routes: HashMap::new(),
            response_buffer_limit_bytes: default_response_buffer_limit(),
        }
    }
}

/// Fault settings for one filter instance or route
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FaultSettingsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort: Option<AbortConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<DelayConfig>,

    /// All of these must match for a request to be eligible
    #[serde(default)]
    pub headers: Vec<HeaderMatcherConfig>,

    /// Restrict faults to requests routed to this cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_cluster: Option<String>,

    /// Restrict faults to requests from these downstream nodes
    #[serde(default)]
    pub downstream_nodes: Vec<String>,

    /// Cap on faults active at once across all requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_active_faults: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_rate_limit: Option<ResponseRateLimitConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortConfig {
    #[serde(default)]
    pub percentage: FractionalPercent,

    /// HTTP status sent in the local reply
    pub http_status: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayConfig {
    #[serde(default)]
    pub percentage: FractionalPercent,

    #[serde(default)]
    pub fixed_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRateLimitConfig {
    pub fixed_limit: FixedLimitConfig,

    /// Probability that a matching request is rate limited at all
    #[serde(default)]
    pub percentage: FractionalPercent,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FixedLimitConfig {
    pub limit_kbps: u64,
}

fn default_stat_prefix() -> String {
    "fault".to_string()
}

fn default_response_buffer_limit() -> u64 {
    1024 * 1024
}
