//! Runtime overrides for configured fault values.
//!
//! Any configured percentage, duration, status or limit can be replaced for a
//! single evaluation by a value looked up under a well-known key. Missing or
//! malformed values fall back to the configured one.

pub mod snapshot;

use crate::fault::percent::{DenominatorType, FractionalPercent};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use snapshot::SnapshotRuntime;

pub const DELAY_PERCENT_KEY: &str = "fault.http.delay.fixed_delay_percent";
pub const ABORT_PERCENT_KEY: &str = "fault.http.abort.abort_percent";
pub const DELAY_DURATION_KEY: &str = "fault.http.delay.fixed_duration_ms";
pub const ABORT_HTTP_STATUS_KEY: &str = "fault.http.abort.http_status";
pub const MAX_ACTIVE_FAULTS_KEY: &str = "fault.http.max_active_faults";
pub const RESPONSE_RATE_LIMIT_PERCENT_KEY: &str = "fault.http.rate_limit.response_percent";

/// A value stored under a runtime key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuntimeValue {
    Integer(u64),
    Percent(FractionalPercent),
}

/// Key/value override source.
pub trait Runtime: Send + Sync {
    fn lookup(&self, key: &str) -> Option<RuntimeValue>;

    /// Integer under `key`, or `default` when absent or not an integer.
    fn get_integer(&self, key: &str, default: u64) -> u64 {
        match self.lookup(key) {
            Some(RuntimeValue::Integer(value)) => value,
            Some(other) => {
                debug!(key, value = ?other, "ignoring non-integer runtime override");
                default
            }
            None => default,
        }
    }

    /// Percentage under `key`, or `default` when absent. A bare integer is
    /// read as a percentage out of one hundred.
    fn get_percent(&self, key: &str, default: FractionalPercent) -> FractionalPercent {
        match self.lookup(key) {
            Some(RuntimeValue::Percent(percent)) => percent,
            Some(RuntimeValue::Integer(value)) => {
                FractionalPercent::new(value, DenominatorType::Hundred)
            }
            None => default,
        }
    }
}

/// Runtime with no overrides.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRuntime;

impl Runtime for NoRuntime {
    fn lookup(&self, _key: &str) -> Option<RuntimeValue> {
        None
    }
}

/// Downstream-cluster scoped keys, e.g. `fault.http.frontend.delay.fixed_delay_percent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownstreamClusterKeys {
    pub delay_percent: String,
    pub abort_percent: String,
    pub delay_duration: String,
    pub abort_http_status: String,
}

impl DownstreamClusterKeys {
    pub fn new(cluster: &str) -> Self {
        Self {
            delay_percent: format!("fault.http.{}.delay.fixed_delay_percent", cluster),
            abort_percent: format!("fault.http.{}.abort.abort_percent", cluster),
            delay_duration: format!("fault.http.{}.delay.fixed_duration_ms", cluster),
            abort_http_status: format!("fault.http.{}.abort.http_status", cluster),
        }
    }
}
