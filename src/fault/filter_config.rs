use crate::config::validator::validate_filter_config;
use crate::config::FaultFilterConfigFile;
use crate::errors::Result;
use crate::fault::policy::FaultPolicy;
use crate::fault::tracker::ActiveFaultTracker;
use crate::metrics::FaultStats;
use crate::runtime::Runtime;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// State shared by every request the filter handles: policies, the override
/// runtime, stats and the active fault tracker.
///
/// Route-specific policies share the tracker and stats of the filter.
pub struct FaultFilterConfig {
    default_policy: Arc<FaultPolicy>,
    routes: DashMap<String, Arc<FaultPolicy>>,
    runtime: Arc<dyn Runtime>,
    stats: FaultStats,
    tracker: Arc<ActiveFaultTracker>,
    response_buffer_limit: u64,
}

impl FaultFilterConfig {
    /// Validate a configuration file and build the filter config from it.
    pub fn new(config: &FaultFilterConfigFile, runtime: Arc<dyn Runtime>) -> Result<Self> {
        validate_filter_config(config)?;

        let filter = Self::with_policy(
            FaultPolicy::build(&config.settings)?,
            &config.stat_prefix,
            runtime,
        )
        .with_response_buffer_limit(config.response_buffer_limit_bytes);

        for (name, settings) in &config.routes {
            filter
                .routes
                .insert(name.clone(), Arc::new(FaultPolicy::build(settings)?));
        }

        info!(
            stat_prefix = %config.stat_prefix,
            routes = filter.routes.len(),
            "fault filter configured"
        );

        Ok(filter)
    }

    /// Config with a single policy and the default response buffer limit.
    pub fn with_policy(policy: FaultPolicy, stat_prefix: &str, runtime: Arc<dyn Runtime>) -> Self {
        let stats = FaultStats::new(stat_prefix);
        let tracker =
            ActiveFaultTracker::new(stats.active_faults.clone(), stats.faults_overflow.clone());
        Self {
            default_policy: Arc::new(policy),
            routes: DashMap::new(),
            runtime,
            stats,
            tracker,
            response_buffer_limit: FaultFilterConfigFile::default().response_buffer_limit_bytes,
        }
    }

    pub fn with_response_buffer_limit(mut self, limit: u64) -> Self {
        self.response_buffer_limit = limit;
        self
    }

    /// Policy for a route, falling back to the filter's own settings.
    pub fn policy_for(&self, route: Option<&str>) -> Arc<FaultPolicy> {
        route
            .and_then(|name| self.routes.get(name).map(|entry| Arc::clone(entry.value())))
            .unwrap_or_else(|| Arc::clone(&self.default_policy))
    }

    /// Install or replace a route-specific policy.
    pub fn set_route_policy(&self, route: &str, policy: FaultPolicy) {
        self.routes.insert(route.to_string(), Arc::new(policy));
    }

    pub fn remove_route_policy(&self, route: &str) -> bool {
        self.routes.remove(route).is_some()
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn runtime(&self) -> &dyn Runtime {
        self.runtime.as_ref()
    }

    pub fn stats(&self) -> &FaultStats {
        &self.stats
    }

    pub fn tracker(&self) -> &Arc<ActiveFaultTracker> {
        &self.tracker
    }

    pub fn response_buffer_limit(&self) -> u64 {
        self.response_buffer_limit
    }
}

impl fmt::Debug for FaultFilterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultFilterConfig")
            .field("stat_prefix", &self.stats.prefix())
            .field("routes", &self.routes.len())
            .field("active_faults", &self.tracker.active())
            .field("response_buffer_limit", &self.response_buffer_limit)
            .finish()
    }
}
