use crate::config::validator::validate_fault_settings;
use crate::config::FaultSettingsConfig;
use crate::errors::Result;
use crate::fault::matcher::{match_all, HeaderMatcher};
use crate::fault::percent::FractionalPercent;
use http::HeaderMap;
use std::collections::HashSet;

/// Header naming the node the request originated from.
pub const DOWNSTREAM_SERVICE_NODE: &str = "x-envoy-downstream-service-node";

/// Header naming the cluster the request originated from.
pub const DOWNSTREAM_SERVICE_CLUSTER: &str = "x-envoy-downstream-service-cluster";

/// Response rate limit applied to a matching request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseRateLimit {
    pub fixed_rate_kbps: u64,
    pub percentage: FractionalPercent,
}

/// What the engine needs to know about a request to decide whether it is
/// eligible for a fault.
#[derive(Debug, Clone, Copy)]
pub struct RequestInfo<'a> {
    pub headers: &'a HeaderMap,

    /// Upstream cluster the route resolved to, if any
    pub route_cluster: Option<&'a str>,

    /// Name of the matched route, used to pick route-specific settings
    pub route_name: Option<&'a str>,
}

impl<'a> RequestInfo<'a> {
    pub fn new(headers: &'a HeaderMap) -> Self {
        Self {
            headers,
            route_cluster: None,
            route_name: None,
        }
    }

    pub fn with_route_cluster(mut self, cluster: &'a str) -> Self {
        self.route_cluster = Some(cluster);
        self
    }

    pub fn with_route_name(mut self, name: &'a str) -> Self {
        self.route_name = Some(name);
        self
    }

    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Immutable fault settings for one filter instance or route.
#[derive(Debug, Clone)]
pub struct FaultPolicy {
    header_matchers: Vec<HeaderMatcher>,
    has_abort: bool,
    has_delay: bool,
    abort_percentage: FractionalPercent,
    abort_status: u32,
    delay_percentage: FractionalPercent,
    delay_duration_ms: u64,
    upstream_cluster: Option<String>,
    downstream_nodes: HashSet<String>,
    max_active_faults: Option<u64>,
    response_rate_limit: Option<ResponseRateLimit>,
}

impl FaultPolicy {
    /// Validate and compile settings. Any configuration error is fatal.
    pub fn from_config(config: &FaultSettingsConfig) -> Result<Self> {
        validate_fault_settings(config, "default")?;
        Self::build(config)
    }

    pub(crate) fn build(config: &FaultSettingsConfig) -> Result<Self> {
        let header_matchers = config
            .headers
            .iter()
            .map(HeaderMatcher::from_config)
            .collect::<Result<Vec<_>>>()?;

        let (abort_percentage, abort_status) = match &config.abort {
            Some(abort) => (abort.percentage, abort.http_status),
            None => (FractionalPercent::zero(), 0),
        };

        let (delay_percentage, delay_duration_ms) = match &config.delay {
            Some(delay) => (delay.percentage, delay.fixed_delay_ms),
            None => (FractionalPercent::zero(), 0),
        };

        Ok(Self {
            header_matchers,
            has_abort: config.abort.is_some(),
            has_delay: config.delay.is_some(),
            abort_percentage,
            abort_status,
            delay_percentage,
            delay_duration_ms,
            upstream_cluster: config.upstream_cluster.clone(),
            downstream_nodes: config.downstream_nodes.iter().cloned().collect(),
            max_active_faults: config.max_active_faults,
            response_rate_limit: config.response_rate_limit.as_ref().map(|rl| {
                ResponseRateLimit {
                    fixed_rate_kbps: rl.fixed_limit.limit_kbps,
                    percentage: rl.percentage,
                }
            }),
        })
    }

    /// Pure eligibility predicate: headers, then upstream cluster, then
    /// downstream node.
    pub fn matches(&self, request: &RequestInfo<'_>) -> bool {
        match_all(&self.header_matchers, request.headers)
            && self.matches_upstream_cluster(request)
            && self.matches_downstream_node(request)
    }

    fn matches_upstream_cluster(&self, request: &RequestInfo<'_>) -> bool {
        match &self.upstream_cluster {
            None => true,
            Some(target) => request.route_cluster == Some(target.as_str()),
        }
    }

    fn matches_downstream_node(&self, request: &RequestInfo<'_>) -> bool {
        if self.downstream_nodes.is_empty() {
            return true;
        }
        request
            .header(DOWNSTREAM_SERVICE_NODE)
            .map(|node| self.downstream_nodes.contains(node))
            .unwrap_or(false)
    }

    pub fn header_matchers(&self) -> &[HeaderMatcher] {
        &self.header_matchers
    }

    /// Whether an abort is configured at all. Runtime overrides cannot
    /// enable a fault kind the policy lacks.
    pub fn has_abort(&self) -> bool {
        self.has_abort
    }

    pub fn has_delay(&self) -> bool {
        self.has_delay
    }

    pub fn abort_percentage(&self) -> FractionalPercent {
        self.abort_percentage
    }

    pub fn abort_status(&self) -> u32 {
        self.abort_status
    }

    pub fn delay_percentage(&self) -> FractionalPercent {
        self.delay_percentage
    }

    pub fn delay_duration_ms(&self) -> u64 {
        self.delay_duration_ms
    }

    pub fn upstream_cluster(&self) -> Option<&str> {
        self.upstream_cluster.as_deref()
    }

    pub fn downstream_nodes(&self) -> &HashSet<String> {
        &self.downstream_nodes
    }

    pub fn max_active_faults(&self) -> Option<u64> {
        self.max_active_faults
    }

    pub fn response_rate_limit(&self) -> Option<&ResponseRateLimit> {
        self.response_rate_limit.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AbortConfig, DelayConfig};
    use crate::fault::matcher::HeaderMatcherConfig;
    use http::HeaderValue;

    fn settings() -> FaultSettingsConfig {
        FaultSettingsConfig {
            abort: Some(AbortConfig {
                percentage: FractionalPercent::percent(100),
                http_status: 503,
            }),
            delay: Some(DelayConfig {
                percentage: FractionalPercent::percent(10),
                fixed_delay_ms: 50,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_policy_matches_everything() {
        let policy = FaultPolicy::from_config(&settings()).unwrap();
        let headers = HeaderMap::new();
        assert!(policy.matches(&RequestInfo::new(&headers)));
        assert_eq!(policy.abort_status(), 503);
        assert_eq!(policy.delay_duration_ms(), 50);
        assert_eq!(policy.max_active_faults(), None);
    }

    #[test]
    fn test_header_matchers_all_required() {
        let mut config = settings();
        config.headers = vec![
            HeaderMatcherConfig {
                name: "x-a".into(),
                ..Default::default()
            },
            HeaderMatcherConfig {
                name: "x-b".into(),
                exact_match: Some("1".into()),
                ..Default::default()
            },
        ];
        let policy = FaultPolicy::from_config(&config).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("x-a", HeaderValue::from_static("anything"));
        assert!(!policy.matches(&RequestInfo::new(&headers)));

        headers.insert("x-b", HeaderValue::from_static("1"));
        assert!(policy.matches(&RequestInfo::new(&headers)));
    }

    #[test]
    fn test_upstream_cluster_restriction() {
        let mut config = settings();
        config.upstream_cluster = Some("backend".into());
        let policy = FaultPolicy::from_config(&config).unwrap();
        let headers = HeaderMap::new();

        assert!(!policy.matches(&RequestInfo::new(&headers)));
        assert!(!policy.matches(&RequestInfo::new(&headers).with_route_cluster("other")));
        assert!(policy.matches(&RequestInfo::new(&headers).with_route_cluster("backend")));
    }

    #[test]
    fn test_downstream_node_restriction() {
        let mut config = settings();
        config.downstream_nodes = vec!["node-a".into(), "node-b".into()];
        let policy = FaultPolicy::from_config(&config).unwrap();

        let mut headers = HeaderMap::new();
        assert!(!policy.matches(&RequestInfo::new(&headers)));

        headers.insert(DOWNSTREAM_SERVICE_NODE, HeaderValue::from_static("node-c"));
        assert!(!policy.matches(&RequestInfo::new(&headers)));

        headers.insert(DOWNSTREAM_SERVICE_NODE, HeaderValue::from_static("node-b"));
        assert!(policy.matches(&RequestInfo::new(&headers)));
    }

    #[test]
    fn test_zero_abort_status_rejected() {
        let mut config = settings();
        config.abort = Some(AbortConfig {
            percentage: FractionalPercent::percent(100),
            http_status: 0,
        });
        assert!(FaultPolicy::from_config(&config).is_err());
    }

    #[test]
    fn test_malformed_matcher_rejected() {
        let mut config = settings();
        config.headers = vec![HeaderMatcherConfig {
            name: "x".into(),
            regex_match: Some("[".into()),
            ..Default::default()
        }];
        assert!(FaultPolicy::from_config(&config).is_err());
    }
}
