use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec, register_int_gauge_vec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec,
};

lazy_static! {
    // Fault metrics
    pub static ref DELAYS_INJECTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "fault_delays_injected_total",
        "Total number of requests delayed by the fault filter",
        &["prefix"]
    ).unwrap();

    pub static ref ABORTS_INJECTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "fault_aborts_injected_total",
        "Total number of requests aborted by the fault filter",
        &["prefix"]
    ).unwrap();

    pub static ref RESPONSE_RL_INJECTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "fault_response_rl_injected_total",
        "Total number of responses put under a rate limit",
        &["prefix"]
    ).unwrap();

    pub static ref FAULTS_OVERFLOW_TOTAL: IntCounterVec = register_int_counter_vec!(
        "fault_faults_overflow_total",
        "Faults dropped because max_active_faults was reached",
        &["prefix"]
    ).unwrap();

    pub static ref ACTIVE_FAULTS: IntGaugeVec = register_int_gauge_vec!(
        "fault_active_faults",
        "Faults currently in effect",
        &["prefix"]
    ).unwrap();

    // Per downstream cluster
    pub static ref DOWNSTREAM_DELAYS_INJECTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "fault_downstream_delays_injected_total",
        "Delays injected, by downstream service cluster",
        &["prefix", "downstream_cluster"]
    ).unwrap();

    pub static ref DOWNSTREAM_ABORTS_INJECTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "fault_downstream_aborts_injected_total",
        "Aborts injected, by downstream service cluster",
        &["prefix", "downstream_cluster"]
    ).unwrap();
}

/// Stats of one filter config, bound to its stat prefix.
#[derive(Debug, Clone)]
pub struct FaultStats {
    prefix: String,
    pub delays_injected: IntCounter,
    pub aborts_injected: IntCounter,
    pub response_rl_injected: IntCounter,
    pub faults_overflow: IntCounter,
    pub active_faults: IntGauge,
}

impl FaultStats {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            delays_injected: DELAYS_INJECTED_TOTAL.with_label_values(&[prefix]),
            aborts_injected: ABORTS_INJECTED_TOTAL.with_label_values(&[prefix]),
            response_rl_injected: RESPONSE_RL_INJECTED_TOTAL.with_label_values(&[prefix]),
            faults_overflow: FAULTS_OVERFLOW_TOTAL.with_label_values(&[prefix]),
            active_faults: ACTIVE_FAULTS.with_label_values(&[prefix]),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Record a delay against the generic and, if known, the downstream
    /// cluster counters.
    pub fn record_delay_injected(&self, downstream_cluster: Option<&str>) {
        if let Some(cluster) = downstream_cluster {
            DOWNSTREAM_DELAYS_INJECTED_TOTAL
                .with_label_values(&[&self.prefix, cluster])
                .inc();
        }
        self.delays_injected.inc();
    }

    pub fn record_abort_injected(&self, downstream_cluster: Option<&str>) {
        if let Some(cluster) = downstream_cluster {
            DOWNSTREAM_ABORTS_INJECTED_TOTAL
                .with_label_values(&[&self.prefix, cluster])
                .inc();
        }
        self.aborts_injected.inc();
    }
}

/// Delays recorded for one downstream cluster
pub fn downstream_delays(prefix: &str, cluster: &str) -> u64 {
    DOWNSTREAM_DELAYS_INJECTED_TOTAL
        .with_label_values(&[prefix, cluster])
        .get()
}

/// Aborts recorded for one downstream cluster
pub fn downstream_aborts(prefix: &str, cluster: &str) -> u64 {
    DOWNSTREAM_ABORTS_INJECTED_TOTAL
        .with_label_values(&[prefix, cluster])
        .get()
}
