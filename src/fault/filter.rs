use crate::fault::policy::{FaultPolicy, RequestInfo, DOWNSTREAM_SERVICE_CLUSTER};
use crate::fault::tracker::ActiveFault;
use crate::fault::{
    AfterDelay, FaultAction, FaultFilterConfig, FaultPhase, FilterDataStatus,
    FilterTrailersStatus, ABORT_BODY,
};
use crate::limiter::{StreamCallbacks, StreamRateLimiter};
use crate::runtime::{
    DownstreamClusterKeys, RuntimeValue, ABORT_HTTP_STATUS_KEY, ABORT_PERCENT_KEY,
    DELAY_DURATION_KEY, DELAY_PERCENT_KEY, MAX_ACTIVE_FAULTS_KEY,
    RESPONSE_RATE_LIMIT_PERCENT_KEY,
};
use crate::timer::{TimerEvent, TimerHandle, TimerId, TimerKind, TimerService};
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

type ResponseLimiter = StreamRateLimiter<Box<dyn StreamCallbacks>>;

/// Per-request fault state machine.
///
/// Created when request headers arrive and destroyed with the stream. All
/// methods run on the stream's execution context; only the active fault
/// tracker inside the shared config is touched concurrently.
pub struct FaultFilter {
    config: Arc<FaultFilterConfig>,
    timers: Arc<dyn TimerService>,
    rng: StdRng,
    phase: FaultPhase,
    policy: Option<Arc<FaultPolicy>>,
    active_fault: Option<ActiveFault>,
    selected_abort: bool,
    selected_delay: bool,
    abort_status: u32,
    delay_timer: Option<TimerHandle>,
    delay_deadline: Option<Instant>,
    downstream_cluster: Option<String>,
    cluster_keys: Option<DownstreamClusterKeys>,
    response_limiter: Option<ResponseLimiter>,
    response_rl_evaluated: bool,
    destroyed: bool,
}

impl FaultFilter {
    pub fn new(config: Arc<FaultFilterConfig>, timers: Arc<dyn TimerService>) -> Self {
        Self::with_rng(config, timers, StdRng::from_entropy())
    }

    pub fn with_rng(
        config: Arc<FaultFilterConfig>,
        timers: Arc<dyn TimerService>,
        rng: StdRng,
    ) -> Self {
        Self {
            config,
            timers,
            rng,
            phase: FaultPhase::Init,
            policy: None,
            active_fault: None,
            selected_abort: false,
            selected_delay: false,
            abort_status: 0,
            delay_timer: None,
            delay_deadline: None,
            downstream_cluster: None,
            cluster_keys: None,
            response_limiter: None,
            response_rl_evaluated: false,
            destroyed: false,
        }
    }

    /// Decide the fault for a request. Called once, when its headers arrive.
    pub fn on_request_headers(&mut self, request: &RequestInfo<'_>) -> FaultAction {
        if self.phase != FaultPhase::Init || self.destroyed {
            warn!(phase = ?self.phase, "request headers already handled; ignoring");
            return FaultAction::None;
        }

        let policy = self.config.policy_for(request.route_name);
        if !policy.matches(request) {
            debug!(route = ?request.route_name, "request does not match fault policy");
            self.phase = FaultPhase::Done;
            return FaultAction::None;
        }
        self.policy = Some(Arc::clone(&policy));

        if let Some(cluster) = request
            .header(DOWNSTREAM_SERVICE_CLUSTER)
            .filter(|c| !c.is_empty())
        {
            self.cluster_keys = Some(DownstreamClusterKeys::new(cluster));
            self.downstream_cluster = Some(cluster.to_string());
        }

        let delay_enabled = self.is_delay_enabled(&policy);
        let abort_enabled = self.is_abort_enabled(&policy);
        if !delay_enabled && !abort_enabled {
            self.phase = FaultPhase::Done;
            return FaultAction::None;
        }

        let max_active = self.max_active_faults(&policy);
        let Some(slot) = self.config.tracker().try_activate(max_active) else {
            warn!(
                max_active_faults = ?max_active,
                "max active faults reached; forwarding unfaulted"
            );
            self.phase = FaultPhase::Done;
            return FaultAction::None;
        };
        self.active_fault = Some(slot);
        self.selected_delay = delay_enabled;
        self.selected_abort = abort_enabled;
        if abort_enabled {
            self.abort_status = self.abort_http_status(&policy);
        }

        if delay_enabled {
            let duration = Duration::from_millis(self.delay_duration_ms(&policy));
            return self.start_delay(duration);
        }

        FaultAction::Abort(self.abort())
    }

    /// Request body chunks are held while a delay is pending.
    pub fn on_request_data(&self) -> FilterDataStatus {
        if self.phase == FaultPhase::DelayPending {
            FilterDataStatus::StopIterationAndWatermark
        } else {
            FilterDataStatus::Continue
        }
    }

    pub fn on_request_trailers(&self) -> FilterTrailersStatus {
        if self.phase == FaultPhase::DelayPending {
            FilterTrailersStatus::StopIteration
        } else {
            FilterTrailersStatus::Continue
        }
    }

    /// Route a fired timer. Returns the follow-up when a delay elapsed.
    pub fn on_timer(&mut self, event: TimerEvent) -> Option<AfterDelay> {
        match event.kind {
            TimerKind::Delay => self.on_delay_timer(event.id),
            TimerKind::TokenRefill => {
                if let Some(limiter) = self.response_limiter.as_mut() {
                    limiter.on_token_timer(event);
                }
                None
            }
        }
    }

    /// Decide whether the response is rate limited. Evaluated at most once.
    ///
    /// Only requests that matched the policy are eligible. Rate limiting
    /// does not hold an active fault slot.
    pub fn on_response_headers(&mut self, callbacks: Box<dyn StreamCallbacks>) -> bool {
        if self.response_rl_evaluated || self.destroyed {
            return false;
        }
        self.response_rl_evaluated = true;

        let Some(rate_limit) = self
            .policy
            .as_ref()
            .and_then(|policy| policy.response_rate_limit().copied())
        else {
            return false;
        };

        let percentage = self
            .config
            .runtime()
            .get_percent(RESPONSE_RATE_LIMIT_PERCENT_KEY, rate_limit.percentage);
        if !percentage.evaluate(&mut self.rng) {
            return false;
        }

        match StreamRateLimiter::new(
            rate_limit.fixed_rate_kbps,
            self.config.response_buffer_limit(),
            callbacks,
            Arc::clone(&self.timers),
        ) {
            Ok(limiter) => {
                self.config.stats().response_rl_injected.inc();
                info!(
                    fixed_rate_kbps = rate_limit.fixed_rate_kbps,
                    "response rate limit injected"
                );
                self.response_limiter = Some(limiter);
                true
            }
            Err(e) => {
                warn!("cannot create response rate limiter: {}", e);
                false
            }
        }
    }

    /// Hand a response body chunk to the rate limiter, if one is attached.
    /// The chunk is taken out of `data` when it is.
    pub fn on_response_data(&mut self, data: &mut Bytes, end_stream: bool) -> FilterDataStatus {
        match self.response_limiter.as_mut() {
            Some(limiter) => {
                limiter.write_data(std::mem::take(data), end_stream);
                FilterDataStatus::StopIterationNoBuffer
            }
            None => FilterDataStatus::Continue,
        }
    }

    pub fn on_response_trailers(&mut self) -> FilterTrailersStatus {
        match self.response_limiter.as_mut() {
            Some(limiter) => {
                if limiter.on_trailers() {
                    FilterTrailersStatus::StopIteration
                } else {
                    FilterTrailersStatus::Continue
                }
            }
            None => FilterTrailersStatus::Continue,
        }
    }

    /// Tear down: cancel outstanding timers and release the active fault.
    /// Safe to call any number of times.
    pub fn on_destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        if let Some(mut timer) = self.delay_timer.take() {
            timer.cancel();
            debug!("stream destroyed during fault delay");
        }
        self.response_limiter = None;
        self.release_fault();
        self.phase = FaultPhase::Done;
    }

    pub fn phase(&self) -> FaultPhase {
        self.phase
    }

    /// Status and body of the local reply once the request was aborted.
    pub fn local_reply(&self) -> Option<(u32, &'static str)> {
        (self.phase == FaultPhase::Aborted).then_some((self.abort_status, ABORT_BODY))
    }

    pub fn is_fault_active(&self) -> bool {
        self.active_fault.is_some()
    }

    pub fn selected_abort(&self) -> bool {
        self.selected_abort
    }

    pub fn selected_delay(&self) -> bool {
        self.selected_delay
    }

    pub fn delay_deadline(&self) -> Option<Instant> {
        self.delay_deadline
    }

    pub fn downstream_cluster(&self) -> Option<&str> {
        self.downstream_cluster.as_deref()
    }

    pub fn is_response_rate_limited(&self) -> bool {
        self.response_limiter.is_some()
    }

    fn start_delay(&mut self, duration: Duration) -> FaultAction {
        match self.timers.schedule(duration, TimerKind::Delay) {
            Ok(timer) => {
                self.delay_timer = Some(timer);
                self.delay_deadline = Some(Instant::now() + duration);
                self.phase = FaultPhase::DelayPending;
                self.config
                    .stats()
                    .record_delay_injected(self.downstream_cluster.as_deref());

                let then = if self.selected_abort {
                    AfterDelay::Abort(self.abort_status)
                } else {
                    AfterDelay::Continue
                };
                info!(
                    delay_ms = duration.as_millis() as u64,
                    ?then,
                    downstream_cluster = ?self.downstream_cluster,
                    "fault delay injected"
                );
                FaultAction::Delay { duration, then }
            }
            Err(e) => {
                warn!("cannot arm fault delay timer, forwarding unfaulted: {}", e);
                self.selected_delay = false;
                self.selected_abort = false;
                self.release_fault();
                self.phase = FaultPhase::Done;
                FaultAction::None
            }
        }
    }

    fn on_delay_timer(&mut self, id: TimerId) -> Option<AfterDelay> {
        let current = self.delay_timer.as_ref().map(TimerHandle::id);
        if self.phase != FaultPhase::DelayPending || current != Some(id) {
            trace!(?id, phase = ?self.phase, "ignoring stale delay timer");
            return None;
        }
        self.delay_timer = None;
        self.phase = FaultPhase::DelayElapsed;
        debug!("fault delay elapsed");

        if self.selected_abort {
            return Some(AfterDelay::Abort(self.abort()));
        }

        self.phase = FaultPhase::Continuing;
        self.release_fault();
        Some(AfterDelay::Continue)
    }

    fn abort(&mut self) -> u32 {
        self.phase = FaultPhase::Aborted;
        self.config
            .stats()
            .record_abort_injected(self.downstream_cluster.as_deref());
        info!(
            status = self.abort_status,
            downstream_cluster = ?self.downstream_cluster,
            "fault abort injected"
        );
        self.release_fault();
        self.abort_status
    }

    fn release_fault(&mut self) {
        if self.active_fault.take().is_some() {
            debug!("active fault released");
        }
    }

    fn is_delay_enabled(&mut self, policy: &FaultPolicy) -> bool {
        if !policy.has_delay() {
            return false;
        }
        let runtime = self.config.runtime();
        let mut enabled = runtime
            .get_percent(DELAY_PERCENT_KEY, policy.delay_percentage())
            .evaluate(&mut self.rng);
        if let Some(keys) = &self.cluster_keys {
            if runtime.lookup(&keys.delay_percent).is_some() {
                enabled |= runtime
                    .get_percent(&keys.delay_percent, policy.delay_percentage())
                    .evaluate(&mut self.rng);
            }
        }
        enabled
    }

    fn is_abort_enabled(&mut self, policy: &FaultPolicy) -> bool {
        if !policy.has_abort() {
            return false;
        }
        let runtime = self.config.runtime();
        let mut enabled = runtime
            .get_percent(ABORT_PERCENT_KEY, policy.abort_percentage())
            .evaluate(&mut self.rng);
        if let Some(keys) = &self.cluster_keys {
            if runtime.lookup(&keys.abort_percent).is_some() {
                enabled |= runtime
                    .get_percent(&keys.abort_percent, policy.abort_percentage())
                    .evaluate(&mut self.rng);
            }
        }
        enabled
    }

    fn delay_duration_ms(&self, policy: &FaultPolicy) -> u64 {
        let runtime = self.config.runtime();
        let duration = runtime.get_integer(DELAY_DURATION_KEY, policy.delay_duration_ms());
        match &self.cluster_keys {
            Some(keys) => runtime.get_integer(&keys.delay_duration, duration),
            None => duration,
        }
    }

    fn abort_http_status(&self, policy: &FaultPolicy) -> u32 {
        let runtime = self.config.runtime();
        let mut status = runtime.get_integer(ABORT_HTTP_STATUS_KEY, u64::from(policy.abort_status()));
        if let Some(keys) = &self.cluster_keys {
            status = runtime.get_integer(&keys.abort_http_status, status);
        }

        match u32::try_from(status) {
            Ok(status) if (200..600).contains(&status) => status,
            _ => {
                warn!(
                    status,
                    configured = policy.abort_status(),
                    "ignoring invalid abort status override"
                );
                policy.abort_status()
            }
        }
    }

    fn max_active_faults(&self, policy: &FaultPolicy) -> Option<u64> {
        let runtime = self.config.runtime();
        match policy.max_active_faults() {
            Some(max) => Some(runtime.get_integer(MAX_ACTIVE_FAULTS_KEY, max)),
            None => match runtime.lookup(MAX_ACTIVE_FAULTS_KEY) {
                Some(RuntimeValue::Integer(max)) => Some(max),
                _ => None,
            },
        }
    }
}

impl Drop for FaultFilter {
    fn drop(&mut self) {
        self.on_destroy();
    }
}

impl fmt::Debug for FaultFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultFilter")
            .field("phase", &self.phase)
            .field("fault_active", &self.active_fault.is_some())
            .field("selected_abort", &self.selected_abort)
            .field("selected_delay", &self.selected_delay)
            .field("delay_deadline", &self.delay_deadline)
            .field("downstream_cluster", &self.downstream_cluster)
            .field("response_rate_limited", &self.response_limiter.is_some())
            .finish()
    }
}
