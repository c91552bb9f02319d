use bytes::Bytes;
use faultline::config::loader::load_config;
use faultline::config::watcher::watch_runtime_file;
use faultline::fault::policy::DOWNSTREAM_SERVICE_CLUSTER;
use faultline::limiter::StreamCallbacks;
use faultline::{
    AfterDelay, FaultAction, FaultFilter, FaultFilterConfig, RequestInfo, SnapshotRuntime,
    TokioTimers,
};
use http::{HeaderMap, HeaderValue};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DRILL_BODY_BYTES: usize = 4096;

/// Sink for a paced response body; records how much got through.
struct DrillSink {
    written: Arc<AtomicUsize>,
    finished: Arc<AtomicBool>,
}

impl StreamCallbacks for DrillSink {
    fn pause_data(&mut self) {
        info!("drill: upstream paused");
    }

    fn resume_data(&mut self) {
        info!("drill: upstream resumed");
    }

    fn write_data(&mut self, data: Bytes, end_stream: bool) {
        self.written.fetch_add(data.len(), Ordering::Relaxed);
        if end_stream {
            self.finished.store(true, Ordering::Relaxed);
        }
    }
}

async fn drive_request(id: usize, config: Arc<FaultFilterConfig>, cluster: Option<String>) {
    let (timers, mut events) = TokioTimers::new();
    let mut filter = FaultFilter::new(config, Arc::new(timers));

    let mut headers = HeaderMap::new();
    if let Some(value) = cluster.and_then(|c| HeaderValue::from_str(&c).ok()) {
        headers.insert(DOWNSTREAM_SERVICE_CLUSTER, value);
    }

    let start = Instant::now();
    let outcome = match filter.on_request_headers(&RequestInfo::new(&headers)) {
        FaultAction::None => "forwarded".to_string(),
        FaultAction::Abort(status) => format!("aborted with {}", status),
        FaultAction::Delay { .. } => loop {
            let Some(event) = events.recv().await else {
                break "timer channel closed".to_string();
            };
            match filter.on_timer(event) {
                Some(AfterDelay::Continue) => break "delayed then forwarded".to_string(),
                Some(AfterDelay::Abort(status)) => {
                    break format!("delayed then aborted with {}", status)
                }
                None => continue,
            }
        },
    };
    info!(
        request = id,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "drill: {}",
        outcome
    );

    if let Some((status, body)) = filter.local_reply() {
        info!(request = id, status, body, "drill: local reply sent");
        return;
    }

    let written = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicBool::new(false));
    let sink = DrillSink {
        written: Arc::clone(&written),
        finished: Arc::clone(&finished),
    };
    if !filter.on_response_headers(Box::new(sink)) {
        return;
    }

    let start = Instant::now();
    let mut body = Bytes::from(vec![0u8; DRILL_BODY_BYTES]);
    filter.on_response_data(&mut body, true);
    while !finished.load(Ordering::Relaxed) {
        match events.recv().await {
            Some(event) => {
                filter.on_timer(event);
            }
            None => break,
        }
    }
    info!(
        request = id,
        bytes = written.load(Ordering::Relaxed),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "drill: response rate limited"
    );
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "faultline=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Fault injection drill starting...");

    let app_config = load_config().await?;

    let runtime = Arc::new(SnapshotRuntime::new());
    if let Some(path) = app_config.runtime_overrides.clone() {
        if let Err(e) = runtime.reload_from_file(&path).await {
            warn!("Starting without runtime overrides: {}", e);
        }
        let watched = Arc::clone(&runtime);
        tokio::spawn(async move {
            if let Err(e) = watch_runtime_file(path, watched).await {
                tracing::error!("Runtime override watcher failed: {}", e);
            }
        });
    }

    let config = Arc::new(FaultFilterConfig::new(&app_config.filter, runtime)?);

    let requests: usize = std::env::var("FAULT_DRILL_REQUESTS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(20);
    let cluster = std::env::var("FAULT_DRILL_CLUSTER").ok();

    let tasks: Vec<_> = (0..requests)
        .map(|id| tokio::spawn(drive_request(id, Arc::clone(&config), cluster.clone())))
        .collect();
    for task in tasks {
        task.await?;
    }

    let stats = config.stats();
    tracing::info!(
        delays = stats.delays_injected.get(),
        aborts = stats.aborts_injected.get(),
        response_rate_limited = stats.response_rl_injected.get(),
        overflow = stats.faults_overflow.get(),
        active = stats.active_faults.get(),
        "Fault injection drill finished"
    );

    Ok(())
}
