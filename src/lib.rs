pub mod config;
pub mod errors;
pub mod fault;
pub mod limiter;
pub mod metrics;
pub mod runtime;
pub mod timer;

// Re-export commonly used types
pub use config::AppConfig;
pub use errors::{FaultError, Result};
pub use fault::{AfterDelay, FaultAction, FaultFilter, FaultFilterConfig, FaultPolicy, RequestInfo};
pub use runtime::{Runtime, SnapshotRuntime};
pub use timer::{TimerEvent, TimerService, TokioTimers};
