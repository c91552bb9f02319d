pub mod filter;
pub mod filter_config;
pub mod matcher;
pub mod percent;
pub mod policy;
pub mod tracker;

use std::time::Duration;

pub use filter::FaultFilter;
pub use filter_config::FaultFilterConfig;
pub use percent::{DenominatorType, FractionalPercent};
pub use policy::{FaultPolicy, RequestInfo, ResponseRateLimit};
pub use tracker::{ActiveFault, ActiveFaultTracker};

/// Body of the local reply sent for an injected abort.
pub const ABORT_BODY: &str = "fault filter abort";

/// Decision taken for a request at header time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// Forward the request untouched.
    None,
    /// Answer immediately with this status instead of forwarding.
    Abort(u32),
    /// Hold the request for `duration`, then do `then`.
    Delay { duration: Duration, then: AfterDelay },
}

/// What happens once a delay has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterDelay {
    Abort(u32),
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPhase {
    Init,
    DelayPending,
    DelayElapsed,
    Aborted,
    Continuing,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDataStatus {
    Continue,
    /// Hold the data and apply backpressure until the delay completes.
    StopIterationAndWatermark,
    /// The data was taken over by the filter.
    StopIterationNoBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterTrailersStatus {
    Continue,
    StopIteration,
}
