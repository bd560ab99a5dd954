//! Backpressure, result reconciliation and derived statistics.

mod reconcile;
mod stats;
mod store;
mod throttle;

pub use reconcile::{apply_privacy, AcceptedEvent, AnalysisReconciler};
pub use stats::{age_bucket, summarize, LatencySummary, PerformanceAggregator};
pub use store::StateStore;
pub use throttle::{FrameThrottler, InFlightEntry, SendDecision};
