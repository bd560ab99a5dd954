use serde::{Deserialize, Serialize};

use crate::frame::FrameId;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencySample {
    pub frame_id: FrameId,
    /// `received_at - captured_at` of the originating frame.
    pub round_trip_ms: f64,
    /// Inference time reported by the service, if any.
    pub processing_ms: Option<f64>,
}

/// Monotonic pipeline counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PipelineCounters {
    pub captured: u64,
    pub capture_failures: u64,
    pub sent: u64,
    pub throttled: u64,
    pub timed_out: u64,
    pub stale: u64,
    pub accepted: u64,
}
