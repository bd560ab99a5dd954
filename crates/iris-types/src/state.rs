use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    analysis::{FaceAnalysis, FaceDetection},
    frame::FrameId,
    telemetry::PipelineCounters,
};

/// Transport connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn can_transition_to(self, target: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, target),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Connected, Connecting)
        )
    }

    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

/// Counts of observed attribute values over accepted analyses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Distribution {
    pub emotions: BTreeMap<String, u64>,
    pub genders: BTreeMap<String, u64>,
    pub age_buckets: BTreeMap<String, u64>,
}

/// Rolling statistics derived from accepted events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PerformanceMetrics {
    pub fps: f64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub last_latency_ms: f64,
    pub avg_processing_ms: f64,
    pub samples: usize,
    pub counters: PipelineCounters,
    pub distribution: Distribution,
}

/// Metrics pushed by the inference service in reply to `get_metrics`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ServerMetrics {
    pub total_requests: Option<u64>,
    pub active_connections: Option<u64>,
    pub avg_processing_time: Option<f64>,
    pub fps: Option<f64>,
}

/// Everything a renderer needs, replaced as a whole on every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UiSnapshot {
    pub faces: Vec<FaceDetection>,
    pub analysis: Vec<FaceAnalysis>,
    pub displayed_frame: Option<FrameId>,
    pub is_processing: bool,
    pub connection: ConnectionState,
    pub services_ready: Option<bool>,
    pub performance: PerformanceMetrics,
    pub server_metrics: Option<ServerMetrics>,
    pub last_error: Option<String>,
}
