use std::{collections::BTreeMap, time::Instant};

use serde::{Deserialize, Serialize};

use crate::frame::FrameId;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceDetection {
    pub local_id: String,
    pub bounding_box: BoundingBox,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FaceAnalysis {
    pub face_id: String,
    pub age: Option<f32>,
    pub age_confidence: Option<f32>,
    pub gender: Option<String>,
    pub gender_confidence: Option<f32>,
    pub dominant_emotion: Option<String>,
    pub emotion_confidence: Option<f32>,
    pub emotion_scores: BTreeMap<String, f32>,
    pub confidence: f32,
}

impl FaceAnalysis {
    /// Dominant emotion as reported, or the highest scoring one.
    pub fn top_emotion(&self) -> Option<&str> {
        if let Some(emotion) = self.dominant_emotion.as_deref() {
            return Some(emotion);
        }
        self.emotion_scores
            .iter()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(name, _)| name.as_str())
    }
}

/// Detection result for one frame, resolved to a local frame id.
#[derive(Debug, Clone)]
pub struct AnalysisEvent {
    pub frame_id: FrameId,
    pub faces: Vec<FaceDetection>,
    pub received_at: Instant,
    pub processing_time_ms: Option<f64>,
}

/// Per-face analysis that trails the detection of the same frame.
#[derive(Debug, Clone)]
pub struct AnalysisResults {
    pub frame_id: FrameId,
    pub results: Vec<FaceAnalysis>,
    pub received_at: Instant,
    pub processing_time_ms: Option<f64>,
}
