use std::{fmt, time::Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Monotonic identity of a captured frame. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameId(pub u64);

impl FrameId {
    pub fn next(self) -> Self {
        FrameId(self.0 + 1)
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Raw pixels sampled from a video source before encoding.
#[derive(Debug, Clone)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGBA8 buffer.
    pub data: Vec<u8>,
}

impl RawImage {
    pub fn from_rgba(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            data,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// One encoded sample ready for transmission.
#[derive(Debug, Clone)]
pub struct Frame {
    pub id: FrameId,
    /// JPEG bytes.
    pub payload: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: Instant,
    pub wall_clock: DateTime<Utc>,
    pub target_quality: u8,
}

impl Frame {
    /// Wall-clock capture time in milliseconds, as sent on the wire.
    pub fn timestamp_ms(&self) -> i64 {
        self.wall_clock.timestamp_millis()
    }
}
