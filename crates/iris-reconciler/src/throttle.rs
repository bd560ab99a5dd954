use std::{collections::BTreeMap, time::Instant};

use iris_types::{
    config::ThrottleConfig,
    frame::{Frame, FrameId},
    state::ConnectionState,
};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlightEntry {
    pub captured_at: Instant,
    pub sent_at: Instant,
    pub deadline: Instant,
    /// Wall-clock timestamp the frame carried on the wire.
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendDecision {
    Send,
    NotConnected,
    AtCapacity,
    TooSoon,
    /// Not captured after the last frame that went out.
    Superseded,
}

/// Gatekeeper between capture and transport.
///
/// At most `max_in_flight` frames await a result at any time; everything
/// sampled beyond that is dropped rather than queued.
#[derive(Debug)]
pub struct FrameThrottler {
    config: ThrottleConfig,
    in_flight: BTreeMap<FrameId, InFlightEntry>,
    last_sent_at: Option<Instant>,
    last_sent: Option<(Instant, FrameId)>,
}

impl FrameThrottler {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            in_flight: BTreeMap::new(),
            last_sent_at: None,
            last_sent: None,
        }
    }

    pub fn decide(&self, frame: &Frame, connection: ConnectionState, now: Instant) -> SendDecision {
        if !connection.is_connected() {
            return SendDecision::NotConnected;
        }
        if self.in_flight.len() >= self.config.max_in_flight {
            return SendDecision::AtCapacity;
        }
        if let Some(last) = self.last_sent_at {
            if now.saturating_duration_since(last) < self.config.min_send_interval() {
                return SendDecision::TooSoon;
            }
        }
        if let Some(last) = self.last_sent {
            if (frame.captured_at, frame.id) <= last {
                return SendDecision::Superseded;
            }
        }
        SendDecision::Send
    }

    pub fn should_send(&self, frame: &Frame, connection: ConnectionState, now: Instant) -> bool {
        self.decide(frame, connection, now) == SendDecision::Send
    }

    /// Tracks a transmitted frame. Refuses (returns false) when already full.
    pub fn on_sent(&mut self, frame: &Frame, now: Instant) -> bool {
        if self.in_flight.len() >= self.config.max_in_flight {
            warn!("Refusing to track frame {}: in-flight set is full", frame.id);
            return false;
        }
        self.in_flight.insert(
            frame.id,
            InFlightEntry {
                captured_at: frame.captured_at,
                sent_at: now,
                deadline: now + self.config.timeout(),
                timestamp_ms: frame.timestamp_ms(),
            },
        );
        self.last_sent_at = Some(now);
        self.last_sent = Some((frame.captured_at, frame.id));
        true
    }

    /// Frees the slot held by `id`, returning its entry if it was still tracked.
    pub fn on_result_or_timeout(&mut self, id: FrameId) -> Option<InFlightEntry> {
        self.in_flight.remove(&id)
    }

    pub fn lookup(&self, id: FrameId) -> Option<&InFlightEntry> {
        self.in_flight.get(&id)
    }

    /// Finds the in-flight frame that carried `timestamp_ms` on the wire.
    pub fn resolve_timestamp(&self, timestamp_ms: i64) -> Option<FrameId> {
        self.in_flight
            .iter()
            .find(|(_, entry)| entry.timestamp_ms == timestamp_ms)
            .map(|(id, _)| *id)
    }

    pub fn evict_expired(&mut self, now: Instant) -> Vec<FrameId> {
        let expired: Vec<FrameId> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.in_flight.remove(id);
            debug!("Frame {} timed out", id);
        }
        expired
    }

    /// Treats every outstanding frame as lost.
    pub fn evict_all(&mut self) -> Vec<FrameId> {
        let ids: Vec<FrameId> = self.in_flight.keys().copied().collect();
        self.in_flight.clear();
        ids
    }

    pub fn clear(&mut self) {
        self.in_flight.clear();
        self.last_sent_at = None;
        self.last_sent = None;
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.in_flight.values().map(|entry| entry.deadline).min()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.config.max_in_flight
    }
}
