use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use iris_types::{
    analysis::FaceAnalysis,
    config::StatsConfig,
    state::{Distribution, PerformanceMetrics, UiSnapshot},
    telemetry::{LatencySample, PipelineCounters},
};

use crate::{reconcile::AcceptedEvent, store::StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LatencySummary {
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub last_ms: f64,
    pub avg_processing_ms: f64,
    pub samples: usize,
}

/// Reduces a window of samples; an empty window yields all zeros.
pub fn summarize<'a>(samples: impl IntoIterator<Item = &'a LatencySample>) -> LatencySummary {
    let mut summary = LatencySummary {
        min_ms: f64::INFINITY,
        ..Default::default()
    };
    let mut total = 0.0;
    let mut processing_total = 0.0;
    let mut processing_count = 0usize;

    for sample in samples {
        summary.samples += 1;
        total += sample.round_trip_ms;
        summary.min_ms = summary.min_ms.min(sample.round_trip_ms);
        summary.max_ms = summary.max_ms.max(sample.round_trip_ms);
        summary.last_ms = sample.round_trip_ms;
        if let Some(processing) = sample.processing_ms {
            processing_total += processing;
            processing_count += 1;
        }
    }

    if summary.samples == 0 {
        return LatencySummary::default();
    }
    summary.avg_ms = total / summary.samples as f64;
    if processing_count > 0 {
        summary.avg_processing_ms = processing_total / processing_count as f64;
    }
    summary
}

pub fn age_bucket(age: f32) -> &'static str {
    match age {
        a if a < 13.0 => "0-12",
        a if a < 20.0 => "13-19",
        a if a < 30.0 => "20-29",
        a if a < 40.0 => "30-39",
        a if a < 50.0 => "40-49",
        a if a < 60.0 => "50-59",
        _ => "60+",
    }
}

/// Read-only observer of accepted events.
#[derive(Debug)]
pub struct PerformanceAggregator {
    window_size: usize,
    fps_window: Duration,
    accepted_at: VecDeque<Instant>,
    samples: VecDeque<LatencySample>,
    counters: PipelineCounters,
    distribution: Distribution,
}

impl PerformanceAggregator {
    pub fn new(config: &StatsConfig) -> Self {
        Self {
            window_size: config.window_size.max(1),
            fps_window: Duration::from_millis(config.fps_window_ms.max(1)),
            accepted_at: VecDeque::new(),
            samples: VecDeque::with_capacity(config.window_size.max(1)),
            counters: PipelineCounters::default(),
            distribution: Distribution::default(),
        }
    }

    pub fn record_accepted(&mut self, event: &AcceptedEvent) {
        self.counters.accepted += 1;
        self.accepted_at.push_back(event.received_at);

        if self.samples.len() == self.window_size {
            self.samples.pop_front();
        }
        self.samples.push_back(LatencySample {
            frame_id: event.frame_id,
            round_trip_ms: event.latency_ms(),
            processing_ms: event.processing_time_ms,
        });
    }

    pub fn record_analysis(&mut self, analysis: &[FaceAnalysis]) {
        for face in analysis {
            if let Some(emotion) = face.top_emotion() {
                *self
                    .distribution
                    .emotions
                    .entry(emotion.to_string())
                    .or_default() += 1;
            }
            if let Some(gender) = &face.gender {
                *self.distribution.genders.entry(gender.clone()).or_default() += 1;
            }
            if let Some(age) = face.age {
                *self
                    .distribution
                    .age_buckets
                    .entry(age_bucket(age).to_string())
                    .or_default() += 1;
            }
        }
    }

    pub fn counters(&self) -> PipelineCounters {
        self.counters
    }

    pub fn counters_mut(&mut self) -> &mut PipelineCounters {
        &mut self.counters
    }

    /// Accepted events per second over the trailing window ending at `now`.
    pub fn fps(&mut self, now: Instant) -> f64 {
        while let Some(front) = self.accepted_at.front() {
            if now.saturating_duration_since(*front) >= self.fps_window {
                self.accepted_at.pop_front();
            } else {
                break;
            }
        }
        self.accepted_at.len() as f64 / self.fps_window.as_secs_f64()
    }

    pub fn metrics(&mut self, now: Instant) -> PerformanceMetrics {
        let fps = self.fps(now);
        let summary = summarize(&self.samples);
        PerformanceMetrics {
            fps,
            avg_latency_ms: summary.avg_ms,
            min_latency_ms: summary.min_ms,
            max_latency_ms: summary.max_ms,
            last_latency_ms: summary.last_ms,
            avg_processing_ms: summary.avg_processing_ms,
            samples: summary.samples,
            counters: self.counters,
            distribution: self.distribution.clone(),
        }
    }

    /// Writes current metrics into the snapshot, leaving every other field alone.
    pub fn publish(&mut self, store: &StateStore, now: Instant) {
        let performance = self.metrics(now);
        store.update(|snapshot| UiSnapshot {
            performance,
            ..snapshot.clone()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iris_types::frame::FrameId;

    fn accepted(origin: Instant, id: u64, received_ms: u64, latency_ms: u64) -> AcceptedEvent {
        let received_at = origin + Duration::from_millis(received_ms);
        AcceptedEvent {
            frame_id: FrameId(id),
            captured_at: received_at - Duration::from_millis(latency_ms),
            received_at,
            face_count: 1,
            processing_time_ms: Some(20.0),
        }
    }

    fn origin() -> Instant {
        Instant::now() + Duration::from_secs(1)
    }

    fn aggregator(window_size: usize) -> PerformanceAggregator {
        PerformanceAggregator::new(&StatsConfig {
            window_size,
            fps_window_ms: 1_000,
        })
    }

    #[test]
    fn summarize_empty_window_is_zero() {
        assert_eq!(summarize(&[] as &[LatencySample]), LatencySummary::default());
    }

    #[test]
    fn summarize_tracks_extremes_and_processing() {
        let samples = [
            LatencySample {
                frame_id: FrameId(1),
                round_trip_ms: 100.0,
                processing_ms: Some(30.0),
            },
            LatencySample {
                frame_id: FrameId(2),
                round_trip_ms: 200.0,
                processing_ms: None,
            },
            LatencySample {
                frame_id: FrameId(3),
                round_trip_ms: 150.0,
                processing_ms: Some(50.0),
            },
        ];
        let summary = summarize(&samples);
        assert_eq!(summary.samples, 3);
        assert_eq!(summary.avg_ms, 150.0);
        assert_eq!(summary.min_ms, 100.0);
        assert_eq!(summary.max_ms, 200.0);
        assert_eq!(summary.last_ms, 150.0);
        assert_eq!(summary.avg_processing_ms, 40.0);
    }

    #[test]
    fn fps_counts_the_trailing_second() {
        let origin = origin();
        let mut stats = aggregator(30);
        for i in 0..5u64 {
            stats.record_accepted(&accepted(origin, i, i * 150, 150));
        }
        // Events at 0..600ms; at 1000ms the first one has aged out.
        assert_eq!(stats.fps(origin + Duration::from_millis(1_000)), 4.0);
        assert_eq!(stats.fps(origin + Duration::from_millis(5_000)), 0.0);
        assert_eq!(stats.counters().accepted, 5);
    }

    #[test]
    fn moving_average_uses_last_n_samples() {
        let origin = origin();
        let mut stats = aggregator(2);
        stats.record_accepted(&accepted(origin, 1, 100, 400));
        stats.record_accepted(&accepted(origin, 2, 200, 100));
        stats.record_accepted(&accepted(origin, 3, 300, 200));
        let metrics = stats.metrics(origin + Duration::from_millis(300));
        assert_eq!(metrics.samples, 2);
        assert_eq!(metrics.avg_latency_ms, 150.0);
        assert_eq!(metrics.max_latency_ms, 200.0);
        assert_eq!(metrics.last_latency_ms, 200.0);
        assert_eq!(metrics.avg_processing_ms, 20.0);
    }

    #[test]
    fn buckets_ages() {
        assert_eq!(age_bucket(4.0), "0-12");
        assert_eq!(age_bucket(12.9), "0-12");
        assert_eq!(age_bucket(13.0), "13-19");
        assert_eq!(age_bucket(29.5), "20-29");
        assert_eq!(age_bucket(45.0), "40-49");
        assert_eq!(age_bucket(59.0), "50-59");
        assert_eq!(age_bucket(87.0), "60+");
    }

    #[test]
    fn distribution_counts_present_attributes() {
        let mut stats = aggregator(30);
        let mut scored = FaceAnalysis {
            face_id: "face_1".into(),
            age: Some(17.0),
            ..Default::default()
        };
        scored.emotion_scores.insert("angry".into(), 0.2);
        scored.emotion_scores.insert("happy".into(), 0.7);
        stats.record_analysis(&[
            FaceAnalysis {
                face_id: "face_0".into(),
                age: Some(34.0),
                gender: Some("Woman".into()),
                dominant_emotion: Some("happy".into()),
                ..Default::default()
            },
            scored,
        ]);

        let metrics = stats.metrics(Instant::now());
        let dist = metrics.distribution;
        assert_eq!(dist.emotions.get("happy"), Some(&2));
        assert_eq!(dist.genders.get("Woman"), Some(&1));
        assert_eq!(dist.age_buckets.get("30-39"), Some(&1));
        assert_eq!(dist.age_buckets.get("13-19"), Some(&1));
    }

    #[test]
    fn publish_only_touches_performance() {
        let origin = origin();
        let store = StateStore::new();
        store.update(|s| UiSnapshot {
            is_processing: true,
            last_error: Some("boom".into()),
            ..s.clone()
        });
        let mut stats = aggregator(30);
        stats.counters_mut().sent += 3;
        stats.record_accepted(&accepted(origin, 1, 100, 150));
        stats.publish(&store, origin + Duration::from_millis(100));

        let snapshot = store.snapshot();
        assert!(snapshot.is_processing);
        assert_eq!(snapshot.last_error.as_deref(), Some("boom"));
        assert_eq!(snapshot.performance.counters.sent, 3);
        assert_eq!(snapshot.performance.counters.accepted, 1);
        assert_eq!(snapshot.performance.fps, 1.0);
    }
}
