use std::time::Instant;

use iris_types::{
    analysis::{AnalysisEvent, AnalysisResults, FaceAnalysis},
    config::PrivacyConfig,
    frame::FrameId,
    protocol::Correlation,
    state::UiSnapshot,
    IrisError, Result,
};
use tracing::debug;

use crate::{store::StateStore, throttle::FrameThrottler};

/// A detection result that made it into the displayed state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcceptedEvent {
    pub frame_id: FrameId,
    pub captured_at: Instant,
    pub received_at: Instant,
    pub face_count: usize,
    pub processing_time_ms: Option<f64>,
}

impl AcceptedEvent {
    pub fn latency_ms(&self) -> f64 {
        self.received_at
            .saturating_duration_since(self.captured_at)
            .as_micros() as f64
            / 1000.0
    }
}

#[derive(Debug, Clone, Copy)]
struct Displayed {
    frame_id: FrameId,
    captured_at: Instant,
    timestamp_ms: i64,
}

/// Merges asynchronous service results into the UI snapshot.
///
/// The displayed frame only ever moves forward in capture order: a result for
/// a frame captured before the one on screen is discarded, as is any result
/// for a frame the throttler no longer tracks.
#[derive(Debug)]
pub struct AnalysisReconciler {
    privacy: PrivacyConfig,
    displayed: Option<Displayed>,
}

impl AnalysisReconciler {
    pub fn new(privacy: PrivacyConfig) -> Self {
        Self {
            privacy,
            displayed: None,
        }
    }

    pub fn displayed_frame(&self) -> Option<FrameId> {
        self.displayed.map(|d| d.frame_id)
    }

    /// Maps wire correlation data to a local frame id.
    pub fn resolve_frame(
        &self,
        correlation: Correlation,
        throttler: &FrameThrottler,
    ) -> Option<FrameId> {
        if let Some(frame_id) = correlation.frame_id {
            return Some(frame_id);
        }
        let timestamp_ms = correlation.timestamp_ms?;
        throttler.resolve_timestamp(timestamp_ms).or_else(|| {
            self.displayed
                .filter(|d| d.timestamp_ms == timestamp_ms)
                .map(|d| d.frame_id)
        })
    }

    pub fn on_event(
        &mut self,
        event: AnalysisEvent,
        throttler: &mut FrameThrottler,
        store: &StateStore,
    ) -> Result<AcceptedEvent> {
        let Some(entry) = throttler.on_result_or_timeout(event.frame_id) else {
            debug!("Discarding result for untracked frame {}", event.frame_id);
            return Err(IrisError::StaleResult(event.frame_id));
        };

        if let Some(current) = self.displayed {
            if (entry.captured_at, event.frame_id) < (current.captured_at, current.frame_id) {
                debug!(
                    "Discarding out-of-order result for frame {} (showing {})",
                    event.frame_id, current.frame_id
                );
                store.update(|snapshot| UiSnapshot {
                    is_processing: throttler.in_flight() > 0,
                    ..snapshot.clone()
                });
                return Err(IrisError::StaleResult(event.frame_id));
            }
        }

        let faces = event.faces;
        let face_count = faces.len();
        let is_processing = throttler.in_flight() > 0;
        // Face ids are positional per frame; analysis only ever describes the displayed one.
        store.update(|snapshot| UiSnapshot {
            faces: faces.clone(),
            analysis: Vec::new(),
            displayed_frame: Some(event.frame_id),
            is_processing,
            ..snapshot.clone()
        });

        self.displayed = Some(Displayed {
            frame_id: event.frame_id,
            captured_at: entry.captured_at,
            timestamp_ms: entry.timestamp_ms,
        });

        Ok(AcceptedEvent {
            frame_id: event.frame_id,
            captured_at: entry.captured_at,
            received_at: event.received_at,
            face_count,
            processing_time_ms: event.processing_time_ms,
        })
    }

    /// Attaches per-face analysis to the displayed frame. Returns what was applied.
    pub fn on_analysis(
        &mut self,
        results: AnalysisResults,
        store: &StateStore,
    ) -> Result<Vec<FaceAnalysis>> {
        if self.displayed_frame() != Some(results.frame_id) {
            debug!(
                "Discarding analysis for frame {} (showing {:?})",
                results.frame_id,
                self.displayed_frame()
            );
            return Err(IrisError::StaleResult(results.frame_id));
        }

        let privacy = self.privacy;
        let analysis: Vec<FaceAnalysis> = results
            .results
            .into_iter()
            .map(|a| apply_privacy(a, privacy))
            .collect();
        store.update(|snapshot| UiSnapshot {
            analysis: analysis.clone(),
            ..snapshot.clone()
        });
        Ok(analysis)
    }

    /// Records a service-side error without touching results.
    pub fn on_service_error(&self, message: String, store: &StateStore) {
        store.update(|snapshot| UiSnapshot {
            last_error: Some(message),
            ..snapshot.clone()
        });
    }
}

/// Strips the attributes the operator has opted out of.
pub fn apply_privacy(mut analysis: FaceAnalysis, privacy: PrivacyConfig) -> FaceAnalysis {
    if !privacy.enable_age {
        analysis.age = None;
        analysis.age_confidence = None;
    }
    if !privacy.enable_gender {
        analysis.gender = None;
        analysis.gender_confidence = None;
    }
    if !privacy.enable_emotion {
        analysis.dominant_emotion = None;
        analysis.emotion_confidence = None;
        analysis.emotion_scores.clear();
    }
    analysis
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::frame;
    use iris_types::{
        analysis::{BoundingBox, FaceDetection},
        config::ThrottleConfig,
        state::ConnectionState,
    };
    use std::time::Duration;

    struct Harness {
        origin: Instant,
        throttler: FrameThrottler,
        reconciler: AnalysisReconciler,
        store: StateStore,
    }

    impl Harness {
        fn new(max_in_flight: usize) -> Self {
            Self {
                origin: Instant::now(),
                throttler: FrameThrottler::new(ThrottleConfig {
                    max_in_flight,
                    timeout_ms: 500,
                    min_send_interval_ms: 0,
                }),
                reconciler: AnalysisReconciler::new(PrivacyConfig::default()),
                store: StateStore::new(),
            }
        }

        fn send(&mut self, id: u64) {
            let f = frame(self.origin, id);
            assert!(self
                .throttler
                .should_send(&f, ConnectionState::Connected, f.captured_at));
            assert!(self.throttler.on_sent(&f, f.captured_at));
        }

        fn event(&self, id: u64, faces: &[&str]) -> AnalysisEvent {
            AnalysisEvent {
                frame_id: FrameId(id),
                faces: faces
                    .iter()
                    .map(|name| FaceDetection {
                        local_id: name.to_string(),
                        bounding_box: BoundingBox::new(1.0, 2.0, 3.0, 4.0),
                        confidence: 0.9,
                    })
                    .collect(),
                received_at: self.origin + Duration::from_millis(id * 100 + 150),
                processing_time_ms: Some(40.0),
            }
        }

        fn deliver(&mut self, id: u64, faces: &[&str]) -> Result<AcceptedEvent> {
            let event = self.event(id, faces);
            self.reconciler
                .on_event(event, &mut self.throttler, &self.store)
        }

        fn analysis(&self, id: u64, face: &str) -> AnalysisResults {
            AnalysisResults {
                frame_id: FrameId(id),
                results: vec![FaceAnalysis {
                    face_id: face.into(),
                    age: Some(30.0),
                    gender: Some("Female".into()),
                    dominant_emotion: Some("happy".into()),
                    confidence: 0.8,
                    ..Default::default()
                }],
                received_at: self.origin,
                processing_time_ms: None,
            }
        }
    }

    #[test]
    fn accepted_event_replaces_faces_and_frees_slot() {
        let mut h = Harness::new(1);
        h.send(1);
        let accepted = h.deliver(1, &["face_0", "face_1"]).unwrap();
        assert_eq!(accepted.face_count, 2);
        assert_eq!(accepted.latency_ms(), 150.0);
        assert_eq!(h.throttler.in_flight(), 0);

        let snapshot = h.store.snapshot();
        assert_eq!(snapshot.faces.len(), 2);
        assert_eq!(snapshot.displayed_frame, Some(FrameId(1)));
        assert!(!snapshot.is_processing);
    }

    #[test]
    fn untracked_frame_is_stale() {
        let mut h = Harness::new(1);
        let err = h.deliver(3, &["face_0"]).unwrap_err();
        assert!(matches!(err, IrisError::StaleResult(FrameId(3))));
        assert_eq!(h.store.snapshot(), UiSnapshot::default());
    }

    #[test]
    fn out_of_order_results_never_regress_display() {
        let mut h = Harness::new(2);
        h.send(4);
        h.send(5);
        h.deliver(5, &["late"]).unwrap();

        let err = h.deliver(4, &["early"]).unwrap_err();
        assert!(matches!(err, IrisError::StaleResult(FrameId(4))));
        assert_eq!(h.throttler.in_flight(), 0);

        let snapshot = h.store.snapshot();
        assert_eq!(snapshot.displayed_frame, Some(FrameId(5)));
        assert_eq!(snapshot.faces[0].local_id, "late");
    }

    #[test]
    fn displayed_capture_time_is_monotonic_under_shuffled_delivery() {
        let mut h = Harness::new(3);
        let mut displayed = Vec::new();
        for batch in [[1u64, 2, 3], [4, 5, 6], [7, 8, 9]] {
            for id in batch {
                h.send(id);
            }
            for id in [batch[1], batch[2], batch[0]] {
                let _ = h.deliver(id, &["face_0"]);
                if let Some(frame) = h.store.snapshot().displayed_frame {
                    displayed.push(frame);
                }
            }
        }
        for pair in displayed.windows(2) {
            assert!(pair[0] <= pair[1], "display regressed: {:?}", displayed);
        }
        assert_eq!(displayed.last(), Some(&FrameId(9)));
    }

    #[test]
    fn zero_faces_clears_but_timeout_does_not() {
        let mut h = Harness::new(1);
        h.send(6);
        h.deliver(6, &["face_0"]).unwrap();
        h.reconciler
            .on_analysis(h.analysis(6, "face_0"), &h.store)
            .unwrap();

        // Frame 7 gets lost: state stays exactly as it was.
        h.send(7);
        let before = h.store.snapshot();
        let evicted = h
            .throttler
            .evict_expired(h.origin + Duration::from_secs(10));
        assert_eq!(evicted, vec![FrameId(7)]);
        assert_eq!(h.store.snapshot(), before);
        assert!(h.deliver(7, &[]).is_err());
        assert_eq!(h.store.snapshot(), before);

        // Frame 8 comes back empty: that is a real "no face" result.
        h.send(8);
        let accepted = h.deliver(8, &[]).unwrap();
        assert_eq!(accepted.face_count, 0);
        let snapshot = h.store.snapshot();
        assert!(snapshot.faces.is_empty());
        assert!(snapshot.analysis.is_empty());
        assert_eq!(snapshot.displayed_frame, Some(FrameId(8)));
    }

    #[test]
    fn analysis_only_lands_on_displayed_frame() {
        let mut h = Harness::new(1);
        h.send(1);
        h.deliver(1, &["face_0"]).unwrap();
        assert!(h
            .reconciler
            .on_analysis(h.analysis(2, "face_0"), &h.store)
            .is_err());
        let applied = h
            .reconciler
            .on_analysis(h.analysis(1, "face_0"), &h.store)
            .unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(h.store.snapshot().analysis[0].age, Some(30.0));

        // The next detection starts without analysis, even for a reused face id.
        h.send(2);
        h.deliver(2, &["face_0", "face_9"]).unwrap();
        assert!(h.store.snapshot().analysis.is_empty());
    }

    #[test]
    fn earlier_analysis_never_carries_over_to_a_new_frame() {
        let mut h = Harness::new(1);
        h.send(1);
        h.deliver(1, &["face_0"]).unwrap();
        let mut earlier = h.analysis(1, "face_0");
        earlier.results[0].age = Some(71.0);
        earlier.results[0].gender = Some("Male".into());
        h.reconciler.on_analysis(earlier, &h.store).unwrap();

        // Frame 2 shows the same positional id but its analysis never arrives.
        h.send(2);
        h.deliver(2, &["face_0"]).unwrap();
        let snapshot = h.store.snapshot();
        assert_eq!(snapshot.displayed_frame, Some(FrameId(2)));
        assert_eq!(snapshot.faces[0].local_id, "face_0");
        assert!(snapshot.analysis.is_empty());

        // A late analysis for frame 1 cannot bring the old labels back.
        assert!(h
            .reconciler
            .on_analysis(h.analysis(1, "face_0"), &h.store)
            .is_err());
        assert!(h.store.snapshot().analysis.is_empty());
    }

    #[test]
    fn resolves_by_frame_id_then_timestamp() {
        let mut h = Harness::new(1);
        h.send(2);
        let ts = frame(h.origin, 2).timestamp_ms();
        let by_ts = Correlation {
            frame_id: None,
            timestamp_ms: Some(ts),
        };
        assert_eq!(h.reconciler.resolve_frame(by_ts, &h.throttler), Some(FrameId(2)));

        h.deliver(2, &["face_0"]).unwrap();
        // After acceptance the trailing analysis still resolves via the display.
        assert_eq!(h.reconciler.resolve_frame(by_ts, &h.throttler), Some(FrameId(2)));

        let by_id = Correlation {
            frame_id: Some(FrameId(11)),
            timestamp_ms: Some(ts),
        };
        assert_eq!(h.reconciler.resolve_frame(by_id, &h.throttler), Some(FrameId(11)));
        let unknown = Correlation {
            frame_id: None,
            timestamp_ms: Some(1),
        };
        assert_eq!(h.reconciler.resolve_frame(unknown, &h.throttler), None);
    }

    #[test]
    fn privacy_filters_strip_opted_out_fields() {
        let mut analysis = FaceAnalysis {
            face_id: "face_0".into(),
            age: Some(40.0),
            age_confidence: Some(0.5),
            gender: Some("Male".into()),
            gender_confidence: Some(0.6),
            dominant_emotion: Some("sad".into()),
            ..Default::default()
        };
        analysis.emotion_scores.insert("sad".into(), 0.8);

        let filtered = apply_privacy(
            analysis.clone(),
            PrivacyConfig {
                enable_age: true,
                enable_gender: false,
                enable_emotion: false,
            },
        );
        assert_eq!(filtered.age, Some(40.0));
        assert_eq!(filtered.gender, None);
        assert_eq!(filtered.dominant_emotion, None);
        assert!(filtered.emotion_scores.is_empty());
        assert_eq!(apply_privacy(analysis.clone(), PrivacyConfig::default()), analysis);
    }

    #[test]
    fn service_errors_are_recorded() {
        let h = Harness::new(1);
        h.reconciler
            .on_service_error("Failed to decode image".into(), &h.store);
        assert_eq!(
            h.store.snapshot().last_error.as_deref(),
            Some("Failed to decode image")
        );
    }
}
