use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use base64::Engine;
use iris_types::{
    frame::FrameId,
    protocol::{InboundMessage, OutboundMessage, WireAnalysis, WireFace},
    state::ServerMetrics,
    Result,
};
use tokio::{sync::mpsc, time::sleep};
use tracing::{debug, info};

use crate::{channel_error, Connector, Link};

const LINK_CAPACITY: usize = 32;
const EMOTIONS: [&str; 4] = ["happy", "neutral", "surprise", "sad"];

type FaceScript = Arc<dyn Fn(FrameId) -> Vec<WireFace> + Send + Sync>;

/// In-process stand-in for the inference service.
///
/// Frames are answered strictly in arrival order after `latency`, the same
/// way the real service handles one socket.
#[derive(Clone)]
pub struct LoopbackService {
    latency: Duration,
    faces: FaceScript,
    echo_frame_id: bool,
    drop_after: Option<u64>,
}

impl Default for LoopbackService {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(50),
            faces: Arc::new(|_| {
                vec![WireFace {
                    id: "face_0".into(),
                    bbox: [120.0, 80.0, 160.0, 200.0],
                    confidence: 0.92,
                }]
            }),
            echo_frame_id: true,
            drop_after: None,
        }
    }
}

impl LoopbackService {
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Decide which faces are "seen" in each frame.
    pub fn with_faces<F>(mut self, script: F) -> Self
    where
        F: Fn(FrameId) -> Vec<WireFace> + Send + Sync + 'static,
    {
        self.faces = Arc::new(script);
        self
    }

    /// When false, replies carry only the echoed `timestamp`.
    pub fn with_frame_id_echo(mut self, echo: bool) -> Self {
        self.echo_frame_id = echo;
        self
    }

    /// Close the link when the `n`th frame on it arrives, without answering.
    pub fn with_drop_after(mut self, n: u64) -> Self {
        self.drop_after = Some(n.max(1));
        self
    }

    async fn serve(
        self,
        mut requests: mpsc::Receiver<String>,
        replies: mpsc::Sender<String>,
        client_ids: Arc<Mutex<Vec<String>>>,
    ) {
        let mut frames: u64 = 0;
        while let Some(text) = requests.recv().await {
            let answers = match serde_json::from_str::<OutboundMessage>(&text) {
                Ok(OutboundMessage::Connect { client_id }) => {
                    if let Ok(mut ids) = client_ids.lock() {
                        ids.push(client_id);
                    }
                    vec![InboundMessage::Connected {
                        status: Some("connected".into()),
                        server_time: None,
                        services_ready: Some(true),
                    }]
                }
                Ok(OutboundMessage::VideoFrame {
                    data,
                    timestamp,
                    frame_id,
                }) => {
                    frames += 1;
                    if self.drop_after.is_some_and(|n| frames >= n) {
                        info!("Loopback service dropping link at frame {}", frame_id);
                        return;
                    }
                    sleep(self.latency).await;
                    self.answer_frame(&data, timestamp, frame_id)
                }
                Ok(OutboundMessage::GetMetrics) => {
                    let latency_ms = self.latency.as_millis() as f64;
                    vec![InboundMessage::MetricsUpdate(ServerMetrics {
                        total_requests: Some(frames),
                        active_connections: Some(1),
                        avg_processing_time: Some(latency_ms),
                        fps: Some(1000.0 / latency_ms.max(1.0)),
                    })]
                }
                Err(err) => vec![InboundMessage::Error {
                    message: format!("Invalid message: {err}"),
                }],
            };

            for answer in answers {
                let Ok(text) = serde_json::to_string(&answer) else {
                    continue;
                };
                if replies.send(text).await.is_err() {
                    return;
                }
            }
        }
        debug!("Loopback client went away after {} frames", frames);
    }

    fn answer_frame(&self, data: &str, timestamp: i64, frame_id: FrameId) -> Vec<InboundMessage> {
        if data.is_empty() {
            return vec![InboundMessage::Error {
                message: "No image data provided".into(),
            }];
        }
        if base64::engine::general_purpose::STANDARD
            .decode(data)
            .is_err()
        {
            return vec![InboundMessage::Error {
                message: "Failed to decode image".into(),
            }];
        }

        let processing_time = Some(self.latency.as_millis() as f64);
        let timestamp = Some(timestamp as f64);
        let echoed = self.echo_frame_id.then_some(frame_id);
        let faces = (self.faces)(frame_id);
        if faces.is_empty() {
            return vec![InboundMessage::NoFacesDetected {
                timestamp,
                processing_time,
                frame_id: echoed,
            }];
        }

        let results = faces
            .iter()
            .map(|face| synthesize_analysis(face, frame_id))
            .collect();
        vec![
            InboundMessage::FaceDetected {
                faces,
                timestamp,
                processing_time,
                frame_id: echoed,
            },
            InboundMessage::AnalysisComplete {
                results,
                timestamp,
                processing_time,
                frame_id: echoed,
            },
        ]
    }
}

fn synthesize_analysis(face: &WireFace, frame_id: FrameId) -> WireAnalysis {
    let dominant = EMOTIONS[(frame_id.0 % EMOTIONS.len() as u64) as usize];
    let emotions: BTreeMap<String, f32> = EMOTIONS
        .iter()
        .map(|name| {
            let score = if *name == dominant { 0.7 } else { 0.1 };
            (name.to_string(), score)
        })
        .collect();
    WireAnalysis {
        face_id: face.id.clone(),
        age: Some(20.0 + (frame_id.0 % 40) as f32),
        age_confidence: Some(0.8),
        gender: Some(if frame_id.0 % 2 == 0 { "Male" } else { "Female" }.into()),
        gender_confidence: Some(0.6),
        emotions,
        dominant_emotion: Some(dominant.into()),
        emotion_confidence: Some(0.7),
        confidence: face.confidence,
    }
}

/// Connects to a fresh [`LoopbackService`] instance on every call.
pub struct LoopbackConnector {
    service: LoopbackService,
    refuse: AtomicU32,
    connections: AtomicUsize,
    client_ids: Arc<Mutex<Vec<String>>>,
}

impl LoopbackConnector {
    pub fn new(service: LoopbackService) -> Self {
        Self {
            service,
            refuse: AtomicU32::new(0),
            connections: AtomicUsize::new(0),
            client_ids: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fail the next `n` connection attempts.
    pub fn refuse_next(self, n: u32) -> Self {
        self.refuse.store(n, Ordering::Relaxed);
        self
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Client identifiers received in handshakes, in order.
    pub fn client_ids(&self) -> Vec<String> {
        self.client_ids
            .lock()
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, url: &str) -> Result<Link> {
        let refused = self
            .refuse
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        if refused.is_ok() {
            return Err(channel_error(format!("loopback refused connection to {url}")));
        }

        let (request_tx, request_rx) = mpsc::channel(LINK_CAPACITY);
        let (reply_tx, reply_rx) = mpsc::channel(LINK_CAPACITY);
        tokio::spawn(
            self.service
                .clone()
                .serve(request_rx, reply_tx, self.client_ids.clone()),
        );
        self.connections.fetch_add(1, Ordering::Relaxed);
        Ok(Link {
            outbound: request_tx,
            inbound: reply_rx,
        })
    }
}
