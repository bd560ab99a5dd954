//! JSON wire contract with the inference service.

use std::collections::BTreeMap;

use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    analysis::{BoundingBox, FaceAnalysis, FaceDetection},
    frame::{Frame, FrameId},
    state::ServerMetrics,
    IrisError, Result,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Connect {
        #[serde(rename = "clientId")]
        client_id: String,
    },
    VideoFrame {
        data: String,
        timestamp: i64,
        #[serde(rename = "frameId")]
        frame_id: FrameId,
    },
    GetMetrics,
}

impl OutboundMessage {
    pub fn video_frame(frame: &Frame) -> Self {
        OutboundMessage::VideoFrame {
            data: base64::engine::general_purpose::STANDARD.encode(&frame.payload),
            timestamp: frame.timestamp_ms(),
            frame_id: frame.id,
        }
    }

    pub fn to_text(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|err| IrisError::Protocol(format!("failed to encode message: {err}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFace {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub bbox: [f32; 4],
    #[serde(default)]
    pub confidence: f32,
}

impl From<WireFace> for FaceDetection {
    fn from(face: WireFace) -> Self {
        let [x, y, w, h] = face.bbox;
        FaceDetection {
            local_id: face.id,
            bounding_box: BoundingBox::new(x, y, w, h),
            confidence: face.confidence,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireAnalysis {
    #[serde(deserialize_with = "string_or_number")]
    pub face_id: String,
    pub age: Option<f32>,
    pub age_confidence: Option<f32>,
    pub gender: Option<String>,
    pub gender_confidence: Option<f32>,
    #[serde(default)]
    pub emotions: BTreeMap<String, f32>,
    pub dominant_emotion: Option<String>,
    pub emotion_confidence: Option<f32>,
    #[serde(default)]
    pub confidence: f32,
}

impl From<WireAnalysis> for FaceAnalysis {
    fn from(wire: WireAnalysis) -> Self {
        FaceAnalysis {
            face_id: wire.face_id,
            age: wire.age,
            age_confidence: wire.age_confidence,
            gender: wire.gender,
            gender_confidence: wire.gender_confidence,
            dominant_emotion: wire.dominant_emotion,
            emotion_confidence: wire.emotion_confidence,
            emotion_scores: wire.emotions,
            confidence: wire.confidence,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Connected {
        status: Option<String>,
        server_time: Option<String>,
        services_ready: Option<bool>,
    },
    FaceDetected {
        faces: Vec<WireFace>,
        timestamp: Option<f64>,
        processing_time: Option<f64>,
        #[serde(rename = "frameId")]
        frame_id: Option<FrameId>,
    },
    AnalysisComplete {
        results: Vec<WireAnalysis>,
        timestamp: Option<f64>,
        processing_time: Option<f64>,
        #[serde(rename = "frameId")]
        frame_id: Option<FrameId>,
    },
    NoFacesDetected {
        timestamp: Option<f64>,
        processing_time: Option<f64>,
        #[serde(rename = "frameId")]
        frame_id: Option<FrameId>,
    },
    MetricsUpdate(ServerMetrics),
    Error {
        message: String,
    },
    #[serde(other)]
    Unknown,
}

/// How an inbound result refers back to the frame it answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Correlation {
    pub frame_id: Option<FrameId>,
    pub timestamp_ms: Option<i64>,
}

impl InboundMessage {
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|err| IrisError::Protocol(format!("failed to decode message: {err}")))
    }

    /// Correlation data for result-carrying messages.
    pub fn correlation(&self) -> Option<Correlation> {
        match self {
            InboundMessage::FaceDetected {
                timestamp,
                frame_id,
                ..
            }
            | InboundMessage::AnalysisComplete {
                timestamp,
                frame_id,
                ..
            }
            | InboundMessage::NoFacesDetected {
                timestamp,
                frame_id,
                ..
            } => Some(Correlation {
                frame_id: *frame_id,
                timestamp_ms: timestamp.map(|ts| ts.round() as i64),
            }),
            _ => None,
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(text) => Ok(text),
        serde_json::Value::Number(number) => Ok(number.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Instant;

    #[test]
    fn video_frame_wire_shape() {
        let frame = Frame {
            id: FrameId(7),
            payload: vec![0xff, 0xd8, 0xff],
            width: 2,
            height: 2,
            captured_at: Instant::now(),
            wall_clock: Utc::now(),
            target_quality: 80,
        };
        let text = OutboundMessage::video_frame(&frame).to_text().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "video_frame");
        assert_eq!(value["frameId"], 7);
        assert_eq!(value["data"], "/9j/");
        assert_eq!(value["timestamp"], frame.timestamp_ms());
    }

    #[test]
    fn handshake_and_metrics_request_shape() {
        let text = OutboundMessage::Connect {
            client_id: "kiosk-1".into(),
        }
        .to_text()
        .unwrap();
        assert_eq!(text, r#"{"type":"connect","clientId":"kiosk-1"}"#);
        assert_eq!(
            OutboundMessage::GetMetrics.to_text().unwrap(),
            r#"{"type":"get_metrics"}"#
        );
    }

    #[test]
    fn decode_face_detected_with_timestamp_only() {
        let msg = InboundMessage::decode(
            r#"{"type":"face_detected","faces":[{"id":"face_0","bbox":[10,20,30,40],"confidence":0.93}],"timestamp":1700000000123,"processing_time":42.5}"#,
        )
        .unwrap();
        let correlation = msg.correlation().unwrap();
        assert_eq!(correlation.frame_id, None);
        assert_eq!(correlation.timestamp_ms, Some(1_700_000_000_123));
        let InboundMessage::FaceDetected { faces, .. } = msg else {
            panic!("unexpected variant");
        };
        let face: FaceDetection = faces[0].clone().into();
        assert_eq!(face.local_id, "face_0");
        assert_eq!(face.bounding_box, BoundingBox::new(10.0, 20.0, 30.0, 40.0));
    }

    #[test]
    fn decode_analysis_with_numeric_face_id() {
        let msg = InboundMessage::decode(
            r#"{"type":"analysis_complete","results":[{"face_id":3,"age":31.5,"gender":"Female","emotions":{"happy":0.8,"neutral":0.2},"dominant_emotion":"happy","confidence":0.7}],"processing_time":12.0,"frameId":9}"#,
        )
        .unwrap();
        let InboundMessage::AnalysisComplete {
            results, frame_id, ..
        } = msg
        else {
            panic!("unexpected variant");
        };
        assert_eq!(frame_id, Some(FrameId(9)));
        let analysis: FaceAnalysis = results[0].clone().into();
        assert_eq!(analysis.face_id, "3");
        assert_eq!(analysis.emotion_scores.len(), 2);
        assert_eq!(analysis.top_emotion(), Some("happy"));
    }

    #[test]
    fn decode_service_notifications() {
        let connected = InboundMessage::decode(
            r#"{"type":"connected","status":"connected","server_time":"2024-01-01T00:00:00","services_ready":true}"#,
        )
        .unwrap();
        assert!(matches!(
            connected,
            InboundMessage::Connected {
                services_ready: Some(true),
                ..
            }
        ));

        let metrics = InboundMessage::decode(
            r#"{"type":"metrics_update","total_requests":4,"active_connections":1,"fps":9.5,"last_update":"x"}"#,
        )
        .unwrap();
        let InboundMessage::MetricsUpdate(metrics) = metrics else {
            panic!("unexpected variant");
        };
        assert_eq!(metrics.total_requests, Some(4));

        let unknown = InboundMessage::decode(r#"{"type":"pong"}"#).unwrap();
        assert_eq!(unknown, InboundMessage::Unknown);
        assert!(InboundMessage::decode("not json").is_err());
    }
}
