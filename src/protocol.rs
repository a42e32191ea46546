//! Messages exchanged with the analysis service.
//!
//! Every message travels as one JSON object per line:
//! `{"event": "<name>", "data": {...}, "epoch": 3}`. The epoch is attached by
//! the coach to everything it sends and echoed back by the service, so
//! replies produced for an earlier session can be recognised and dropped.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{
    CoachError,
    session::{ArmSide, CalibrationPhase},
};

const EPOCH_KEY: &str = "epoch";
const EVENT_KEY: &str = "event";

/// Monotonically increasing session generation.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Epoch(u64);

impl Epoch {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

/// One sampled frame sent for analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRequest {
    /// JPEG frame as a `data:image/jpeg;base64,` URL
    pub image: String,
    /// Calibration phase the frame belongs to, `None` outside calibration
    #[serde(default)]
    pub calibration_mode: Option<CalibrationPhase>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    SetArmSide { arm_side: ArmSide },
    StartCalibrationMin,
    CompleteCalibrationMin,
    StartCalibrationMax,
    CompleteCalibrationMax,
    ProcessFrame(FrameRequest),
    ResetCounter,
}

impl ClientMessage {
    pub fn start_calibration(phase: CalibrationPhase) -> Self {
        match phase {
            CalibrationPhase::Min => Self::StartCalibrationMin,
            CalibrationPhase::Max => Self::StartCalibrationMax,
        }
    }

    pub fn complete_calibration(phase: CalibrationPhase) -> Self {
        match phase {
            CalibrationPhase::Min => Self::CompleteCalibrationMin,
            CalibrationPhase::Max => Self::CompleteCalibrationMax,
        }
    }
}

/// Result of analysing one frame. Every field is optional and is applied
/// only when present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameResult {
    /// Annotated frame as a JPEG data URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_image: Option<String>,
    /// Joint angle in degrees
    #[serde(skip_serializing_if = "Option::is_none")]
    pub angle: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    /// Progress through the current repetition, 0 to 100
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentage: Option<f32>,
    /// Informational echo of the service's calibration flag. The coach does
    /// not derive its own calibration state from it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calibrated: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    ArmSideSet {
        arm_side: ArmSide,
    },
    CalibrationMinStarted,
    CalibrationMaxStarted,
    CalibrationMinComplete {
        min_angle: f32,
    },
    CalibrationMaxComplete {
        max_angle: f32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        calibrated: Option<bool>,
    },
    FrameProcessed(FrameResult),
    CounterReset {
        count: u32,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub const FRAME_PROCESSED: &'static str = "frame_processed";

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::ArmSideSet { .. } => "arm_side_set",
            Self::CalibrationMinStarted => "calibration_min_started",
            Self::CalibrationMaxStarted => "calibration_max_started",
            Self::CalibrationMinComplete { .. } => "calibration_min_complete",
            Self::CalibrationMaxComplete { .. } => "calibration_max_complete",
            Self::FrameProcessed(_) => Self::FRAME_PROCESSED,
            Self::CounterReset { .. } => "counter_reset",
            Self::Error { .. } => "error",
        }
    }
}

/// A message together with the session epoch it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<M> {
    pub epoch: Option<Epoch>,
    pub message: M,
}

impl<M> Envelope<M> {
    pub fn new(epoch: Epoch, message: M) -> Self {
        Self {
            epoch: Some(epoch),
            message,
        }
    }

    pub fn unversioned(message: M) -> Self {
        Self {
            epoch: None,
            message,
        }
    }
}

impl<M: Serialize> Envelope<M> {
    /// Encodes the envelope as a single JSON line (without the newline).
    pub fn encode(&self) -> Result<String, CoachError> {
        let mut value = serde_json::to_value(&self.message)
            .map_err(|e| CoachError::MessageEncodingError { source: e })?;
        if let (Some(epoch), Some(object)) = (self.epoch, value.as_object_mut()) {
            object.insert(EPOCH_KEY.to_string(), Value::from(epoch.value()));
        }
        serde_json::to_string(&value).map_err(|e| CoachError::MessageEncodingError { source: e })
    }
}

impl<M: DeserializeOwned> Envelope<M> {
    /// Decodes one JSON line. On failure the error carries the event name when
    /// it could be read, so a broken reply can still be matched to its kind.
    pub fn decode(line: &str) -> Result<Self, CoachError> {
        let mut value: Value = serde_json::from_str(line)
            .map_err(|e| CoachError::MalformedMessage {
                event: None,
                source: e,
            })?;

        let event = value
            .get(EVENT_KEY)
            .and_then(Value::as_str)
            .map(str::to_string);
        let epoch = value
            .as_object_mut()
            .and_then(|object| object.remove(EPOCH_KEY))
            .and_then(|epoch| epoch.as_u64())
            .map(Epoch::new);

        let message = serde_json::from_value(value)
            .map_err(|e| CoachError::MalformedMessage { event, source: e })?;
        Ok(Self { epoch, message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_messages_use_service_event_names() {
        let line = Envelope::new(
            Epoch::new(4),
            ClientMessage::SetArmSide {
                arm_side: ArmSide::Right,
            },
        )
        .encode()
        .unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["event"], "set_arm_side");
        assert_eq!(value["data"]["arm_side"], "right");
        assert_eq!(value["epoch"], 4);

        let line = Envelope::new(Epoch::new(1), ClientMessage::CompleteCalibrationMax)
            .encode()
            .unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["event"], "complete_calibration_max");
    }

    #[test]
    fn test_frame_request_carries_mode_tag() {
        let request = ClientMessage::ProcessFrame(FrameRequest {
            image: "data:image/jpeg;base64,AAAA".to_string(),
            calibration_mode: Some(CalibrationPhase::Min),
        });
        let line = Envelope::new(Epoch::new(2), request.clone()).encode().unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["data"]["calibration_mode"], "min");

        let decoded = Envelope::<ClientMessage>::decode(&line).unwrap();
        assert_eq!(decoded.message, request);
        assert_eq!(decoded.epoch, Some(Epoch::new(2)));
    }

    #[test]
    fn test_service_reply_without_optional_fields() {
        let line = r#"{"event":"frame_processed","data":{"angle":87},"epoch":9}"#;
        let decoded = Envelope::<ServerMessage>::decode(line).unwrap();
        assert_eq!(decoded.epoch, Some(Epoch::new(9)));
        assert_eq!(
            decoded.message,
            ServerMessage::FrameProcessed(FrameResult {
                angle: Some(87.0),
                ..Default::default()
            })
        );
    }

    #[test]
    fn test_unit_reply_and_missing_epoch() {
        let decoded =
            Envelope::<ServerMessage>::decode(r#"{"event":"calibration_min_started"}"#).unwrap();
        assert_eq!(decoded.epoch, None);
        assert_eq!(decoded.message, ServerMessage::CalibrationMinStarted);
    }

    #[test]
    fn test_max_result_calibrated_flag_is_optional() {
        let decoded = Envelope::<ServerMessage>::decode(
            r#"{"event":"calibration_max_complete","data":{"max_angle":160},"epoch":1}"#,
        )
        .unwrap();
        assert_eq!(
            decoded.message,
            ServerMessage::CalibrationMaxComplete {
                max_angle: 160.0,
                calibrated: None,
            }
        );
    }

    #[test]
    fn test_malformed_reply_keeps_event_name() {
        let error =
            Envelope::<ServerMessage>::decode(r#"{"event":"frame_processed","data":"oops"}"#)
                .unwrap_err();
        match error {
            CoachError::MalformedMessage { event, .. } => {
                assert_eq!(event.as_deref(), Some(ServerMessage::FRAME_PROCESSED))
            }
            other => panic!("unexpected error {other:?}"),
        }

        let error = Envelope::<ServerMessage>::decode("not json").unwrap_err();
        assert!(matches!(
            error,
            CoachError::MalformedMessage { event: None, .. }
        ));
    }

    #[test]
    fn test_absent_fields_are_not_serialized() {
        let line = Envelope::new(
            Epoch::new(1),
            ServerMessage::FrameProcessed(FrameResult {
                angle: Some(12.0),
                ..Default::default()
            }),
        )
        .encode()
        .unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        let data = value["data"].as_object().unwrap();
        assert_eq!(data.len(), 1);
        assert!(data.contains_key("angle"));
    }
}
