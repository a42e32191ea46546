// Error types for repcoach

use crate::session::{CalibrationPhase, Mode};
use snafu::Snafu;
use std::io;

#[derive(Debug, Snafu)]
pub enum CoachError {
    // Camera errors
    #[snafu(display("Unable to access camera: {reason}"))]
    CameraUnavailable { reason: String },

    // Session validation errors
    #[snafu(display("Cannot {action} while the session is {mode}"))]
    InvalidTransition { action: String, mode: Mode },
    #[snafu(display("Please complete MIN calibration first."))]
    MinCalibrationIncomplete,
    #[snafu(display("Please complete both MIN and MAX calibration first."))]
    CalibrationIncomplete,
    #[snafu(display(
        "The analysis service did not confirm the calibration. Please repeat the MAX calibration with your arm fully extended."
    ))]
    CalibrationNotAcknowledged,
    #[snafu(display("{phase} calibration is still in progress"))]
    PhaseInProgress { phase: CalibrationPhase },

    // Transport errors
    #[snafu(display("Not connected to the analysis service"))]
    NotConnected,
    #[snafu(display("Error talking to the analysis service"))]
    TransportIOError { source: io::Error },
    #[snafu(display("Malformed message from the analysis service ({event:?})"))]
    MalformedMessage {
        event: Option<String>,
        source: serde_json::Error,
    },
    #[snafu(display("Error encoding message for the analysis service"))]
    MessageEncodingError { source: serde_json::Error },
    #[snafu(display("Could not bind analysis service on {addr}"))]
    ServiceBindError { addr: String, source: io::Error },

    // Frame errors
    #[snafu(display("Error encoding video frame"))]
    FrameEncodingError { source: image::ImageError },
    #[snafu(display("Invalid image payload: {reason}"))]
    InvalidImagePayload { reason: String },
    #[snafu(display("Error decoding image payload"))]
    ImageDecodeError { source: image::ImageError },
    #[snafu(display("Error saving snapshot"))]
    SnapshotError { source: image::ImageError },

    // Session event log errors
    #[snafu(display("Error writing session event log"))]
    WriterError { source: io::Error },

    // Config management errors
    #[snafu(display("Could not find application data directory to save config file"))]
    NoConfigDir,
    #[snafu(display("Error reading or writing config file"))]
    ConfigIOError { source: io::Error },
    #[snafu(display("Error serializing config file"))]
    ConfigSerializeError { source: serde_json::Error },
    #[snafu(display("Invalid configuration: {reason}"))]
    InvalidConfig { reason: String },
}

impl CoachError {
    /// Validation errors are rejected locally and never reach the service.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CoachError::InvalidTransition { .. }
                | CoachError::MinCalibrationIncomplete
                | CoachError::CalibrationIncomplete
                | CoachError::CalibrationNotAcknowledged
                | CoachError::PhaseInProgress { .. }
        )
    }
}
