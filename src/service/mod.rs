//! Stand-in for the pose analysis service.
//!
//! Keeps one analysis session per connection: calibration samples are
//! collected from tagged frames and averaged when a phase is finalized, and
//! once calibrated every untagged frame is mapped onto the calibrated range to
//! count repetitions. Every reply echoes the epoch of the message it answers.

pub mod angles;
pub mod server;

use image::{Rgb, RgbImage};
use log::{debug, info, warn};

use crate::{
    CoachError,
    frame::{decode_data_url, encode_jpeg_data_url},
    protocol::{ClientMessage, Envelope, FrameRequest, FrameResult, ServerMessage},
    session::{ArmSide, CalibrationPhase},
};

pub use angles::{AngleSource, ScriptedAngles, SimulatedAthlete};
pub use server::AnalysisServer;

/// Progress at or above this counts the upper half of a repetition.
const UPPER_THRESHOLD: f32 = 95.;
/// Progress at or below this counts the lower half.
const LOWER_THRESHOLD: f32 = 5.;
const OVERLAY_JPEG_QUALITY: u8 = 65;

const BAR_WIDTH: u32 = 6;
const BAR_COLOR: Rgb<u8> = Rgb([255, 0, 255]);
const BAR_TRACK_COLOR: Rgb<u8> = Rgb([40, 40, 40]);

#[derive(Debug, Default)]
struct AnalysisState {
    arm_side: ArmSide,
    half_reps: u32,
    /// Upper half of the current repetition already counted
    raised: bool,
    min_angle: Option<f32>,
    max_angle: Option<f32>,
    calibrated: bool,
    min_samples: Vec<f32>,
    max_samples: Vec<f32>,
}

impl AnalysisState {
    fn count(&self) -> u32 {
        self.half_reps / 2
    }

    fn samples(&mut self, phase: CalibrationPhase) -> &mut Vec<f32> {
        match phase {
            CalibrationPhase::Min => &mut self.min_samples,
            CalibrationPhase::Max => &mut self.max_samples,
        }
    }
}

pub struct AnalysisService {
    angles: Box<dyn AngleSource + Send>,
    state: AnalysisState,
    frames: u64,
}

impl AnalysisService {
    pub fn new(angles: Box<dyn AngleSource + Send>) -> Self {
        Self {
            angles,
            state: AnalysisState::default(),
            frames: 0,
        }
    }

    /// Drops the analysis session, as when the client disconnects.
    pub fn reset(&mut self) {
        self.state = AnalysisState::default();
    }

    pub fn is_calibrated(&self) -> bool {
        self.state.calibrated
    }

    pub fn count(&self) -> u32 {
        self.state.count()
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames
    }

    /// Handles one client message and returns the replies, in order.
    pub fn handle(&mut self, envelope: Envelope<ClientMessage>) -> Vec<Envelope<ServerMessage>> {
        let epoch = envelope.epoch;
        let replies = match envelope.message {
            ClientMessage::SetArmSide { arm_side } => vec![self.set_arm_side(arm_side)],
            ClientMessage::StartCalibrationMin => {
                self.state.min_samples.clear();
                vec![ServerMessage::CalibrationMinStarted]
            }
            ClientMessage::StartCalibrationMax => {
                self.state.max_samples.clear();
                vec![ServerMessage::CalibrationMaxStarted]
            }
            ClientMessage::CompleteCalibrationMin => self.complete_min().into_iter().collect(),
            ClientMessage::CompleteCalibrationMax => self.complete_max().into_iter().collect(),
            ClientMessage::ProcessFrame(request) => match self.process_frame(&request) {
                Ok(result) => vec![ServerMessage::FrameProcessed(result)],
                Err(e) => {
                    warn!("Error processing frame: {e}");
                    vec![ServerMessage::Error {
                        message: e.to_string(),
                    }]
                }
            },
            ClientMessage::ResetCounter => {
                self.state.half_reps = 0;
                self.state.raised = false;
                vec![ServerMessage::CounterReset { count: 0 }]
            }
        };
        replies
            .into_iter()
            .map(|message| Envelope { epoch, message })
            .collect()
    }

    fn set_arm_side(&mut self, arm_side: ArmSide) -> ServerMessage {
        let state = &mut self.state;
        state.arm_side = arm_side;
        state.half_reps = 0;
        state.raised = false;
        state.calibrated = false;
        state.min_samples.clear();
        state.max_samples.clear();
        ServerMessage::ArmSideSet { arm_side }
    }

    fn complete_min(&mut self) -> Option<ServerMessage> {
        let Some(min_angle) = average(&self.state.min_samples) else {
            warn!("No MIN samples collected");
            return None;
        };
        self.state.min_angle = Some(min_angle);
        info!("MIN calibration complete: {}°", min_angle.trunc());
        Some(ServerMessage::CalibrationMinComplete {
            min_angle: min_angle.trunc(),
        })
    }

    fn complete_max(&mut self) -> Option<ServerMessage> {
        let Some(max_angle) = average(&self.state.max_samples) else {
            warn!("No MAX samples collected");
            return None;
        };
        self.state.max_angle = Some(max_angle);

        let calibrated = self.state.min_angle.is_some_and(|min| max_angle > min);
        if calibrated {
            self.state.calibrated = true;
            info!("MAX calibration complete: {}°", max_angle.trunc());
        } else {
            warn!(
                "Calibration not complete, MAX {}° is not above MIN {:?}",
                max_angle.trunc(),
                self.state.min_angle
            );
        }
        Some(ServerMessage::CalibrationMaxComplete {
            max_angle: max_angle.trunc(),
            calibrated: calibrated.then_some(true),
        })
    }

    fn process_frame(&mut self, request: &FrameRequest) -> Result<FrameResult, CoachError> {
        let mut image = decode_data_url(&request.image)?.to_rgb8();
        self.frames += 1;

        let state = &mut self.state;
        let mut result = FrameResult {
            count: Some(state.count()),
            percentage: Some(0.),
            calibrated: Some(state.calibrated),
            ..Default::default()
        };

        let angle = self
            .angles
            .measure(&image, state.arm_side, request.calibration_mode);
        if let Some(angle) = angle {
            result.angle = Some(angle.trunc());
            match (request.calibration_mode, state.min_angle, state.max_angle) {
                (Some(phase), _, _) => state.samples(phase).push(angle),
                (None, Some(min), Some(max)) if state.calibrated => {
                    let percentage = progress(angle, min, max);
                    result.percentage = Some(percentage.trunc());
                    if percentage >= UPPER_THRESHOLD && !state.raised {
                        state.half_reps += 1;
                        state.raised = true;
                    } else if percentage <= LOWER_THRESHOLD && state.raised {
                        state.half_reps += 1;
                        state.raised = false;
                    }
                    result.count = Some(state.count());
                }
                _ => {}
            }
            draw_angle_bar(&mut image, angle);
        } else {
            debug!("No pose found in frame {}", self.frames);
        }

        result.processed_image = Some(encode_jpeg_data_url(&image, OVERLAY_JPEG_QUALITY)?);
        Ok(result)
    }
}

/// Reply to a client line the service could not decode.
pub fn undecodable(error: &CoachError) -> Envelope<ServerMessage> {
    Envelope::unversioned(ServerMessage::Error {
        message: error.to_string(),
    })
}

fn average(samples: &[f32]) -> Option<f32> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().sum::<f32>() / samples.len() as f32)
}

/// Linear position of `angle` between `min` (0) and `max` (100), clamped.
fn progress(angle: f32, min: f32, max: f32) -> f32 {
    if max <= min {
        return 0.;
    }
    ((angle - min) * 100. / (max - min)).clamp(0., 100.)
}

/// Vertical bar on the right edge filled in proportion to the angle.
fn draw_angle_bar(image: &mut RgbImage, angle: f32) {
    let (width, height) = image.dimensions();
    if width < BAR_WIDTH || height == 0 {
        return;
    }
    let filled = ((angle.clamp(0., 180.) / 180.) * height as f32) as u32;
    for y in 0..height {
        let color = if height - y <= filled {
            BAR_COLOR
        } else {
            BAR_TRACK_COLOR
        };
        for x in width - BAR_WIDTH..width {
            image.put_pixel(x, y, color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Epoch;

    fn frame_request(calibration_mode: Option<CalibrationPhase>) -> ClientMessage {
        let frame = RgbImage::from_pixel(32, 24, Rgb([120, 120, 120]));
        ClientMessage::ProcessFrame(FrameRequest {
            image: encode_jpeg_data_url(&frame, 65).unwrap(),
            calibration_mode,
        })
    }

    fn send(service: &mut AnalysisService, message: ClientMessage) -> Vec<ServerMessage> {
        service
            .handle(Envelope::new(Epoch::new(1), message))
            .into_iter()
            .map(|envelope| {
                assert_eq!(envelope.epoch, Some(Epoch::new(1)));
                envelope.message
            })
            .collect()
    }

    fn calibrate(service: &mut AnalysisService, min: f32, max: f32) {
        let angles = ScriptedAngles::with_calibration(min, max);
        service.angles = Box::new(angles);
        send(service, ClientMessage::StartCalibrationMin);
        send(service, frame_request(Some(CalibrationPhase::Min)));
        send(service, ClientMessage::CompleteCalibrationMin);
        send(service, ClientMessage::StartCalibrationMax);
        send(service, frame_request(Some(CalibrationPhase::Max)));
        send(service, ClientMessage::CompleteCalibrationMax);
    }

    #[test]
    fn test_calibration_averages_tagged_samples() {
        let angles = ScriptedAngles::with_calibration(30., 150.);
        let mut service = AnalysisService::new(Box::new(angles.clone()));

        send(&mut service, ClientMessage::StartCalibrationMin);
        send(&mut service, frame_request(Some(CalibrationPhase::Min)));
        angles.set_calibration(CalibrationPhase::Min, Some(40.));
        send(&mut service, frame_request(Some(CalibrationPhase::Min)));
        assert_eq!(
            send(&mut service, ClientMessage::CompleteCalibrationMin),
            vec![ServerMessage::CalibrationMinComplete { min_angle: 35. }]
        );

        send(&mut service, ClientMessage::StartCalibrationMax);
        send(&mut service, frame_request(Some(CalibrationPhase::Max)));
        assert_eq!(
            send(&mut service, ClientMessage::CompleteCalibrationMax),
            vec![ServerMessage::CalibrationMaxComplete {
                max_angle: 150.,
                calibrated: Some(true),
            }]
        );
        assert!(service.is_calibrated());
    }

    #[test]
    fn test_finalize_without_samples_sends_nothing() {
        let mut service = AnalysisService::new(Box::new(ScriptedAngles::new()));
        send(&mut service, ClientMessage::StartCalibrationMin);
        send(&mut service, frame_request(Some(CalibrationPhase::Min)));
        assert!(send(&mut service, ClientMessage::CompleteCalibrationMin).is_empty());
    }

    #[test]
    fn test_max_not_above_min_is_not_calibrated() {
        let mut service = AnalysisService::new(Box::new(ScriptedAngles::new()));
        calibrate(&mut service, 120., 90.);
        assert!(!service.is_calibrated());
    }

    #[test]
    fn test_counts_half_reps_across_thresholds() {
        let mut service = AnalysisService::new(Box::new(ScriptedAngles::new()));
        calibrate(&mut service, 35., 160.);
        let angles = ScriptedAngles::new();
        service.angles = Box::new(angles.clone());

        angles.extend([160., 35., 160., 35., 160., 35., 87.5]);
        let mut last = None;
        for _ in 0..7 {
            last = send(&mut service, frame_request(None)).pop();
        }
        match last {
            Some(ServerMessage::FrameProcessed(result)) => {
                assert_eq!(result.count, Some(3));
                assert_eq!(result.percentage, Some(42.));
                assert_eq!(result.angle, Some(87.));
                assert!(result.processed_image.is_some());
            }
            other => panic!("unexpected reply {other:?}"),
        }

        assert_eq!(
            send(&mut service, ClientMessage::ResetCounter),
            vec![ServerMessage::CounterReset { count: 0 }]
        );
        assert_eq!(service.count(), 0);
    }

    #[test]
    fn test_set_arm_side_drops_calibration() {
        let mut service = AnalysisService::new(Box::new(ScriptedAngles::new()));
        calibrate(&mut service, 35., 160.);
        assert!(service.is_calibrated());

        let replies = send(
            &mut service,
            ClientMessage::SetArmSide {
                arm_side: ArmSide::Right,
            },
        );
        assert_eq!(
            replies,
            vec![ServerMessage::ArmSideSet {
                arm_side: ArmSide::Right
            }]
        );
        assert!(!service.is_calibrated());
    }

    #[test]
    fn test_undecodable_frame_is_answered_with_error() {
        let mut service = AnalysisService::new(Box::new(ScriptedAngles::new()));
        let replies = send(
            &mut service,
            ClientMessage::ProcessFrame(FrameRequest {
                image: "data:image/jpeg;base64,AAAA".to_string(),
                calibration_mode: None,
            }),
        );
        assert!(matches!(replies.as_slice(), [ServerMessage::Error { .. }]));
        assert_eq!(service.frames_processed(), 0);
    }

    #[test]
    fn test_progress_is_clamped() {
        assert_eq!(progress(10., 35., 160.), 0.);
        assert_eq!(progress(170., 35., 160.), 100.);
        assert_eq!(progress(87.5, 35., 160.), 42.);
        assert_eq!(progress(50., 90., 90.), 0.);
    }
}
