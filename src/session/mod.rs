pub mod countdown;

use std::fmt;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uom::si::{angle::degree, f32::Angle};

use crate::{
    CoachError,
    protocol::{Envelope, Epoch, FrameResult, ServerMessage},
};

pub use countdown::{Countdown, CountdownStatus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArmSide {
    #[default]
    Left,
    Right,
}

impl fmt::Display for ArmSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArmSide::Left => write!(f, "Left Arm"),
            ArmSide::Right => write!(f, "Right Arm"),
        }
    }
}

/// The two calibration phases: MIN with the arm contracted, MAX with the arm
/// fully extended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationPhase {
    Min,
    Max,
}

impl CalibrationPhase {
    pub fn instruction(&self) -> &'static str {
        match self {
            CalibrationPhase::Min => "CONTRACT YOUR ARM (Bicep Curl Up)",
            CalibrationPhase::Max => "EXTEND YOUR ARM FULLY (Down Position)",
        }
    }
}

impl fmt::Display for CalibrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalibrationPhase::Min => write!(f, "MIN"),
            CalibrationPhase::Max => write!(f, "MAX"),
        }
    }
}

/// Observable session mode. Each mode corresponds to one screen of the coach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Landing screen
    Idle,
    /// Arm selection and camera start
    Setup,
    CalibratingMin,
    CalibratingMax,
    /// Calibration screen with no phase running
    Armed,
    Training,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Idle => write!(f, "idle"),
            Mode::Setup => write!(f, "in setup"),
            Mode::CalibratingMin => write!(f, "calibrating MIN"),
            Mode::CalibratingMax => write!(f, "calibrating MAX"),
            Mode::Armed => write!(f, "waiting for calibration"),
            Mode::Training => write!(f, "training"),
        }
    }
}

/// Calibrated range of the tracked joint. Only exists once both bounds were
/// measured, so training can never start with a missing bound.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AngleRange {
    pub min: Angle,
    pub max: Angle,
}

impl fmt::Display for AngleRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}°–{}°",
            self.min.get::<degree>().round(),
            self.max.get::<degree>().round()
        )
    }
}

pub fn degrees(value: f32) -> Angle {
    Angle::new::<degree>(value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhaseStatus {
    /// Countdown running, frames are tagged with the phase
    Sampling,
    /// Finalize signal sent, waiting out the settle delay
    Finalizing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ActivePhase {
    phase: CalibrationPhase,
    status: PhaseStatus,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Calibration {
    active: Option<ActivePhase>,
    min: Option<Angle>,
    max: Option<Angle>,
    calibrated: bool,
    current_angle: Option<Angle>,
}

#[derive(Debug, Clone, PartialEq)]
struct Training {
    range: AngleRange,
    rep_count: u32,
    progress: f32,
    current_angle: Option<Angle>,
}

#[derive(Debug, Clone, PartialEq)]
enum Stage {
    Idle,
    Setup,
    Calibration(Calibration),
    Training(Training),
}

/// What happened to a reply handed to `Session::apply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    Applied,
    /// The reply belongs to an earlier epoch and was dropped
    Stale,
    /// The reply is current but means nothing in the present mode
    Ignored,
}

/// Calibration and training state machine.
///
/// The session is the single source of truth for the user's progress. It is
/// pure state: it never talks to the service or the camera itself, the coach
/// does that based on the transitions accepted here.
///
/// Every transition that starts a new capture pipeline or abandons the
/// current one moves to a new epoch. Stateful replies are only applied when
/// they carry the current epoch.
#[derive(Debug, Clone)]
pub struct Session {
    arm_side: ArmSide,
    stage: Stage,
    epoch: Epoch,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            arm_side: ArmSide::default(),
            stage: Stage::Idle,
            epoch: Epoch::default(),
        }
    }

    pub fn mode(&self) -> Mode {
        match &self.stage {
            Stage::Idle => Mode::Idle,
            Stage::Setup => Mode::Setup,
            Stage::Calibration(calibration) => match calibration.active {
                Some(ActivePhase {
                    phase: CalibrationPhase::Min,
                    ..
                }) => Mode::CalibratingMin,
                Some(ActivePhase {
                    phase: CalibrationPhase::Max,
                    ..
                }) => Mode::CalibratingMax,
                None => Mode::Armed,
            },
            Stage::Training(_) => Mode::Training,
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn arm_side(&self) -> ArmSide {
        self.arm_side
    }

    pub fn min_angle(&self) -> Option<Angle> {
        match &self.stage {
            Stage::Calibration(calibration) => calibration.min,
            Stage::Training(training) => Some(training.range.min),
            _ => None,
        }
    }

    pub fn max_angle(&self) -> Option<Angle> {
        match &self.stage {
            Stage::Calibration(calibration) => calibration.max,
            Stage::Training(training) => Some(training.range.max),
            _ => None,
        }
    }

    pub fn is_calibrated(&self) -> bool {
        match &self.stage {
            Stage::Calibration(calibration) => {
                calibration.calibrated && calibration.min.is_some() && calibration.max.is_some()
            }
            Stage::Training(_) => true,
            _ => false,
        }
    }

    pub fn angle_range(&self) -> Option<AngleRange> {
        match &self.stage {
            Stage::Training(training) => Some(training.range),
            _ => None,
        }
    }

    pub fn rep_count(&self) -> u32 {
        match &self.stage {
            Stage::Training(training) => training.rep_count,
            _ => 0,
        }
    }

    pub fn progress_percentage(&self) -> f32 {
        match &self.stage {
            Stage::Training(training) => training.progress,
            _ => 0.,
        }
    }

    pub fn current_angle(&self) -> Option<Angle> {
        match &self.stage {
            Stage::Calibration(calibration) => calibration.current_angle,
            Stage::Training(training) => training.current_angle,
            _ => None,
        }
    }

    /// Tag attached to outgoing frames: the phase whose countdown is running
    /// or finalizing, `None` in steady state.
    pub fn calibration_tag(&self) -> Option<CalibrationPhase> {
        match &self.stage {
            Stage::Calibration(calibration) => calibration.active.map(|active| active.phase),
            _ => None,
        }
    }

    /// Countdown ticks still to go are tracked by the coach; this only tells
    /// whether the phase has passed its countdown.
    pub fn is_finalizing(&self, phase: CalibrationPhase) -> bool {
        matches!(
            &self.stage,
            Stage::Calibration(Calibration {
                active: Some(ActivePhase {
                    phase: active,
                    status: PhaseStatus::Finalizing,
                }),
                ..
            }) if *active == phase
        )
    }

    pub fn can_begin(&self, phase: CalibrationPhase) -> bool {
        self.check_begin(phase).is_ok()
    }

    pub fn can_complete(&self) -> bool {
        self.check_complete().is_ok()
    }

    fn invalid(&self, action: &str) -> CoachError {
        CoachError::InvalidTransition {
            action: action.to_string(),
            mode: self.mode(),
        }
    }

    pub fn get_started(&mut self) -> Result<(), CoachError> {
        match self.stage {
            Stage::Idle => {
                self.stage = Stage::Setup;
                Ok(())
            }
            _ => Err(self.invalid("get started")),
        }
    }

    pub fn select_arm(&mut self, arm_side: ArmSide) -> Result<(), CoachError> {
        match self.stage {
            Stage::Setup => {
                self.arm_side = arm_side;
                info!("Tracking {}", arm_side);
                Ok(())
            }
            _ => Err(self.invalid("change the tracked arm")),
        }
    }

    /// Camera granted: enter calibration with a clean slate.
    pub fn enter_calibration(&mut self) -> Result<Epoch, CoachError> {
        match self.stage {
            Stage::Setup => Ok(self.restart_calibration()),
            _ => Err(self.invalid("start the camera")),
        }
    }

    fn check_begin(&self, phase: CalibrationPhase) -> Result<(), CoachError> {
        let Stage::Calibration(calibration) = &self.stage else {
            return Err(self.invalid(&format!("calibrate {phase}")));
        };
        if let Some(active) = calibration.active {
            return Err(CoachError::PhaseInProgress {
                phase: active.phase,
            });
        }
        if phase == CalibrationPhase::Max && calibration.min.is_none() {
            return Err(CoachError::MinCalibrationIncomplete);
        }
        Ok(())
    }

    pub fn begin_phase(&mut self, phase: CalibrationPhase) -> Result<(), CoachError> {
        self.check_begin(phase)?;
        if let Stage::Calibration(calibration) = &mut self.stage {
            calibration.active = Some(ActivePhase {
                phase,
                status: PhaseStatus::Sampling,
            });
            // the calibrated flag only ever covers the latest MIN/MAX pair
            calibration.max = None;
            calibration.calibrated = false;
        }
        info!("{} calibration started", phase);
        Ok(())
    }

    /// Countdown of `phase` ran out; the finalize signal goes out next.
    pub fn expire_phase(&mut self, phase: CalibrationPhase) -> Result<(), CoachError> {
        let error = self.invalid(&format!("finalize {phase} calibration"));
        match &mut self.stage {
            Stage::Calibration(Calibration {
                active: Some(active),
                ..
            }) if active.phase == phase && active.status == PhaseStatus::Sampling => {
                active.status = PhaseStatus::Finalizing;
                Ok(())
            }
            _ => Err(error),
        }
    }

    /// Settle delay after the finalize signal elapsed; the calibration screen
    /// goes back to its steady state.
    pub fn settle_phase(&mut self, phase: CalibrationPhase) {
        if let Stage::Calibration(calibration) = &mut self.stage {
            if calibration
                .active
                .is_some_and(|active| active.phase == phase)
            {
                calibration.active = None;
                if phase == CalibrationPhase::Min && calibration.min.is_none() {
                    warn!("MIN calibration finished without a result from the service");
                }
                if phase == CalibrationPhase::Max && calibration.max.is_none() {
                    warn!("MAX calibration finished without a result from the service");
                }
            }
        }
    }

    fn check_complete(&self) -> Result<AngleRange, CoachError> {
        let Stage::Calibration(calibration) = &self.stage else {
            return Err(self.invalid("complete calibration"));
        };
        if let Some(active) = calibration.active {
            return Err(CoachError::PhaseInProgress {
                phase: active.phase,
            });
        }
        let (Some(min), Some(max)) = (calibration.min, calibration.max) else {
            return Err(CoachError::CalibrationIncomplete);
        };
        if !calibration.calibrated {
            return Err(CoachError::CalibrationNotAcknowledged);
        }
        Ok(AngleRange { min, max })
    }

    pub fn complete_calibration(&mut self) -> Result<AngleRange, CoachError> {
        let range = self.check_complete()?;
        self.stage = Stage::Training(Training {
            range,
            rep_count: 0,
            progress: 0.,
            current_angle: None,
        });
        self.epoch = self.epoch.next();
        info!("Calibration complete, training with range {}", range);
        Ok(range)
    }

    /// Drops the calibrated range and goes back to the calibration screen.
    pub fn recalibrate(&mut self) -> Result<Epoch, CoachError> {
        match self.stage {
            Stage::Training(_) => Ok(self.restart_calibration()),
            _ => Err(self.invalid("recalibrate")),
        }
    }

    /// Resets calibration after the service lost its state (for example on a
    /// dropped connection). Only meaningful on the calibration and training
    /// screens; returns `None` elsewhere.
    pub fn reset_calibration(&mut self) -> Option<Epoch> {
        match self.stage {
            Stage::Calibration(_) | Stage::Training(_) => Some(self.restart_calibration()),
            _ => None,
        }
    }

    fn restart_calibration(&mut self) -> Epoch {
        self.stage = Stage::Calibration(Calibration::default());
        self.epoch = self.epoch.next();
        self.epoch
    }

    pub fn go_home(&mut self) -> Epoch {
        self.stage = Stage::Idle;
        self.epoch = self.epoch.next();
        self.epoch
    }

    /// The camera could not be reacquired for a new pipeline; back to the
    /// setup screen with the arm selection kept.
    pub fn return_to_setup(&mut self) -> Epoch {
        self.stage = Stage::Setup;
        self.epoch = self.epoch.next();
        self.epoch
    }

    /// Reset only touches the rep counter, and only the service can zero it,
    /// so this just validates that a reset makes sense now.
    pub fn check_reset(&self) -> Result<(), CoachError> {
        match self.stage {
            Stage::Training(_) => Ok(()),
            _ => Err(self.invalid("reset the counter")),
        }
    }

    /// Applies a reply from the service.
    ///
    /// Fields are applied one by one and only when present, so a reply
    /// without a count never clears the displayed count.
    pub fn apply(&mut self, envelope: &Envelope<ServerMessage>) -> ReplyOutcome {
        match &envelope.message {
            ServerMessage::ArmSideSet { arm_side } => {
                info!("Service tracking {}", arm_side);
                ReplyOutcome::Applied
            }
            ServerMessage::CalibrationMinStarted | ServerMessage::CalibrationMaxStarted => {
                debug!("Service acknowledged {}", envelope.message.event_name());
                ReplyOutcome::Applied
            }
            ServerMessage::Error { message } => {
                warn!("Analysis service error: {}", message);
                ReplyOutcome::Applied
            }
            message => {
                if envelope.epoch != Some(self.epoch) {
                    debug!(
                        "Dropping {} from epoch {:?}, current epoch is {}",
                        message.event_name(),
                        envelope.epoch.map(Epoch::value),
                        self.epoch.value()
                    );
                    return ReplyOutcome::Stale;
                }
                self.apply_current(message)
            }
        }
    }

    fn apply_current(&mut self, message: &ServerMessage) -> ReplyOutcome {
        match (message, &mut self.stage) {
            (ServerMessage::CalibrationMinComplete { min_angle }, Stage::Calibration(calibration)) => {
                calibration.min = Some(degrees(*min_angle));
                info!("MIN calibration complete: {}°", min_angle);
                ReplyOutcome::Applied
            }
            (
                ServerMessage::CalibrationMaxComplete {
                    max_angle,
                    calibrated,
                },
                Stage::Calibration(calibration),
            ) => {
                calibration.max = Some(degrees(*max_angle));
                calibration.calibrated = calibrated.unwrap_or(false) && calibration.min.is_some();
                if calibration.calibrated {
                    info!("MAX calibration complete: {}°, fully calibrated", max_angle);
                } else {
                    warn!(
                        "MAX calibration returned {}° but the service did not confirm calibration",
                        max_angle
                    );
                }
                ReplyOutcome::Applied
            }
            (ServerMessage::FrameProcessed(result), stage) => Self::apply_frame(result, stage),
            (ServerMessage::CounterReset { count }, Stage::Training(training)) => {
                training.rep_count = *count;
                training.progress = 0.;
                ReplyOutcome::Applied
            }
            (message, _) => {
                debug!("Ignoring {} in the current mode", message.event_name());
                ReplyOutcome::Ignored
            }
        }
    }

    fn apply_frame(result: &FrameResult, stage: &mut Stage) -> ReplyOutcome {
        match stage {
            Stage::Calibration(calibration) => {
                if let Some(angle) = result.angle {
                    calibration.current_angle = Some(degrees(angle));
                }
                ReplyOutcome::Applied
            }
            Stage::Training(training) => {
                if let Some(angle) = result.angle {
                    training.current_angle = Some(degrees(angle));
                }
                // only counter_reset may lower the count
                match result.count {
                    Some(count) if count < training.rep_count => debug!(
                        "Ignoring service count {} below displayed count {}",
                        count, training.rep_count
                    ),
                    Some(count) => training.rep_count = count,
                    None => {}
                }
                if let Some(percentage) = result.percentage {
                    training.progress = percentage.clamp(0., 100.);
                }
                ReplyOutcome::Applied
            }
            _ => ReplyOutcome::Ignored,
        }
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn arb_frame_result() -> impl Strategy<Value = FrameResult> {
        (
            proptest::option::of(0.0f32..180.0),
            proptest::option::of(0u32..50),
            proptest::option::of(0.0f32..100.0),
        )
            .prop_map(|(angle, count, percentage)| FrameResult {
                angle,
                count,
                percentage,
                ..Default::default()
            })
    }

    proptest! {
        /// The displayed count is the highest count the service reported,
        /// whatever the fields in between.
        #[test]
        fn prop_count_tracks_highest_reported(results in proptest::collection::vec(arb_frame_result(), 1..40)) {
            let mut session = Session::new();
            session.get_started().unwrap();
            session.enter_calibration().unwrap();
            session.begin_phase(CalibrationPhase::Min).unwrap();
            session.apply(&Envelope::new(session.epoch(), ServerMessage::CalibrationMinComplete { min_angle: 30. }));
            session.settle_phase(CalibrationPhase::Min);
            session.begin_phase(CalibrationPhase::Max).unwrap();
            session.apply(&Envelope::new(session.epoch(), ServerMessage::CalibrationMaxComplete { max_angle: 150., calibrated: Some(true) }));
            session.settle_phase(CalibrationPhase::Max);
            session.complete_calibration().unwrap();

            let mut expected_count = 0;
            let mut expected_progress = 0.;
            for result in results {
                if let Some(count) = result.count {
                    expected_count = expected_count.max(count);
                }
                if let Some(percentage) = result.percentage {
                    expected_progress = percentage;
                }
                session.apply(&Envelope::new(session.epoch(), ServerMessage::FrameProcessed(result)));
                prop_assert_eq!(session.rep_count(), expected_count);
                prop_assert_eq!(session.progress_percentage(), expected_progress);
            }
        }

        /// Replies tagged with any other epoch never change the session.
        #[test]
        fn prop_foreign_epochs_are_stale(offset in 1u64..1000, count in 0u32..100) {
            let mut session = Session::new();
            session.get_started().unwrap();
            session.enter_calibration().unwrap();
            let foreign = Epoch::new(session.epoch().value() + offset);
            let outcome = session.apply(&Envelope::new(foreign, ServerMessage::CalibrationMinComplete { min_angle: count as f32 }));
            prop_assert_eq!(outcome, ReplyOutcome::Stale);
            prop_assert_eq!(session.min_angle(), None);
        }
    }
}
