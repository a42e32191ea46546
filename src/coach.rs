//! The coach ties the session, the camera, the capture pipeline and the
//! transport together on one thread.
//!
//! Nothing in here runs on its own. User actions are method calls, and
//! `advance(now)` first drains the transport and then runs every timer due at
//! `now`: render ticks, dispatch ticks, countdown ticks and settle delays.

use std::{collections::VecDeque, sync::mpsc::Sender, time::Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    CoachError,
    camera::{CameraBackend, DeviceId, VideoSampler},
    config::CoachConfig,
    pipeline::{Pipeline, Surface},
    protocol::{ClientMessage, Envelope, Epoch, ServerMessage},
    scheduler::{Scheduler, TimerHandle},
    session::{
        ArmSide, CalibrationPhase, Countdown, CountdownStatus, Mode, ReplyOutcome, Session,
    },
    transport::{Transport, TransportEvent},
    writer::SessionEvent,
};

pub const RECALIBRATE_QUESTION: &str =
    "Recalibrate? This will reset your current calibration and rep count.";
pub const GO_HOME_QUESTION: &str = "Return to home? Your current progress will be lost.";

/// Timer events driving the coach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoachTimer {
    RenderFrame { device: DeviceId },
    DispatchTick { device: DeviceId },
    CountdownTick { phase: CalibrationPhase },
    SettleElapsed { phase: CalibrationPhase, epoch: Epoch },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// Camera could not be acquired
    Device,
    /// Action rejected locally
    Validation,
    /// Error reported by the analysis service
    Service,
    Connection,
}

/// A message for the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
}

/// Asks the user to confirm a destructive action.
pub trait Prompt {
    fn confirm(&mut self, question: &str) -> bool;
}

impl<F: FnMut(&str) -> bool> Prompt for F {
    fn confirm(&mut self, question: &str) -> bool {
        self(question)
    }
}

fn notice_kind(error: &CoachError) -> NoticeKind {
    if error.is_validation() {
        return NoticeKind::Validation;
    }
    match error {
        CoachError::CameraUnavailable { .. } => NoticeKind::Device,
        CoachError::NotConnected | CoachError::TransportIOError { .. } => NoticeKind::Connection,
        _ => NoticeKind::Service,
    }
}

pub struct Coach<T, S> {
    config: CoachConfig,
    session: Session,
    sampler: VideoSampler,
    transport: T,
    surface: S,
    scheduler: Scheduler<CoachTimer>,
    pipeline: Option<Pipeline>,
    countdown: Option<Countdown>,
    settle: Option<TimerHandle>,
    notices: VecDeque<Notice>,
    events: Option<Sender<SessionEvent>>,
    recorded: (Mode, Epoch),
}

impl<T: Transport, S: Surface> Coach<T, S> {
    pub fn new(
        config: CoachConfig,
        camera: Box<dyn CameraBackend>,
        transport: T,
        surface: S,
    ) -> Self {
        let sampler = VideoSampler::new(camera, config.capture.clone());
        let session = Session::new();
        let recorded = (session.mode(), session.epoch());
        Self {
            config,
            session,
            sampler,
            transport,
            surface,
            scheduler: Scheduler::new(),
            pipeline: None,
            countdown: None,
            settle: None,
            notices: VecDeque::new(),
            events: None,
            recorded,
        }
    }

    /// Sends every session event to `events`, typically the event log writer.
    pub fn with_event_log(mut self, events: Sender<SessionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn config(&self) -> &CoachConfig {
        &self.config
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn pipeline(&self) -> Option<&Pipeline> {
        self.pipeline.as_ref()
    }

    pub fn active_device(&self) -> Option<DeviceId> {
        self.sampler.active_device()
    }

    /// Phase and remaining units of the running countdown.
    pub fn countdown(&self) -> Option<(CalibrationPhase, u32)> {
        self.countdown
            .as_ref()
            .map(|countdown| (countdown.phase(), countdown.remaining()))
    }

    pub fn is_settling(&self) -> bool {
        self.settle
            .is_some_and(|settle| self.scheduler.is_scheduled(settle))
    }

    pub fn pending_timers(&self) -> usize {
        self.scheduler.len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduler.next_deadline()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        self.notices.drain(..).collect()
    }

    pub fn get_started(&mut self) -> Result<(), CoachError> {
        let result = self.session.get_started();
        self.finish(result)
    }

    pub fn select_arm(&mut self, arm_side: ArmSide) -> Result<(), CoachError> {
        let result = self.session.select_arm(arm_side);
        if result.is_ok() {
            // resent on calibration entry, a failure here is harmless
            let envelope = Envelope::new(
                self.session.epoch(),
                ClientMessage::SetArmSide { arm_side },
            );
            if let Err(e) = self.transport.send(&envelope) {
                debug!("Arm side not sent yet: {e}");
            }
        }
        self.finish(result)
    }

    /// Acquires the camera and enters calibration. A denied or missing camera
    /// leaves the session in setup.
    pub fn start_camera(&mut self, now: Instant) -> Result<(), CoachError> {
        let result = self.try_start_camera(now);
        self.finish(result)
    }

    fn try_start_camera(&mut self, now: Instant) -> Result<(), CoachError> {
        if self.session.mode() != Mode::Setup {
            return Err(self.invalid("start the camera"));
        }
        let device = self.sampler.acquire()?;
        if let Err(e) = self.session.enter_calibration() {
            self.sampler.release(device);
            return Err(e);
        }
        self.pipeline = Some(Pipeline::start(
            device,
            &self.config,
            now,
            &mut self.scheduler,
        ));
        self.send_arm_side();
        Ok(())
    }

    pub fn calibrate_min(&mut self, now: Instant) -> Result<(), CoachError> {
        self.calibrate(CalibrationPhase::Min, now)
    }

    pub fn calibrate_max(&mut self, now: Instant) -> Result<(), CoachError> {
        self.calibrate(CalibrationPhase::Max, now)
    }

    fn calibrate(&mut self, phase: CalibrationPhase, now: Instant) -> Result<(), CoachError> {
        let result = self.session.begin_phase(phase);
        if result.is_ok() {
            self.send(ClientMessage::start_calibration(phase));
            self.countdown = Some(Countdown::start(
                phase,
                self.config.countdown_units,
                self.config.countdown_unit(),
                now,
                &mut self.scheduler,
                |phase| CoachTimer::CountdownTick { phase },
            ));
        }
        self.finish(result)
    }

    /// Moves to training with the calibrated range. The capture pipeline is
    /// restarted for the new session.
    pub fn complete_calibration(&mut self, now: Instant) -> Result<(), CoachError> {
        let result = self
            .session
            .complete_calibration()
            .and_then(|_| self.restart_pipeline(now));
        self.finish(result)
    }

    /// Asks the service to zero the counter. The displayed count changes when
    /// the service acknowledges.
    pub fn reset_count(&mut self) -> Result<(), CoachError> {
        let result = self.session.check_reset().and_then(|_| {
            let envelope = Envelope::new(self.session.epoch(), ClientMessage::ResetCounter);
            self.transport.send(&envelope)
        });
        self.finish(result)
    }

    /// Drops the calibration and starts over, after the user confirmed.
    /// Returns false when the user declined.
    pub fn recalibrate(
        &mut self,
        now: Instant,
        prompt: &mut impl Prompt,
    ) -> Result<bool, CoachError> {
        if self.session.mode() != Mode::Training {
            let error = self.invalid("recalibrate");
            return self.finish(Err(error));
        }
        if !prompt.confirm(RECALIBRATE_QUESTION) {
            return Ok(false);
        }
        let result = self.session.recalibrate().and_then(|_| {
            self.restart_pipeline(now)?;
            self.send_arm_side();
            Ok(true)
        });
        self.finish(result)
    }

    /// Tears everything down and returns to the landing screen. Asks for
    /// confirmation while calibrating or training; returns false when the user
    /// declined.
    pub fn go_home(&mut self, prompt: &mut impl Prompt) -> bool {
        let in_progress = !matches!(self.session.mode(), Mode::Idle | Mode::Setup);
        if in_progress && !prompt.confirm(GO_HOME_QUESTION) {
            return false;
        }
        self.teardown();
        self.session.go_home();
        self.record_mode();
        true
    }

    /// Handles everything due at `now`: transport events first, in arrival
    /// order, then timers in deadline order.
    pub fn advance(&mut self, now: Instant) {
        while let Some(event) = self.transport.poll(now) {
            self.handle_transport_event(event, now);
        }
        while let Some((_, deadline, timer)) = self.scheduler.pop_due(now) {
            self.handle_timer(timer, deadline, now);
        }
        self.record_mode();
    }

    fn handle_timer(&mut self, timer: CoachTimer, deadline: Instant, now: Instant) {
        match timer {
            CoachTimer::RenderFrame { device } => {
                if let Some(pipeline) = self
                    .pipeline
                    .as_mut()
                    .filter(|pipeline| pipeline.device() == device)
                {
                    pipeline.on_render(
                        deadline,
                        now,
                        &mut self.sampler,
                        &mut self.surface,
                        &mut self.scheduler,
                    );
                }
            }
            CoachTimer::DispatchTick { device } => self.dispatch(device, deadline, now),
            CoachTimer::CountdownTick { phase } => self.countdown_tick(phase, deadline),
            CoachTimer::SettleElapsed { phase, epoch } => {
                self.settle = None;
                if epoch == self.session.epoch() {
                    self.session.settle_phase(phase);
                }
            }
        }
    }

    fn dispatch(&mut self, device: DeviceId, deadline: Instant, now: Instant) {
        let tag = self.session.calibration_tag();
        let epoch = self.session.epoch();
        let Some(pipeline) = self
            .pipeline
            .as_mut()
            .filter(|pipeline| pipeline.device() == device)
        else {
            return;
        };
        match pipeline.on_dispatch(deadline, now, &mut self.sampler, tag, &mut self.scheduler) {
            Ok(Some(request)) => {
                let envelope = Envelope::new(epoch, ClientMessage::ProcessFrame(request));
                if let Err(e) = self.transport.send(&envelope) {
                    debug!("Frame not sent: {e}");
                    pipeline.cancel_in_flight();
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Could not encode frame for analysis: {e}"),
        }
    }

    fn countdown_tick(&mut self, phase: CalibrationPhase, deadline: Instant) {
        let Some(countdown) = self
            .countdown
            .as_mut()
            .filter(|countdown| countdown.phase() == phase)
        else {
            return;
        };
        match countdown.on_tick(deadline, &mut self.scheduler, |phase| {
            CoachTimer::CountdownTick { phase }
        }) {
            CountdownStatus::Running { remaining } => {
                debug!("{phase} calibration: {remaining} remaining")
            }
            CountdownStatus::Expired => {
                self.countdown = None;
                if let Err(e) = self.session.expire_phase(phase) {
                    warn!("Countdown expired out of turn: {e}");
                    return;
                }
                self.send(ClientMessage::complete_calibration(phase));
                self.settle = Some(self.scheduler.schedule_at(
                    deadline + self.config.settle_delay(),
                    CoachTimer::SettleElapsed {
                        phase,
                        epoch: self.session.epoch(),
                    },
                ));
            }
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::Connected => {
                info!("Connected to the analysis service");
                if self.pipeline.is_some() {
                    self.send_arm_side();
                }
            }
            TransportEvent::Disconnected { reason } => {
                self.notify(
                    NoticeKind::Connection,
                    format!("Connection to the analysis service lost: {reason}"),
                );
                if let Some(pipeline) = self.pipeline.as_mut() {
                    pipeline.cancel_in_flight();
                }
                // the service forgot the calibration along with the connection
                if self.session.reset_calibration().is_some() {
                    if let Err(e) = self.restart_pipeline(now) {
                        self.notify(notice_kind(&e), e.to_string());
                    }
                }
            }
            TransportEvent::Message(envelope) => self.handle_reply(envelope),
            TransportEvent::Malformed { event, error } => {
                warn!("Malformed message from the analysis service: {error}");
                if event.as_deref() == Some(ServerMessage::FRAME_PROCESSED) {
                    if let Some(pipeline) = self.pipeline.as_mut() {
                        pipeline.on_reply(None);
                    }
                }
                self.notify(NoticeKind::Service, error.to_string());
            }
        }
    }

    fn handle_reply(&mut self, envelope: Envelope<ServerMessage>) {
        match &envelope.message {
            ServerMessage::FrameProcessed(result) => {
                if envelope.epoch != Some(self.session.epoch()) {
                    debug!(
                        "Dropping frame result from epoch {:?}",
                        envelope.epoch.map(Epoch::value)
                    );
                    return;
                }
                let Some(pipeline) = self.pipeline.as_mut() else {
                    return;
                };
                pipeline.on_reply(result.processed_image.as_deref());

                let before = (
                    self.session.rep_count(),
                    self.session.progress_percentage(),
                );
                self.session.apply(&envelope);
                let after = (
                    self.session.rep_count(),
                    self.session.progress_percentage(),
                );
                if self.session.mode() == Mode::Training && before != after {
                    self.emit(SessionEvent::Progress {
                        count: after.0,
                        percentage: after.1,
                    });
                }
            }
            ServerMessage::Error { message } => {
                // an error answering an earlier session leaves the current
                // request outstanding
                let current = envelope
                    .epoch
                    .is_none_or(|epoch| epoch == self.session.epoch());
                if let Some(pipeline) = self.pipeline.as_mut().filter(|_| current) {
                    pipeline.cancel_in_flight();
                }
                self.notify(NoticeKind::Service, message.clone());
                self.session.apply(&envelope);
            }
            ServerMessage::CalibrationMinComplete { min_angle } => {
                if self.session.apply(&envelope) == ReplyOutcome::Applied {
                    self.emit(SessionEvent::CalibrationResult {
                        phase: CalibrationPhase::Min,
                        angle: *min_angle,
                        calibrated: false,
                    });
                }
            }
            ServerMessage::CalibrationMaxComplete { max_angle, .. } => {
                if self.session.apply(&envelope) == ReplyOutcome::Applied {
                    let calibrated = self.session.is_calibrated();
                    if !calibrated {
                        self.notify(
                            NoticeKind::Service,
                            CoachError::CalibrationNotAcknowledged.to_string(),
                        );
                    }
                    self.emit(SessionEvent::CalibrationResult {
                        phase: CalibrationPhase::Max,
                        angle: *max_angle,
                        calibrated,
                    });
                }
            }
            ServerMessage::CounterReset { count } => {
                if self.session.apply(&envelope) == ReplyOutcome::Applied {
                    self.emit(SessionEvent::Progress {
                        count: *count,
                        percentage: self.session.progress_percentage(),
                    });
                }
            }
            _ => {
                self.session.apply(&envelope);
            }
        }
    }

    /// Stops the pipeline, releases the camera and cancels every calibration
    /// timer. Dropping the pipeline clears the in-flight flag and the overlay.
    fn teardown(&mut self) {
        if let Some(countdown) = self.countdown.take() {
            countdown.cancel(&mut self.scheduler);
        }
        if let Some(settle) = self.settle.take() {
            self.scheduler.cancel(settle);
        }
        if let Some(pipeline) = self.pipeline.take() {
            let device = pipeline.stop(&mut self.scheduler);
            self.sampler.release(device);
        }
    }

    /// Tears the current pipeline down and starts a new one. When the camera
    /// cannot be reacquired the session falls back to setup.
    fn restart_pipeline(&mut self, now: Instant) -> Result<(), CoachError> {
        self.teardown();
        match self.sampler.acquire() {
            Ok(device) => {
                self.pipeline = Some(Pipeline::start(
                    device,
                    &self.config,
                    now,
                    &mut self.scheduler,
                ));
                Ok(())
            }
            Err(e) => {
                self.session.return_to_setup();
                Err(e)
            }
        }
    }

    fn send_arm_side(&mut self) {
        self.send(ClientMessage::SetArmSide {
            arm_side: self.session.arm_side(),
        });
    }

    /// Sends a control message for the current epoch. A failure is reported
    /// to the user but does not undo the transition that caused it.
    fn send(&mut self, message: ClientMessage) {
        let envelope = Envelope::new(self.session.epoch(), message);
        if let Err(e) = self.transport.send(&envelope) {
            self.notify(notice_kind(&e), e.to_string());
        }
    }

    fn invalid(&self, action: &str) -> CoachError {
        CoachError::InvalidTransition {
            action: action.to_string(),
            mode: self.session.mode(),
        }
    }

    fn finish<R>(&mut self, result: Result<R, CoachError>) -> Result<R, CoachError> {
        if let Err(e) = &result {
            self.notify(notice_kind(e), e.to_string());
        }
        self.record_mode();
        result
    }

    fn notify(&mut self, kind: NoticeKind, message: String) {
        match kind {
            NoticeKind::Validation => info!("{message}"),
            _ => warn!("{message}"),
        }
        self.emit(SessionEvent::Notice {
            kind,
            message: message.clone(),
        });
        self.notices.push_back(Notice { kind, message });
    }

    fn record_mode(&mut self) {
        let current = (self.session.mode(), self.session.epoch());
        if current == self.recorded {
            return;
        }
        self.recorded = current;
        debug!("Session is {} (epoch {})", current.0, current.1.value());
        self.emit(SessionEvent::ModeChanged {
            mode: current.0,
            epoch: current.1,
            arm_side: self.session.arm_side(),
        });
    }

    fn emit(&mut self, event: SessionEvent) {
        let closed = self
            .events
            .as_ref()
            .is_some_and(|events| events.send(event).is_err());
        if closed {
            warn!("Session event log closed, no longer recording events");
            self.events = None;
        }
    }
}
