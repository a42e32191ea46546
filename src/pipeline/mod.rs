//! The capture pipeline: a render loop and an analysis dispatcher running on
//! separate timers against the same camera acquisition.

pub mod dispatcher;
pub mod overlay;
pub mod render;

use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::{
    CoachError,
    camera::{DeviceId, VideoSampler},
    coach::CoachTimer,
    config::CoachConfig,
    protocol::FrameRequest,
    scheduler::{Scheduler, TimerHandle, next_period},
    session::CalibrationPhase,
};

pub use dispatcher::{AnalysisDispatcher, Dispatch, Skip};
pub use overlay::{Overlay, OverlaySlot};
pub use render::{CanvasSurface, RenderLoop, Surface};

/// One running pair of render and dispatch loops.
///
/// The pipeline borrows the camera through its `DeviceId`; the coach owns the
/// device and releases it after `stop`. Dropping the pipeline drops the
/// in-flight flag and the overlay with it.
#[derive(Debug)]
pub struct Pipeline {
    device: DeviceId,
    refresh_interval: Duration,
    dispatch_interval: Duration,
    dispatcher: AnalysisDispatcher,
    render: RenderLoop,
    overlay: OverlaySlot,
    render_timer: TimerHandle,
    dispatch_timer: TimerHandle,
}

impl Pipeline {
    /// Starts both loops; the first render and dispatch ticks are due `now`.
    pub fn start(
        device: DeviceId,
        config: &CoachConfig,
        now: Instant,
        scheduler: &mut Scheduler<CoachTimer>,
    ) -> Self {
        let render_timer = scheduler.schedule_at(now, CoachTimer::RenderFrame { device });
        let dispatch_timer = scheduler.schedule_at(now, CoachTimer::DispatchTick { device });
        debug!("Pipeline started on device {device}");
        Self {
            device,
            refresh_interval: config.refresh_interval(),
            dispatch_interval: config.dispatch_interval(),
            dispatcher: AnalysisDispatcher::new(config.dispatch_interval(), config.jpeg_quality),
            render: RenderLoop::new(),
            overlay: OverlaySlot::new(),
            render_timer,
            dispatch_timer,
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn dispatcher(&self) -> &AnalysisDispatcher {
        &self.dispatcher
    }

    pub fn render_loop(&self) -> &RenderLoop {
        &self.render
    }

    pub fn overlay(&self) -> Option<&Overlay> {
        self.overlay.current()
    }

    pub fn is_in_flight(&self) -> bool {
        self.dispatcher.is_in_flight()
    }

    /// Handles a render tick scheduled for `deadline` and schedules the next.
    pub fn on_render<S: Surface + ?Sized>(
        &mut self,
        deadline: Instant,
        now: Instant,
        sampler: &mut VideoSampler,
        surface: &mut S,
        scheduler: &mut Scheduler<CoachTimer>,
    ) {
        let frame = sampler.frame(self.device);
        self.render
            .tick(self.device, frame, self.overlay.current(), surface);
        self.render_timer = scheduler.schedule_at(
            next_period(deadline, self.refresh_interval, now),
            CoachTimer::RenderFrame {
                device: self.device,
            },
        );
    }

    /// Handles a dispatch tick and schedules the next. Returns the request to
    /// send when one was admitted.
    pub fn on_dispatch(
        &mut self,
        deadline: Instant,
        now: Instant,
        sampler: &mut VideoSampler,
        calibration_mode: Option<CalibrationPhase>,
        scheduler: &mut Scheduler<CoachTimer>,
    ) -> Result<Option<FrameRequest>, CoachError> {
        self.dispatch_timer = scheduler.schedule_at(
            next_period(deadline, self.dispatch_interval, now),
            CoachTimer::DispatchTick {
                device: self.device,
            },
        );
        let frame = sampler.frame(self.device);
        match self.dispatcher.tick(now, frame, calibration_mode)? {
            Dispatch::Issued(request) => Ok(Some(request)),
            Dispatch::Skipped(_) => Ok(None),
        }
    }

    /// A `frame_processed` reply for this pipeline arrived. Clears the
    /// in-flight flag, then swaps in the overlay if it decodes.
    pub fn on_reply(&mut self, processed_image: Option<&str>) {
        self.dispatcher.on_reply();
        if let Some(payload) = processed_image {
            if let Err(e) = self.overlay.offer(payload) {
                warn!("Keeping previous overlay, processed image unusable: {e}");
            }
        }
    }

    pub fn cancel_in_flight(&mut self) {
        self.dispatcher.cancel_in_flight();
    }

    /// Cancels both loops and returns the device so the owner can release it.
    pub fn stop(self, scheduler: &mut Scheduler<CoachTimer>) -> DeviceId {
        scheduler.cancel(self.render_timer);
        scheduler.cancel(self.dispatch_timer);
        debug!("Pipeline on device {} stopped", self.device);
        self.device
    }
}
