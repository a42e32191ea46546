use std::time::{Duration, Instant};

use image::RgbImage;
use log::trace;

use crate::{
    CoachError, frame::encode_jpeg_data_url, protocol::FrameRequest, session::CalibrationPhase,
};

/// Why a dispatch tick did not produce a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    /// Less than one throttle interval since the last request was issued
    Throttled,
    /// The previous request has not been answered yet
    InFlight,
    /// The camera has no decodable frame
    NoFrame,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Issued(FrameRequest),
    Skipped(Skip),
}

/// Issues analysis requests with at most one outstanding at a time.
///
/// A new request goes out only when the camera has a frame, nothing is in
/// flight, and one throttle interval passed since the last request was
/// *issued*. Frames that do not qualify are dropped, never queued.
#[derive(Debug)]
pub struct AnalysisDispatcher {
    interval: Duration,
    jpeg_quality: u8,
    in_flight: bool,
    last_issued: Option<Instant>,
    issued: u64,
    replies: u64,
}

impl AnalysisDispatcher {
    pub fn new(interval: Duration, jpeg_quality: u8) -> Self {
        Self {
            interval,
            jpeg_quality,
            in_flight: false,
            last_issued: None,
            issued: 0,
            replies: 0,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn issued(&self) -> u64 {
        self.issued
    }

    pub fn replies(&self) -> u64 {
        self.replies
    }

    /// Runs one dispatch tick. On `Issued` the request counts as in flight
    /// until `on_reply` or `cancel_in_flight` is called.
    pub fn tick(
        &mut self,
        now: Instant,
        frame: Option<&RgbImage>,
        calibration_mode: Option<CalibrationPhase>,
    ) -> Result<Dispatch, CoachError> {
        if self
            .last_issued
            .is_some_and(|last| now.duration_since(last) < self.interval)
        {
            return Ok(Dispatch::Skipped(Skip::Throttled));
        }
        if self.in_flight {
            trace!("Dropping sample, previous request still in flight");
            return Ok(Dispatch::Skipped(Skip::InFlight));
        }
        let Some(frame) = frame else {
            return Ok(Dispatch::Skipped(Skip::NoFrame));
        };

        let image = encode_jpeg_data_url(frame, self.jpeg_quality)?;
        self.in_flight = true;
        self.last_issued = Some(now);
        self.issued += 1;
        Ok(Dispatch::Issued(FrameRequest {
            image,
            calibration_mode,
        }))
    }

    /// A reply for the outstanding request arrived. Must run before anything
    /// else looks at the reply so a broken reply can never wedge the loop.
    pub fn on_reply(&mut self) {
        self.in_flight = false;
        self.replies += 1;
    }

    /// The outstanding request will never be answered (send failed or the
    /// connection dropped).
    pub fn cancel_in_flight(&mut self) {
        self.in_flight = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn frame() -> RgbImage {
        RgbImage::from_pixel(8, 6, Rgb([10, 20, 30]))
    }

    #[test]
    fn test_first_tick_issues_tagged_request() {
        let t0 = Instant::now();
        let mut dispatcher = AnalysisDispatcher::new(ms(40), 65);
        let frame = frame();

        match dispatcher
            .tick(t0, Some(&frame), Some(CalibrationPhase::Max))
            .unwrap()
        {
            Dispatch::Issued(request) => {
                assert_eq!(request.calibration_mode, Some(CalibrationPhase::Max));
                assert!(request.image.starts_with("data:image/jpeg;base64,"));
            }
            other => panic!("expected a request, got {other:?}"),
        }
        assert!(dispatcher.is_in_flight());
    }

    #[test]
    fn test_no_frame_issues_nothing() {
        let t0 = Instant::now();
        let mut dispatcher = AnalysisDispatcher::new(ms(40), 65);
        assert_eq!(
            dispatcher.tick(t0, None, None).unwrap(),
            Dispatch::Skipped(Skip::NoFrame)
        );
        assert!(!dispatcher.is_in_flight());
        assert_eq!(dispatcher.issued(), 0);
    }

    #[test]
    fn test_throttle_counts_from_issue_not_reply() {
        let t0 = Instant::now();
        let mut dispatcher = AnalysisDispatcher::new(ms(40), 65);
        let frame = frame();

        dispatcher.tick(t0, Some(&frame), None).unwrap();
        dispatcher.on_reply();
        assert_eq!(
            dispatcher.tick(t0 + ms(39), Some(&frame), None).unwrap(),
            Dispatch::Skipped(Skip::Throttled)
        );
        assert!(matches!(
            dispatcher.tick(t0 + ms(40), Some(&frame), None).unwrap(),
            Dispatch::Issued(_)
        ));
    }

    #[test]
    fn test_in_flight_blocks_until_reply() {
        let t0 = Instant::now();
        let mut dispatcher = AnalysisDispatcher::new(ms(40), 65);
        let frame = frame();

        dispatcher.tick(t0, Some(&frame), None).unwrap();
        assert_eq!(
            dispatcher.tick(t0 + ms(500), Some(&frame), None).unwrap(),
            Dispatch::Skipped(Skip::InFlight)
        );
        dispatcher.cancel_in_flight();
        assert!(matches!(
            dispatcher.tick(t0 + ms(501), Some(&frame), None).unwrap(),
            Dispatch::Issued(_)
        ));
        assert_eq!(dispatcher.issued(), 2);
    }
}
