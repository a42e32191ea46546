use std::{cell::RefCell, rc::Rc};

use image::{Rgb, RgbImage};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::CoachError;

/// Identifies one acquisition of the camera. A new id is handed out every
/// time the device is acquired, so work scheduled against a released device
/// can be told apart from work for the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(u64);

impl DeviceId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resolution and frame rate hints passed to the camera when it is opened.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CaptureHints {
    pub ideal_width: u32,
    pub max_width: u32,
    pub ideal_height: u32,
    pub max_height: u32,
    pub ideal_fps: u32,
    pub max_fps: u32,
}

impl Default for CaptureHints {
    fn default() -> Self {
        Self {
            ideal_width: 480,
            max_width: 640,
            ideal_height: 360,
            max_height: 480,
            ideal_fps: 30,
            max_fps: 30,
        }
    }
}

impl CaptureHints {
    /// Frame size a backend should produce when it can honour the hints.
    pub fn frame_size(&self) -> (u32, u32) {
        (
            self.ideal_width.min(self.max_width).max(1),
            self.ideal_height.min(self.max_height).max(1),
        )
    }
}

/// A source of live video frames.
///
/// # Lifecycle
///
/// 1. `open()` is called with the capture hints; it may block on a permission
///    prompt and fails when access is denied or no device exists
/// 2. `poll_frame()` is called by both the render and the analysis loop; it
///    returns `None` until the device has a decodable frame
/// 3. `close()` releases the device
pub trait CameraBackend {
    fn open(&mut self, hints: &CaptureHints) -> Result<(), CoachError>;
    fn poll_frame(&mut self) -> Option<&RgbImage>;
    fn close(&mut self);
}

/// Owns the camera and hands out read access to the current frame.
///
/// Only the owner acquires and releases the device; readers go through
/// `frame()` with the `DeviceId` they were started with and get nothing once
/// that acquisition is over.
pub struct VideoSampler {
    backend: Box<dyn CameraBackend>,
    hints: CaptureHints,
    active: Option<DeviceId>,
    next_id: u64,
}

impl VideoSampler {
    pub fn new(backend: Box<dyn CameraBackend>, hints: CaptureHints) -> Self {
        Self {
            backend,
            hints,
            active: None,
            next_id: 1,
        }
    }

    pub fn acquire(&mut self) -> Result<DeviceId, CoachError> {
        if let Some(device) = self.active {
            self.release(device);
        }
        self.backend.open(&self.hints)?;
        let device = DeviceId(self.next_id);
        self.next_id += 1;
        self.active = Some(device);
        info!("Camera acquired as device {device}");
        Ok(device)
    }

    pub fn release(&mut self, device: DeviceId) {
        if self.active == Some(device) {
            self.backend.close();
            self.active = None;
            info!("Camera device {device} released");
        } else {
            debug!("Ignoring release of stale camera device {device}");
        }
    }

    pub fn is_active(&self, device: DeviceId) -> bool {
        self.active == Some(device)
    }

    pub fn active_device(&self) -> Option<DeviceId> {
        self.active
    }

    /// Current frame of `device`, `None` if the device was released or has no
    /// decodable frame yet.
    pub fn frame(&mut self, device: DeviceId) -> Option<&RgbImage> {
        if self.active != Some(device) {
            return None;
        }
        self.backend.poll_frame()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CameraStats {
    pub opens: usize,
    pub closes: usize,
    pub frames_served: usize,
    pub is_open: bool,
}

/// Shared view on a `SyntheticCamera`'s counters that stays usable after the
/// camera was boxed into a `VideoSampler`.
#[derive(Debug, Default, Clone)]
pub struct CameraProbe(Rc<RefCell<CameraStats>>);

impl CameraProbe {
    pub fn stats(&self) -> CameraStats {
        self.0.borrow().clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Availability {
    Granted,
    Denied,
    Missing,
}

/// Camera backend producing a moving test pattern (or a fixed set of frames).
///
/// Used by the headless binary and by tests. It can simulate a denied
/// permission prompt, a missing device and a warm-up period without frames.
pub struct SyntheticCamera {
    availability: Availability,
    fixed_frames: Option<Vec<RgbImage>>,
    frames: Vec<RgbImage>,
    cursor: usize,
    warmup_polls: usize,
    warmup_remaining: usize,
    probe: CameraProbe,
}

const TEST_PATTERN_FRAMES: usize = 8;

impl SyntheticCamera {
    pub fn test_pattern() -> Self {
        Self {
            availability: Availability::Granted,
            fixed_frames: None,
            frames: Vec::new(),
            cursor: 0,
            warmup_polls: 0,
            warmup_remaining: 0,
            probe: CameraProbe::default(),
        }
    }

    pub fn from_frames(frames: Vec<RgbImage>) -> Self {
        Self {
            fixed_frames: Some(frames),
            ..Self::test_pattern()
        }
    }

    pub fn denied() -> Self {
        Self {
            availability: Availability::Denied,
            ..Self::test_pattern()
        }
    }

    pub fn missing() -> Self {
        Self {
            availability: Availability::Missing,
            ..Self::test_pattern()
        }
    }

    /// Number of polls after each `open()` that return no frame, like a video
    /// element that has not buffered enough data yet.
    pub fn with_warmup(mut self, polls: usize) -> Self {
        self.warmup_polls = polls;
        self
    }

    pub fn probe(&self) -> CameraProbe {
        self.probe.clone()
    }
}

impl CameraBackend for SyntheticCamera {
    fn open(&mut self, hints: &CaptureHints) -> Result<(), CoachError> {
        match self.availability {
            Availability::Denied => {
                return Err(CoachError::CameraUnavailable {
                    reason: "permission to use the camera was denied".to_string(),
                });
            }
            Availability::Missing => {
                return Err(CoachError::CameraUnavailable {
                    reason: "no camera device found".to_string(),
                });
            }
            Availability::Granted => {}
        }

        self.frames = match &self.fixed_frames {
            Some(frames) => frames.clone(),
            None => {
                let (width, height) = hints.frame_size();
                (0..TEST_PATTERN_FRAMES)
                    .map(|i| test_pattern_frame(width, height, i))
                    .collect()
            }
        };
        self.cursor = 0;
        self.warmup_remaining = self.warmup_polls;

        let mut stats = self.probe.0.borrow_mut();
        stats.opens += 1;
        stats.is_open = true;
        Ok(())
    }

    fn poll_frame(&mut self) -> Option<&RgbImage> {
        if !self.probe.0.borrow().is_open || self.frames.is_empty() {
            return None;
        }
        if self.warmup_remaining > 0 {
            self.warmup_remaining -= 1;
            return None;
        }
        let index = self.cursor % self.frames.len();
        self.cursor = self.cursor.wrapping_add(1);
        self.probe.0.borrow_mut().frames_served += 1;
        self.frames.get(index)
    }

    fn close(&mut self) {
        self.frames.clear();
        let mut stats = self.probe.0.borrow_mut();
        stats.closes += 1;
        stats.is_open = false;
    }
}

/// Diagonal gradient with a bright bar that moves a little on every frame.
fn test_pattern_frame(width: u32, height: u32, index: usize) -> RgbImage {
    let bar = (index as u32 * width / TEST_PATTERN_FRAMES as u32) % width.max(1);
    RgbImage::from_fn(width, height, |x, y| {
        if x.abs_diff(bar) < 2 {
            Rgb([240, 240, 240])
        } else {
            let r = (x * 255 / width.max(1)) as u8;
            let g = (y * 255 / height.max(1)) as u8;
            Rgb([r, g, 96])
        }
    })
}


#[cfg(test)]
mod tests {
    use super::*;

    fn small_hints() -> CaptureHints {
        CaptureHints {
            ideal_width: 16,
            ideal_height: 12,
            ..Default::default()
        }
    }

    #[test]
    fn test_frame_size_respects_max() {
        let hints = CaptureHints {
            ideal_width: 1920,
            ideal_height: 1080,
            ..Default::default()
        };
        assert_eq!(hints.frame_size(), (640, 480));
        assert_eq!(CaptureHints::default().frame_size(), (480, 360));
    }

    #[test]
    fn test_denied_camera_surfaces_error() {
        let mut sampler = VideoSampler::new(Box::new(SyntheticCamera::denied()), small_hints());
        let result = sampler.acquire();
        assert!(matches!(result, Err(CoachError::CameraUnavailable { .. })));
        assert_eq!(sampler.active_device(), None);
    }

    #[test]
    fn test_released_device_serves_no_frames() {
        let camera = SyntheticCamera::test_pattern();
        let probe = camera.probe();
        let mut sampler = VideoSampler::new(Box::new(camera), small_hints());

        let device = sampler.acquire().unwrap();
        let frame = sampler.frame(device).unwrap();
        assert_eq!(frame.dimensions(), (16, 12));

        sampler.release(device);
        assert!(sampler.frame(device).is_none());
        assert_eq!(
            probe.stats(),
            CameraStats {
                opens: 1,
                closes: 1,
                frames_served: 1,
                is_open: false,
            }
        );
    }

    #[test]
    fn test_reacquire_hands_out_new_device() {
        let mut sampler =
            VideoSampler::new(Box::new(SyntheticCamera::test_pattern()), small_hints());
        let first = sampler.acquire().unwrap();
        sampler.release(first);
        let second = sampler.acquire().unwrap();

        assert_ne!(first, second);
        assert!(!sampler.is_active(first));
        assert!(sampler.is_active(second));
        assert!(sampler.frame(first).is_none());
        assert!(sampler.frame(second).is_some());
    }

    #[test]
    fn test_missing_camera_surfaces_error() {
        let mut sampler = VideoSampler::new(Box::new(SyntheticCamera::missing()), small_hints());
        match sampler.acquire() {
            Err(CoachError::CameraUnavailable { reason }) => {
                assert!(reason.contains("no camera"))
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_fixed_frames_are_served_in_a_loop() {
        let frames = vec![
            RgbImage::from_pixel(4, 4, Rgb([10, 10, 10])),
            RgbImage::from_pixel(4, 4, Rgb([200, 200, 200])),
        ];
        let mut sampler =
            VideoSampler::new(Box::new(SyntheticCamera::from_frames(frames)), small_hints());
        let device = sampler.acquire().unwrap();

        let served: Vec<u8> = (0..3)
            .map(|_| sampler.frame(device).unwrap().get_pixel(0, 0)[0])
            .collect();
        assert_eq!(served, vec![10, 200, 10]);
    }

    #[test]
    fn test_warmup_delays_first_frame() {
        let mut sampler = VideoSampler::new(
            Box::new(SyntheticCamera::test_pattern().with_warmup(2)),
            small_hints(),
        );
        let device = sampler.acquire().unwrap();
        assert!(sampler.frame(device).is_none());
        assert!(sampler.frame(device).is_none());
        assert!(sampler.frame(device).is_some());
    }
}
