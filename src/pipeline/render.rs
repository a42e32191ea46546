use std::{collections::HashMap, path::Path};

use image::{RgbImage, RgbaImage, imageops};

use crate::{CoachError, camera::DeviceId};

use super::overlay::Overlay;

/// Where the render loop paints.
pub trait Surface {
    fn draw_frame(&mut self, device: DeviceId, frame: &RgbImage);
    fn draw_overlay(&mut self, overlay: &Overlay);
}

/// Paints the live frame and, on top of it, the latest overlay.
///
/// The loop only ever reads what is already there: it never waits for an
/// analysis reply, so one overlay may be shown for many ticks.
#[derive(Debug, Default)]
pub struct RenderLoop {
    ticks: u64,
    frames_drawn: u64,
    overlays_drawn: u64,
}

impl RenderLoop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick<S: Surface + ?Sized>(
        &mut self,
        device: DeviceId,
        frame: Option<&RgbImage>,
        overlay: Option<&Overlay>,
        surface: &mut S,
    ) {
        self.ticks += 1;
        if let Some(frame) = frame {
            surface.draw_frame(device, frame);
            self.frames_drawn += 1;
        }
        if let Some(overlay) = overlay {
            surface.draw_overlay(overlay);
            self.overlays_drawn += 1;
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn frames_drawn(&self) -> u64 {
        self.frames_drawn
    }

    pub fn overlays_drawn(&self) -> u64 {
        self.overlays_drawn
    }
}

/// In-memory surface compositing frame and overlay onto one canvas.
///
/// Keeps per-device draw counts so callers can check that nothing is drawn
/// from a device after it was released.
#[derive(Debug, Default)]
pub struct CanvasSurface {
    canvas: RgbaImage,
    frames_by_device: HashMap<DeviceId, u64>,
    overlays: u64,
    last_overlay_seq: Option<u64>,
}

impl CanvasSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn canvas(&self) -> &RgbaImage {
        &self.canvas
    }

    pub fn frames_drawn(&self) -> u64 {
        self.frames_by_device.values().sum()
    }

    pub fn frames_drawn_for(&self, device: DeviceId) -> u64 {
        self.frames_by_device.get(&device).copied().unwrap_or(0)
    }

    pub fn overlays_drawn(&self) -> u64 {
        self.overlays
    }

    pub fn last_overlay_seq(&self) -> Option<u64> {
        self.last_overlay_seq
    }

    /// Writes the current canvas as a PNG file.
    pub fn save_png(&self, path: &Path) -> Result<(), CoachError> {
        self.canvas
            .save_with_format(path, image::ImageFormat::Png)
            .map_err(|e| CoachError::SnapshotError { source: e })
    }
}

impl Surface for CanvasSurface {
    fn draw_frame(&mut self, device: DeviceId, frame: &RgbImage) {
        if self.canvas.dimensions() != frame.dimensions() {
            self.canvas = RgbaImage::new(frame.width(), frame.height());
        }
        for (target, source) in self.canvas.pixels_mut().zip(frame.pixels()) {
            let [r, g, b] = source.0;
            target.0 = [r, g, b, 255];
        }
        *self.frames_by_device.entry(device).or_insert(0) += 1;
    }

    fn draw_overlay(&mut self, overlay: &Overlay) {
        imageops::overlay(&mut self.canvas, &overlay.image, 0, 0);
        self.overlays += 1;
        self.last_overlay_seq = Some(overlay.seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, Rgba};

    #[test]
    fn test_tick_without_overlay_draws_frame_only() {
        let mut render = RenderLoop::new();
        let mut surface = CanvasSurface::new();
        let frame = RgbImage::from_pixel(4, 4, Rgb([1, 2, 3]));
        let device = crate::camera::tests_support::device(1);

        render.tick(device, Some(&frame), None, &mut surface);
        render.tick(device, None, None, &mut surface);

        assert_eq!(render.ticks(), 2);
        assert_eq!(render.frames_drawn(), 1);
        assert_eq!(surface.frames_drawn_for(device), 1);
        assert_eq!(surface.overlays_drawn(), 0);
        assert_eq!(surface.canvas().get_pixel(0, 0), &Rgba([1, 2, 3, 255]));
    }

    #[test]
    fn test_overlay_is_composited_over_frame() {
        let mut render = RenderLoop::new();
        let mut surface = CanvasSurface::new();
        let frame = RgbImage::from_pixel(4, 4, Rgb([0, 0, 0]));
        let overlay = Overlay {
            seq: 7,
            image: RgbaImage::from_pixel(2, 2, Rgba([255, 0, 0, 255])),
        };
        let device = crate::camera::tests_support::device(3);

        for _ in 0..3 {
            render.tick(device, Some(&frame), Some(&overlay), &mut surface);
        }

        assert_eq!(render.overlays_drawn(), 3);
        assert_eq!(surface.last_overlay_seq(), Some(7));
        assert_eq!(surface.canvas().get_pixel(1, 1), &Rgba([255, 0, 0, 255]));
        assert_eq!(surface.canvas().get_pixel(3, 3), &Rgba([0, 0, 0, 255]));
    }
}
