use image::RgbaImage;

use crate::{CoachError, frame::decode_data_url};

/// A fully decoded annotated frame returned by the analysis service.
#[derive(Debug, Clone, PartialEq)]
pub struct Overlay {
    /// Increases with every overlay accepted by the slot
    pub seq: u64,
    pub image: RgbaImage,
}

/// Single-slot holder of the latest overlay.
///
/// Written by the reply handler, read by the render loop. A new overlay is
/// decoded completely before it replaces the previous one, so the render
/// loop sees either the old image or the new one, never a partial image.
/// A payload that fails to decode leaves the current overlay in place.
#[derive(Debug, Default)]
pub struct OverlaySlot {
    current: Option<Overlay>,
    next_seq: u64,
}

impl OverlaySlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes `payload` and swaps it in. Returns the sequence number of the
    /// new overlay.
    pub fn offer(&mut self, payload: &str) -> Result<u64, CoachError> {
        let image = decode_data_url(payload)?.to_rgba8();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.current = Some(Overlay { seq, image });
        Ok(seq)
    }

    pub fn current(&self) -> Option<&Overlay> {
        self.current.as_ref()
    }
}
