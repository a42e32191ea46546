use std::{
    collections::VecDeque,
    f32::consts::TAU,
    sync::{Arc, Mutex},
};

use image::RgbImage;

use crate::session::{ArmSide, CalibrationPhase};

/// Measures the tracked joint angle on a frame.
///
/// Returns `None` when no pose is visible. Implementations see the calibration
/// tag the frame was sent with, which lets simulated sources act out the
/// requested posture.
pub trait AngleSource {
    fn measure(
        &mut self,
        frame: &RgbImage,
        arm_side: ArmSide,
        calibration_mode: Option<CalibrationPhase>,
    ) -> Option<f32>;
}

#[derive(Debug, Default)]
struct Script {
    min: Option<f32>,
    max: Option<f32>,
    queue: VecDeque<Option<f32>>,
    held: Option<f32>,
}

/// Angles fed from a script, shared with whoever holds a clone.
///
/// Frames tagged with a calibration phase measure the angle configured for
/// that phase. Untagged frames consume the queue one entry per frame and keep
/// repeating the last entry once it runs dry.
#[derive(Debug, Default, Clone)]
pub struct ScriptedAngles(Arc<Mutex<Script>>);

impl ScriptedAngles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_calibration(min: f32, max: f32) -> Self {
        let angles = Self::new();
        angles.set_calibration(CalibrationPhase::Min, Some(min));
        angles.set_calibration(CalibrationPhase::Max, Some(max));
        angles
    }

    pub fn set_calibration(&self, phase: CalibrationPhase, angle: Option<f32>) {
        let Ok(mut script) = self.0.lock() else {
            return;
        };
        match phase {
            CalibrationPhase::Min => script.min = angle,
            CalibrationPhase::Max => script.max = angle,
        }
    }

    pub fn push(&self, angle: Option<f32>) {
        if let Ok(mut script) = self.0.lock() {
            script.queue.push_back(angle);
        }
    }

    pub fn extend(&self, angles: impl IntoIterator<Item = f32>) {
        if let Ok(mut script) = self.0.lock() {
            script.queue.extend(angles.into_iter().map(Some));
        }
    }

    pub fn pending(&self) -> usize {
        self.0.lock().map(|script| script.queue.len()).unwrap_or(0)
    }
}

impl AngleSource for ScriptedAngles {
    fn measure(
        &mut self,
        _frame: &RgbImage,
        _arm_side: ArmSide,
        calibration_mode: Option<CalibrationPhase>,
    ) -> Option<f32> {
        let mut script = self.0.lock().ok()?;
        match calibration_mode {
            Some(CalibrationPhase::Min) => script.min,
            Some(CalibrationPhase::Max) => script.max,
            None => {
                if let Some(next) = script.queue.pop_front() {
                    script.held = next;
                }
                script.held
            }
        }
    }
}

/// A simulated athlete doing slow, steady curls.
///
/// Holds the arm contracted or extended while a calibration phase is
/// sampled and sweeps between the two otherwise, one full curl every
/// `period` frames.
#[derive(Debug, Clone)]
pub struct SimulatedAthlete {
    contracted: f32,
    extended: f32,
    period: u32,
    frame: u32,
}

impl Default for SimulatedAthlete {
    fn default() -> Self {
        Self::new(40., 155., 50)
    }
}

impl SimulatedAthlete {
    pub fn new(contracted: f32, extended: f32, period: u32) -> Self {
        Self {
            contracted,
            extended,
            period: period.max(2),
            frame: 0,
        }
    }
}

impl AngleSource for SimulatedAthlete {
    fn measure(
        &mut self,
        _frame: &RgbImage,
        _arm_side: ArmSide,
        calibration_mode: Option<CalibrationPhase>,
    ) -> Option<f32> {
        let frame = self.frame;
        self.frame = self.frame.wrapping_add(1);
        // small tremor so calibration averages are not trivially exact
        let tremor = ((frame % 5) as f32 - 2.) * 0.5;
        match calibration_mode {
            Some(CalibrationPhase::Min) => Some(self.contracted + tremor),
            Some(CalibrationPhase::Max) => Some(self.extended + tremor),
            None => {
                let phase = (frame % self.period) as f32 / self.period as f32;
                let mid = (self.contracted + self.extended) / 2.;
                let amplitude = (self.extended - self.contracted) / 2.;
                Some(mid + amplitude * (phase * TAU).cos())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> RgbImage {
        RgbImage::new(2, 2)
    }

    #[test]
    fn test_script_holds_last_angle() {
        let mut angles = ScriptedAngles::with_calibration(35., 160.);
        let handle = angles.clone();
        assert_eq!(angles.measure(&frame(), ArmSide::Left, None), None);

        handle.extend([90., 100.]);
        assert_eq!(handle.pending(), 2);
        assert_eq!(angles.measure(&frame(), ArmSide::Left, None), Some(90.));
        assert_eq!(angles.measure(&frame(), ArmSide::Left, None), Some(100.));
        assert_eq!(angles.measure(&frame(), ArmSide::Left, None), Some(100.));

        assert_eq!(
            angles.measure(&frame(), ArmSide::Left, Some(CalibrationPhase::Max)),
            Some(160.)
        );
        handle.push(None);
        assert_eq!(angles.measure(&frame(), ArmSide::Left, None), None);
    }

    #[test]
    fn test_athlete_sweeps_full_range() {
        let mut athlete = SimulatedAthlete::new(40., 150., 20);
        let angles: Vec<f32> = (0..20)
            .filter_map(|_| athlete.measure(&frame(), ArmSide::Right, None))
            .collect();
        let low = angles.iter().cloned().fold(f32::MAX, f32::min);
        let high = angles.iter().cloned().fold(f32::MIN, f32::max);
        assert!(low <= 41.);
        assert!(high >= 149.);
    }
}
