use std::time::{Duration, Instant};

use crate::scheduler::{Scheduler, TimerHandle};

use super::CalibrationPhase;

/// Result of one countdown tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownStatus {
    Running { remaining: u32 },
    Expired,
}

/// Repeating timer that counts a calibration phase down to zero.
///
/// Holds the handle of its pending tick so that canceling the countdown
/// leaves nothing behind in the scheduler.
#[derive(Debug)]
pub struct Countdown {
    phase: CalibrationPhase,
    remaining: u32,
    unit: Duration,
    timer: Option<TimerHandle>,
}

impl Countdown {
    /// Starts counting `units` down, one tick every `unit`. `tick` builds the
    /// scheduler event for this phase. A countdown always runs at least one
    /// unit, so 0 counts as 1.
    pub fn start<T>(
        phase: CalibrationPhase,
        units: u32,
        unit: Duration,
        now: Instant,
        scheduler: &mut Scheduler<T>,
        tick: impl Fn(CalibrationPhase) -> T,
    ) -> Self {
        let timer = scheduler.schedule_at(now + unit, tick(phase));
        Self {
            phase,
            remaining: units.max(1),
            unit,
            timer: Some(timer),
        }
    }

    pub fn phase(&self) -> CalibrationPhase {
        self.phase
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Handles a fired tick scheduled for `deadline`. Ticks are strictly
    /// periodic: the next one is due one unit after the previous deadline.
    pub fn on_tick<T>(
        &mut self,
        deadline: Instant,
        scheduler: &mut Scheduler<T>,
        tick: impl Fn(CalibrationPhase) -> T,
    ) -> CountdownStatus {
        self.timer = None;
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            return CountdownStatus::Expired;
        }
        self.timer = Some(scheduler.schedule_at(deadline + self.unit, tick(self.phase)));
        CountdownStatus::Running {
            remaining: self.remaining,
        }
    }

    pub fn is_pending<T>(&self, scheduler: &Scheduler<T>) -> bool {
        self.timer.is_some_and(|timer| scheduler.is_scheduled(timer))
    }

    pub fn cancel<T>(mut self, scheduler: &mut Scheduler<T>) {
        if let Some(timer) = self.timer.take() {
            scheduler.cancel(timer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn test_counts_down_every_unit_then_expires() {
        let t0 = Instant::now();
        let mut scheduler = Scheduler::new();
        let mut countdown =
            Countdown::start(CalibrationPhase::Min, 3, ms(1000), t0, &mut scheduler, |p| p);

        let mut statuses = Vec::new();
        while let Some((_, deadline, phase)) = scheduler.pop_due(t0 + ms(10_000)) {
            assert_eq!(phase, CalibrationPhase::Min);
            assert_eq!(deadline, t0 + ms(1000) * (statuses.len() as u32 + 1));
            statuses.push(countdown.on_tick(deadline, &mut scheduler, |p| p));
        }

        assert_eq!(
            statuses,
            vec![
                CountdownStatus::Running { remaining: 2 },
                CountdownStatus::Running { remaining: 1 },
                CountdownStatus::Expired,
            ]
        );
        assert!(!countdown.is_pending(&scheduler));
    }

    #[test]
    fn test_zero_units_run_one_unit() {
        let t0 = Instant::now();
        let mut scheduler = Scheduler::new();
        let mut countdown =
            Countdown::start(CalibrationPhase::Min, 0, ms(1000), t0, &mut scheduler, |p| p);
        assert_eq!(countdown.remaining(), 1);

        let (_, deadline, _) = scheduler.pop_due(t0 + ms(1000)).unwrap();
        assert_eq!(
            countdown.on_tick(deadline, &mut scheduler, |p| p),
            CountdownStatus::Expired
        );
    }

    #[test]
    fn test_cancel_leaves_no_residual_tick() {
        let t0 = Instant::now();
        let mut scheduler = Scheduler::new();
        let countdown =
            Countdown::start(CalibrationPhase::Max, 7, ms(1000), t0, &mut scheduler, |p| p);
        assert!(countdown.is_pending(&scheduler));

        countdown.cancel(&mut scheduler);
        assert!(scheduler.is_empty());
        assert!(scheduler.pop_due(t0 + ms(60_000)).is_none());
    }
}
