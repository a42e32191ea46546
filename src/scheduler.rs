use std::{
    collections::{BTreeMap, HashMap},
    time::{Duration, Instant},
};

/// Handle to a scheduled timer, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

/// Single-threaded timer queue.
///
/// Timers fire in deadline order; timers sharing a deadline fire in the order
/// they were scheduled. Nothing runs on its own: the owner pops due timers and
/// handles them, which keeps every callback interleaved on one thread.
#[derive(Debug)]
pub struct Scheduler<T> {
    next_id: u64,
    queue: BTreeMap<(Instant, u64), T>,
    deadlines: HashMap<u64, Instant>,
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Scheduler<T> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            queue: BTreeMap::new(),
            deadlines: HashMap::new(),
        }
    }

    pub fn schedule_at(&mut self, deadline: Instant, event: T) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.queue.insert((deadline, id), event);
        self.deadlines.insert(id, deadline);
        TimerHandle(id)
    }

    /// Cancels a pending timer. Returns false when it already fired or was
    /// canceled before.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        match self.deadlines.remove(&handle.0) {
            Some(deadline) => self.queue.remove(&(deadline, handle.0)).is_some(),
            None => false,
        }
    }

    pub fn is_scheduled(&self, handle: TimerHandle) -> bool {
        self.deadlines.contains_key(&handle.0)
    }

    /// Removes and returns the earliest timer whose deadline is at or before
    /// `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<(TimerHandle, Instant, T)> {
        let (&(deadline, id), _) = self.queue.first_key_value()?;
        if deadline > now {
            return None;
        }
        let event = self.queue.remove(&(deadline, id))?;
        self.deadlines.remove(&id);
        Some((TimerHandle(id), deadline, event))
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.first_key_value().map(|(&(deadline, _), _)| deadline)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Next deadline of a periodic loop that last fired at `deadline`, skipping
/// periods that were missed entirely so a stalled driver does not replay a
/// burst of stale ticks.
pub fn next_period(deadline: Instant, period: Duration, now: Instant) -> Instant {
    let next = deadline + period;
    if next > now {
        return next;
    }
    let behind = now.duration_since(deadline);
    let missed = behind.as_nanos() / period.as_nanos().max(1);
    let skipped = u32::try_from(missed + 1).unwrap_or(u32::MAX);
    deadline + period.saturating_mul(skipped)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn test_timers_fire_in_deadline_then_fifo_order() {
        let t0 = Instant::now();
        let mut scheduler = Scheduler::new();
        scheduler.schedule_at(t0 + ms(20), "late");
        scheduler.schedule_at(t0 + ms(10), "first");
        scheduler.schedule_at(t0 + ms(10), "second");

        assert!(scheduler.pop_due(t0 + ms(5)).is_none());
        let fired: Vec<_> = std::iter::from_fn(|| scheduler.pop_due(t0 + ms(30)))
            .map(|(_, _, event)| event)
            .collect();
        assert_eq!(fired, vec!["first", "second", "late"]);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_canceled_timer_never_fires() {
        let t0 = Instant::now();
        let mut scheduler = Scheduler::new();
        let handle = scheduler.schedule_at(t0 + ms(10), 1);
        scheduler.schedule_at(t0 + ms(20), 2);

        assert!(scheduler.cancel(handle));
        assert!(!scheduler.cancel(handle));
        assert!(!scheduler.is_scheduled(handle));

        let (_, _, event) = scheduler.pop_due(t0 + ms(100)).unwrap();
        assert_eq!(event, 2);
        assert!(scheduler.pop_due(t0 + ms(100)).is_none());
    }

    #[test]
    fn test_next_deadline_tracks_earliest_timer() {
        let t0 = Instant::now();
        let mut scheduler = Scheduler::new();
        assert_eq!(scheduler.next_deadline(), None);
        let handle = scheduler.schedule_at(t0 + ms(5), ());
        scheduler.schedule_at(t0 + ms(9), ());
        assert_eq!(scheduler.next_deadline(), Some(t0 + ms(5)));
        scheduler.cancel(handle);
        assert_eq!(scheduler.next_deadline(), Some(t0 + ms(9)));
    }

    #[test]
    fn test_next_period_skips_missed_ticks() {
        let t0 = Instant::now();
        assert_eq!(next_period(t0, ms(16), t0 + ms(3)), t0 + ms(16));
        assert_eq!(next_period(t0, ms(16), t0 + ms(16)), t0 + ms(32));
        assert_eq!(next_period(t0, ms(16), t0 + ms(100)), t0 + ms(112));
    }
}
