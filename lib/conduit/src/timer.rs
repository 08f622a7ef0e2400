//! Synchronous deferred events. The wheel holds `(deadline, id, event)`
//! entries ordered by deadline and is drained by whichever loop owns it
//! (the reactor, or a worker's poll loop). There is no timer thread, so
//! firing never races the loop's own state.

use std::time::{Duration, Instant};

pub type TimerId = u64;

struct TimerEntry<E> {
    deadline: Instant,
    id: TimerId,
    event: E,
}

pub struct TimerWheel<E> {
    entries: Vec<TimerEntry<E>>,
    next_id: TimerId,
}

impl<E> TimerWheel<E> {
    #[inline]
    pub fn new() -> TimerWheel<E> {
        TimerWheel {
            entries: Vec::new(),
            next_id: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Schedules `event` to fire `delay` after `now`. Entries with equal
    /// deadlines fire in insertion order.
    pub fn add(&mut self, now: Instant, delay: Duration, event: E) -> TimerId {
        let deadline = now + delay;
        self.next_id += 1;
        let id = self.next_id;

        let at = self
            .entries
            .iter()
            .position(|entry| entry.deadline > deadline)
            .unwrap_or(self.entries.len());
        self.entries.insert(at, TimerEntry { deadline, id, event });

        id
    }

    /// Removes the timer with the given id. Idempotent.
    pub fn cancel(&mut self, id: TimerId) {
        self.entries.retain(|entry| entry.id != id);
    }

    /// Pops the next due event, if any. Callers drain in a loop so that
    /// events scheduled while handling (with an already-passed deadline)
    /// fire in the same pass.
    pub fn pop_due(&mut self, now: Instant) -> Option<E> {
        match self.entries.first() {
            Some(entry) if entry.deadline <= now => Some(self.entries.remove(0).event),
            _ => None,
        }
    }

    /// Deadline of the nearest timer.
    #[inline]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.first().map(|entry| entry.deadline)
    }

    /// Drops every timer. A freshly started worker calls this to discard
    /// anything inherited from its parent context.
    #[inline]
    pub fn flush(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_in_deadline_order() {
        let now = Instant::now();
        let mut wheel = TimerWheel::new();

        wheel.add(now, Duration::from_secs(3), "c");
        wheel.add(now, Duration::from_secs(1), "a");
        wheel.add(now, Duration::from_secs(2), "b");

        let later = now + Duration::from_secs(5);
        assert_eq!(wheel.pop_due(later), Some("a"));
        assert_eq!(wheel.pop_due(later), Some("b"));
        assert_eq!(wheel.pop_due(later), Some("c"));
        assert_eq!(wheel.pop_due(later), None);
    }

    #[test]
    fn test_equal_deadlines_fire_in_insertion_order() {
        let now = Instant::now();
        let mut wheel = TimerWheel::new();

        wheel.add(now, Duration::from_secs(1), 1);
        wheel.add(now, Duration::from_secs(1), 2);
        wheel.add(now, Duration::from_secs(1), 3);

        let later = now + Duration::from_secs(1);
        assert_eq!(wheel.pop_due(later), Some(1));
        assert_eq!(wheel.pop_due(later), Some(2));
        assert_eq!(wheel.pop_due(later), Some(3));
    }

    #[test]
    fn test_not_due_yet() {
        let now = Instant::now();
        let mut wheel = TimerWheel::new();

        wheel.add(now, Duration::from_secs(10), ());

        assert_eq!(wheel.pop_due(now), None);
        assert_eq!(wheel.pop_due(now + Duration::from_secs(9)), None);
        assert_eq!(wheel.pop_due(now + Duration::from_secs(10)), Some(()));
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let now = Instant::now();
        let mut wheel = TimerWheel::new();

        let id = wheel.add(now, Duration::from_secs(1), "x");
        wheel.cancel(id);
        wheel.cancel(id);
        wheel.cancel(9999);

        assert_eq!(wheel.pop_due(now + Duration::from_secs(2)), None);
    }

    #[test]
    fn test_same_pass_rearm() {
        // Drain loop picks up an entry added mid-pass with a due deadline.
        let now = Instant::now();
        let mut wheel = TimerWheel::new();
        wheel.add(now, Duration::from_secs(1), 1u32);

        let later = now + Duration::from_secs(2);
        let mut fired = Vec::new();
        while let Some(event) = wheel.pop_due(later) {
            fired.push(event);
            if event == 1 {
                wheel.add(now, Duration::from_secs(2), 2u32);
            }
        }

        assert_eq!(fired, vec![1, 2]);
    }

    #[test]
    fn test_ids_are_monotonic() {
        let now = Instant::now();
        let mut wheel = TimerWheel::new();

        let a = wheel.add(now, Duration::from_secs(5), ());
        let b = wheel.add(now, Duration::from_secs(1), ());

        assert!(b > a);
    }

    #[test]
    fn test_flush() {
        let now = Instant::now();
        let mut wheel = TimerWheel::new();
        wheel.add(now, Duration::from_secs(1), ());
        wheel.add(now, Duration::from_secs(2), ());

        wheel.flush();

        assert_eq!(wheel.len(), 0);
        assert_eq!(wheel.next_deadline(), None);
    }
}
