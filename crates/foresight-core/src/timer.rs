//! Deterministic timer service driven by the simulation clock.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::trace;

/// Clock readings for one tick. `server` is authoritative across peers and is
/// what replicated start times are expressed in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NetTime {
    pub world: f64,
    pub server: f64,
}

impl NetTime {
    pub fn new(world: f64, server: f64) -> Self {
        Self { world, server }
    }

    /// Both clocks agree, as on the authority.
    pub fn synced(t: f64) -> Self {
        Self {
            world: t,
            server: t,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub const INVALID: TimerHandle = TimerHandle(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

#[derive(Debug)]
struct Timer<T> {
    deadline: f64,
    period: Option<f64>,
    payload: T,
}

/// Smallest loop period; keeps a zero period from spinning inside `advance`.
const MIN_PERIOD: f64 = 1e-3;

#[derive(Debug)]
pub struct TimerManager<T> {
    timers: BTreeMap<u64, Timer<T>>,
    next_id: u64,
    now: f64,
}

impl<T> Default for TimerManager<T> {
    fn default() -> Self {
        Self {
            timers: BTreeMap::new(),
            next_id: 0,
            now: 0.0,
        }
    }
}

impl<T: Clone> TimerManager<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> f64 {
        self.now
    }

    pub fn set_timer(&mut self, delay: f64, payload: T) -> TimerHandle {
        self.insert(self.now + delay.max(0.0), None, payload)
    }

    pub fn set_looping_timer(&mut self, period: f64, payload: T) -> TimerHandle {
        let period = period.max(MIN_PERIOD);
        self.insert(self.now + period, Some(period), payload)
    }

    /// Fires on the next call to `advance`, whatever time it is given.
    pub fn set_timer_for_next_tick(&mut self, payload: T) -> TimerHandle {
        self.insert(f64::NEG_INFINITY, None, payload)
    }

    /// Returns false if the handle was not active.
    pub fn clear(&mut self, handle: TimerHandle) -> bool {
        self.timers.remove(&handle.0).is_some()
    }

    pub fn is_active(&self, handle: TimerHandle) -> bool {
        self.timers.contains_key(&handle.0)
    }

    pub fn remaining(&self, handle: TimerHandle) -> Option<f64> {
        self.timers
            .get(&handle.0)
            .map(|t| (t.deadline - self.now).max(0.0))
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Move the clock to `now` and return every payload that came due, in
    /// deadline order (ties broken by creation order). A looping timer fires
    /// once for each period that elapsed.
    pub fn advance(&mut self, now: f64) -> Vec<(TimerHandle, T)> {
        if now > self.now {
            self.now = now;
        }

        let mut fired = Vec::new();
        loop {
            let due = self
                .timers
                .iter()
                .filter(|(_, t)| t.deadline <= self.now)
                .min_by(|(a_id, a), (b_id, b)| {
                    a.deadline.total_cmp(&b.deadline).then(a_id.cmp(b_id))
                })
                .map(|(id, _)| *id);

            let Some(id) = due else { break };
            let Some(timer) = self.timers.remove(&id) else { break };
            trace!(timer = id, deadline = timer.deadline, "timer fired");

            match timer.period {
                Some(period) => {
                    fired.push((TimerHandle(id), timer.payload.clone()));
                    self.timers.insert(
                        id,
                        Timer {
                            deadline: timer.deadline + period,
                            ..timer
                        },
                    );
                }
                None => fired.push((TimerHandle(id), timer.payload)),
            }
        }
        fired
    }

    fn insert(&mut self, deadline: f64, period: Option<f64>, payload: T) -> TimerHandle {
        self.next_id += 1;
        self.timers.insert(
            self.next_id,
            Timer {
                deadline,
                period,
                payload,
            },
        );
        TimerHandle(self.next_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let mut timers = TimerManager::new();
        timers.set_timer(2.0, "late");
        timers.set_timer(1.0, "early");
        timers.set_timer_for_next_tick("now");

        let fired: Vec<_> = timers.advance(3.0).into_iter().map(|(_, p)| p).collect();
        assert_eq!(fired, vec!["now", "early", "late"]);
        assert!(timers.is_empty());
    }

    #[test]
    fn looping_timer_fires_per_period() {
        let mut timers = TimerManager::new();
        let handle = timers.set_looping_timer(1.0, 'p');
        assert_eq!(timers.advance(0.5).len(), 0);
        assert_eq!(timers.advance(3.2).len(), 3);
        assert!((timers.remaining(handle).unwrap_or_default() - 0.8).abs() < 1e-9);

        assert!(timers.clear(handle));
        assert!(!timers.clear(handle));
        assert!(timers.advance(10.0).is_empty());
    }

    #[test]
    fn clock_never_runs_backwards() {
        let mut timers = TimerManager::new();
        timers.advance(5.0);
        timers.advance(1.0);
        assert_eq!(timers.now(), 5.0);
        let h = timers.set_timer(1.0, ());
        assert_eq!(timers.remaining(h), Some(1.0));
    }
}
