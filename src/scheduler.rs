//! Poll timing for controllers and bump-bond monitors.
//!
//! Schedulers do not own a timer task. The engine loop ticks at a fixed rate and asks each
//! scheduler whether a poll is due, so all protocol state stays on the loop's task and tests can
//! drive time by hand.

use std::time::Duration;
use tokio::time::Instant;

/// Injectable periodic trigger.
pub trait PollScheduler: Send + std::fmt::Debug {
    /// Start polling every `interval`. The first poll is due immediately.
    fn start(&mut self, interval: Duration, now: Instant);

    /// Stop polling. Calling it on a stopped scheduler is a no-op.
    fn stop(&mut self);

    /// Whether polling is started.
    fn is_running(&self) -> bool;

    /// Poll interval while running.
    fn interval(&self) -> Option<Duration>;

    /// Returns `true` at most once per elapsed interval and re-arms itself.
    fn poll_due(&mut self, now: Instant) -> bool;
}

/// Fixed-interval scheduler. Missed periods are coalesced into a single poll.
#[derive(Debug, Default, Clone)]
pub struct IntervalScheduler {
    interval: Option<Duration>,
    next_due: Option<Instant>,
}

impl IntervalScheduler {
    /// Stopped scheduler.
    pub fn new() -> Self {
        Self::default()
    }
}

impl PollScheduler for IntervalScheduler {
    fn start(&mut self, interval: Duration, now: Instant) {
        self.interval = Some(interval);
        self.next_due = Some(now);
    }

    fn stop(&mut self) {
        self.next_due = None;
    }

    fn is_running(&self) -> bool {
        self.next_due.is_some()
    }

    fn interval(&self) -> Option<Duration> {
        self.interval
    }

    fn poll_due(&mut self, now: Instant) -> bool {
        let (Some(due), Some(interval)) = (self.next_due, self.interval) else {
            return false;
        };
        if now < due {
            return false;
        }
        let mut next = due + interval;
        if next <= now {
            next = now + interval;
        }
        self.next_due = Some(next);
        true
    }
}
