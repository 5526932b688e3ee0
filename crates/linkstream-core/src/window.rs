//! Sliding-window event counter

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Counts events within a trailing `period`.
///
/// Stale events are discarded lazily whenever the window is read or
/// written, so there is no reset tick and no background timer.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    period: Duration,
    events: VecDeque<Instant>,
}

impl SlidingWindow {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            events: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.events.front() {
            if now.saturating_duration_since(oldest) >= self.period {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    /// Events inside the window as of `now`
    pub fn count(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.events.len()
    }

    /// Whether one more event fits under `limit`
    pub fn has_headroom(&mut self, now: Instant, limit: usize) -> bool {
        self.count(now) < limit
    }

    pub fn record(&mut self, now: Instant) {
        self.prune(now);
        self.events.push_back(now);
    }

    /// Take back the most recent event
    pub fn undo(&mut self) {
        self.events.pop_back();
    }

    /// Remove one event recorded at `at`, newest first
    pub fn forget(&mut self, at: Instant) -> bool {
        match self.events.iter().rposition(|event| *event == at) {
            Some(index) => self.events.remove(index).is_some(),
            None => false,
        }
    }

    /// When the oldest counted event falls out of the window
    pub fn next_expiry(&self) -> Option<Instant> {
        self.events.front().map(|oldest| *oldest + self.period)
    }

    /// True when no event is inside the window as of `now`
    pub fn is_idle(&mut self, now: Instant) -> bool {
        self.count(now) == 0
    }
}
