//! Link timers.
//!
//! A timer is only a deadline. Nothing here fires by itself: owners ask
//! [`Timer::expired`] (or sleep for [`Timer::remaining`]) and feed the
//! matching event into the state machine.
use std::time::{Duration, Instant};

#[derive(Debug, Default, Clone)]
pub struct Timer {
    started: Option<Instant>,
    deadline: Option<Instant>,
}

impl Timer {
    /// Start (or restart) the timer.
    pub fn start(&mut self, v: Duration) {
        let now = Instant::now();
        self.started = Some(now);
        self.deadline = Some(now + v);
    }

    /// Start the timer unless it's already running.
    pub fn ensure(&mut self, v: Duration) {
        if !self.running() {
            self.start(v);
        }
    }

    pub fn stop(&mut self) {
        self.started = None;
        self.deadline = None;
    }

    #[must_use]
    pub fn running(&self) -> bool {
        self.deadline.is_some()
    }

    /// Time left until expiry, or None if stopped.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Time since the timer was started, or None if stopped.
    #[must_use]
    pub fn elapsed(&self) -> Option<Duration> {
        self.started.map(|s| s.elapsed())
    }

    #[must_use]
    pub fn expired(&self) -> bool {
        match self.deadline {
            Some(d) => Instant::now() >= d,
            None => false,
        }
    }
}
