//! Sliding-window guard for externally observable actions.
//!
//! Every scan and every attack attempt passes through a [`RateLimiter`]
//! before it touches the air. The limiter keeps the instants of the requests
//! admitted during the last `time_window` and refuses new ones once
//! `max_requests` of them are live. Checking and recording happen under one
//! lock, so two callers can never both take the last slot.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::config::ConfigStore;
use crate::error::{Error, Result};

/// Mutable state of one limiter. Never handed out to callers.
#[derive(Debug)]
struct RateWindow {
    admitted: VecDeque<Instant>,
    max_requests: usize,
    window: Duration,
}

impl RateWindow {
    fn expire(&mut self, now: Instant) {
        while let Some(&oldest) = self.admitted.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    name: &'static str,
    state: Mutex<RateWindow>,
}

impl RateLimiter {
    pub fn new(name: &'static str, max_requests: usize, time_window: Duration) -> Self {
        Self {
            name,
            state: Mutex::new(RateWindow {
                admitted: VecDeque::with_capacity(max_requests),
                max_requests,
                window: time_window,
            }),
        }
    }

    /// Builds a limiter from `<prefix>.max_requests` and `<prefix>.time_window`
    /// (seconds).
    pub fn from_config(name: &'static str, cfg: &ConfigStore, prefix: &str) -> Result<Self> {
        let max_requests: usize = cfg.get_or(&format!("{prefix}.max_requests"), 5);
        let window_secs: u64 = cfg.get_or(&format!("{prefix}.time_window"), 60);
        if window_secs == 0 {
            return Err(Error::Config(format!("{prefix}.time_window must be positive")));
        }
        Ok(Self::new(name, max_requests, Duration::from_secs(window_secs)))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Admits and records one request if the window has room.
    ///
    /// A refused call records nothing and can be repeated freely.
    pub fn allow_request(&self) -> bool {
        self.allow_at(Instant::now())
    }

    /// Like [`allow_request`](Self::allow_request) but maps a refusal to
    /// [`Error::RateLimitExceeded`].
    pub fn acquire(&self) -> Result<()> {
        if self.allow_request() {
            Ok(())
        } else {
            Err(Error::RateLimitExceeded(self.name))
        }
    }

    pub(crate) fn allow_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        state.expire(now);

        if state.admitted.len() >= state.max_requests {
            debug!(limiter = self.name, live = state.admitted.len(), "request refused");
            return false;
        }

        state.admitted.push_back(now);
        true
    }

    pub fn reset(&self) {
        self.state.lock().admitted.clear();
    }

    /// Requests admitted within the current window.
    pub fn current_usage(&self) -> usize {
        self.usage_at(Instant::now())
    }

    pub(crate) fn usage_at(&self, now: Instant) -> usize {
        let mut state = self.state.lock();
        state.expire(now);
        state.admitted.len()
    }

    /// Time until the oldest admitted request leaves the window, if full.
    pub fn retry_after(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.expire(now);
        if state.admitted.len() < state.max_requests {
            return None;
        }
        let oldest = *state.admitted.front()?;
        Some(state.window.saturating_sub(now.saturating_duration_since(oldest)))
    }
}
