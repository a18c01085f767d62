//! Failure breaker over a sliding window of ticks.
//!
//! Launch and terminate failures are counted per tick. When the count
//! inside the window reaches `max_num_failures` the breaker trips and
//! stays tripped until an operator resets it; while tripped the loop
//! stops launching but keeps terminating.

use std::collections::VecDeque;

use tracing::{error, info};

use fleet_core::BreakerState;

#[derive(Debug, Clone)]
pub struct FailureBreaker {
    max_num_failures: u32,
    window_ticks: u64,
    /// Tick number of every failure still inside the window.
    failures: VecDeque<u64>,
    current_tick: u64,
    tripped: bool,
    total_failures: u64,
}

impl FailureBreaker {
    pub fn new(max_num_failures: u32, window_ticks: u64) -> Self {
        Self {
            max_num_failures,
            window_ticks: window_ticks.max(1),
            failures: VecDeque::new(),
            current_tick: 0,
            tripped: false,
            total_failures: 0,
        }
    }

    /// Age the window to `tick`.
    pub fn advance(&mut self, tick: u64) {
        self.current_tick = self.current_tick.max(tick);
        let horizon = self.current_tick.saturating_sub(self.window_ticks);
        while self.failures.front().is_some_and(|&t| t <= horizon) {
            self.failures.pop_front();
        }
    }

    /// Count one failure at `tick`. Returns true if this failure
    /// tripped the breaker.
    pub fn record_failure(&mut self, tick: u64) -> bool {
        self.advance(tick);
        self.failures.push_back(tick);
        self.total_failures += 1;

        if !self.tripped && self.failures.len() as u64 >= u64::from(self.max_num_failures) {
            self.tripped = true;
            error!(
                failures = self.failures.len(),
                window_ticks = self.window_ticks,
                max_num_failures = self.max_num_failures,
                "failure breaker tripped, launches halted until reset"
            );
            return true;
        }
        false
    }

    /// A successful launch clears the window, unless already tripped.
    pub fn record_success(&mut self) {
        if !self.tripped {
            self.failures.clear();
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped
    }

    /// Operator reset.
    pub fn reset(&mut self) {
        if self.tripped {
            info!("failure breaker reset");
        }
        self.tripped = false;
        self.failures.clear();
    }

    /// Apply new limits after a reconfiguration. Does not un-trip.
    pub fn set_limits(&mut self, max_num_failures: u32, window_ticks: u64) {
        self.max_num_failures = max_num_failures;
        self.window_ticks = window_ticks.max(1);
        self.advance(self.current_tick);
    }

    pub fn state(&self) -> BreakerState {
        BreakerState {
            tripped: self.tripped,
            failures_in_window: self.failures.len() as u32,
            max_num_failures: self.max_num_failures,
            window_ticks: self.window_ticks,
            total_failures: self.total_failures,
        }
    }
}
