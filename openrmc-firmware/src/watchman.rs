//! Watchdog management.
//!
//! Tracks the run state written by the bus master and pets the independent
//! hardware watchdog from the background task. While the watchdog runs the
//! master must stop it before the deadline, otherwise petting ceases and
//! the hardware watchdog resets the system.

use stm32f1xx_hal::{prelude::*, watchdog::IndependentWatchdog};
use systick_monotonic::ExtU64;

use crate::{app::monotonics, Duration, Instant};

/// Watchdog manager.
pub struct Watchman {
    dog: IndependentWatchdog,
    state: u8,
    deadline_start: Instant,
    timeout: Duration,
}

impl Watchman {
    /// Creates a new watchdog manager.
    pub fn new(mut dog: IndependentWatchdog, timeout: Duration, state: u8) -> Self {
        dog.start(3u32.secs());
        dog.feed();
        Self { dog, state, deadline_start: monotonics::now(), timeout }
    }

    /// Necessary watchdog pet interval.
    pub fn pet_interval() -> Duration {
        1u64.secs()
    }

    /// Current run state (1 = running).
    pub fn state(&self) -> u8 {
        self.state
    }

    /// Sets the run state. Starting restarts the deadline.
    pub fn set_state(&mut self, state: u8) {
        defmt::info!("{} watchdog", if state != 0 { "starting" } else { "stopping" });
        self.deadline_start = monotonics::now();
        self.state = state;
    }

    /// Pets the hardware watchdog, if possible.
    ///
    /// Returns whether petting was possible.
    pub fn pet_hardware_watchdog(&mut self) -> bool {
        if self.state == 0 {
            self.dog.feed();
            return true;
        }

        match monotonics::now().checked_duration_since(self.deadline_start) {
            Some(elapsed) if elapsed <= self.timeout => {
                defmt::trace!("petting hardware watchdog");
                self.dog.feed();
                true
            }
            _ => {
                defmt::error!("watchdog deadline passed, system will reset");
                false
            }
        }
    }
}
