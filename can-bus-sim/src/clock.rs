//! Global simulation clock
//!
//! A single driver thread emits pulses at a fixed period. Pulses are counted
//! by a monotonically increasing generation number: waiting means "block
//! until the generation exceeds the one I observed", so a waiter can never
//! miss a pulse that happens between its check and its sleep.

use crate::shutdown::ShutdownSignal;
use crate::types::{Result, SimError};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Default)]
struct ClockState {
    generation: Mutex<u64>,
    pulse: Condvar,
}

/// Broadcast tick source shared by every participant
pub struct GlobalClock {
    period: Duration,
    state: Arc<ClockState>,
    shutdown: ShutdownSignal,
}

impl GlobalClock {
    /// Create a clock pulsing every `period` until `shutdown` fires
    pub fn new(period: Duration, shutdown: ShutdownSignal) -> Self {
        let state = Arc::new(ClockState::default());

        let wake = Arc::clone(&state);
        shutdown.on_trigger(move || {
            let _guard = wake.generation.lock();
            wake.pulse.notify_all();
        });

        Self {
            period,
            state,
            shutdown,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Number of pulses emitted so far
    pub fn tick(&self) -> u64 {
        *self.state.generation.lock()
    }

    /// Emit one pulse, waking every current waiter
    pub fn pulse(&self) -> u64 {
        let mut generation = self.state.generation.lock();
        *generation += 1;
        self.state.pulse.notify_all();
        *generation
    }

    /// Block until the next pulse
    ///
    /// Returns the new generation, or [`SimError::Cancelled`] once shutdown
    /// has been requested.
    pub fn wait(&self) -> Result<u64> {
        let mut generation = self.state.generation.lock();
        let observed = *generation;
        while *generation == observed {
            if self.shutdown.is_triggered() {
                return Err(SimError::Cancelled);
            }
            self.state.pulse.wait(&mut generation);
        }
        Ok(*generation)
    }

    /// Block for `count` consecutive pulses
    pub fn wait_ticks(&self, count: u64) -> Result<u64> {
        let mut generation = self.tick();
        for _ in 0..count {
            generation = self.wait()?;
        }
        Ok(generation)
    }

    /// Driver loop: pulse every period until shutdown
    pub fn run(&self) {
        log::info!("Global clock started (period {:?})", self.period);
        while !self.shutdown.is_triggered() {
            thread::sleep(self.period);
            self.pulse();
        }
        log::info!("Global clock stopped after {} ticks", self.tick());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_blocks_until_next_pulse() {
        let shutdown = ShutdownSignal::new();
        let clock = Arc::new(GlobalClock::new(Duration::from_millis(1), shutdown.clone()));

        // A pulse emitted before the call is not observed by the waiter
        clock.pulse();
        let waiter = {
            let clock = Arc::clone(&clock);
            thread::spawn(move || clock.wait())
        };

        while !waiter.is_finished() {
            thread::sleep(Duration::from_millis(2));
            clock.pulse();
        }
        let seen = waiter.join().unwrap().unwrap();
        assert!(seen >= 2);
    }

    #[test]
    fn test_wait_interrupted_by_shutdown() {
        let shutdown = ShutdownSignal::new();
        let clock = Arc::new(GlobalClock::new(Duration::from_secs(3600), shutdown.clone()));

        let waiter = {
            let clock = Arc::clone(&clock);
            thread::spawn(move || clock.wait())
        };
        thread::sleep(Duration::from_millis(20));
        shutdown.trigger("test");

        assert!(matches!(waiter.join().unwrap(), Err(SimError::Cancelled)));
    }

    #[test]
    fn test_run_stops_on_shutdown() {
        let shutdown = ShutdownSignal::new();
        let clock = Arc::new(GlobalClock::new(Duration::from_millis(1), shutdown.clone()));
        let driver = {
            let clock = Arc::clone(&clock);
            thread::spawn(move || clock.run())
        };

        assert!(clock.wait_ticks(3).unwrap() >= 3);
        shutdown.trigger("done");
        driver.join().unwrap();
        assert!(clock.tick() >= 3);
    }
}
