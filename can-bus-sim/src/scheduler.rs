//! Periodic transmission scheduling
//!
//! A [`NodeRunner`] owns one [`Ecu`] and drives it on the bus frame counter:
//! it transmits whenever the counter reaches a multiple of its period and,
//! after a bit or stuff error, retries as soon as the counter moves past the
//! failed slot. Nodes that wake on the same counter change start their SOF
//! on the same tick, which is what makes collisions (and arbitration)
//! reproducible.

use crate::bus::CanBus;
use crate::ecu::{Ecu, TransmitStats};
use crate::frame::Frame;
use crate::shutdown::{ShutdownSignal, StartBarrier};
use crate::types::{EcuStatus, Result, SimError, TecSample, TransmitOutcome};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Final state of a node once its loop has ended
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeReport {
    pub name: String,
    /// Frame the node was transmitting, in display form
    pub frame: String,
    pub period: u64,
    pub tec: u32,
    pub rec: u32,
    pub status: EcuStatus,
    pub stats: TransmitStats,
    /// Frame counter value of the transmission that sent the node BUS_OFF
    pub bus_off_at: Option<u64>,
    pub history: Vec<TecSample>,
}

/// Drives an ECU on a fixed frame-counter period
pub struct NodeRunner {
    ecu: Ecu,
    frame: Frame,
    period: u64,
    bus: Arc<CanBus>,
    shutdown: ShutdownSignal,
    start: Option<Arc<StartBarrier>>,
}

impl NodeRunner {
    pub fn new(
        name: impl Into<String>,
        frame: Frame,
        period: u64,
        bus: Arc<CanBus>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            ecu: Ecu::new(name, Arc::clone(&bus)),
            frame,
            period,
            bus,
            shutdown,
            start: None,
        }
    }

    /// Builder method: rendezvous on `barrier` before the first transmission
    pub fn with_start_barrier(mut self, barrier: Arc<StartBarrier>) -> Self {
        self.start = Some(barrier);
        self
    }

    pub fn name(&self) -> &str {
        self.ecu.name()
    }

    /// Run until this node goes BUS_OFF or the simulation is shut down
    ///
    /// Reaching BUS_OFF triggers the shared shutdown signal.
    pub fn run(mut self) -> Result<NodeReport> {
        log::info!(
            "Start {} -> Period: {}; {}",
            self.ecu.name(),
            self.period,
            self.frame
        );
        if let Some(barrier) = self.start.take() {
            if barrier.wait().is_err() {
                log::info!("{} stopped before its first transmission", self.ecu.name());
                return Ok(self.into_report(None));
            }
        }

        let mut bus_off_at = None;
        let mut retransmit = false;
        let mut last_slot = 0;

        while !self.shutdown.is_triggered() {
            let slot = if retransmit {
                self.bus.wait_frame_count(last_slot + 1)
            } else {
                self.next_slot(last_slot)
            };
            let slot = match slot {
                Ok(slot) => slot,
                Err(SimError::Cancelled) => break,
                Err(e) => return Err(e),
            };
            last_slot = slot;

            let outcome = match self.ecu.send_frame(&self.frame) {
                Ok(outcome) => outcome,
                Err(SimError::Cancelled) => break,
                Err(e) => return Err(e),
            };

            if self.ecu.is_bus_off() {
                bus_off_at = Some(slot);
                log::warn!("{} entered BUS_OFF at frame {}", self.ecu.name(), slot);
                self.shutdown
                    .trigger(format!("{} entered BUS_OFF", self.ecu.name()));
                break;
            }

            retransmit = outcome.needs_retransmission();
            if outcome == TransmitOutcome::Suppressed {
                break;
            }
        }

        Ok(self.into_report(bus_off_at))
    }

    /// Next periodic slot strictly after the one already used
    fn next_slot(&self, last_slot: u64) -> Result<u64> {
        if self.ecu.stats().attempts > 0 {
            self.bus.wait_frame_count(last_slot + 1)?;
        }
        self.bus.wait_frame_count_multiple(self.period)
    }

    fn into_report(self, bus_off_at: Option<u64>) -> NodeReport {
        NodeReport {
            name: self.ecu.name().to_string(),
            frame: self.frame.to_string(),
            period: self.period,
            tec: self.ecu.tec(),
            rec: self.ecu.rec(),
            status: self.ecu.status(),
            stats: self.ecu.stats().clone(),
            bus_off_at,
            history: self.ecu.history().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::GlobalClock;
    use std::thread;
    use std::time::Duration;

    fn start_bus(shutdown: &ShutdownSignal) -> (Arc<CanBus>, Vec<thread::JoinHandle<()>>) {
        let bus = CanBus::new(shutdown.clone());
        let clock = Arc::new(GlobalClock::new(
            Duration::from_micros(500),
            shutdown.clone(),
        ));
        let clock_thread = {
            let clock = Arc::clone(&clock);
            thread::spawn(move || clock.run())
        };
        let bus_thread = {
            let bus = Arc::clone(&bus);
            thread::spawn(move || bus.run(&clock, 3))
        };
        (bus, vec![clock_thread, bus_thread])
    }

    #[test]
    fn test_single_node_completes_every_period() {
        let shutdown = ShutdownSignal::new();
        let (bus, drivers) = start_bus(&shutdown);
        let frame = Frame::new(0x123, 1, vec![0xA5]).unwrap();
        let runner = NodeRunner::new("ECU1", frame.clone(), 5, Arc::clone(&bus), shutdown.clone());
        let node = thread::spawn(move || runner.run());

        bus.wait_frame_count(16).unwrap();
        shutdown.trigger("done");
        let report = node.join().unwrap().unwrap();
        for driver in drivers {
            driver.join().unwrap();
        }

        assert_eq!(report.name, "ECU1");
        assert_eq!(report.frame, frame.to_string());
        assert_eq!(report.status, EcuStatus::ErrorActive);
        assert_eq!(report.tec, 0);
        assert_eq!(report.stats.bit_errors, 0);
        assert_eq!(report.stats.stuff_errors, 0);
        // Slots 0, 5, 10 and 15 are reached before the counter hits 16
        assert!(report.stats.completed >= 3);
        assert!(report.bus_off_at.is_none());
    }

    /// Start two runners on the same tick and stop once the counter hits `stop_at`
    fn run_pair(
        a: (&str, Frame),
        b: (&str, Frame),
        period: u64,
        stop_at: u64,
    ) -> (NodeReport, NodeReport) {
        let shutdown = ShutdownSignal::new();
        let bus = CanBus::new(shutdown.clone());
        let barrier = StartBarrier::new(3, shutdown.clone());

        let spawn = |(name, frame): (&str, Frame)| {
            let runner = NodeRunner::new(name, frame, period, Arc::clone(&bus), shutdown.clone())
                .with_start_barrier(Arc::clone(&barrier));
            thread::spawn(move || runner.run())
        };
        let a = spawn(a);
        let b = spawn(b);
        barrier.wait().unwrap();

        // Both runners submit SOF before the bus is driven
        thread::sleep(Duration::from_millis(50));
        let clock = Arc::new(GlobalClock::new(
            Duration::from_micros(500),
            shutdown.clone(),
        ));
        let clock_thread = {
            let clock = Arc::clone(&clock);
            thread::spawn(move || clock.run())
        };
        let bus_thread = {
            let bus = Arc::clone(&bus);
            thread::spawn(move || bus.run(&clock, 3))
        };

        bus.wait_frame_count(stop_at).unwrap();
        shutdown.trigger("done");
        let a = a.join().unwrap().unwrap();
        let b = b.join().unwrap().unwrap();
        clock_thread.join().unwrap();
        bus_thread.join().unwrap();
        (a, b)
    }

    #[test]
    fn test_lower_id_wins_shared_slot() {
        let (high, low) = run_pair(
            ("High", Frame::new(0x100, 0, vec![]).unwrap()),
            ("Low", Frame::new(0x0FF, 0, vec![]).unwrap()),
            5,
            1,
        );

        assert_eq!(high.stats.arbitration_losses, 1);
        assert_eq!(high.tec, 0);
        assert_eq!(low.stats.completed, 1);
        assert_eq!(low.tec, 0);
    }

    #[test]
    fn test_lost_arbitration_waits_for_next_period() {
        let (high, low) = run_pair(
            ("High", Frame::new(0x100, 0, vec![]).unwrap()),
            ("Low", Frame::new(0x0FF, 0, vec![]).unwrap()),
            50,
            4,
        );

        // Slot 50 is far away: the loser must not have tried again
        assert_eq!(high.stats.attempts, 1);
        assert_eq!(high.stats.arbitration_losses, 1);
        assert_eq!(high.tec, 0);
        assert_eq!(low.stats.attempts, 1);
        assert_eq!(low.stats.completed, 1);
    }

    #[test]
    fn test_errored_frame_retried_before_next_period() {
        let (a, b) = run_pair(
            ("A", Frame::new(0x555, 1, vec![0xFF]).unwrap()),
            ("B", Frame::new(0x555, 1, vec![0x0F]).unwrap()),
            50,
            4,
        );

        for node in [&a, &b] {
            assert!(node.stats.bit_errors + node.stats.stuff_errors >= 1);
            // Slot 0 plus at least one retry long before slot 50
            assert!(
                node.stats.attempts >= 2,
                "{} made {} attempts",
                node.name,
                node.stats.attempts
            );
        }
        assert!(a.stats.attempts + b.stats.attempts >= 4);
    }

    #[test]
    fn test_runner_stops_on_shutdown() {
        let shutdown = ShutdownSignal::new();
        let bus = CanBus::new(shutdown.clone());

        // The bus is never driven, so the runner blocks on its first bit
        let runner = NodeRunner::new(
            "ECU1",
            Frame::new(0x1, 0, vec![]).unwrap(),
            5,
            Arc::clone(&bus),
            shutdown.clone(),
        );
        let node = thread::spawn(move || runner.run());
        thread::sleep(Duration::from_millis(20));
        shutdown.trigger("stop");

        let report = node.join().unwrap().unwrap();
        assert_eq!(report.stats.completed, 0);
        assert_eq!(report.status, EcuStatus::ErrorActive);
    }

    #[test]
    fn test_runner_released_when_start_never_completes() {
        let shutdown = ShutdownSignal::new();
        let bus = CanBus::new(shutdown.clone());
        // The second party never arrives
        let barrier = StartBarrier::new(2, shutdown.clone());
        let runner = NodeRunner::new(
            "ECU1",
            Frame::new(0x1, 0, vec![]).unwrap(),
            5,
            Arc::clone(&bus),
            shutdown.clone(),
        )
        .with_start_barrier(barrier);
        let node = thread::spawn(move || runner.run());

        thread::sleep(Duration::from_millis(20));
        assert!(!node.is_finished());
        shutdown.trigger("stop");

        let report = node.join().unwrap().unwrap();
        assert_eq!(report.stats.attempts, 0);
        assert!(report.history.is_empty());
    }
}
