//! Shared CAN medium
//!
//! The bus aggregates the bits driven by every node during one tick with a
//! wired-AND, then advances a small state machine once per tick:
//!
//! - `ACTIVE` → the accumulated bit is appended to the in-progress frame and
//!   the bus goes to `WAIT`.
//! - `WAIT` → a whole tick went by without a driven bit: the in-progress
//!   sequence is published as the completed frame, the frame counter is
//!   incremented and the bus goes `IDLE`.
//! - `IDLE` → every second consecutive idle tick increments the frame counter
//!   and clears the published frame, so period-based schedulers keep
//!   progressing while the bus is silent.
//!
//! The bus never references the nodes. Nodes hold an `Arc<CanBus>` and submit
//! bits through [`CanBus::transmit_bit`] / [`BitMedium::exchange_bit`].

use crate::clock::GlobalClock;
use crate::shutdown::ShutdownSignal;
use crate::types::{Bit, BitSequence, BusStatus, Result, SimError};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Resolved bits remembered for late readers
///
/// Longer than any stuffed frame, so a transmitter is never more than one
/// frame behind the bus.
const RESOLVED_HISTORY: usize = 256;

/// Anything a node can drive bits onto
///
/// Implemented by [`CanBus`]; the indirection keeps the node protocol
/// testable against scripted media.
pub trait BitMedium: Send + Sync {
    /// Offer `bit` for the current tick and block until the tick resolves
    ///
    /// Returns the bit every participant observed on the medium.
    fn exchange_bit(&self, bit: Bit) -> Result<Bit>;
}

#[derive(Debug)]
struct BusState {
    /// Wired-AND of every bit driven during the current tick
    accumulator: Bit,
    /// Resolved bits of the frame in progress
    frame: BitSequence,
    /// Last completed frame
    sended_frame: BitSequence,
    sended_bit: Bit,
    status: BusStatus,
    /// Frames completed plus idle slots elapsed
    count: u64,
    /// Transitions processed
    tick: u64,
    idle_ticks: u64,
    /// (tick, bit) pairs of recent ACTIVE → WAIT transitions
    resolved: VecDeque<(u64, Bit)>,
}

impl BusState {
    fn new() -> Self {
        Self {
            accumulator: Bit::Recessive,
            frame: Vec::new(),
            sended_frame: Vec::new(),
            sended_bit: Bit::Recessive,
            status: BusStatus::Idle,
            count: 0,
            tick: 0,
            idle_ticks: 0,
            resolved: VecDeque::with_capacity(RESOLVED_HISTORY),
        }
    }
}

/// Bus statistics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusStats {
    pub status: BusStatus,
    pub frame_count: u64,
    pub ticks: u64,
}

/// The single shared medium of a simulation
pub struct CanBus {
    state: Mutex<BusState>,
    changed: Condvar,
    shutdown: ShutdownSignal,
}

impl CanBus {
    pub fn new(shutdown: ShutdownSignal) -> Arc<Self> {
        let bus = Arc::new(Self {
            state: Mutex::new(BusState::new()),
            changed: Condvar::new(),
            shutdown: shutdown.clone(),
        });

        let wake = Arc::downgrade(&bus);
        shutdown.on_trigger(move || {
            if let Some(bus) = wake.upgrade() {
                let _guard = bus.state.lock();
                bus.changed.notify_all();
            }
        });

        bus
    }

    /// Drive `bit` during the current tick
    ///
    /// Returns the tick index whose transition will resolve the bit.
    pub fn transmit_bit(&self, bit: Bit) -> u64 {
        let mut state = self.state.lock();
        state.accumulator = state.accumulator.wired_and(bit);
        state.status = BusStatus::Active;
        state.tick
    }

    /// Advance the bus by one tick
    pub fn process(&self) {
        let mut state = self.state.lock();

        match state.status {
            BusStatus::Wait => {
                let frame = std::mem::take(&mut state.frame);
                log::trace!("Bus frame #{} completed ({} bits)", state.count + 1, frame.len());
                state.sended_frame = frame;
                state.accumulator = Bit::Recessive;
                state.count += 1;
                state.idle_ticks = 0;
                state.status = BusStatus::Idle;
            }
            BusStatus::Active => {
                let bit = state.accumulator;
                let tick = state.tick;
                state.frame.push(bit);
                state.sended_bit = bit;
                if state.resolved.len() == RESOLVED_HISTORY {
                    state.resolved.pop_front();
                }
                state.resolved.push_back((tick, bit));
                state.accumulator = Bit::Recessive;
                state.idle_ticks = 0;
                state.status = BusStatus::Wait;
            }
            BusStatus::Idle => {
                state.idle_ticks += 1;
                if state.idle_ticks % 2 == 0 {
                    state.count += 1;
                    state.sended_frame.clear();
                }
            }
        }

        state.tick += 1;
        self.changed.notify_all();
    }

    /// Bus driver loop: one transition every `pulses_per_bit` clock pulses
    pub fn run(&self, clock: &GlobalClock, pulses_per_bit: u64) {
        log::info!(
            "CAN bus driver started ({} pulses per bit, {:?} bit time)",
            pulses_per_bit,
            Self::bit_time(clock, pulses_per_bit)
        );
        while !self.shutdown.is_triggered() {
            if clock.wait_ticks(pulses_per_bit).is_err() {
                break;
            }
            self.process();
        }
        log::info!("CAN bus driver stopped at frame count {}", self.get_count());
    }

    /// Wall-clock duration of one bus transition
    pub fn bit_time(clock: &GlobalClock, pulses_per_bit: u64) -> Duration {
        clock
            .period()
            .saturating_mul(u32::try_from(pulses_per_bit).unwrap_or(u32::MAX))
    }

    /// Last resolved bit
    pub fn get_sended_bit(&self) -> Bit {
        self.state.lock().sended_bit
    }

    /// Last completed frame as resolved on the medium (empty after idle slots)
    pub fn get_sended_frame(&self) -> BitSequence {
        self.state.lock().sended_frame.clone()
    }

    pub fn get_status(&self) -> BusStatus {
        self.state.lock().status
    }

    /// Monotonic frame counter
    pub fn get_count(&self) -> u64 {
        self.state.lock().count
    }

    /// Frame counter together with the published frame, read atomically
    pub fn published_frame(&self) -> (u64, BitSequence) {
        let state = self.state.lock();
        (state.count, state.sended_frame.clone())
    }

    pub fn stats(&self) -> BusStats {
        let state = self.state.lock();
        BusStats {
            status: state.status,
            frame_count: state.count,
            ticks: state.tick,
        }
    }

    /// Block until the bus is idle
    pub fn wait_idle_status(&self) -> Result<()> {
        self.wait_for(|state| (state.status == BusStatus::Idle).then_some(()))
    }

    /// Block until the bus has resolved a bit and waits for the next one
    pub fn wait_wait_status(&self) -> Result<()> {
        self.wait_for(|state| (state.status == BusStatus::Wait).then_some(()))
    }

    /// Block until the frame counter changes; returns the new value
    pub fn wait_frame_count_increase(&self) -> Result<u64> {
        let observed = self.get_count();
        self.wait_for(|state| (state.count > observed).then_some(state.count))
    }

    /// Block until the frame counter reaches the next multiple of `period`
    ///
    /// Returns immediately if the counter already is a multiple.
    pub fn wait_frame_count_multiple(&self, period: u64) -> Result<u64> {
        if period == 0 {
            return Err(SimError::InvalidConfig("period must be at least 1".into()));
        }
        let target = self.get_count().div_ceil(period) * period;
        self.wait_frame_count(target)
    }

    /// Block until the frame counter is at least `count`
    pub fn wait_frame_count(&self, count: u64) -> Result<u64> {
        self.wait_for(|state| (state.count >= count).then_some(state.count))
    }

    /// Block until the transition of `tick` ran and return the bit it resolved
    ///
    /// Fails with [`SimError::BitUnavailable`] if the tick already left the
    /// resolved history, or never resolved a driven bit.
    pub fn wait_bit_resolved(&self, tick: u64) -> Result<Bit> {
        self.wait_for(|state| {
            if state.tick <= tick {
                return None;
            }
            let bit = state
                .resolved
                .iter()
                .rev()
                .find(|(t, _)| *t == tick)
                .map(|(_, bit)| *bit)
                .ok_or(SimError::BitUnavailable(tick));
            Some(bit)
        })?
    }

    /// Wait on the bus condition until `ready` yields a value
    ///
    /// The lock is released while sleeping; shutdown wakes every waiter.
    fn wait_for<T>(&self, mut ready: impl FnMut(&BusState) -> Option<T>) -> Result<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(value) = ready(&state) {
                return Ok(value);
            }
            if self.shutdown.is_triggered() {
                return Err(SimError::Cancelled);
            }
            self.changed.wait(&mut state);
        }
    }
}

impl BitMedium for CanBus {
    fn exchange_bit(&self, bit: Bit) -> Result<Bit> {
        let tick = self.transmit_bit(bit);
        self.wait_bit_resolved(tick)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::types::bits_from_str;
    use std::thread;

    fn bus() -> Arc<CanBus> {
        CanBus::new(ShutdownSignal::new())
    }

    #[test]
    fn test_resolved_bit_is_wired_and() {
        let bus = bus();
        for (a, b, expected) in [
            (Bit::Dominant, Bit::Recessive, Bit::Dominant),
            (Bit::Recessive, Bit::Recessive, Bit::Recessive),
            (Bit::Recessive, Bit::Dominant, Bit::Dominant),
        ] {
            bus.transmit_bit(a);
            bus.transmit_bit(b);
            assert_eq!(bus.get_status(), BusStatus::Active);
            bus.process();
            assert_eq!(bus.get_sended_bit(), expected);
            assert_eq!(bus.get_status(), BusStatus::Wait);
        }
    }

    #[test]
    fn test_frame_published_after_silent_tick() {
        let bus = bus();
        let bits = Frame::new(0x2A, 1, vec![0x5C]).unwrap().encode();
        for bit in &bits {
            bus.transmit_bit(*bit);
            bus.process();
        }
        assert_eq!(bus.get_count(), 0);
        assert!(bus.get_sended_frame().is_empty());

        bus.process();
        assert_eq!(bus.get_status(), BusStatus::Idle);
        assert_eq!(bus.get_count(), 1);
        assert_eq!(bus.get_sended_frame(), bits);
    }

    #[test]
    fn test_two_transmitters_resolve_to_and_of_sequences() {
        let bus = bus();
        let a = bits_from_str("0110101");
        let b = bits_from_str("0101111");
        for (x, y) in a.iter().zip(&b) {
            bus.transmit_bit(*x);
            bus.transmit_bit(*y);
            bus.process();
        }
        bus.process();
        assert_eq!(bus.get_sended_frame(), bits_from_str("0100101"));
    }

    #[test]
    fn test_idle_ticks_advance_counter() {
        let bus = bus();
        bus.transmit_bit(Bit::Dominant);
        bus.process();
        bus.process();
        assert_eq!(bus.get_count(), 1);
        assert_eq!(bus.get_sended_frame(), vec![Bit::Dominant]);

        bus.process();
        assert_eq!(bus.get_count(), 1);
        assert_eq!(bus.get_sended_frame(), vec![Bit::Dominant]);

        bus.process();
        assert_eq!(bus.get_count(), 2);
        assert!(bus.get_sended_frame().is_empty());

        bus.process();
        bus.process();
        assert_eq!(bus.get_count(), 3);
        assert_eq!(bus.stats().ticks, 6);
    }

    #[test]
    fn test_activity_resets_idle_run() {
        let bus = bus();
        bus.process(); // idle 1
        bus.transmit_bit(Bit::Recessive);
        bus.process(); // active -> wait
        bus.process(); // publish
        assert_eq!(bus.get_count(), 1);
        bus.process(); // idle 1
        assert_eq!(bus.get_count(), 1);
        bus.process(); // idle 2
        assert_eq!(bus.get_count(), 2);
    }

    #[test]
    fn test_exchange_bit_returns_resolved_bit() {
        let bus = bus();
        let node = {
            let bus = Arc::clone(&bus);
            thread::spawn(move || bus.exchange_bit(Bit::Recessive))
        };
        while bus.get_status() != BusStatus::Active {
            thread::sleep(Duration::from_millis(1));
        }
        bus.transmit_bit(Bit::Dominant);
        bus.process();
        assert_eq!(node.join().unwrap().unwrap(), Bit::Dominant);
    }

    #[test]
    fn test_wait_frame_count_multiple() {
        let bus = bus();
        let waiter = {
            let bus = Arc::clone(&bus);
            thread::spawn(move || bus.wait_frame_count_multiple(3))
        };
        // Counter 0 is already a multiple
        assert_eq!(waiter.join().unwrap().unwrap(), 0);

        bus.process();
        bus.process();
        assert_eq!(bus.get_count(), 1);
        let waiter = {
            let bus = Arc::clone(&bus);
            thread::spawn(move || bus.wait_frame_count_multiple(3))
        };
        while !waiter.is_finished() {
            bus.process();
            thread::sleep(Duration::from_millis(1));
        }
        assert!(waiter.join().unwrap().unwrap() >= 3);
        assert!(bus.wait_frame_count_multiple(0).is_err());
    }

    #[test]
    fn test_wait_frame_count_and_increase() {
        let bus = bus();
        let increase = {
            let bus = Arc::clone(&bus);
            thread::spawn(move || bus.wait_frame_count_increase())
        };
        let reach = {
            let bus = Arc::clone(&bus);
            thread::spawn(move || bus.wait_frame_count(4))
        };
        while !(increase.is_finished() && reach.is_finished()) {
            bus.process();
            thread::sleep(Duration::from_millis(1));
        }
        assert!(increase.join().unwrap().unwrap() >= 1);
        assert!(reach.join().unwrap().unwrap() >= 4);
    }

    #[test]
    fn test_evicted_tick_is_an_error() {
        let bus = bus();
        let tick = bus.transmit_bit(Bit::Dominant);
        bus.process();
        for _ in 0..RESOLVED_HISTORY {
            bus.transmit_bit(Bit::Recessive);
            bus.process();
        }

        assert_eq!(bus.get_sended_bit(), Bit::Recessive);
        assert!(matches!(
            bus.wait_bit_resolved(tick),
            Err(SimError::BitUnavailable(t)) if t == tick
        ));
        // The oldest tick still in the history keeps its own bit
        let recent = bus.stats().ticks - RESOLVED_HISTORY as u64;
        assert_eq!(bus.wait_bit_resolved(recent).unwrap(), Bit::Recessive);
    }

    #[test]
    fn test_undriven_tick_is_an_error() {
        let bus = bus();
        bus.process();
        bus.process();
        assert!(matches!(
            bus.wait_bit_resolved(0),
            Err(SimError::BitUnavailable(0))
        ));
    }

    #[test]
    fn test_wait_idle_status_returns_after_publish() {
        let bus = bus();
        bus.transmit_bit(Bit::Dominant);
        bus.process();
        assert_eq!(bus.get_status(), BusStatus::Wait);

        let waiter = {
            let bus = Arc::clone(&bus);
            thread::spawn(move || {
                bus.wait_idle_status()?;
                Ok::<_, SimError>(bus.published_frame())
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        bus.process();
        let (count, frame) = waiter.join().unwrap().unwrap();
        assert_eq!(count, 1);
        assert_eq!(frame, vec![Bit::Dominant]);

        // Already idle: returns without another transition
        bus.wait_idle_status().unwrap();
    }

    #[test]
    fn test_waits_cancelled_by_shutdown() {
        let shutdown = ShutdownSignal::new();
        let bus = CanBus::new(shutdown.clone());
        bus.transmit_bit(Bit::Dominant);
        bus.process();
        let waiters: Vec<_> = (0..4)
            .map(|i| {
                let bus = Arc::clone(&bus);
                thread::spawn(move || match i {
                    0 => bus.wait_idle_status(),
                    1 => bus.wait_frame_count(100).map(|_| ()),
                    2 => bus.wait_bit_resolved(1).map(|_| ()),
                    _ => bus.exchange_bit(Bit::Dominant).map(|_| ()),
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        shutdown.trigger("test");
        for waiter in waiters {
            assert!(matches!(waiter.join().unwrap(), Err(SimError::Cancelled)));
        }
    }

    #[test]
    fn test_bit_time_scales_clock_period() {
        let clock = GlobalClock::new(Duration::from_micros(250), ShutdownSignal::new());
        assert_eq!(CanBus::bit_time(&clock, 3), Duration::from_micros(750));
        assert_eq!(CanBus::bit_time(&clock, 1), clock.period());
    }

    #[test]
    fn test_run_drives_transitions_from_clock() {
        let shutdown = ShutdownSignal::new();
        let clock = Arc::new(GlobalClock::new(Duration::from_millis(1), shutdown.clone()));
        let bus = CanBus::new(shutdown.clone());

        let clock_driver = {
            let clock = Arc::clone(&clock);
            thread::spawn(move || clock.run())
        };
        let bus_driver = {
            let bus = Arc::clone(&bus);
            let clock = Arc::clone(&clock);
            thread::spawn(move || bus.run(&clock, 2))
        };

        assert!(bus.wait_frame_count(3).unwrap() >= 3);
        shutdown.trigger("done");
        clock_driver.join().unwrap();
        bus_driver.join().unwrap();
    }
}
