//! Electronic Control Unit transmit protocol
//!
//! An ECU sends a frame one resolved bit per tick and compares what it reads
//! back from the medium with what it offered:
//!
//! 1. Six identical resolved bits in a row → stuff error.
//! 2. Inside the identifier a dominant bit where a recessive one was offered
//!    means a lower ID is winning arbitration: back off without penalty.
//! 3. Anywhere else a mismatch is a bit error.
//!
//! Errors are signalled with a six-bit error flag (dominant while
//! ERROR_ACTIVE, recessive while ERROR_PASSIVE) and cost 8 TEC points; a
//! completed frame gives one point back. Node health follows the CAN fault
//! confinement thresholds.
//!
//! Only transmit-side errors are modelled: REC is carried for the health
//! derivation and the diagnostics, but nothing increments it.

use crate::bus::{BitMedium, CanBus};
use crate::frame::Frame;
use crate::types::{Bit, EcuStatus, Result, TecSample, TransmitOutcome};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// TEC/REC value above which a node becomes ERROR_PASSIVE
pub const ERROR_PASSIVE_THRESHOLD: u32 = 127;

/// TEC value above which a node goes BUS_OFF
pub const BUS_OFF_THRESHOLD: u32 = 255;

/// TEC increment per detected bit or stuff error
pub const TEC_ERROR_PENALTY: u32 = 8;

/// Length of the error flag, also the stuff-error window
pub const ERROR_FLAG_BITS: usize = 6;

/// Per-node transmission statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransmitStats {
    pub attempts: u64,
    pub completed: u64,
    pub arbitration_losses: u64,
    pub bit_errors: u64,
    pub stuff_errors: u64,
}

impl TransmitStats {
    fn record(&mut self, outcome: TransmitOutcome) {
        match outcome {
            TransmitOutcome::Completed => self.completed += 1,
            TransmitOutcome::ArbitrationLost => self.arbitration_losses += 1,
            TransmitOutcome::BitError => self.bit_errors += 1,
            TransmitOutcome::StuffError => self.stuff_errors += 1,
            TransmitOutcome::Suppressed => {}
        }
    }
}

/// A simulated node attached to a shared medium
pub struct Ecu<M: BitMedium + ?Sized = CanBus> {
    name: String,
    medium: Arc<M>,
    tec: u32,
    rec: u32,
    status: EcuStatus,
    history: Vec<TecSample>,
    stats: TransmitStats,
}

impl<M: BitMedium + ?Sized> Ecu<M> {
    pub fn new(name: impl Into<String>, medium: Arc<M>) -> Self {
        Self {
            name: name.into(),
            medium,
            tec: 0,
            rec: 0,
            status: EcuStatus::ErrorActive,
            history: Vec::new(),
            stats: TransmitStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tec(&self) -> u32 {
        self.tec
    }

    pub fn rec(&self) -> u32 {
        self.rec
    }

    pub fn status(&self) -> EcuStatus {
        self.status
    }

    pub fn is_bus_off(&self) -> bool {
        self.status == EcuStatus::BusOff
    }

    /// Every (TEC, REC, timestamp) sample recorded so far
    pub fn history(&self) -> &[TecSample] {
        &self.history
    }

    pub fn stats(&self) -> &TransmitStats {
        &self.stats
    }

    /// Transmit `frame`, one bit per bus tick
    ///
    /// Bit and stuff errors are handled here (error flag + TEC penalty) and
    /// reported through the returned outcome; `Err` only means the simulation
    /// was cancelled mid-frame.
    pub fn send_frame(&mut self, frame: &Frame) -> Result<TransmitOutcome> {
        if self.is_bus_off() {
            return Ok(TransmitOutcome::Suppressed);
        }

        self.stats.attempts += 1;
        let outcome = self.transmit(frame)?;
        self.stats.record(outcome);

        log::debug!(
            "{:<9} | TEC: {:<3} Status: {:<13} | {} -> {}",
            self.name,
            self.tec,
            self.status.to_string(),
            frame,
            outcome
        );
        Ok(outcome)
    }

    fn transmit(&mut self, frame: &Frame) -> Result<TransmitOutcome> {
        let bits = frame.encode();
        let arbitration = 1..frame.arbitration_end();
        let mut window: VecDeque<Bit> = VecDeque::with_capacity(ERROR_FLAG_BITS);

        for (index, &offered) in bits.iter().enumerate() {
            let resolved = self.medium.exchange_bit(offered)?;

            if window.len() == ERROR_FLAG_BITS {
                window.pop_front();
            }
            window.push_back(resolved);

            if window.len() == ERROR_FLAG_BITS && window.iter().all(|b| *b == resolved) {
                log::trace!("{}: stuff error at bit {}", self.name, index);
                return self.signal_error(TransmitOutcome::StuffError);
            }

            if resolved == offered {
                continue;
            }

            if arbitration.contains(&index) && resolved.dominates(offered) {
                log::trace!("{}: lost arbitration at bit {}", self.name, index);
                return Ok(TransmitOutcome::ArbitrationLost);
            }

            log::trace!(
                "{}: bit error at bit {} (offered {}, read {})",
                self.name,
                index,
                offered,
                resolved
            );
            return self.signal_error(TransmitOutcome::BitError);
        }

        self.decrease_tec();
        Ok(TransmitOutcome::Completed)
    }

    /// Broadcast the error flag, then apply the TEC penalty
    fn signal_error(&mut self, outcome: TransmitOutcome) -> Result<TransmitOutcome> {
        let flag = self.status.error_flag_bit();
        for _ in 0..ERROR_FLAG_BITS {
            self.medium.exchange_bit(flag)?;
        }
        self.increase_tec();
        Ok(outcome)
    }

    fn increase_tec(&mut self) {
        self.tec += TEC_ERROR_PENALTY;
        self.record_sample();
    }

    fn decrease_tec(&mut self) {
        self.tec = self.tec.saturating_sub(1);
        self.record_sample();
    }

    fn record_sample(&mut self) {
        self.history.push(TecSample {
            tec: self.tec,
            rec: self.rec,
            timestamp: Utc::now(),
        });
        self.update_status();
    }

    fn update_status(&mut self) {
        if self.status == EcuStatus::BusOff {
            return;
        }

        let status = if self.tec > BUS_OFF_THRESHOLD {
            EcuStatus::BusOff
        } else if self.tec > ERROR_PASSIVE_THRESHOLD || self.rec > ERROR_PASSIVE_THRESHOLD {
            EcuStatus::ErrorPassive
        } else {
            EcuStatus::ErrorActive
        };

        if status != self.status {
            match status {
                EcuStatus::BusOff => log::warn!("{} entered BUS_OFF (TEC {})", self.name, self.tec),
                _ => log::info!("{}: {} -> {} (TEC {})", self.name, self.status, status, self.tec),
            }
            self.status = status;
        }
    }
}
