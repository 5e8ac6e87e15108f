//! Core types for the CAN bus simulator
//!
//! This module defines the wire-level bit type, the state enums shared by the
//! bus and the nodes, the diagnostic sample type and the error taxonomy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp type used throughout the simulator
pub type Timestamp = DateTime<Utc>;

/// Result type for simulator operations
pub type Result<T> = std::result::Result<T, SimError>;

/// Ordered wire-level bit content (stuffed or unstuffed)
pub type BitSequence = Vec<Bit>;

/// A single bit on the shared medium
///
/// The bus is a wired-AND: a dominant bit driven by any node overrides
/// recessive bits driven by every other node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Bit {
    /// Logical 0
    Dominant,
    /// Logical 1, the idle level of the bus
    Recessive,
}

impl Bit {
    /// Resolve two simultaneously driven bits
    pub fn wired_and(self, other: Bit) -> Bit {
        if self == Bit::Dominant || other == Bit::Dominant {
            Bit::Dominant
        } else {
            Bit::Recessive
        }
    }

    /// The opposite level (used for stuff bits)
    pub fn complement(self) -> Bit {
        match self {
            Bit::Dominant => Bit::Recessive,
            Bit::Recessive => Bit::Dominant,
        }
    }

    /// True if this bit would win against `other` on the medium
    pub fn dominates(self, other: Bit) -> bool {
        self == Bit::Dominant && other == Bit::Recessive
    }

    /// Numeric value of the bit (0 or 1)
    pub fn as_u8(self) -> u8 {
        match self {
            Bit::Dominant => 0,
            Bit::Recessive => 1,
        }
    }
}

impl From<bool> for Bit {
    fn from(value: bool) -> Self {
        if value {
            Bit::Recessive
        } else {
            Bit::Dominant
        }
    }
}

impl fmt::Display for Bit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// Render a bit slice as a compact `0`/`1` string
pub fn bits_to_string(bits: &[Bit]) -> String {
    bits.iter().map(|b| if *b == Bit::Dominant { '0' } else { '1' }).collect()
}

/// Parse a `0`/`1` string into bits, ignoring any other character
///
/// Mostly useful in tests and log analysis where sequences are written by hand.
pub fn bits_from_str(s: &str) -> BitSequence {
    s.chars()
        .filter_map(|c| match c {
            '0' => Some(Bit::Dominant),
            '1' => Some(Bit::Recessive),
            _ => None,
        })
        .collect()
}

/// State of the shared medium
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusStatus {
    /// Nothing driven
    Idle,
    /// At least one bit was driven during the current tick
    Active,
    /// A full tick elapsed since the last driven bit (end-of-frame candidate)
    Wait,
}

impl fmt::Display for BusStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusStatus::Idle => write!(f, "IDLE"),
            BusStatus::Active => write!(f, "ACTIVE"),
            BusStatus::Wait => write!(f, "WAIT"),
        }
    }
}

/// Fault confinement state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EcuStatus {
    ErrorActive,
    ErrorPassive,
    /// Terminal: the node no longer drives the bus
    BusOff,
}

impl EcuStatus {
    /// Level of the error flag a node in this state broadcasts
    pub fn error_flag_bit(self) -> Bit {
        match self {
            EcuStatus::ErrorActive => Bit::Dominant,
            EcuStatus::ErrorPassive | EcuStatus::BusOff => Bit::Recessive,
        }
    }
}

impl fmt::Display for EcuStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EcuStatus::ErrorActive => write!(f, "ERROR_ACTIVE"),
            EcuStatus::ErrorPassive => write!(f, "ERROR_PASSIVE"),
            EcuStatus::BusOff => write!(f, "BUS_OFF"),
        }
    }
}

/// Result of a single transmission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransmitOutcome {
    /// Every bit was sent and read back unchanged
    Completed,
    /// Another node with a lower ID won arbitration (no penalty)
    ArbitrationLost,
    /// The resolved bit differed from the offered bit outside arbitration
    BitError,
    /// Six identical resolved bits were observed
    StuffError,
    /// The node is BUS_OFF and did not drive the bus
    Suppressed,
}

impl TransmitOutcome {
    /// True if the caller should retransmit on the next bus cycle
    pub fn needs_retransmission(self) -> bool {
        matches!(self, TransmitOutcome::BitError | TransmitOutcome::StuffError)
    }
}

impl fmt::Display for TransmitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransmitOutcome::Completed => write!(f, "COMPLETED"),
            TransmitOutcome::ArbitrationLost => write!(f, "LOWER_FRAME_ID"),
            TransmitOutcome::BitError => write!(f, "BIT_ERROR"),
            TransmitOutcome::StuffError => write!(f, "STUFF_ERROR"),
            TransmitOutcome::Suppressed => write!(f, "SUPPRESSED"),
        }
    }
}

/// One diagnostic sample of a node's error counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TecSample {
    /// Transmit error counter after the change
    pub tec: u32,
    /// Receive error counter after the change
    pub rec: u32,
    /// Wall-clock time of the change
    pub timestamp: Timestamp,
}

/// Reasons a bit sequence cannot be turned back into a frame
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Bit sequence too short: {len} bits, need at least {min}")]
    TooShort { len: usize, min: usize },

    #[error("Invalid DLC: {0} (must be 0-8)")]
    InvalidDlc(u8),

    #[error("Bit sequence truncated: {len} bits, DLC announces {expected}")]
    Truncated { len: usize, expected: usize },

    #[error("Invalid EOF: 0b{0:07b} (expected 0b1111111)")]
    InvalidEof(u8),
}

/// Errors that can occur while running the simulation
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Frame decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Resolved bit of tick {0} is no longer available")]
    BitUnavailable(u64),

    #[error("Simulation cancelled")]
    Cancelled,

    #[error("Thread panicked: {0}")]
    ThreadPanicked(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wired_and() {
        assert_eq!(Bit::Dominant.wired_and(Bit::Recessive), Bit::Dominant);
        assert_eq!(Bit::Recessive.wired_and(Bit::Dominant), Bit::Dominant);
        assert_eq!(Bit::Recessive.wired_and(Bit::Recessive), Bit::Recessive);
        assert_eq!(Bit::Dominant.wired_and(Bit::Dominant), Bit::Dominant);
    }

    #[test]
    fn test_dominates() {
        assert!(Bit::Dominant.dominates(Bit::Recessive));
        assert!(!Bit::Recessive.dominates(Bit::Dominant));
        assert!(!Bit::Dominant.dominates(Bit::Dominant));
    }

    #[test]
    fn test_bit_string_conversions() {
        let bits = bits_from_str("0110 1");
        assert_eq!(
            bits,
            vec![Bit::Dominant, Bit::Recessive, Bit::Recessive, Bit::Dominant, Bit::Recessive]
        );
        assert_eq!(bits_to_string(&bits), "01101");
    }

    #[test]
    fn test_error_flag_levels() {
        assert_eq!(EcuStatus::ErrorActive.error_flag_bit(), Bit::Dominant);
        assert_eq!(EcuStatus::ErrorPassive.error_flag_bit(), Bit::Recessive);
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(TransmitOutcome::ArbitrationLost.to_string(), "LOWER_FRAME_ID");
        assert_eq!(EcuStatus::BusOff.to_string(), "BUS_OFF");
        assert!(TransmitOutcome::BitError.needs_retransmission());
        assert!(!TransmitOutcome::ArbitrationLost.needs_retransmission());
    }
}
