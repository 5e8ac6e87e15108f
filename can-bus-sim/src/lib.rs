//! CAN Bus Simulator Library
//!
//! A bit-level simulation of a Classical CAN bus and of the bus-off attack:
//! an adversary that learns a victim's transmission period from the traffic
//! and collides with every one of its frames until fault confinement takes
//! the victim off the bus.
//!
//! # Architecture
//!
//! - [`GlobalClock`] emits pulses; [`CanBus`] advances one bit per
//!   `pulses_per_bit` pulses and resolves concurrent bits with a wired-AND
//! - [`Frame`] encodes and decodes the simplified base frame
//!   (SOF, 11-bit ID, DLC, data, EOF) with bit stuffing
//! - [`Ecu`] implements the transmit protocol: arbitration, bit and stuff
//!   error detection, error flags, TEC/REC and ERROR_ACTIVE → ERROR_PASSIVE
//!   → BUS_OFF
//! - [`NodeRunner`] schedules an ECU on the bus frame counter
//! - [`Attacker`] fingerprints frames, infers the period and jams the victim
//! - [`Simulation`] wires it all together on one thread per participant
//!
//! Every blocking wait is interruptible through the shared
//! [`ShutdownSignal`], which a node triggers when it goes BUS_OFF.
//!
//! # Example Usage
//!
//! ```no_run
//! use can_bus_sim::{Simulation, SimulationConfig};
//! use std::time::Duration;
//!
//! let config = SimulationConfig::new()
//!     .with_clock_period(Duration::from_millis(1))
//!     .with_victim_period(5)
//!     .with_seed(42);
//!
//! let report = Simulation::new(config).unwrap().run().unwrap();
//! if let Some(node) = report.bus_off_node {
//!     println!("{} entered BUS_OFF after {} frames", node, report.frame_count);
//! }
//! ```

pub mod attacker;
pub mod bus;
pub mod clock;
pub mod config;
pub mod ecu;
pub mod frame;
pub mod scheduler;
pub mod shutdown;
pub mod simulation;
pub mod types;

// Re-export main types for convenience
pub use attacker::{AttackReport, Attacker, Detection, PeriodDetector};
pub use bus::{BitMedium, BusStats, CanBus};
pub use clock::GlobalClock;
pub use config::{AttackerConfig, FrameConfig, NodeConfig, SimulationConfig};
pub use ecu::{Ecu, TransmitStats};
pub use frame::Frame;
pub use scheduler::{NodeReport, NodeRunner};
pub use shutdown::{ShutdownSignal, StartBarrier};
pub use simulation::{NodePlan, Simulation, SimulationReport};
pub use types::{
    Bit, BitSequence, BusStatus, DecodeError, EcuStatus, Result, SimError, TecSample,
    Timestamp, TransmitOutcome,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
