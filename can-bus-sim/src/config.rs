//! Simulation configuration types
//!
//! Everything the core consumes: clock timing, node schedules and frames, and
//! attacker settings. Periods are expressed in bus frame-counter units, not
//! wall-clock time, so schedules do not drift with thread timing.

use crate::frame::{Frame, MAX_DLC};
use crate::types::{Result, SimError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::time::Duration;

/// Configuration for a simulation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Global clock period in microseconds (default: 3000)
    #[serde(default = "default_clock_period_us")]
    pub clock_period_us: u64,

    /// Clock pulses between two bus transitions (default: 3)
    #[serde(default = "default_pulses_per_bit")]
    pub pulses_per_bit: u64,

    /// The node the attacker targets
    #[serde(default = "default_victim")]
    pub victim: NodeConfig,

    /// Additional bystander nodes
    #[serde(default)]
    pub extra_nodes: Vec<NodeConfig>,

    #[serde(default)]
    pub attacker: AttackerConfig,

    /// Stop once the bus frame counter reaches this value
    #[serde(default)]
    pub max_frames: Option<u64>,

    /// Seed for random frames (random seed if unset)
    #[serde(default)]
    pub seed: Option<u64>,

    /// Largest payload of randomly generated frames (default: 4)
    #[serde(default = "default_max_random_dlc")]
    pub max_random_dlc: u8,
}

fn default_clock_period_us() -> u64 {
    3000
}

fn default_pulses_per_bit() -> u64 {
    3
}

fn default_max_random_dlc() -> u8 {
    4
}

fn default_victim() -> NodeConfig {
    NodeConfig::new("Victim", 5)
}

fn default_attacker_name() -> String {
    "Adversary".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            clock_period_us: default_clock_period_us(),
            pulses_per_bit: default_pulses_per_bit(),
            victim: default_victim(),
            extra_nodes: Vec::new(),
            attacker: AttackerConfig::default(),
            max_frames: None,
            seed: None,
            max_random_dlc: default_max_random_dlc(),
        }
    }
}

/// A periodically transmitting node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    pub name: String,
    /// Transmission period in bus frame-counter units
    ///
    /// Required for the victim. A bystander without one draws its period
    /// from the seeded RNG, see [`SimulationConfig::random_period_range`].
    #[serde(default)]
    pub period: Option<u64>,
    /// Frame to transmit (random if unset)
    #[serde(default)]
    pub frame: Option<FrameConfig>,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>, period: u64) -> Self {
        Self {
            name: name.into(),
            period: Some(period),
            frame: None,
        }
    }

    /// A node whose period is drawn at random when the simulation starts
    pub fn with_random_period(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            period: None,
            frame: None,
        }
    }

    /// Builder method: use a fixed frame
    pub fn with_frame(mut self, frame: FrameConfig) -> Self {
        self.frame = Some(frame);
        self
    }
}

/// Frame contents as written in configuration files
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FrameConfig {
    pub id: u16,
    /// Defaults to the payload length
    #[serde(default)]
    pub dlc: Option<u8>,
    #[serde(default)]
    pub data: Vec<u8>,
}

impl FrameConfig {
    pub fn to_frame(&self) -> Result<Frame> {
        match self.dlc {
            Some(dlc) => Frame::new(self.id, dlc, self.data.clone()),
            None => Frame::with_data(self.id, self.data.clone()),
        }
    }
}

impl From<&Frame> for FrameConfig {
    fn from(frame: &Frame) -> Self {
        Self {
            id: frame.id(),
            dlc: Some(frame.dlc()),
            data: frame.data().to_vec(),
        }
    }
}

/// Bus-off attacker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_attacker_name")]
    pub name: String,

    /// Only fingerprint frames with this ID
    #[serde(default)]
    pub target_id: Option<u16>,

    /// Give up after observing this many bus frame-counter increments
    #[serde(default)]
    pub observation_limit: Option<u64>,
}

impl Default for AttackerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: default_attacker_name(),
            target_id: None,
            observation_limit: None,
        }
    }
}

impl SimulationConfig {
    /// Create a configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: set the global clock period
    pub fn with_clock_period(mut self, period: Duration) -> Self {
        self.clock_period_us = period.as_micros() as u64;
        self
    }

    /// Builder method: set the number of clock pulses per bus bit
    pub fn with_pulses_per_bit(mut self, pulses: u64) -> Self {
        self.pulses_per_bit = pulses;
        self
    }

    /// Builder method: set the victim's period
    pub fn with_victim_period(mut self, period: u64) -> Self {
        self.victim.period = Some(period);
        self
    }

    /// Builder method: set the victim's frame
    pub fn with_victim_frame(mut self, frame: &Frame) -> Self {
        self.victim.frame = Some(FrameConfig::from(frame));
        self
    }

    /// Builder method: add a bystander node
    pub fn add_node(mut self, node: NodeConfig) -> Self {
        self.extra_nodes.push(node);
        self
    }

    /// Builder method: enable or disable the attacker
    pub fn with_attacker(mut self, enabled: bool) -> Self {
        self.attacker.enabled = enabled;
        self
    }

    /// Builder method: stop after a number of bus frames
    pub fn with_max_frames(mut self, frames: u64) -> Self {
        self.max_frames = Some(frames);
        self
    }

    /// Builder method: seed random frame generation
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn clock_period(&self) -> Duration {
        Duration::from_micros(self.clock_period_us)
    }

    /// Range random bystander periods are drawn from: one to three victim periods
    pub fn random_period_range(&self) -> Option<RangeInclusive<u64>> {
        self.victim
            .period
            .map(|period| period..=period.saturating_mul(3))
    }

    /// Every configured node, victim first
    pub fn nodes(&self) -> impl Iterator<Item = &NodeConfig> {
        std::iter::once(&self.victim).chain(self.extra_nodes.iter())
    }

    /// Check that the configuration describes a runnable simulation
    pub fn validate(&self) -> Result<()> {
        if self.clock_period_us == 0 {
            return Err(SimError::InvalidConfig("clock period must be positive".into()));
        }
        if self.pulses_per_bit == 0 {
            return Err(SimError::InvalidConfig("pulses_per_bit must be at least 1".into()));
        }
        if self.max_random_dlc == 0 || self.max_random_dlc > MAX_DLC {
            return Err(SimError::InvalidConfig(format!(
                "max_random_dlc must be within 1-{}",
                MAX_DLC
            )));
        }

        if self.victim.period.is_none() {
            return Err(SimError::InvalidConfig(format!(
                "victim '{}' needs a fixed period",
                self.victim.name
            )));
        }

        let mut names = HashSet::new();
        for node in self.nodes() {
            match node.period {
                Some(0) => {
                    return Err(SimError::InvalidConfig(format!(
                        "node '{}': period must be at least 1",
                        node.name
                    )));
                }
                Some(period) if period < 5 => log::warn!(
                    "node '{}': periods below 5 leave no idle slots between frames",
                    node.name
                ),
                _ => {}
            }
            if let Some(frame) = &node.frame {
                frame.to_frame().map_err(|e| {
                    SimError::InvalidConfig(format!("node '{}': {}", node.name, e))
                })?;
            }
            if !names.insert(node.name.as_str()) {
                return Err(SimError::InvalidConfig(format!(
                    "duplicate node name '{}'",
                    node.name
                )));
            }
        }

        if self.attacker.enabled && names.contains(self.attacker.name.as_str()) {
            return Err(SimError::InvalidConfig(format!(
                "attacker name '{}' clashes with a node",
                self.attacker.name
            )));
        }
        if !self.attacker.enabled && self.max_frames.is_none() {
            return Err(SimError::InvalidConfig(
                "without an attacker a frame limit is required to end the simulation".into(),
            ));
        }

        Ok(())
    }
}
