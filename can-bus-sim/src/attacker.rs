//! Bus-off attacker
//!
//! The attacker passively decodes every completed frame on the bus and
//! fingerprints them by exact content. The first frame seen twice gives the
//! victim's period as the distance between the two frame-counter values.
//!
//! Once the period is known the attacker transmits a frame with the victim's
//! ID and DLC 0 on the same schedule. Both nodes start on the same tick, tie
//! through arbitration, and collide at the DLC field, where the attacker's
//! dominant bits overwrite the victim's recessive ones. Every retransmission
//! collides again until the victim's TEC pushes it BUS_OFF.

use crate::bus::CanBus;
use crate::config::AttackerConfig;
use crate::frame::Frame;
use crate::scheduler::{NodeReport, NodeRunner};
use crate::shutdown::ShutdownSignal;
use crate::types::{bits_to_string, Result, SimError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// A periodic frame recognised on the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub frame: Frame,
    /// Frame-counter value of the first sighting
    pub first_seen: u64,
    /// Frame-counter value of the repeat
    pub seen_again: u64,
}

impl Detection {
    pub fn period(&self) -> u64 {
        self.seen_again - self.first_seen
    }
}

/// Frame fingerprinting by exact content
#[derive(Debug, Default)]
pub struct PeriodDetector {
    first_seen: HashMap<Frame, u64>,
    target_id: Option<u16>,
}

impl PeriodDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only fingerprint frames carrying `id`
    pub fn with_target_id(mut self, id: u16) -> Self {
        self.target_id = Some(id);
        self
    }

    /// Record `frame` as completed at frame counter `count`
    ///
    /// Returns a detection when the frame was already seen at an earlier
    /// counter value.
    pub fn observe(&mut self, count: u64, frame: &Frame) -> Option<Detection> {
        if self.target_id.is_some_and(|id| id != frame.id()) {
            return None;
        }

        match self.first_seen.get(frame) {
            Some(&first) if count > first => Some(Detection {
                frame: frame.clone(),
                first_seen: first,
                seen_again: count,
            }),
            Some(_) => None,
            None => {
                self.first_seen.insert(frame.clone(), count);
                None
            }
        }
    }

    /// Number of distinct frames fingerprinted so far
    pub fn distinct_frames(&self) -> usize {
        self.first_seen.len()
    }
}

/// Outcome of an attack
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackReport {
    pub inferred_period: Option<u64>,
    /// Victim frame the attack was aimed at, in display form
    pub target: Option<String>,
    /// The attacking node's final state, if it started transmitting
    pub node: Option<NodeReport>,
}

/// Observes the bus, infers a victim's period, then jams it
pub struct Attacker {
    config: AttackerConfig,
    bus: Arc<CanBus>,
    shutdown: ShutdownSignal,
}

impl Attacker {
    pub fn new(config: AttackerConfig, bus: Arc<CanBus>, shutdown: ShutdownSignal) -> Self {
        Self {
            config,
            bus,
            shutdown,
        }
    }

    /// Watch completed frames until one repeats
    ///
    /// Returns `None` once the observation limit is exhausted.
    pub fn observe(&self) -> Result<Option<Detection>> {
        let mut detector = PeriodDetector::new();
        if let Some(id) = self.config.target_id {
            detector = detector.with_target_id(id);
        }

        let start = self.bus.get_count();
        let mut last = start;
        loop {
            if let Some(limit) = self.config.observation_limit {
                if last - start >= limit {
                    log::warn!(
                        "{}: no periodic frame found within {} frames",
                        self.config.name,
                        limit
                    );
                    return Ok(None);
                }
            }

            self.bus.wait_frame_count(last + 1)?;
            let (count, bits) = self.bus.published_frame();
            last = count;

            // Idle slots clear the published frame, partial or garbled
            // sequences fail to decode
            let frame = match Frame::decode(&bits) {
                Ok(frame) => frame,
                Err(e) => {
                    if !bits.is_empty() {
                        log::trace!("Ignoring bus sequence {}: {}", bits_to_string(&bits), e);
                    }
                    continue;
                }
            };
            log::debug!("{} observed {} at frame {}", self.config.name, frame, count);

            if let Some(detection) = detector.observe(count, &frame) {
                log::info!(
                    "{} inferred period {} for {} (frames {} and {})",
                    self.config.name,
                    detection.period(),
                    detection.frame,
                    detection.first_seen,
                    detection.seen_again
                );
                return Ok(Some(detection));
            }
        }
    }

    /// The frame used to collide with `victim`: same ID, no payload
    pub fn attack_frame(victim: &Frame) -> Result<Frame> {
        Frame::new(victim.id(), 0, Vec::new())
    }

    /// Observe, then transmit on the victim's schedule until shutdown
    pub fn run(self) -> Result<AttackReport> {
        log::info!("Start {} -> observing the bus", self.config.name);

        let detection = match self.observe() {
            Ok(Some(detection)) => detection,
            Ok(None) | Err(SimError::Cancelled) => {
                return Ok(AttackReport {
                    inferred_period: None,
                    target: None,
                    node: None,
                })
            }
            Err(e) => return Err(e),
        };

        let frame = Self::attack_frame(&detection.frame)?;
        let period = detection.period();
        let runner = NodeRunner::new(
            self.config.name.clone(),
            frame,
            period,
            Arc::clone(&self.bus),
            self.shutdown.clone(),
        );
        let node = runner.run()?;

        Ok(AttackReport {
            inferred_period: Some(period),
            target: Some(detection.frame.to_string()),
            node: Some(node),
        })
    }
}
