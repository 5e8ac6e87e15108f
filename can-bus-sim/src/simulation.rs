//! Simulation orchestration
//!
//! Wires one clock, one bus, the configured nodes and the optional attacker
//! together, runs each on its own thread and collects their final state.
//!
//! The run ends when any node goes BUS_OFF, when the optional frame limit is
//! reached, or when the caller triggers the shared [`ShutdownSignal`]. Every
//! thread is joined before [`Simulation::run`] returns.

use crate::attacker::{AttackReport, Attacker};
use crate::bus::CanBus;
use crate::clock::GlobalClock;
use crate::config::SimulationConfig;
use crate::frame::Frame;
use crate::scheduler::{NodeReport, NodeRunner};
use crate::shutdown::{ShutdownSignal, StartBarrier};
use crate::types::{Result, SimError, Timestamp};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Everything known about a finished run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationReport {
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    /// Why the run stopped
    pub stop_reason: Option<String>,
    /// First node that went BUS_OFF
    pub bus_off_node: Option<String>,
    /// Period the attacker inferred for its target
    pub inferred_period: Option<u64>,
    /// Victim frame the attacker targeted
    pub attack_target: Option<String>,
    /// Final bus frame counter
    pub frame_count: u64,
    /// Bus transitions processed
    pub bus_ticks: u64,
    /// Victim first, then extra nodes, then the attacker
    pub nodes: Vec<NodeReport>,
}

impl SimulationReport {
    pub fn node(&self, name: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|node| node.name == name)
    }
}

/// A node with its frame and period fixed for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePlan {
    pub name: String,
    pub period: u64,
    pub frame: Frame,
}

/// A configured, ready-to-run simulation
pub struct Simulation {
    config: SimulationConfig,
    shutdown: ShutdownSignal,
}

impl Simulation {
    /// Validate `config` and prepare a simulation
    pub fn new(config: SimulationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            shutdown: ShutdownSignal::new(),
        })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Signal that stops the run when triggered from outside
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Resolve every node's frame and period, drawing random ones where unset
    pub fn resolve_nodes(&self) -> Result<Vec<NodePlan>> {
        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let periods = self.config.random_period_range().ok_or_else(|| {
            SimError::InvalidConfig(format!(
                "victim '{}' needs a fixed period",
                self.config.victim.name
            ))
        })?;

        self.config
            .nodes()
            .map(|node| {
                let frame = match &node.frame {
                    Some(frame) => frame.to_frame()?,
                    None => Frame::random(&mut rng, self.config.max_random_dlc),
                };
                let period = match node.period {
                    Some(period) => period,
                    None => {
                        let period = rng.gen_range(periods.clone());
                        log::info!("{} drew random period {}", node.name, period);
                        period
                    }
                };
                Ok(NodePlan {
                    name: node.name.clone(),
                    period,
                    frame,
                })
            })
            .collect()
    }

    /// Run to completion on the calling thread
    pub fn run(&self) -> Result<SimulationReport> {
        let started_at = Utc::now();
        let shutdown = self.shutdown.clone();
        let nodes = self.resolve_nodes()?;

        let clock = Arc::new(GlobalClock::new(self.config.clock_period(), shutdown.clone()));
        let bus = CanBus::new(shutdown.clone());

        // Nodes rendezvous with the orchestrator so every first SOF is
        // submitted before the bus starts moving
        let barrier = StartBarrier::new(nodes.len() + 1, shutdown.clone());
        let mut failure = None;
        let mut node_threads = Vec::with_capacity(nodes.len());
        for node in nodes {
            let runner = NodeRunner::new(
                node.name.clone(),
                node.frame,
                node.period,
                Arc::clone(&bus),
                shutdown.clone(),
            )
            .with_start_barrier(Arc::clone(&barrier));
            node_threads.extend(spawn_or_stop(
                &node.name,
                move || runner.run(),
                &shutdown,
                &mut failure,
            ));
        }

        let attacker_thread = if self.config.attacker.enabled {
            let attacker = Attacker::new(
                self.config.attacker.clone(),
                Arc::clone(&bus),
                shutdown.clone(),
            );
            spawn_or_stop(
                &self.config.attacker.name,
                move || attacker.run(),
                &shutdown,
                &mut failure,
            )
        } else {
            None
        };

        let limit_thread = match self.config.max_frames {
            Some(limit) => {
                let bus = Arc::clone(&bus);
                let stop = shutdown.clone();
                spawn_or_stop(
                    "frame-limit",
                    move || {
                        if bus.wait_frame_count(limit).is_ok() {
                            stop.trigger(format!("frame limit {} reached", limit));
                        }
                        Ok(())
                    },
                    &shutdown,
                    &mut failure,
                )
            }
            None => None,
        };

        // Released early if anything failed to start
        if barrier.wait().is_err() {
            log::warn!(
                "Simulation start aborted: {}",
                shutdown.reason().unwrap_or_default()
            );
        }

        let clock_thread = {
            let clock = Arc::clone(&clock);
            spawn_or_stop(
                "clock",
                move || {
                    clock.run();
                    Ok(())
                },
                &shutdown,
                &mut failure,
            )
        };
        let bus_thread = {
            let bus = Arc::clone(&bus);
            let clock = Arc::clone(&clock);
            let pulses = self.config.pulses_per_bit;
            spawn_or_stop(
                "bus",
                move || {
                    bus.run(&clock, pulses);
                    Ok(())
                },
                &shutdown,
                &mut failure,
            )
        };

        // Node threads only return once a node went BUS_OFF or shutdown was
        // requested; either way the remaining participants must stop too
        let mut reports = Vec::new();
        for handle in node_threads {
            match join(handle) {
                Ok(report) => reports.push(report),
                Err(e) => {
                    shutdown.trigger(format!("node failed: {}", e));
                    failure.get_or_insert(e);
                }
            }
        }
        shutdown.trigger("all nodes stopped");

        let attack = match attacker_thread.map(join).transpose() {
            Ok(attack) => attack,
            Err(e) => {
                failure.get_or_insert(e);
                None
            }
        };
        for handle in [clock_thread, bus_thread, limit_thread]
            .into_iter()
            .flatten()
        {
            if let Err(e) = join(handle) {
                failure.get_or_insert(e);
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        let AttackReport {
            inferred_period,
            target,
            node,
        } = attack.unwrap_or(AttackReport {
            inferred_period: None,
            target: None,
            node: None,
        });
        reports.extend(node);

        let bus_stats = bus.stats();
        let bus_off_node = reports
            .iter()
            .filter_map(|report| report.bus_off_at.map(|at| (at, &report.name)))
            .min()
            .map(|(_, name)| name.clone());

        let report = SimulationReport {
            started_at,
            finished_at: Utc::now(),
            stop_reason: shutdown.reason(),
            bus_off_node,
            inferred_period,
            attack_target: target,
            frame_count: bus_stats.frame_count,
            bus_ticks: bus_stats.ticks,
            nodes: reports,
        };
        log::info!(
            "Simulation finished after {} frames: {}",
            report.frame_count,
            report.stop_reason.as_deref().unwrap_or("unknown")
        );
        Ok(report)
    }
}

fn spawn_named<T, F>(name: &str, f: F) -> Result<JoinHandle<Result<T>>>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|e| SimError::ThreadPanicked(format!("failed to spawn {}: {}", name, e)))
}

/// Spawn a participant unless an earlier one failed to start
///
/// A spawn failure is recorded in `failure` and stops every participant
/// already running.
fn spawn_or_stop<T, F>(
    name: &str,
    f: F,
    shutdown: &ShutdownSignal,
    failure: &mut Option<SimError>,
) -> Option<JoinHandle<Result<T>>>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    if failure.is_some() {
        return None;
    }
    match spawn_named(name, f) {
        Ok(handle) => Some(handle),
        Err(e) => {
            log::error!("{}", e);
            shutdown.trigger(format!("failed to start {}", name));
            *failure = Some(e);
            None
        }
    }
}

fn join<T>(handle: JoinHandle<Result<T>>) -> Result<T> {
    let name = handle.thread().name().unwrap_or("unnamed").to_string();
    handle.join().map_err(|payload| {
        SimError::ThreadPanicked(format!("{}: {}", name, panic_message(payload.as_ref())))
    })?
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
