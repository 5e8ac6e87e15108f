//! Cooperative shutdown signal
//!
//! A cloneable token shared by the clock, the bus and every node. Triggering
//! it sets a flag that every loop polls at tick granularity and runs the
//! registered wake-up hooks, so threads blocked inside a clock or bus wait
//! return promptly instead of stranding.
//!
//! [`StartBarrier`] is the matching rendezvous: it releases its parties
//! either when all of them arrived or when the signal fires.

use crate::types::{Result, SimError};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type WakeHook = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Inner {
    triggered: AtomicBool,
    reason: Mutex<Option<String>>,
    hooks: Mutex<Vec<WakeHook>>,
}

/// Shared stop flag with wake-up hooks
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown; the first reason wins
    ///
    /// Returns `true` if this call triggered the signal.
    pub fn trigger(&self, reason: impl Into<String>) -> bool {
        {
            let mut current = self.inner.reason.lock();
            if current.is_some() {
                return false;
            }
            *current = Some(reason.into());
        }
        self.inner.triggered.store(true, Ordering::SeqCst);
        log::debug!("Shutdown triggered: {}", self.reason().unwrap_or_default());

        for hook in self.inner.hooks.lock().iter() {
            hook();
        }
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Reason passed to the first `trigger` call
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().clone()
    }

    /// Register a hook run once when the signal is triggered
    ///
    /// Hooks registered after the fact run immediately. A hook must only
    /// acquire locks that are never held while calling `trigger`.
    pub fn on_trigger(&self, hook: impl Fn() + Send + Sync + 'static) {
        let mut hooks = self.inner.hooks.lock();
        if self.is_triggered() {
            drop(hooks);
            hook();
            return;
        }
        hooks.push(Box::new(hook));
    }
}

impl fmt::Debug for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownSignal")
            .field("triggered", &self.is_triggered())
            .field("reason", &self.reason())
            .finish()
    }
}

#[derive(Default)]
struct BarrierState {
    arrived: Mutex<usize>,
    released: Condvar,
}

/// One-shot rendezvous of a fixed number of threads
///
/// Unlike [`std::sync::Barrier`], waiters give up with
/// [`SimError::Cancelled`] once shutdown is requested, so a participant that
/// never shows up cannot strand the others.
pub struct StartBarrier {
    parties: usize,
    state: Arc<BarrierState>,
    shutdown: ShutdownSignal,
}

impl StartBarrier {
    pub fn new(parties: usize, shutdown: ShutdownSignal) -> Arc<Self> {
        let state = Arc::new(BarrierState::default());

        let wake = Arc::clone(&state);
        shutdown.on_trigger(move || {
            let _guard = wake.arrived.lock();
            wake.released.notify_all();
        });

        Arc::new(Self {
            parties,
            state,
            shutdown,
        })
    }

    /// Arrive and block until every party arrived
    pub fn wait(&self) -> Result<()> {
        let mut arrived = self.state.arrived.lock();
        *arrived += 1;
        if *arrived >= self.parties {
            self.state.released.notify_all();
            return Ok(());
        }
        while *arrived < self.parties {
            if self.shutdown.is_triggered() {
                return Err(SimError::Cancelled);
            }
            self.state.released.wait(&mut arrived);
        }
        Ok(())
    }
}
