//! Admission control for renders
//!
//! [`ConcurrencyGate`] bounds how many renders run at once. Callers beyond
//! the limit wait in a FIFO queue of bounded depth; once the queue is full,
//! further callers are rejected with [`RenderError::QueueFull`] instead of
//! piling up.

use crate::{Config, RenderError, Result};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateLimits {
    pub max_concurrent: usize,
    pub max_queue_size: usize,
}

impl GateLimits {
    pub fn new(max_concurrent: usize, max_queue_size: usize) -> Self {
        Self {
            max_concurrent,
            max_queue_size,
        }
    }
}

impl Default for GateLimits {
    fn default() -> Self {
        Self::new(3, 100)
    }
}

impl From<&Config> for GateLimits {
    fn from(config: &Config) -> Self {
        Self::new(config.max_concurrent, config.max_queue_size)
    }
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

#[derive(Debug)]
struct GateState {
    active: usize,
    waiters: VecDeque<Waiter>,
    limits: GateLimits,
    /// Bumped by `reset()`; permits from an older generation release nothing.
    generation: u64,
    next_waiter_id: u64,
}

impl GateState {
    /// Hand free slots to queued waiters, oldest first.
    fn admit_waiters(&mut self) {
        while self.active < self.limits.max_concurrent {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            if waiter.tx.send(()).is_ok() {
                self.active += 1;
            }
        }
    }
}

/// Bounded FIFO admission gate
#[derive(Debug)]
pub struct ConcurrencyGate {
    state: Mutex<GateState>,
}

impl ConcurrencyGate {
    pub fn new(limits: GateLimits) -> Self {
        Self {
            state: Mutex::new(GateState {
                active: 0,
                waiters: VecDeque::new(),
                limits,
                generation: 0,
                next_waiter_id: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a slot, waiting in line if every slot is busy.
    ///
    /// Fails immediately with `QueueFull` when the wait queue is at capacity,
    /// and with `Cancelled` if [`reset`](Self::reset) runs while waiting.
    /// Dropping the returned future gives up the place in line.
    pub async fn acquire(&self) -> Result<GatePermit<'_>> {
        let mut pending = {
            let mut state = self.lock();

            if state.active < state.limits.max_concurrent {
                state.active += 1;
                return Ok(GatePermit::new(self, state.generation));
            }

            if state.waiters.len() >= state.limits.max_queue_size {
                warn!(
                    "Render queue full ({} waiting, {} active), rejecting request",
                    state.waiters.len(),
                    state.active
                );
                return Err(RenderError::QueueFull {
                    limit: state.limits.max_queue_size,
                });
            }

            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state.waiters.push_back(Waiter { id, tx });
            debug!("Queued for render slot (position {})", state.waiters.len());

            PendingWaiter {
                gate: self,
                id,
                generation: state.generation,
                rx,
                finished: false,
            }
        };

        let granted = (&mut pending.rx).await;
        pending.finished = true;

        match granted {
            Ok(()) => Ok(GatePermit::new(self, pending.generation)),
            Err(_) => Err(RenderError::Cancelled),
        }
    }

    /// Give back one slot from `generation`, handing it to the next waiter if
    /// the current limit allows.
    fn release_slot(&self, generation: u64) {
        let mut state = self.lock();
        if generation != state.generation {
            debug!("Ignoring release of a permit issued before the last reset");
            return;
        }

        // Waiters only get the slot while active is below the current limit.
        state.active = state.active.saturating_sub(1);
        state.admit_waiters();
    }

    pub fn active_count(&self) -> usize {
        self.lock().active
    }

    pub fn queue_length(&self) -> usize {
        self.lock().waiters.len()
    }

    pub fn limits(&self) -> GateLimits {
        self.lock().limits
    }

    /// Change the limits in place.
    ///
    /// Extra capacity is granted to queued waiters straight away. If the
    /// queue is now deeper than allowed, the newest waiters are cancelled.
    pub fn set_limits(&self, limits: GateLimits) {
        let mut state = self.lock();
        state.limits = limits;
        state.admit_waiters();

        if state.waiters.len() > limits.max_queue_size {
            let excess = state.waiters.len() - limits.max_queue_size;
            warn!("Queue limit lowered, cancelling {} waiting renders", excess);
            state.waiters.truncate(limits.max_queue_size);
        }
    }

    /// Forget every slot and cancel every waiter.
    ///
    /// Waiters resume with `Cancelled`. Permits still held from before the
    /// reset no longer count and release nothing when dropped.
    pub fn reset(&self) {
        let mut state = self.lock();
        if !state.waiters.is_empty() || state.active > 0 {
            warn!(
                "Resetting render gate with {} active and {} waiting",
                state.active,
                state.waiters.len()
            );
        }
        state.active = 0;
        state.generation += 1;
        state.waiters.clear();
    }
}

impl Default for ConcurrencyGate {
    fn default() -> Self {
        Self::new(GateLimits::default())
    }
}

/// A queued `acquire()` call; cleans up after itself if abandoned.
struct PendingWaiter<'a> {
    gate: &'a ConcurrencyGate,
    id: u64,
    generation: u64,
    rx: oneshot::Receiver<()>,
    finished: bool,
}

impl Drop for PendingWaiter<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        {
            let mut state = self.gate.lock();
            if let Some(pos) = state.waiters.iter().position(|w| w.id == self.id) {
                state.waiters.remove(pos);
                return;
            }
        }

        // Granted a slot nobody will use; pass it on.
        if self.rx.try_recv().is_ok() {
            self.gate.release_slot(self.generation);
        }
    }
}

/// One held render slot, released on drop
#[derive(Debug)]
pub struct GatePermit<'a> {
    gate: &'a ConcurrencyGate,
    generation: u64,
    released: bool,
}

impl<'a> GatePermit<'a> {
    fn new(gate: &'a ConcurrencyGate, generation: u64) -> Self {
        Self {
            gate,
            generation,
            released: false,
        }
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.gate.release_slot(self.generation);
        }
    }
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        self.release_once();
    }
}
