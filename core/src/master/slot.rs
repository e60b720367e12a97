//! Attempt bookkeeping for one worker or parameter-server slot.
//!
//! A slot is only ever touched under its own lock, which serializes attempt
//! allocation per id while leaving different ids independent.

use crate::error::{CoordinationError, Result};
use crate::types::WorkerState;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug)]
pub(crate) struct AttemptSlot {
    /// Rendered base id, for logs and errors
    label: String,
    state: WorkerState,
    /// Attempt number currently expected to run
    current: Option<u32>,
    /// Next attempt number to hand out; never decreases
    next_attempt: u32,
    max_attempts: u32,
    /// Whether the current attempt has registered
    registered: bool,
    /// Start of the current lease
    lease_renewed: Option<Instant>,
    /// Last progress clock reported by any attempt of this slot
    clock: u64,
}

impl AttemptSlot {
    pub(crate) fn new(label: String, max_attempts: u32) -> Self {
        Self {
            label,
            state: WorkerState::Unscheduled,
            current: None,
            next_attempt: 0,
            max_attempts,
            registered: false,
            lease_renewed: None,
            clock: 0,
        }
    }

    pub(crate) fn state(&self) -> WorkerState {
        self.state
    }

    pub(crate) fn current(&self) -> Option<u32> {
        self.current
    }

    pub(crate) fn issued(&self) -> u32 {
        self.next_attempt
    }

    pub(crate) fn clock(&self) -> u64 {
        self.clock
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.registered
    }

    /// Whether `attempt` is the running attempt of this slot.
    pub(crate) fn is_current_running(&self, attempt: u32) -> bool {
        self.state == WorkerState::AttemptRunning && self.current == Some(attempt)
    }

    fn transition(&mut self, to: WorkerState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(CoordinationError::InvalidTransition {
                worker: self.label.clone(),
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Hand out the next attempt number.
    ///
    /// A running attempt is superseded: it passes through `Failed` first, so
    /// the state machine is honored. The budget is checked before that, so
    /// a running attempt is never superseded without a replacement. A slot
    /// with no running attempt and no budget left stays `Failed`.
    pub(crate) fn allocate(&mut self) -> Result<u32> {
        if self.state.is_terminal() {
            return Err(CoordinationError::InvalidTransition {
                worker: self.label.clone(),
                from: self.state,
                to: WorkerState::AttemptRunning,
            });
        }
        if self.next_attempt >= self.max_attempts {
            if self.state != WorkerState::AttemptRunning {
                self.state = WorkerState::Failed;
            }
            return Err(CoordinationError::RetryBudgetExhausted {
                worker: self.label.clone(),
                attempts: self.next_attempt,
            });
        }
        if self.state == WorkerState::AttemptRunning {
            warn!(
                "Superseding running attempt {:?} of {}",
                self.current, self.label
            );
            self.transition(WorkerState::Failed)?;
        }

        self.transition(WorkerState::AttemptRunning)?;
        let attempt = self.next_attempt;
        self.next_attempt += 1;
        self.current = Some(attempt);
        self.registered = false;
        // The lease starts at allocation so an attempt that never registers
        // still expires.
        self.lease_renewed = Some(Instant::now());
        info!("Allocated attempt {} for {}", attempt, self.label);
        Ok(attempt)
    }

    pub(crate) fn mark_registered(&mut self) {
        self.registered = true;
        self.renew();
    }

    pub(crate) fn renew(&mut self) {
        self.lease_renewed = Some(Instant::now());
    }

    pub(crate) fn record_clock(&mut self, clock: u64) {
        self.clock = self.clock.max(clock);
    }

    pub(crate) fn lease_expired(&self, timeout: Duration) -> bool {
        self.state == WorkerState::AttemptRunning
            && self
                .lease_renewed
                .is_some_and(|renewed| renewed.elapsed() > timeout)
    }

    pub(crate) fn fail(&mut self) -> Result<()> {
        self.transition(WorkerState::Failed)
    }

    pub(crate) fn succeed(&mut self) -> Result<()> {
        self.transition(WorkerState::Succeeded)
    }

    /// Move to `Killed` unless already terminal.
    pub(crate) fn kill(&mut self) {
        if !self.state.is_terminal() {
            self.state = WorkerState::Killed;
            self.current = None;
        }
    }
}
