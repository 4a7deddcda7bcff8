//! Exclusivity state shared by backup, restore and merge.
//!
//! One mutex guards the active operation, the pending restore request, the
//! abort token of the running operation and the save-wait bookkeeping.
//! Dropping an [`OpGuard`] is the only way back to idle.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::slots::SlotInfo;
use crate::utils::errors::{BackupError, Result};

/// The three mutually exclusive long operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    BackingUp,
    Restoring,
    Merging,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::BackingUp => write!(f, "backup"),
            Operation::Restoring => write!(f, "restore"),
            Operation::Merging => write!(f, "merge"),
        }
    }
}

/// What to do when another operation is active
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Refuse immediately (operator commands)
    Reject,
    /// Wait until the engine is idle (scheduled backups)
    Wait,
}

/// Observable state of the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingConfirmation { slot: u32 },
    BackingUp,
    Restoring,
    Merging,
}

/// A restore waiting for operator confirmation
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRestore {
    pub slot: u32,
    pub info: SlotInfo,
}

#[derive(Debug)]
struct SaveWait {
    started: Instant,
    saved: bool,
    recovered: bool,
}

#[derive(Debug, Default)]
struct Inner {
    active: Option<Operation>,
    pending: Option<PendingRestore>,
    abort: Option<CancellationToken>,
    save_wait: Option<SaveWait>,
}

/// What `abort` found to cancel
#[derive(Debug, Clone, PartialEq)]
pub struct AbortOutcome {
    pub cleared: Option<PendingRestore>,
    pub cancelled: Option<Operation>,
}

#[derive(Debug, Default)]
pub struct ExclusiveState {
    inner: Mutex<Inner>,
    released: Notify,
    saved: Notify,
}

impl ExclusiveState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enter `op` if nothing else is running
    pub fn try_acquire(self: &Arc<Self>, op: Operation) -> Result<OpGuard> {
        let mut inner = self.lock();
        self.enter(&mut inner, op)
    }

    fn enter(self: &Arc<Self>, inner: &mut Inner, op: Operation) -> Result<OpGuard> {
        if let Some(active) = inner.active {
            return Err(BackupError::OperationConflict(active));
        }
        let abort = CancellationToken::new();
        inner.active = Some(op);
        inner.abort = Some(abort.clone());
        Ok(OpGuard {
            state: Arc::clone(self),
            op,
            abort,
        })
    }

    /// Enter `op`, waiting for the current operation to finish in `Wait` mode
    pub async fn acquire(self: &Arc<Self>, op: Operation, mode: Mode) -> Result<OpGuard> {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_acquire(op) {
                Ok(guard) => return Ok(guard),
                Err(e) if mode == Mode::Reject => return Err(e),
                Err(_) => notified.await,
            }
        }
    }

    pub fn active(&self) -> Option<Operation> {
        self.lock().active
    }

    pub fn phase(&self) -> Phase {
        let inner = self.lock();
        match (inner.active, &inner.pending) {
            (Some(Operation::BackingUp), _) => Phase::BackingUp,
            (Some(Operation::Restoring), _) => Phase::Restoring,
            (Some(Operation::Merging), _) => Phase::Merging,
            (None, Some(pending)) => Phase::AwaitingConfirmation { slot: pending.slot },
            (None, None) => Phase::Idle,
        }
    }

    /// Record a restore request; only one may wait at a time
    pub fn set_pending(&self, pending: PendingRestore) -> Result<()> {
        let mut inner = self.lock();
        if let Some(existing) = &inner.pending {
            return Err(BackupError::AlreadyPending(existing.slot));
        }
        if let Some(active) = inner.active {
            return Err(BackupError::OperationConflict(active));
        }
        inner.pending = Some(pending);
        Ok(())
    }

    pub fn pending(&self) -> Option<PendingRestore> {
        self.lock().pending.clone()
    }

    /// Turn the pending request into a running `op` in one step, so an
    /// abort always finds one or the other. The request stays pending when
    /// another operation is active.
    pub fn confirm_pending(self: &Arc<Self>, op: Operation) -> Result<(PendingRestore, OpGuard)> {
        let mut inner = self.lock();
        let pending = inner.pending.take().ok_or(BackupError::NothingPending)?;
        match self.enter(&mut inner, op) {
            Ok(guard) => Ok((pending, guard)),
            Err(e) => {
                inner.pending = Some(pending);
                Err(e)
            }
        }
    }

    /// Drop the pending request and cancel the running operation's abort token
    pub fn abort(&self) -> AbortOutcome {
        let mut inner = self.lock();
        let cleared = inner.pending.take();
        let cancelled = match &inner.abort {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                inner.active
            }
            _ => None,
        };
        AbortOutcome { cleared, cancelled }
    }

    /// Start waiting for the server to report a finished save
    pub fn begin_save_wait(&self) {
        self.lock().save_wait = Some(SaveWait {
            started: Instant::now(),
            saved: false,
            recovered: false,
        });
    }

    /// Save-completed event from the server; ignored when nobody waits
    pub fn mark_saved(&self) -> bool {
        let mut inner = self.lock();
        match inner.save_wait.as_mut() {
            Some(wait) if !wait.saved => {
                wait.saved = true;
                drop(inner);
                self.saved.notify_one();
                true
            }
            _ => false,
        }
    }

    pub fn is_saved(&self) -> bool {
        self.lock().save_wait.as_ref().map(|w| w.saved).unwrap_or(false)
    }

    /// Resolves once `mark_saved` has been called for the current wait
    pub async fn wait_saved(&self) {
        loop {
            let notified = self.saved.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_saved() {
                return;
            }
            notified.await;
        }
    }

    /// Time spent waiting for a save that neither arrived nor was recovered
    pub fn stuck_for(&self) -> Option<Duration> {
        self.lock()
            .save_wait
            .as_ref()
            .filter(|w| !w.saved && !w.recovered)
            .map(|w| w.started.elapsed())
    }

    /// Claim the stuck-save recovery; true for exactly one caller per wait
    pub fn claim_recovery(&self) -> bool {
        let mut inner = self.lock();
        match inner.save_wait.as_mut() {
            Some(wait) if !wait.saved && !wait.recovered => {
                wait.recovered = true;
                true
            }
            _ => false,
        }
    }

    fn release(&self, op: Operation) {
        let mut inner = self.lock();
        if inner.active == Some(op) {
            inner.active = None;
            inner.abort = None;
            inner.save_wait = None;
        }
        drop(inner);
        self.released.notify_waiters();
    }
}

/// Held for the lifetime of one exclusive operation
#[derive(Debug)]
pub struct OpGuard {
    state: Arc<ExclusiveState>,
    op: Operation,
    abort: CancellationToken,
}

impl OpGuard {
    pub fn operation(&self) -> Operation {
        self.op
    }

    /// Cancelled by `trigger_abort`
    pub fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        self.state.release(self.op);
    }
}
