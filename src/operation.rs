//! Operation handles and cross-thread interruption.
//!
//! An [`Operation`] stands for one unit of work running on its own thread.
//! The registry records operations as session holders, and the kill protocol
//! interrupts them through this handle: setting the interrupt flag and waking
//! the condition variable the operation is parked on, if any.
//!
//! Lock order is strictly one-directional: the registry mutex may be held
//! while an operation's lock is taken (park registration, kill delivery),
//! never the other way around.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::error::{ArbiterError, Result};
use crate::session::{ScopedCheckout, SessionId};

/// Global counter for operation ID generation.
static COUNTER: AtomicU64 = AtomicU64::new(1);

/// Why an operation was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptReason {
    /// The session held (or awaited) by the operation was killed.
    SessionKilled,
    /// The operation exceeded its deadline.
    DeadlineExceeded,
    /// The process is shutting down.
    Shutdown,
}

impl fmt::Display for InterruptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            InterruptReason::SessionKilled => "session killed",
            InterruptReason::DeadlineExceeded => "deadline exceeded",
            InterruptReason::Shutdown => "shutdown",
        };
        f.write_str(text)
    }
}

/// Handle for one running operation.
///
/// Cheap to clone; all clones share the same underlying state, and operation
/// identity is the shared allocation (see [`Operation::same_operation`]).
///
/// The handle carries the operation's interrupt flag and, while the operation
/// is blocked in a checkout wait, the condition variable to wake when
/// interrupting it. Only the first interrupt records a reason; later ones are
/// no-ops apart from re-notifying a parked wait.
#[derive(Clone)]
pub struct Operation {
    inner: Arc<OperationInner>,
}

struct OperationInner {
    id: u64,
    state: Mutex<OperationState>,
}

#[derive(Default)]
struct OperationState {
    interrupted: Option<InterruptReason>,
    parked_on: Option<Arc<Condvar>>,
    in_direct_call: bool,
    checked_out: Option<ScopedCheckout>,
}

impl Operation {
    /// Create a new operation handle.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(OperationInner {
                id: COUNTER.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(OperationState::default()),
            }),
        }
    }

    /// Process-unique numeric id, for diagnostics.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Whether `self` and `other` are handles to the same operation.
    pub fn same_operation(&self, other: &Operation) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // The critical sections below never panic, so a poisoned lock can only
    // mean a panic elsewhere on this thread's stack; recover the guard so
    // interrupt delivery and release bookkeeping still complete.
    fn state(&self) -> MutexGuard<'_, OperationState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Interrupt this operation.
    ///
    /// Records `reason` if no interrupt has been recorded yet and wakes the
    /// condition variable the operation is currently parked on, if any. The
    /// operation observes the interrupt at its next
    /// [`check_for_interrupt`](Self::check_for_interrupt) or on the next wake
    /// of a blocking checkout wait.
    pub fn interrupt(&self, reason: InterruptReason) {
        let mut state = self.state();
        if state.interrupted.is_none() {
            state.interrupted = Some(reason);
            tracing::debug!(operation = self.inner.id, %reason, "interrupting operation");
        }
        if let Some(cv) = &state.parked_on {
            cv.notify_all();
        }
    }

    /// The recorded interrupt reason, if the operation has been interrupted.
    pub fn interrupt_reason(&self) -> Option<InterruptReason> {
        self.state().interrupted
    }

    /// Whether the operation has been interrupted.
    pub fn is_interrupted(&self) -> bool {
        self.interrupt_reason().is_some()
    }

    /// Fail with [`ArbiterError::Interrupted`] if the operation has been
    /// interrupted.
    ///
    /// Long-running work holding a session should call this periodically so a
    /// kill unwinds the holder promptly.
    pub fn check_for_interrupt(&self) -> Result<()> {
        match self.interrupt_reason() {
            Some(reason) => Err(ArbiterError::Interrupted(reason)),
            None => Ok(()),
        }
    }

    /// Flag the operation as being inside a nested direct call.
    ///
    /// This enables the one benign re-entrancy case: an
    /// [`OperationBinding`](crate::OperationBinding) created while the flag is
    /// set reuses the operation's existing checkout instead of failing.
    pub fn set_in_direct_call(&self, in_direct_call: bool) {
        self.state().in_direct_call = in_direct_call;
    }

    /// Whether the operation is inside a nested direct call.
    pub fn in_direct_call(&self) -> bool {
        self.state().in_direct_call
    }

    /// Id of the session this operation has checked out, if any.
    pub fn checked_out_session(&self) -> Option<SessionId> {
        self.state().checked_out.as_ref().map(ScopedCheckout::id)
    }

    /// Register the condition variable this operation is about to park on, so
    /// an interrupt can wake it. Fails if the operation is already
    /// interrupted, making the flag check and the registration atomic.
    pub(crate) fn park_on(
        &self,
        cv: &Arc<Condvar>,
    ) -> std::result::Result<(), InterruptReason> {
        let mut state = self.state();
        if let Some(reason) = state.interrupted {
            return Err(reason);
        }
        state.parked_on = Some(Arc::clone(cv));
        Ok(())
    }

    /// Clear the parked-on registration after a wait returns.
    pub(crate) fn unpark(&self) {
        self.state().parked_on = None;
    }

    /// Attach a checkout to this operation. At most one may be attached.
    pub(crate) fn stash_checkout(&self, checkout: ScopedCheckout) {
        let mut state = self.state();
        assert!(
            state.checked_out.is_none(),
            "operation {} already has a checked-out session",
            self.inner.id
        );
        state.checked_out = Some(checkout);
    }

    /// Detach the attached checkout, if any.
    ///
    /// The caller must drop the returned value *after* this call returns:
    /// releasing a checkout takes the registry mutex, which must never be
    /// acquired while an operation lock is held.
    pub(crate) fn take_checkout(&self) -> Option<ScopedCheckout> {
        self.state().checked_out.take()
    }

    /// Whether a checkout is currently attached to this operation.
    pub(crate) fn has_checkout(&self) -> bool {
        self.state().checked_out.is_some()
    }
}

impl Default for Operation {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.inner.id)
            .field("interrupted", &self.interrupt_reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_new_operation_not_interrupted() {
        let op = Operation::new();
        assert!(!op.is_interrupted());
        assert!(op.check_for_interrupt().is_ok());
        assert!(op.checked_out_session().is_none());
    }

    #[test]
    fn test_ids_unique() {
        let a = Operation::new();
        let b = Operation::new();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_same_operation_by_identity() {
        let a = Operation::new();
        let clone = a.clone();
        let b = Operation::new();

        assert!(a.same_operation(&clone));
        assert!(!a.same_operation(&b));
    }

    #[test]
    fn test_first_interrupt_reason_wins() {
        let op = Operation::new();
        op.interrupt(InterruptReason::SessionKilled);
        op.interrupt(InterruptReason::Shutdown);

        assert_eq!(op.interrupt_reason(), Some(InterruptReason::SessionKilled));
        let err = op.check_for_interrupt().unwrap_err();
        assert!(err.to_string().contains("session killed"));
    }

    #[test]
    fn test_park_rejected_when_interrupted() {
        let op = Operation::new();
        op.interrupt(InterruptReason::DeadlineExceeded);

        let cv = Arc::new(Condvar::new());
        assert_eq!(op.park_on(&cv), Err(InterruptReason::DeadlineExceeded));
    }

    #[test]
    fn test_interrupt_wakes_parked_wait() {
        let op = Operation::new();
        let cv = Arc::new(Condvar::new());
        let mutex = Mutex::new(());

        op.park_on(&cv).unwrap();

        let interrupter = {
            let op = op.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                op.interrupt(InterruptReason::Shutdown);
            })
        };

        let started = Instant::now();
        let guard = mutex.lock().unwrap();
        let (_guard, _timeout) = cv.wait_timeout(guard, Duration::from_secs(5)).unwrap();
        op.unpark();

        // The wait should have been cut short by the interrupt, not the
        // five-second timeout.
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(op.is_interrupted());
        interrupter.join().unwrap();
    }

    #[test]
    fn test_direct_call_flag() {
        let op = Operation::new();
        assert!(!op.in_direct_call());

        op.set_in_direct_call(true);
        assert!(op.in_direct_call());

        op.set_in_direct_call(false);
        assert!(!op.in_direct_call());
    }
}
