//! The session registry: slot storage, checkout arbitration, kill, scan, reap.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

use crate::config::RegistryConfig;
use crate::error::{ArbiterError, Result};
use crate::operation::{InterruptReason, Operation};
use crate::session::checkout::{KillToken, ScopedCheckout};
use crate::session::observable::ObservableSession;
use crate::session::state::SessionState;
use crate::session::SessionId;

/// Runtime info for one tracked session.
pub(crate) struct SessionSlot {
    pub(crate) state: SessionState,
    /// Signalled whenever this session may have become available: on release
    /// of the session itself and, for parents, on release of a child that was
    /// co-reserving it. Behind an `Arc` so a waiter can park on it after its
    /// map borrow ends, and so an interrupt can wake it without the registry
    /// lock.
    pub(crate) available: Arc<Condvar>,
    /// Number of operations blocked waiting to check this slot out. Nonzero
    /// waiters veto reaping.
    pub(crate) waiters: u32,
}

impl SessionSlot {
    fn new(id: SessionId) -> Self {
        Self {
            state: SessionState::new(id),
            available: Arc::new(Condvar::new()),
            waiters: 0,
        }
    }

    /// Whether destroying this slot right now would strand anyone.
    fn is_reap_safe(&self) -> bool {
        !self.state.has_current_holder() && !self.state.is_killed() && self.waiters == 0
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            assert_eq!(
                self.waiters, 0,
                "session slot {} destroyed with live waiters",
                self.state.id()
            );
        }
    }
}

/// Map of tracked sessions. Lives entirely behind the registry mutex.
pub(crate) struct RegistryInner {
    pub(crate) sessions: HashMap<SessionId, SessionSlot>,
}

impl RegistryInner {
    /// Look up a slot that is required to exist.
    ///
    /// # Panics
    ///
    /// Panics if the session is untracked. Callers rely on the reap rules
    /// (no reap with holders, waiters, or kills outstanding) to guarantee
    /// presence; absence is a registry bug.
    pub(crate) fn slot(&self, id: SessionId) -> &SessionSlot {
        self.sessions
            .get(&id)
            .unwrap_or_else(|| panic!("session {id} is not tracked"))
    }

    pub(crate) fn slot_mut(&mut self, id: SessionId) -> &mut SessionSlot {
        self.sessions
            .get_mut(&id)
            .unwrap_or_else(|| panic!("session {id} is not tracked"))
    }

    pub(crate) fn get_or_create(&mut self, id: SessionId) -> &mut SessionSlot {
        self.sessions
            .entry(id)
            .or_insert_with(|| SessionSlot::new(id))
    }
}

/// Process-wide arbiter of exclusive access to logical sessions.
///
/// The registry maps [`SessionId`]s to internally-owned slots and arbitrates
/// *checkout*: exclusive, time-bounded ownership of a session by one
/// [`Operation`]. Checking out a child session co-reserves its parent, so a
/// parent and child are never held by two different operations at once.
/// Killed sessions stop matching normal checkout waiters until the kill is
/// redeemed through [`check_out_for_kill`](Self::check_out_for_kill).
///
/// Construct one long-lived instance (typically in an [`Arc`]) at process
/// start and pass the handle to every component that needs it.
pub struct SessionRegistry {
    config: RegistryConfig,
    inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
    /// Create a registry with default configuration.
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a registry with the given configuration.
    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(RegistryInner {
                sessions: HashMap::new(),
            }),
        }
    }

    /// The registry's configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn lock_inner(&self) -> Result<MutexGuard<'_, RegistryInner>> {
        self.inner.lock().map_err(|_| ArbiterError::LockPoisoned)
    }

    /// Check out a session for exclusive use by `op`.
    ///
    /// Blocks the calling thread until the session — and, for a child id, its
    /// parent as well — is simultaneously free of holders and has no
    /// unresolved kill. The slot (and parent slot) are created on first use.
    ///
    /// # Errors
    ///
    /// - [`ArbiterError::InvalidOptions`] for a child id while child sessions
    ///   are administratively disabled.
    /// - [`ArbiterError::Interrupted`] if `op` is interrupted while waiting.
    pub fn check_out(self: &Arc<Self>, op: &Operation, id: SessionId) -> Result<ScopedCheckout> {
        if id.is_child() {
            if !self.config.enable_child_sessions {
                return Err(ArbiterError::InvalidOptions(format!(
                    "child sessions are disabled: {id}"
                )));
            }
            self.check_out_with_parent(op, id, None)
        } else {
            self.check_out_without_parent(op, id, None)
        }
    }

    /// Check out a killed session for post-kill cleanup, redeeming `token`.
    ///
    /// Same waiting protocol as [`check_out`](Self::check_out), but matches
    /// *only* sessions currently in the killed state. Releasing the returned
    /// checkout consumes one outstanding kill on the session (and its parent,
    /// for a child token).
    ///
    /// # Panics
    ///
    /// Panics if the token's target session (or parent) is not in the killed
    /// state; tokens are only minted by kills, so a mismatch is a caller bug.
    pub fn check_out_for_kill(
        self: &Arc<Self>,
        op: &Operation,
        token: KillToken,
    ) -> Result<ScopedCheckout> {
        let id = token.session_id();
        if id.is_child() {
            self.check_out_with_parent(op, id, Some(token))
        } else {
            self.check_out_without_parent(op, id, Some(token))
        }
    }

    fn check_out_without_parent(
        self: &Arc<Self>,
        op: &Operation,
        id: SessionId,
        kill_token: Option<KillToken>,
    ) -> Result<ScopedCheckout> {
        let for_kill = kill_token.is_some();
        if let Some(token) = &kill_token {
            assert_eq!(
                token.session_id(),
                id,
                "kill token does not match the session being checked out"
            );
            assert!(
                token.parent_id().is_none(),
                "kill token for root session {id} carries a parent id"
            );
        }

        let mut inner = self.lock_inner()?;

        {
            let slot = inner.get_or_create(id);
            if for_kill {
                assert!(
                    slot.state.is_killed(),
                    "checkout-for-kill on session {id} which is not killed"
                );
            }
            slot.waiters += 1;
        }

        // Wait until the session is no longer checked out and until any
        // previously scheduled kill has completed.
        let cv = Arc::clone(&inner.slot(id).available);
        let (mut inner, waited) = self.wait_for(inner, op, &cv, move |inner| {
            inner.slot(id).state.is_available_for_checkout(for_kill)
        });

        inner.slot_mut(id).waiters -= 1;
        waited?;

        inner.slot_mut(id).state.record_checkout(op.clone());

        Ok(ScopedCheckout::new(
            Arc::clone(self),
            id,
            None,
            op.clone(),
            kill_token,
        ))
    }

    fn check_out_with_parent(
        self: &Arc<Self>,
        op: &Operation,
        id: SessionId,
        kill_token: Option<KillToken>,
    ) -> Result<ScopedCheckout> {
        let parent_id = match id.parent() {
            Some(parent_id) => parent_id,
            None => panic!("hierarchical checkout on root session id {id}"),
        };
        let for_kill = kill_token.is_some();
        if let Some(token) = &kill_token {
            assert_eq!(
                token.session_id(),
                id,
                "kill token does not match the session being checked out"
            );
            assert_eq!(
                token.parent_id(),
                Some(parent_id),
                "kill token does not match the parent of session {id}"
            );
        }

        let mut inner = self.lock_inner()?;

        inner.get_or_create(parent_id);
        inner.get_or_create(id);
        if for_kill {
            assert!(
                inner.slot(id).state.is_killed(),
                "checkout-for-kill on session {id} which is not killed"
            );
            assert!(
                inner.slot(parent_id).state.is_killed(),
                "checkout-for-kill on session {id} whose parent is not killed"
            );
        }

        // Register interest on both slots before blocking so concurrent reap
        // decisions see the pending checkout.
        inner.slot_mut(parent_id).waiters += 1;
        inner.slot_mut(id).waiters += 1;

        // Wait on the parent's condition variable. Releasing a child notifies
        // the parent's condvar as well as its own, so a parent-side wait
        // observes both kinds of release; waiting on the child's condvar
        // could miss a release of the parent.
        let cv = Arc::clone(&inner.slot(parent_id).available);
        let (mut inner, waited) = self.wait_for(inner, op, &cv, move |inner| {
            let parent_available = inner
                .slot(parent_id)
                .state
                .is_available_for_checkout(for_kill);
            let child_available = inner.slot(id).state.is_available_for_checkout(for_kill);
            if parent_available {
                assert!(
                    child_available || inner.slot(id).state.is_killed(),
                    "parent of {id} is available while the child is neither available nor killed"
                );
            }
            parent_available && child_available
        });

        inner.slot_mut(parent_id).waiters -= 1;
        inner.slot_mut(id).waiters -= 1;
        waited?;

        inner
            .slot_mut(parent_id)
            .state
            .record_child_checkout(op.clone());
        inner.slot_mut(id).state.record_checkout(op.clone());

        Ok(ScopedCheckout::new(
            Arc::clone(self),
            id,
            Some(parent_id),
            op.clone(),
            kill_token,
        ))
    }

    /// Park on `cv` until `predicate` holds or `op` is interrupted.
    ///
    /// The registry mutex is released atomically while parked and reacquired
    /// on every wake; the predicate is re-evaluated under the lock each time.
    /// A short timeout bounds the delay of an interrupt delivered between the
    /// flag check and the park.
    fn wait_for<'a>(
        &'a self,
        mut inner: MutexGuard<'a, RegistryInner>,
        op: &Operation,
        cv: &Arc<Condvar>,
        predicate: impl Fn(&RegistryInner) -> bool,
    ) -> (MutexGuard<'a, RegistryInner>, Result<()>) {
        let poll = Duration::from_millis(self.config.wait_poll_ms.max(1));
        loop {
            if let Some(reason) = op.interrupt_reason() {
                return (inner, Err(ArbiterError::Interrupted(reason)));
            }
            if predicate(&inner) {
                return (inner, Ok(()));
            }
            if let Err(reason) = op.park_on(cv) {
                return (inner, Err(ArbiterError::Interrupted(reason)));
            }
            let wait = cv.wait_timeout(inner, poll);
            op.unpark();
            match wait {
                Ok((guard, _timed_out)) => inner = guard,
                Err(poisoned) => {
                    let (guard, _timed_out) = poisoned.into_inner();
                    return (guard, Err(ArbiterError::LockPoisoned));
                }
            }
        }
    }

    /// Register a kill against a session, interrupting the current holder.
    ///
    /// Increments the session's kill counter and, for a child session, the
    /// parent's too. The first outstanding kill interrupts the operation
    /// currently occupying the session (if any) with
    /// [`InterruptReason::SessionKilled`]. Returns the token that must later
    /// be redeemed through [`check_out_for_kill`](Self::check_out_for_kill).
    ///
    /// # Errors
    ///
    /// [`ArbiterError::NoSuchSession`] if the id was never created.
    pub fn kill(&self, id: SessionId) -> Result<KillToken> {
        self.kill_with_reason(id, InterruptReason::SessionKilled)
    }

    /// [`kill`](Self::kill) with an explicit reason delivered to the holder.
    pub fn kill_with_reason(&self, id: SessionId, reason: InterruptReason) -> Result<KillToken> {
        let mut inner = self.lock_inner()?;
        if !inner.sessions.contains_key(&id) {
            return Err(ArbiterError::NoSuchSession(id.to_string()));
        }
        let mut session = ObservableSession::new(&mut inner, id);
        Ok(session.kill(reason))
    }

    /// Visit every session matching `matcher` under the registry lock.
    ///
    /// Each matching session is exposed to `visitor` as an
    /// [`ObservableSession`]. Sessions the visitor marks for reap are removed
    /// afterwards if reaping is safe at that instant: no holder, no kill in
    /// flight, and zero blocked waiters. Reaped slots are destroyed after the
    /// lock is released.
    pub fn scan(
        &self,
        matcher: impl Fn(&SessionId) -> bool,
        mut visitor: impl FnMut(&mut ObservableSession<'_>),
    ) -> Result<()> {
        let mut reaped = Vec::new();
        {
            let mut inner = self.lock_inner()?;
            debug!(session_count = inner.sessions.len(), "scanning sessions");

            let matching: Vec<SessionId> =
                inner.sessions.keys().copied().filter(|id| matcher(id)).collect();
            for id in matching {
                let mut session = ObservableSession::new(&mut inner, id);
                visitor(&mut session);
                let reap_requested = session.reap_requested();

                if reap_requested && inner.slot(id).is_reap_safe() {
                    if let Some((_, slot)) = inner.sessions.remove_entry(&id) {
                        debug!(session = %id, "reaping session");
                        reaped.push(slot);
                    }
                }
            }
        }
        drop(reaped);
        Ok(())
    }

    /// Single-session variant of [`scan`](Self::scan).
    ///
    /// A no-op if the session is untracked.
    pub fn scan_one(
        &self,
        id: SessionId,
        visitor: impl FnOnce(&mut ObservableSession<'_>),
    ) -> Result<()> {
        let mut reaped = None;
        {
            let mut inner = self.lock_inner()?;
            if !inner.sessions.contains_key(&id) {
                return Ok(());
            }

            let mut session = ObservableSession::new(&mut inner, id);
            visitor(&mut session);
            let reap_requested = session.reap_requested();

            if reap_requested && inner.slot(id).is_reap_safe() {
                if let Some((_, slot)) = inner.sessions.remove_entry(&id) {
                    debug!(session = %id, "reaping session");
                    reaped = Some(slot);
                }
            }
        }
        drop(reaped);
        Ok(())
    }

    /// Idempotently ensure a slot exists for `id`, and for its parent if `id`
    /// is a child, without checking anything out.
    pub fn create_if_absent(&self, id: SessionId) -> Result<()> {
        let mut inner = self.lock_inner()?;
        if let Some(parent_id) = id.parent() {
            inner.get_or_create(parent_id);
        }
        inner.get_or_create(id);
        Ok(())
    }

    /// Number of tracked sessions. Diagnostic only.
    pub fn size(&self) -> usize {
        self.inner.lock().map(|inner| inner.sessions.len()).unwrap_or(0)
    }

    /// Drop every tracked session, for test isolation.
    ///
    /// Callers must ensure the registry is quiescent: no checkouts held and
    /// no blocked waiters.
    pub fn reset_for_test(&self) -> Result<()> {
        let mut inner = self.lock_inner()?;
        inner.sessions.clear();
        Ok(())
    }

    /// Release a checkout: clear the holder fields, wake waiters, and consume
    /// one outstanding kill per slot if a token was redeemed.
    ///
    /// Runs from `Drop`, so a poisoned mutex is recovered rather than
    /// reported; the bookkeeping must complete even if a scan visitor
    /// panicked on another thread.
    ///
    /// # Panics
    ///
    /// Panics if the session has no recorded holder or is held by a different
    /// operation (a double-release bug).
    pub(crate) fn release(
        &self,
        id: SessionId,
        parent_id: Option<SessionId>,
        op: &Operation,
        consumed_kill: bool,
    ) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(parent_id) = parent_id {
            let parent = inner.slot_mut(parent_id);
            let child_holder = parent.state.take_child_holder().unwrap_or_else(|| {
                panic!("releasing session {id} but parent {parent_id} records no child holder")
            });
            assert!(
                child_holder.same_operation(op),
                "releasing session {id} but parent {parent_id} is co-reserved by a different operation"
            );
            parent.available.notify_all();
        }

        let slot = inner.slot_mut(id);
        let holder = slot
            .state
            .take_holder()
            .unwrap_or_else(|| panic!("releasing session {id} with no recorded holder"));
        assert!(
            holder.same_operation(op),
            "releasing session {id} held by a different operation"
        );
        slot.available.notify_all();

        if consumed_kill {
            inner.slot_mut(id).state.decrement_kills();
            if let Some(parent_id) = parent_id {
                inner.slot_mut(parent_id).state.decrement_kills();
            }
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        for slot in inner.sessions.values() {
            assert!(
                !slot.state.has_current_holder(),
                "registry dropped while session {} is checked out",
                slot.state.id()
            );
            assert!(
                !slot.state.is_killed(),
                "registry dropped while session {} has a kill in flight",
                slot.state.id()
            );
        }
    }
}
