//! Per-session bookkeeping.

use std::time::Instant;

use crate::operation::Operation;
use crate::session::SessionId;

/// Mutable bookkeeping for one tracked session.
///
/// Every field is read and written only while the registry mutex is held.
/// A session is *occupied* if either holder field is set: `holder` when an
/// operation checked this session out directly, `child_holder` (set only on
/// parents) when an operation checked out one of this session's children and
/// thereby co-reserved it. The two are mutually exclusive with each other
/// across different operations.
#[derive(Debug)]
pub(crate) struct SessionState {
    id: SessionId,
    holder: Option<Operation>,
    child_holder: Option<Operation>,
    kills_requested: u32,
    last_checkout: Instant,
}

impl SessionState {
    pub(crate) fn new(id: SessionId) -> Self {
        Self {
            id,
            holder: None,
            child_holder: None,
            kills_requested: 0,
            last_checkout: Instant::now(),
        }
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn holder(&self) -> Option<&Operation> {
        self.holder.as_ref()
    }

    pub(crate) fn child_holder(&self) -> Option<&Operation> {
        self.child_holder.as_ref()
    }

    /// Whether any operation occupies this session, directly or through a
    /// checkout of one of its children.
    pub(crate) fn has_current_holder(&self) -> bool {
        self.holder.is_some() || self.child_holder.is_some()
    }

    pub(crate) fn is_killed(&self) -> bool {
        self.kills_requested > 0
    }

    pub(crate) fn kills_requested(&self) -> u32 {
        self.kills_requested
    }

    pub(crate) fn last_checkout(&self) -> Instant {
        self.last_checkout
    }

    /// The checkout matching predicate: free of holders, and the kill marker
    /// matching the waiter class. Normal waiters never match a session whose
    /// kill is unresolved; kill-token waiters match *only* killed sessions.
    pub(crate) fn is_available_for_checkout(&self, for_kill: bool) -> bool {
        if self.has_current_holder() {
            return false;
        }
        if for_kill {
            self.is_killed()
        } else {
            !self.is_killed()
        }
    }

    pub(crate) fn record_checkout(&mut self, op: Operation) {
        self.holder = Some(op);
        self.last_checkout = Instant::now();
    }

    pub(crate) fn record_child_checkout(&mut self, op: Operation) {
        self.child_holder = Some(op);
        self.last_checkout = Instant::now();
    }

    pub(crate) fn take_holder(&mut self) -> Option<Operation> {
        self.holder.take()
    }

    pub(crate) fn take_child_holder(&mut self) -> Option<Operation> {
        self.child_holder.take()
    }

    /// Bump the kill counter. Returns true if this is the first outstanding
    /// kill (the one that interrupts the running holder).
    pub(crate) fn increment_kills(&mut self) -> bool {
        let first_killer = self.kills_requested == 0;
        self.kills_requested += 1;
        first_killer
    }

    /// Consume one outstanding kill.
    ///
    /// # Panics
    ///
    /// Panics if no kill is outstanding; a consuming release without a
    /// matching kill is a bookkeeping bug.
    pub(crate) fn decrement_kills(&mut self) {
        assert!(
            self.kills_requested > 0,
            "kill counter underflow on session {}",
            self.id
        );
        self.kills_requested -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_available() {
        let state = SessionState::new(SessionId::new());
        assert!(!state.has_current_holder());
        assert!(!state.is_killed());
        assert!(state.is_available_for_checkout(false));
        assert!(!state.is_available_for_checkout(true));
    }

    #[test]
    fn test_holder_blocks_availability() {
        let mut state = SessionState::new(SessionId::new());
        state.record_checkout(Operation::new());

        assert!(state.has_current_holder());
        assert!(!state.is_available_for_checkout(false));
        assert!(!state.is_available_for_checkout(true));

        assert!(state.take_holder().is_some());
        assert!(state.is_available_for_checkout(false));
    }

    #[test]
    fn test_child_holder_blocks_availability() {
        let mut state = SessionState::new(SessionId::new());
        state.record_child_checkout(Operation::new());

        assert!(state.has_current_holder());
        assert!(!state.is_available_for_checkout(false));

        assert!(state.take_child_holder().is_some());
        assert!(!state.has_current_holder());
    }

    #[test]
    fn test_killed_matches_only_kill_waiters() {
        let mut state = SessionState::new(SessionId::new());
        assert!(state.increment_kills());

        assert!(state.is_killed());
        assert!(!state.is_available_for_checkout(false));
        assert!(state.is_available_for_checkout(true));
    }

    #[test]
    fn test_kill_counter() {
        let mut state = SessionState::new(SessionId::new());
        assert!(state.increment_kills());
        assert!(!state.increment_kills());
        assert_eq!(state.kills_requested(), 2);

        state.decrement_kills();
        assert!(state.is_killed());
        state.decrement_kills();
        assert!(!state.is_killed());
    }

    #[test]
    #[should_panic(expected = "kill counter underflow")]
    fn test_kill_underflow_panics() {
        let mut state = SessionState::new(SessionId::new());
        state.decrement_kills();
    }

    #[test]
    fn test_record_checkout_updates_timestamp() {
        let mut state = SessionState::new(SessionId::new());
        let before = state.last_checkout();
        std::thread::sleep(std::time::Duration::from_millis(5));
        state.record_checkout(Operation::new());
        assert!(state.last_checkout() > before);
    }
}
