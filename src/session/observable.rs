//! Restricted session view handed to scan visitors.

use std::time::Instant;

use tracing::debug;

use crate::operation::InterruptReason;
use crate::session::checkout::KillToken;
use crate::session::registry::RegistryInner;
use crate::session::SessionId;

/// A capability-restricted projection of one tracked session.
///
/// Only constructed by the registry, inside `scan`/`scan_one` visitors and
/// the kill path, while the registry mutex is held. Visitors can inspect the
/// session, register kills, and mark it for reap; they cannot touch the
/// underlying slot directly or delete it — the reap decision is re-checked by
/// the scan loop after the visitor returns.
pub struct ObservableSession<'a> {
    inner: &'a mut RegistryInner,
    id: SessionId,
    marked_for_reap: bool,
}

impl<'a> ObservableSession<'a> {
    pub(crate) fn new(inner: &'a mut RegistryInner, id: SessionId) -> Self {
        Self {
            inner,
            id,
            marked_for_reap: false,
        }
    }

    /// The observed session's id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Whether any operation currently occupies the session, directly or
    /// through a child checkout.
    pub fn has_current_holder(&self) -> bool {
        self.inner.slot(self.id).state.has_current_holder()
    }

    /// Whether the session has an unresolved kill.
    pub fn is_killed(&self) -> bool {
        self.inner.slot(self.id).state.is_killed()
    }

    /// Number of unresolved kills against the session.
    pub fn kills_requested(&self) -> u32 {
        self.inner.slot(self.id).state.kills_requested()
    }

    /// When the session was last checked out (slot creation time if never).
    pub fn last_checkout_time(&self) -> Instant {
        self.inner.slot(self.id).state.last_checkout()
    }

    /// Register a kill against the session, mid-scan.
    ///
    /// Increments the kill counter here and, for a child session, on the
    /// parent too. Only the first outstanding kill interrupts the operation
    /// currently occupying the session; later kills rely on the holder
    /// observing the nonzero counter through its own interruption checks.
    /// Returns the token to redeem through
    /// [`check_out_for_kill`](crate::SessionRegistry::check_out_for_kill).
    pub fn kill(&mut self, reason: InterruptReason) -> KillToken {
        let parent_id = self.id.parent();

        {
            let state = &mut self.inner.slot_mut(self.id).state;
            let first_killer = state.increment_kills();
            if first_killer {
                if let Some(holder) = state.holder() {
                    holder.interrupt(reason);
                } else if let Some(child_op) = state.child_holder() {
                    // The session is co-reserved by a checkout of one of its
                    // children; that operation is the one to unwind.
                    child_op.interrupt(reason);
                }
            }
        }

        if let Some(parent_id) = parent_id {
            // The parent slot is normally present whenever a child slot is;
            // recreate it if a scan reaped it independently.
            let parent = &mut self.inner.get_or_create(parent_id).state;
            let first_parent_killer = parent.increment_kills();
            if first_parent_killer {
                // A holder of the parent on behalf of a *different* child is
                // left alone; only a direct parent holder is interrupted.
                if let Some(holder) = parent.holder() {
                    holder.interrupt(reason);
                }
            }
        }

        debug!(session = %self.id, %reason, "killed session");
        KillToken::new(self.id, parent_id)
    }

    /// Ask the scan loop to reap this session after the visit.
    ///
    /// The request is honored only if, at that instant, the session has no
    /// holder, no unresolved kill, and no blocked waiters.
    pub fn mark_for_reap(&mut self) {
        self.marked_for_reap = true;
    }

    pub(crate) fn reap_requested(&self) -> bool {
        self.marked_for_reap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Operation;
    use crate::session::registry::SessionRegistry;
    use std::sync::Arc;

    #[test]
    fn test_observed_fields() {
        let registry = Arc::new(SessionRegistry::new());
        let id = SessionId::new();
        registry.create_if_absent(id).unwrap();

        registry
            .scan_one(id, |session| {
                assert_eq!(session.id(), id);
                assert!(!session.has_current_holder());
                assert!(!session.is_killed());
                assert_eq!(session.kills_requested(), 0);
            })
            .unwrap();
    }

    #[test]
    fn test_kill_from_scan_marks_parent() {
        let registry = Arc::new(SessionRegistry::new());
        let parent = SessionId::new();
        let child = SessionId::child_of(parent);
        registry.create_if_absent(child).unwrap();

        let mut token = None;
        registry
            .scan_one(child, |session| {
                token = Some(session.kill(InterruptReason::SessionKilled));
            })
            .unwrap();
        let token = token.unwrap();
        assert_eq!(token.session_id(), child);
        assert_eq!(token.parent_id(), Some(parent));

        let mut parent_killed = false;
        registry
            .scan_one(parent, |session| parent_killed = session.is_killed())
            .unwrap();
        assert!(parent_killed);

        // Redeem so the registry drops clean.
        let op = Operation::new();
        drop(registry.check_out_for_kill(&op, token).unwrap());
    }

    #[test]
    fn test_kill_parent_does_not_mark_child() {
        let registry = Arc::new(SessionRegistry::new());
        let parent = SessionId::new();
        let child = SessionId::child_of(parent);
        registry.create_if_absent(child).unwrap();

        let token = registry.kill(parent).unwrap();

        let mut child_killed = true;
        registry
            .scan_one(child, |session| child_killed = session.is_killed())
            .unwrap();
        assert!(!child_killed);

        let op = Operation::new();
        drop(registry.check_out_for_kill(&op, token).unwrap());
    }

    #[test]
    fn test_kill_child_interrupts_parent_co_reservation() {
        // An operation holding the parent through a child checkout is the one
        // interrupted when the *parent* is killed.
        let registry = Arc::new(SessionRegistry::new());
        let parent = SessionId::new();
        let child = SessionId::child_of(parent);
        let op = Operation::new();
        let checkout = registry.check_out(&op, child).unwrap();

        let token = registry.kill(parent).unwrap();
        assert!(op.is_interrupted());

        drop(checkout);
        drop(registry.check_out_for_kill(&Operation::new(), token).unwrap());
    }
}
