//! Checkout handles: RAII release, kill tokens, operation bindings.

use std::fmt;
use std::sync::Arc;

use crate::error::{ArbiterError, Result};
use crate::operation::Operation;
use crate::session::registry::SessionRegistry;
use crate::session::SessionId;

/// One-time-redeemable proof that a kill was registered against a session.
///
/// Only minted by the kill path, and consumed by value by
/// [`check_out_for_kill`](SessionRegistry::check_out_for_kill) — a token
/// cannot be fabricated or redeemed twice. Releasing the checkout that
/// redeemed it consumes one outstanding kill on the session and, for a child
/// token, on the parent.
#[derive(Debug)]
pub struct KillToken {
    id: SessionId,
    parent_id: Option<SessionId>,
}

impl KillToken {
    pub(crate) fn new(id: SessionId, parent_id: Option<SessionId>) -> Self {
        Self { id, parent_id }
    }

    /// The killed session's id.
    pub fn session_id(&self) -> SessionId {
        self.id
    }

    /// The killed parent's id, for a child-session token.
    pub fn parent_id(&self) -> Option<SessionId> {
        self.parent_id
    }
}

/// Exclusive ownership of a checked-out session.
///
/// Proof that the carrying operation currently owns the session (and, for a
/// child session, co-reserves its parent). Dropping the handle releases the
/// session: holder fields are cleared, waiters are woken, and a redeemed
/// [`KillToken`] consumes one outstanding kill.
pub struct ScopedCheckout {
    registry: Arc<SessionRegistry>,
    id: SessionId,
    parent_id: Option<SessionId>,
    op: Operation,
    kill_token: Option<KillToken>,
}

impl ScopedCheckout {
    pub(crate) fn new(
        registry: Arc<SessionRegistry>,
        id: SessionId,
        parent_id: Option<SessionId>,
        op: Operation,
        kill_token: Option<KillToken>,
    ) -> Self {
        Self {
            registry,
            id,
            parent_id,
            op,
            kill_token,
        }
    }

    /// The checked-out session's id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The co-reserved parent's id, for a child-session checkout.
    pub fn parent_id(&self) -> Option<SessionId> {
        self.parent_id
    }

    /// The operation holding this checkout.
    pub fn operation(&self) -> &Operation {
        &self.op
    }

    /// Whether this checkout redeemed a kill token (post-kill cleanup).
    pub fn kill_pending(&self) -> bool {
        self.kill_token.is_some()
    }
}

impl Drop for ScopedCheckout {
    fn drop(&mut self) {
        let consumed_kill = self.kill_token.take().is_some();
        self.registry
            .release(self.id, self.parent_id, &self.op, consumed_kill);
    }
}

impl fmt::Debug for ScopedCheckout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedCheckout")
            .field("id", &self.id)
            .field("parent_id", &self.parent_id)
            .field("operation", &self.op.id())
            .field("kill_pending", &self.kill_token.is_some())
            .finish()
    }
}

/// Glues a session checkout to the lifetime of one operation.
///
/// On bind, the operation checks the session out and keeps the checkout for
/// the duration of the unit of work; on drop — every exit path, including
/// unwinding — the checkout is released exactly once.
///
/// The one benign re-entrancy case: if the operation already holds a checkout
/// *and* is flagged [`in_direct_call`](Operation::set_in_direct_call), the
/// nested binding reuses it and its drop is a no-op; the outermost binding
/// releases. Any other re-entrant bind fails with
/// [`ArbiterError::AlreadyCheckedOut`].
///
/// Must not be constructed while the calling thread holds any lock the
/// registry may acquire, or inside an active multi-statement transaction
/// context: the bind blocks until the session is available.
pub struct OperationBinding {
    op: Operation,
    owns_checkout: bool,
}

impl OperationBinding {
    /// Check out `id` on behalf of `op` and bind the checkout to it.
    pub fn bind(
        registry: &Arc<SessionRegistry>,
        op: &Operation,
        id: SessionId,
    ) -> Result<Self> {
        if op.has_checkout() {
            if op.in_direct_call() {
                return Ok(Self {
                    op: op.clone(),
                    owns_checkout: false,
                });
            }
            return Err(ArbiterError::AlreadyCheckedOut);
        }

        let checkout = registry.check_out(op, id)?;
        op.stash_checkout(checkout);
        Ok(Self {
            op: op.clone(),
            owns_checkout: true,
        })
    }

    /// Redeem `token` on behalf of `op` and bind the cleanup checkout to it.
    pub fn bind_for_kill(
        registry: &Arc<SessionRegistry>,
        op: &Operation,
        token: KillToken,
    ) -> Result<Self> {
        if op.has_checkout() {
            return Err(ArbiterError::AlreadyCheckedOut);
        }

        let checkout = registry.check_out_for_kill(op, token)?;
        op.stash_checkout(checkout);
        Ok(Self {
            op: op.clone(),
            owns_checkout: true,
        })
    }

    /// The bound operation.
    pub fn operation(&self) -> &Operation {
        &self.op
    }

    /// Id of the bound session.
    pub fn session_id(&self) -> Option<SessionId> {
        self.op.checked_out_session()
    }
}

impl Drop for OperationBinding {
    fn drop(&mut self) {
        if !self.owns_checkout {
            return;
        }
        // Detach under the operation's lock, destroy after it is released:
        // destruction takes the registry mutex, and kill paths take the
        // operation lock while holding that mutex.
        let checkout = self.op.take_checkout();
        drop(checkout);
    }
}
