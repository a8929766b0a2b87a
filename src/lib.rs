//! # session-arbiter
//!
//! Process-wide registry arbitrating exclusive access to logical sessions.
//!
//! A logical session groups a sequence of operations from one client,
//! independent of connection. This crate manages *checkout* of per-session
//! state: at most one operation owns a session at a time, child sessions
//! co-reserve their parents, and a coordinated kill protocol interrupts an
//! in-progress holder so cleanup (or a reaper) can proceed safely.
//!
//! ## Features
//!
//! - **Exclusive checkout**: blocking, interruptible waits with RAII release
//! - **Hierarchical sessions**: parent/child joint availability for nested work
//! - **Kill protocol**: one-shot [`KillToken`]s gate post-kill cleanup
//! - **Scan & reap**: visit sessions under lock, reclaim provably-unused slots
//!
//! ## Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use session_arbiter::{Operation, SessionId, SessionRegistry};
//!
//! fn main() -> session_arbiter::Result<()> {
//!     // Initialize logging
//!     session_arbiter::logging::try_init().ok();
//!
//!     // One registry per process, shared by handle
//!     let registry = Arc::new(SessionRegistry::new());
//!
//!     let op = Operation::new();
//!     let id = SessionId::new();
//!
//!     let checkout = registry.check_out(&op, id)?;
//!     assert_eq!(checkout.id(), id);
//!
//!     // Dropping the checkout releases the session and wakes waiters
//!     drop(checkout);
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod operation;
pub mod session;

// Re-export commonly used types
pub use config::{ConfigError, RegistryConfig};
pub use error::{ArbiterError, Result};
pub use operation::{InterruptReason, Operation};
pub use session::{
    KillToken, ObservableSession, OperationBinding, ScopedCheckout, SessionId, SessionRegistry,
};
