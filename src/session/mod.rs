//! Session registry module.
//!
//! This module provides the types for arbitrating exclusive access to
//! logical sessions: identifiers, the registry itself, restricted scan
//! views, and the RAII checkout handles.

mod checkout;
mod id;
mod observable;
mod registry;
mod state;

pub use checkout::{KillToken, OperationBinding, ScopedCheckout};
pub use id::SessionId;
pub use observable::ObservableSession;
pub use registry::SessionRegistry;
