//! Session lifecycle management.
//!
//! One session per messaging identity, created on demand by the first
//! start request and destroyed by logout or by the client disconnecting.

mod controller;
mod registry;
mod state;

pub use controller::{ErrorKind, SendRequest, SessionController, SessionError, StartOutcome};
pub use registry::SessionRegistry;
pub use state::{PairingClaim, PairingGuard, SendGuard, Session, SessionFlags, SessionId};
