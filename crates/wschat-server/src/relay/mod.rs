//! Chat relay: connection registry and message router.

pub mod registry;
pub mod router;

pub use registry::{AuthOutcome, AuthState, ConnCommand, ConnectionId, Registry, Session};
pub use router::{Delivery, Router};
