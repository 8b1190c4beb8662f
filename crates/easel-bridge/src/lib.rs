#![forbid(unsafe_code)]

//! Session-scoped command/result bridge between a backend agent and a
//! browser block workspace.
//!
//! The agent side issues commands ([`Bridge::create_block`] and
//! friends); the workspace side drains them over a push stream
//! ([`DispatchSession`]) and posts callbacks back ([`ResultCallback`]).
//! Correlation, timeouts, duplicate suppression, and session lifecycle
//! all live here so the HTTP surface can stay thin.

pub mod config;
pub mod dispatch;
pub mod envelope;
pub mod issuer;
pub mod queue;
pub mod session;
pub mod waiter;

pub use config::BridgeConfig;
pub use dispatch::{DedupeSet, DispatchSession, PushMessage};
pub use envelope::{
    CallbackError, CommandEnvelope, CommandKind, CorrelationKey, Placement, PortSpec,
    ResultCallback, ResultEnvelope,
};
pub use issuer::{PlacementError, PlacementRequest};
pub use queue::{CommandQueue, ResultQueue};
pub use session::{Bridge, SessionRegistry, SessionSnapshot};
pub use waiter::{CorrelationWaiter, PendingTicket, ResultDisposition, WaitError};
