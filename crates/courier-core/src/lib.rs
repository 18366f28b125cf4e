//! # courier-core
//!
//! Core session lifecycle logic for Courier, the multi-account messaging gateway.
//!
//! This crate is framework-agnostic and can be used by:
//! - The HTTP server (via `courier-http`)
//! - The daemon binary (via `courier-daemon`)
//! - Tests, with the in-memory fake client
//!
//! ## Key Concepts
//!
//! - **Session**: One messaging account identity, bound 1:1 to a client handle
//! - **SessionController**: Start / send / logout, serialized per session id
//! - **MessagingClient**: The collaborator that actually speaks to the backend
//! - **ClientEvent**: Ready, pairing code, disconnect and auth failure notifications

pub mod client;
pub mod event_bus;
pub mod logging;
pub mod paths;
pub mod session;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

// Re-export commonly used types
pub use client::{ClientError, ClientEvent, ClientFactory, MessagingClient, OutgoingMessage};
pub use session::{
    ErrorKind, SendRequest, Session, SessionController, SessionError, SessionId, SessionRegistry,
    StartOutcome,
};
