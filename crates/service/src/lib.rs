//! ## Session establishment and teardown
//!
//! The protocol logic that turns an authenticated TLS byte stream plus a
//! shared RDMA device into an open reliable-connected session, and back
//! into nothing again:
//!
//! - [`psn`] draws the fresh 24-bit packet sequence numbers from a
//!   cryptographic source, one per direction per connection;
//! - [`handshake`] is the establishment state machine, a typestate chain
//!   where each transition consumes the previous state, so a queue pair
//!   cannot reach ready-to-send before the peer PSN is known and the
//!   local PSN has been committed to the wire;
//! - [`disconnect`] is the three-way goodbye over the same TLS channel;
//! - [`resources`] owns the per-session verb objects in their strict
//!   creation and reverse destruction order.
//!
//! Everything here talks to the control channel through the
//! [`channel::ControlChannel`] trait, implemented by the server and
//! client binaries over their TLS streams and by in-memory pipes in the
//! tests.

pub mod channel;
pub mod disconnect;
pub mod error;
pub mod handshake;
pub mod psn;
pub mod resources;

pub use channel::ControlChannel;
pub use disconnect::{DisconnectOutcome, DisconnectTimers};
pub use error::SessionError;
pub use handshake::Established;
pub use resources::{ResourceOptions, SessionResources};
