//! Networked Execution Backend for Courtier
//!
//! This crate adds the remote pair to the courtier consumer family: a
//! TCP server-side [`NetworkedConsumer`] that dispatches broker items to
//! connected workers, and the blocking [`run_client`] loop those worker
//! processes run. Payloads travel length-prefixed in one of the named
//! serialization formats (binary by default); the frame layout lives in
//! [`codec`].
//!
//! The server never blocks its reactor on broker calls (they run on the
//! blocking pool) and holds no locks across network I/O. Anything that goes
//! wrong on a connection orphans at most the one item currently checked out
//! to it, which the broker's stale sweeper eventually reclaims.

pub mod client;
pub mod codec;
pub mod server;

pub use client::{run_client, ClientConfig, ClientStats};
pub use codec::{TaskReply, TaskRequest, WireError};
pub use server::{NetConsumerConfig, NetworkedConsumer};
