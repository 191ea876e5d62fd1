//! Client-side protocol state machines for Matrix sliding sync and
//! end-to-end-encryption key recovery.
//!
//! Two independent components share the [`http::Transport`] abstraction:
//!
//! - [`sliding_sync::SlidingSync`] runs a long-poll loop against a sliding
//!   sync proxy and maintains ordered, windowed room lists over the server's
//!   mutation stream.
//! - [`key_request::KeyRequestManager`] durably tracks outgoing room-key
//!   requests through their request/cancellation lifecycle and drives a
//!   timer-based background sender.

#[macro_use]
extern crate tracing;

pub mod error;
pub mod http;
pub mod key_request;
pub mod sliding_sync;

pub use mxsync_core as core;

pub use error::{ClientError, ClientResult};
