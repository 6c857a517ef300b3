//! Remote command execution over SSH.
//!
//! One client per target host. Every command in a batch opens its own
//! connection and session; there is no pooling. This keeps a batch resilient
//! to mid-run network resets on hosts that have only just finished booting,
//! at the cost of an extra handshake per command.

mod auth;
mod client;
mod error;

pub use auth::{decode_secret_key, AuthError, AuthMethod};
pub use client::{OutputSinks, RemoteRunner, SshClient, READY_ATTEMPTS, READY_RETRY_DELAY};
pub use error::{BatchError, ExecError};
