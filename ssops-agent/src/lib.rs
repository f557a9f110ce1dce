//! SSH agent client for ssops.
//!
//! Speaks the OpenSSH agent protocol over the Unix socket named by
//! `SSH_AUTH_SOCK`.  Only the two message exchanges the tool needs are
//! implemented: listing identities and requesting signatures.  Signatures
//! are always requested with the `rsa-sha2-256` flag because the rest of
//! the tool relies on them being deterministic for a fixed input.

pub mod client;
pub mod proto;

pub use client::{AgentClient, AgentError, Identity};
