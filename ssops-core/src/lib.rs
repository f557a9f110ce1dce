//! Core of the ssops secret-sharing tool.
//!
//! A payload is encrypted once per recipient with RSA-OAEP and the results
//! are collected into a single artifact; any one recipient's private key
//! decrypts it.  Private keys never touch disk in plaintext — they are
//! wrapped under a passphrase-derived key (scrypt → AES-256-GCM) or under a
//! key derived from a deterministic SSH-agent signature over a stored
//! challenge.
//!
//! Module map:
//! - [`kdf`] — scrypt + AES-GCM wrap records
//! - [`protect`] — private-key protection (passphrase / ssh-agent kinds)
//! - [`envelope`] — per-recipient and multi-recipient encryption
//! - [`keystore`] — the `~/.ssops` on-disk key store
//! - [`method`] — recipient lists shared between collaborators
//! - [`keys`] — RSA key-pair generation
//! - [`types`] — the persisted document shapes
//! - [`error`] — the error taxonomy

pub mod envelope;
pub mod error;
pub mod kdf;
pub mod keys;
pub mod keystore;
pub mod method;
pub mod protect;
pub mod types;

pub use error::{Error, Result};
