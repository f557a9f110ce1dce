//! Method files: the shared, ordered recipient list for one target.
//!
//! Methods are append-only from the user's point of view — recipients are
//! added, never silently replaced — and the file is expected to travel via
//! version control, so writes keep a stable pretty-printed layout.

use std::fs;
use std::io::Write;
use std::path::Path;

use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::{BigUint, RsaPublicKey};
use tracing::debug;

use ssops_agent::proto;

use crate::error::{Error, Result};
use crate::protect;
use crate::types::{MethodFile, RECIPIENT_KIND_RSA, RecipientDescriptor};

/// Create a new, empty method file.  Refuses to clobber an existing one.
pub fn create(path: &Path) -> Result<()> {
    if path.exists() {
        return Err(Error::ConfigInvalid(format!(
            "{} already exists",
            path.display()
        )));
    }
    save(path, &MethodFile::default())
}

/// Load a method file.
pub fn load(path: &Path) -> Result<MethodFile> {
    let text = fs::read_to_string(path)?;
    serde_json::from_str(&text)
        .map_err(|e| Error::ConfigInvalid(format!("method file {}: {e}", path.display())))
}

/// Persist a method file durably (write, flush, fsync, fsync directory).
pub fn save(path: &Path, method: &MethodFile) -> Result<()> {
    let mut text = serde_json::to_string_pretty(method)
        .map_err(|e| Error::ConfigInvalid(format!("serializing method: {e}")))?;
    text.push('\n');

    let mut file = fs::File::create(path)?;
    file.write_all(text.as_bytes())?;
    file.flush()?;
    file.sync_all()?;
    if let Some(dir) = path.parent() {
        // A bare relative filename has parent "", which means the cwd.
        let dir = if dir.as_os_str().is_empty() {
            Path::new(".")
        } else {
            dir
        };
        fs::File::open(dir)?.sync_all()?;
    }
    Ok(())
}

/// Append a recipient, refusing `(kind, name)` duplicates.
pub fn add_recipient(method: &mut MethodFile, descriptor: RecipientDescriptor) -> Result<()> {
    if method
        .methods
        .iter()
        .any(|d| d.kind == descriptor.kind && d.name == descriptor.name)
    {
        return Err(Error::DuplicateRecipient {
            kind: descriptor.kind,
            name: descriptor.name,
        });
    }
    debug!(
        kind = %descriptor.kind,
        name = %descriptor.name,
        embedded = descriptor.encrypted_private_key.is_some(),
        "recipient added"
    );
    method.methods.push(descriptor);
    Ok(())
}

/// Build a recipient descriptor from an SSH public key file.
///
/// The file must hold an `ssh-rsa` authorized-keys line; the wire-format
/// `(e, n)` pair is re-encoded as a standard SPKI public key.  The recipient
/// is named after the file's basename with any `.pub` suffix stripped.
pub fn import_ssh_public_key(path: &Path) -> Result<RecipientDescriptor> {
    let line = protect::read_ssh_public_key_file(path)?;
    let blob = protect::agent_key_blob(&line)?;

    let (e, n) = proto::parse_ssh_rsa(&blob)
        .map_err(|err| Error::ConfigInvalid(format!("SSH public key blob: {err}")))?;
    let public_key = RsaPublicKey::new(
        BigUint::from_bytes_be(&n),
        BigUint::from_bytes_be(&e),
    )
    .map_err(|err| Error::ConfigInvalid(format!("SSH RSA public key: {err}")))?;
    let public_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|err| Error::Crypto(format!("SPKI encoding: {err}")))?;

    let name = recipient_name_from_path(path)?;
    Ok(RecipientDescriptor {
        kind: RECIPIENT_KIND_RSA.to_string(),
        name,
        public_key: public_pem,
        encrypted_private_key: None,
    })
}

fn recipient_name_from_path(path: &Path) -> Result<String> {
    let base = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::ConfigInvalid(format!("unusable file name: {}", path.display())))?;
    let name = base.strip_suffix(".pub").unwrap_or(base);
    if name.is_empty() {
        return Err(Error::ConfigInvalid(format!(
            "cannot derive a recipient name from {}",
            path.display()
        )));
    }
    Ok(name.to_string())
}
