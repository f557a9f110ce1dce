//! Private-key protection.
//!
//! Two kinds share the `{type, name, data}` record shape: a passphrase wrap
//! (scrypt → AES-GCM, see [`crate::kdf`]) and an SSH-agent wrap, where the
//! "passphrase" is the agent's deterministic `rsa-sha2-256` signature over a
//! stored random challenge.  Either way the plaintext key only ever exists
//! on the heap, inside `Zeroizing` buffers.
//!
//! Interactive input and agent access go through the [`PassphrasePrompt`]
//! and [`ChallengeSigner`] seams so the decrypt loop can be exercised
//! without a terminal or a running agent.

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use rand::RngCore;
use tracing::debug;
use zeroize::Zeroizing;

use ssops_agent::proto::{self, SIGN_FLAG_RSA_SHA2_256};
use ssops_agent::AgentClient;

use crate::error::{Error, Result};
use crate::kdf;
use crate::types::{AgentWrapRecord, CHALLENGE_LEN, PrivateKeyRecord, Protection};

/// Signature algorithm the scheme depends on; anything else is not
/// guaranteed deterministic.
const REQUIRED_SIGN_ALGORITHM: &str = "rsa-sha2-256";

/// Source of passphrases.  The real implementation reads from the terminal.
pub trait PassphrasePrompt {
    fn read_passphrase(&mut self, prompt: &str) -> Result<Zeroizing<String>>;
}

/// Terminal prompt with echo disabled.
pub struct TtyPrompt;

impl PassphrasePrompt for TtyPrompt {
    fn read_passphrase(&mut self, prompt: &str) -> Result<Zeroizing<String>> {
        rpassword::prompt_password(prompt)
            .map(Zeroizing::new)
            .map_err(Error::Io)
    }
}

/// Access to an SSH agent for challenge signing.
pub trait ChallengeSigner {
    /// Whether the agent currently holds the key identified by `key_blob`.
    fn has_identity(&mut self, key_blob: &[u8]) -> Result<bool>;

    /// Sign `data` with `key_blob`, returning `(algorithm, signature)`.
    fn sign(&mut self, key_blob: &[u8], data: &[u8]) -> Result<(String, Zeroizing<Vec<u8>>)>;
}

/// Lazily-connecting [`ChallengeSigner`] over the real agent.
///
/// The connection is only opened on first use, so commands that never touch
/// an ssh-agent-protected key work without `SSH_AUTH_SOCK`.
#[derive(Default)]
pub struct AgentSigner {
    client: Option<AgentClient>,
}

impl AgentSigner {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&mut self) -> Result<&mut AgentClient> {
        if self.client.is_none() {
            self.client = Some(AgentClient::connect()?);
        }
        Ok(self.client.as_mut().expect("client was just connected"))
    }
}

impl ChallengeSigner for AgentSigner {
    fn has_identity(&mut self, key_blob: &[u8]) -> Result<bool> {
        let identities = self.client()?.list_identities()?;
        Ok(identities.iter().any(|id| id.blob == key_blob))
    }

    fn sign(&mut self, key_blob: &[u8], data: &[u8]) -> Result<(String, Zeroizing<Vec<u8>>)> {
        let (algorithm, signature) = self
            .client()?
            .sign(key_blob, data, SIGN_FLAG_RSA_SHA2_256)?;
        Ok((algorithm, Zeroizing::new(signature)))
    }
}

/// Wrap `plaintext` under a passphrase collected twice from `prompt`.
pub fn wrap_with_passphrase(
    name: &str,
    plaintext: &[u8],
    prompt: &mut dyn PassphrasePrompt,
) -> Result<PrivateKeyRecord> {
    let first = prompt.read_passphrase(&format!("New passphrase for key '{name}': "))?;
    let second = prompt.read_passphrase(&format!("Repeat passphrase for key '{name}': "))?;
    if *first != *second {
        return Err(Error::PassphraseMismatch);
    }
    let record = kdf::wrap(first.as_bytes(), plaintext)?;
    Ok(PrivateKeyRecord {
        name: name.to_string(),
        protection: Protection::Password(record),
    })
}

/// Wrap `plaintext` under an SSH-agent signature.
///
/// `ssh_public_key` is an authorized-keys line; the agent must currently
/// hold the matching identity.
pub fn wrap_with_agent(
    name: &str,
    plaintext: &[u8],
    ssh_public_key: &str,
    signer: &mut dyn ChallengeSigner,
) -> Result<PrivateKeyRecord> {
    let line = ssh_public_key.trim();
    let blob = agent_key_blob(line)?;

    let mut challenge = [0u8; CHALLENGE_LEN];
    rand::rng().fill_bytes(&mut challenge);

    let signature = sign_checked(signer, &blob, &challenge)?;
    let inner = kdf::wrap(&signature, plaintext)?;
    debug!(key = name, "wrapped private key under agent signature");

    Ok(PrivateKeyRecord {
        name: name.to_string(),
        protection: Protection::SshAgent(AgentWrapRecord {
            challenge: hex::encode(challenge),
            ssh_public_key: line.to_string(),
            encrypted_private_key: inner,
        }),
    })
}

/// Recover the plaintext private key from a stored record.
///
/// Passphrase kind prompts once, naming the key; an empty entry means the
/// user is skipping this key and maps to [`Error::UserDeclined`].
pub fn unwrap(
    record: &PrivateKeyRecord,
    prompt: &mut dyn PassphrasePrompt,
    signer: &mut dyn ChallengeSigner,
) -> Result<Zeroizing<Vec<u8>>> {
    match &record.protection {
        Protection::Password(wrap) => {
            let passphrase =
                prompt.read_passphrase(&format!("Passphrase for key '{}': ", record.name))?;
            if passphrase.is_empty() {
                return Err(Error::UserDeclined);
            }
            kdf::unwrap(passphrase.as_bytes(), wrap)
        }
        Protection::SshAgent(agent_wrap) => {
            let blob = agent_key_blob(&agent_wrap.ssh_public_key)?;
            let challenge = hex::decode(&agent_wrap.challenge)
                .map_err(|e| Error::ConfigInvalid(format!("challenge is not valid hex: {e}")))?;
            let signature = sign_checked(signer, &blob, &challenge)?;
            kdf::unwrap(&signature, &agent_wrap.encrypted_private_key)
        }
    }
}

fn sign_checked(
    signer: &mut dyn ChallengeSigner,
    blob: &[u8],
    challenge: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    if !signer.has_identity(blob)? {
        return Err(Error::KeyNotInAgent);
    }
    let (algorithm, signature) = signer.sign(blob, challenge)?;
    if algorithm != REQUIRED_SIGN_ALGORITHM {
        return Err(Error::BadSignature(format!(
            "agent signed with {algorithm}, {REQUIRED_SIGN_ALGORITHM} required"
        )));
    }
    Ok(signature)
}

/// Parse an authorized-keys line (`"<type> <base64> [comment]"`) into the
/// raw key blob, accepting RSA keys only.
///
/// DSA and ECDSA signatures are randomized and Ed25519 is deliberately not
/// accepted either, so everything except `ssh-rsa` is rejected up front.
pub fn agent_key_blob(line: &str) -> Result<Vec<u8>> {
    let mut fields = line.split_whitespace();
    let declared = fields
        .next()
        .ok_or_else(|| Error::ConfigInvalid("empty SSH public key line".to_string()))?;
    let encoded = fields.next().ok_or_else(|| {
        Error::ConfigInvalid("SSH public key line is missing the key data field".to_string())
    })?;
    let blob = BASE64_STANDARD
        .decode(encoded)
        .map_err(|e| Error::ConfigInvalid(format!("SSH public key is not valid base64: {e}")))?;

    let embedded = proto::blob_algorithm(&blob)
        .map_err(|e| Error::ConfigInvalid(format!("SSH public key blob: {e}")))?;
    if embedded != declared {
        return Err(Error::ConfigInvalid(format!(
            "SSH public key declares {declared} but its blob contains {embedded}"
        )));
    }
    if declared != "ssh-rsa" {
        return Err(Error::UnsupportedRecipientKind(format!(
            "SSH key type {declared} (only ssh-rsa signatures are deterministic)"
        )));
    }
    Ok(blob)
}

/// Read the first non-empty line of an SSH public key file.
pub fn read_ssh_public_key_file(path: &std::path::Path) -> Result<String> {
    let content = std::fs::read_to_string(path)?;
    content
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::ConfigInvalid(format!("{} is empty", path.display())))
}
