//! Persisted document shapes.
//!
//! All records are serde structs rendered as JSON.  Binary fields are
//! lowercase hex; SSH public keys stay in their authorized-keys text form.
//! The `type` tags exist so future format changes can introduce new values
//! without breaking old files.

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// KDF tag of the only wrap-record format defined so far.
pub const KDF_SCRYPT_AES_GCM: &str = "scrypt-aes-gcm";

/// The only recipient kind defined so far.
pub const RECIPIENT_KIND_RSA: &str = "rsa";

pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const KEY_LEN: usize = 32;
pub const CHALLENGE_LEN: usize = 32;

/// scrypt parameters, stored alongside the ciphertext so old records keep
/// decrypting after defaults change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScryptParams {
    /// 16-byte salt, hex.
    pub salt: String,
    /// Derived key length in bytes.
    pub length: u32,
    pub n: u32,
    pub r: u32,
    pub p: u32,
}

impl ScryptParams {
    /// Fresh parameters with a random salt and the current defaults.
    pub fn fresh() -> Self {
        let mut salt = [0u8; SALT_LEN];
        rand::rng().fill_bytes(&mut salt);
        Self {
            salt: hex::encode(salt),
            length: KEY_LEN as u32,
            n: 16384,
            r: 8,
            p: 1,
        }
    }
}

/// A passphrase-derived wrap of some plaintext.
///
/// `ciphertext` is `nonce || ct || tag`, hex — the 12-byte AES-GCM nonce is
/// kept prepended inside the same field for compatibility with existing
/// files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrapRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub scrypt: ScryptParams,
    pub ciphertext: String,
}

/// An SSH-agent-derived wrap.
///
/// The inner [`WrapRecord`]'s "passphrase" is the agent's deterministic
/// `rsa-sha2-256` signature over `challenge`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentWrapRecord {
    /// 32 random bytes, hex.
    pub challenge: String,
    /// The authorized-keys line of the signing key.
    pub ssh_public_key: String,
    pub encrypted_private_key: WrapRecord,
}

/// How a stored private key is protected at rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum Protection {
    Password(WrapRecord),
    SshAgent(AgentWrapRecord),
}

impl Protection {
    pub fn kind(&self) -> &'static str {
        match self {
            Protection::Password(_) => "password",
            Protection::SshAgent(_) => "ssh-agent",
        }
    }
}

/// One stored private key: `{type, name, data}` on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivateKeyRecord {
    pub name: String,
    #[serde(flatten)]
    pub protection: Protection,
}

/// A recipient as recorded in a method file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientDescriptor {
    pub kind: String,
    pub name: String,
    /// SubjectPublicKeyInfo PEM.
    pub public_key: String,
    /// When set, decryption works without a local key store entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_private_key: Option<PrivateKeyRecord>,
}

/// The shared recipient list for one encryption target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MethodFile {
    pub methods: Vec<RecipientDescriptor>,
}

/// The per-recipient `encrypted` object inside an artifact entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientEnvelope {
    /// RSA-OAEP ciphertext, hex.
    pub ciphertext: String,
    /// Copy of the descriptor this entry was encrypted for.
    pub configuration: RecipientDescriptor,
}

/// One element of the encrypted artifact array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub encrypted: RecipientEnvelope,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_scrypt_params_use_documented_defaults() {
        let params = ScryptParams::fresh();
        assert_eq!(params.length, 32);
        assert_eq!(params.n, 16384);
        assert_eq!(params.r, 8);
        assert_eq!(params.p, 1);
        assert_eq!(params.salt.len(), SALT_LEN * 2);
        assert_eq!(params.salt, params.salt.to_lowercase());
    }

    #[test]
    fn fresh_salts_differ() {
        assert_ne!(ScryptParams::fresh().salt, ScryptParams::fresh().salt);
    }

    #[test]
    fn private_key_record_serializes_with_type_and_data() {
        let record = PrivateKeyRecord {
            name: "alex".to_string(),
            protection: Protection::Password(WrapRecord {
                kind: KDF_SCRYPT_AES_GCM.to_string(),
                scrypt: ScryptParams::fresh(),
                ciphertext: "00".to_string(),
            }),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "password");
        assert_eq!(json["name"], "alex");
        assert_eq!(json["data"]["type"], "scrypt-aes-gcm");
    }

    #[test]
    fn ssh_agent_record_roundtrips() {
        let record = PrivateKeyRecord {
            name: "alex".to_string(),
            protection: Protection::SshAgent(AgentWrapRecord {
                challenge: "ab".repeat(32),
                ssh_public_key: "ssh-rsa AAAA comment".to_string(),
                encrypted_private_key: WrapRecord {
                    kind: KDF_SCRYPT_AES_GCM.to_string(),
                    scrypt: ScryptParams::fresh(),
                    ciphertext: "ff".to_string(),
                },
            }),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"ssh-agent\""));
        let back: PrivateKeyRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.protection.kind(), "ssh-agent");
        assert_eq!(back.name, "alex");
    }

    #[test]
    fn unknown_protection_type_fails_to_parse() {
        let json = r#"{"name": "alex", "type": "tpm", "data": {}}"#;
        assert!(serde_json::from_str::<PrivateKeyRecord>(json).is_err());
    }

    #[test]
    fn descriptor_omits_absent_embedded_key() {
        let desc = RecipientDescriptor {
            kind: RECIPIENT_KIND_RSA.to_string(),
            name: "alex".to_string(),
            public_key: "---".to_string(),
            encrypted_private_key: None,
        };
        let json = serde_json::to_string(&desc).unwrap();
        assert!(!json.contains("encrypted_private_key"));
    }
}
