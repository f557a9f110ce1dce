//! Recipient envelopes and multi-recipient artifacts.
//!
//! Encryption applies RSA-OAEP (MGF1-SHA-256, SHA-256, empty label) per
//! recipient and collects the results into one JSON array, preserving the
//! method's ordering.  Decryption walks the array in order and stops at the
//! first entry whose private key can be recovered — a declined prompt just
//! moves on to the next entry.

use rand_core::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::traits::PublicKeyParts as _;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::digest::Digest as _;
use sha2::Sha256;
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::keystore::KeyStore;
use crate::protect::{self, ChallengeSigner, PassphrasePrompt};
use crate::types::{
    ArtifactEntry, MethodFile, PrivateKeyRecord, RECIPIENT_KIND_RSA, RecipientDescriptor,
    RecipientEnvelope,
};

/// Interactive context for the decrypt path: where passphrases come from
/// and who signs agent challenges.
pub struct UnwrapContext<'a> {
    pub prompt: &'a mut dyn PassphrasePrompt,
    pub signer: &'a mut dyn ChallengeSigner,
}

/// Largest payload RSA-OAEP-SHA-256 admits for this key.
pub fn oaep_limit(public_key: &RsaPublicKey) -> usize {
    public_key.size() - 2 * Sha256::output_size() - 2
}

/// Encrypt `plaintext` for a single recipient.
pub fn encrypt_for(
    descriptor: &RecipientDescriptor,
    plaintext: &[u8],
) -> Result<RecipientEnvelope> {
    if descriptor.kind != RECIPIENT_KIND_RSA {
        return Err(Error::UnsupportedRecipientKind(descriptor.kind.clone()));
    }
    let public_key = RsaPublicKey::from_public_key_pem(&descriptor.public_key).map_err(|e| {
        Error::ConfigInvalid(format!("public key for {:?}: {e}", descriptor.name))
    })?;

    let max = oaep_limit(&public_key);
    if plaintext.len() > max {
        return Err(Error::PayloadTooLarge {
            size: plaintext.len(),
            max,
        });
    }

    let ciphertext = public_key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)
        .map_err(|e| Error::Crypto(format!("RSA-OAEP encrypt: {e}")))?;

    Ok(RecipientEnvelope {
        ciphertext: hex::encode(ciphertext),
        configuration: descriptor.clone(),
    })
}

/// Decrypt a single recipient envelope.
///
/// The private key is resolved from the embedded record when present,
/// otherwise from the local key store — in which case the stored public key
/// must match the descriptor's copy before any RSA operation happens.
pub fn decrypt_with(
    envelope: &RecipientEnvelope,
    store: &KeyStore,
    ctx: &mut UnwrapContext<'_>,
) -> Result<Zeroizing<Vec<u8>>> {
    decrypt_inner(envelope, store, ctx).map_err(|cause| Error::DecryptFailed {
        name: envelope.configuration.name.clone(),
        cause: Box::new(cause),
    })
}

fn decrypt_inner(
    envelope: &RecipientEnvelope,
    store: &KeyStore,
    ctx: &mut UnwrapContext<'_>,
) -> Result<Zeroizing<Vec<u8>>> {
    let descriptor = &envelope.configuration;
    if descriptor.kind != RECIPIENT_KIND_RSA {
        return Err(Error::UnsupportedRecipientKind(descriptor.kind.clone()));
    }

    let stored;
    let record: &PrivateKeyRecord = match &descriptor.encrypted_private_key {
        Some(embedded) => embedded,
        None => {
            let (loaded, stored_pub) = store.load(&descriptor.name)?;
            if stored_pub.trim() != descriptor.public_key.trim() {
                return Err(Error::PublicKeyMismatch(descriptor.name.clone()));
            }
            stored = loaded;
            &stored
        }
    };

    let private_pem = protect::unwrap(record, ctx.prompt, ctx.signer)?;
    let pem_text = std::str::from_utf8(&private_pem)
        .map_err(|e| Error::ConfigInvalid(format!("stored private key is not UTF-8: {e}")))?;
    let private_key = RsaPrivateKey::from_pkcs8_pem(pem_text)
        .map_err(|e| Error::ConfigInvalid(format!("stored private key: {e}")))?;

    let ciphertext = hex::decode(&envelope.ciphertext)
        .map_err(|e| Error::ConfigInvalid(format!("ciphertext is not valid hex: {e}")))?;
    let plaintext = private_key
        .decrypt(Oaep::new::<Sha256>(), &ciphertext)
        .map_err(|e| Error::Crypto(format!("RSA-OAEP decrypt: {e}")))?;

    Ok(Zeroizing::new(plaintext))
}

/// Encrypt `plaintext` for every selected recipient of a method.
///
/// Entry order equals method order; `filter` restricts by recipient name.
pub fn encrypt_to_artifact(
    method: &MethodFile,
    filter: Option<&str>,
    plaintext: &[u8],
) -> Result<Vec<ArtifactEntry>> {
    let selected: Vec<&RecipientDescriptor> = method
        .methods
        .iter()
        .filter(|d| filter.is_none_or(|name| d.name == name))
        .collect();
    if selected.is_empty() {
        return Err(Error::ConfigInvalid(match filter {
            Some(name) => format!("no recipient named {name:?} in the method"),
            None => "the method has no recipients".to_string(),
        }));
    }

    let mut entries = Vec::with_capacity(selected.len());
    for descriptor in selected {
        let encrypted = encrypt_for(descriptor, plaintext)?;
        entries.push(ArtifactEntry {
            kind: descriptor.kind.clone(),
            name: descriptor.name.clone(),
            encrypted,
        });
    }
    debug!(recipients = entries.len(), "artifact assembled");
    Ok(entries)
}

/// Try artifact entries in order; first successful decrypt wins.
///
/// Per-recipient failures (including a declined prompt) are collected and
/// only surface as [`Error::AllRecipientsFailed`] when nothing succeeds.
pub fn decrypt_from_artifact(
    entries: &[ArtifactEntry],
    filter: Option<&str>,
    store: &KeyStore,
    ctx: &mut UnwrapContext<'_>,
) -> Result<Zeroizing<Vec<u8>>> {
    let mut failures: Vec<(String, Error)> = Vec::new();
    for entry in entries
        .iter()
        .filter(|e| filter.is_none_or(|name| e.name == name))
    {
        match decrypt_with(&entry.encrypted, store, ctx) {
            Ok(plaintext) => {
                debug!(recipient = %entry.name, "decrypted");
                return Ok(plaintext);
            }
            Err(err) => {
                debug!(recipient = %entry.name, error = %err, "recipient failed, trying next");
                failures.push((entry.name.clone(), err));
            }
        }
    }
    Err(Error::AllRecipientsFailed(failures))
}

/// Render an artifact as its persisted JSON form.
pub fn render_artifact(entries: &[ArtifactEntry]) -> Result<String> {
    let mut text = serde_json::to_string_pretty(entries)
        .map_err(|e| Error::ConfigInvalid(format!("serializing artifact: {e}")))?;
    text.push('\n');
    Ok(text)
}

/// Parse a persisted artifact.
pub fn parse_artifact(text: &str) -> Result<Vec<ArtifactEntry>> {
    serde_json::from_str(text).map_err(|e| Error::ConfigInvalid(format!("artifact: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protect::test_support::{FakeSigner, ScriptedPrompt};
    use crate::types::RECIPIENT_KIND_RSA;
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Shared test key pair; RSA generation is slow enough to do once.
    fn test_keypair(slot: usize) -> &'static (Zeroizing<String>, String) {
        static KEYS: [OnceLock<(Zeroizing<String>, String)>; 2] =
            [OnceLock::new(), OnceLock::new()];
        KEYS[slot].get_or_init(|| {
            let generated = crate::keys::generate_rsa().unwrap();
            (generated.private_pem, generated.public_pem)
        })
    }

    fn tmp_store() -> (PathBuf, KeyStore) {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let root =
            std::env::temp_dir().join(format!("ssops-envelope-{}-{n}", std::process::id()));
        (root.clone(), KeyStore::at(root))
    }

    /// A passphrase-protected recipient written into `store`.
    fn stored_recipient(name: &str, passphrase: &str, slot: usize, store: &KeyStore) -> RecipientDescriptor {
        let (private_pem, public_pem) = test_keypair(slot);
        let mut prompt = ScriptedPrompt::new(&[passphrase, passphrase]);
        let record =
            protect::wrap_with_passphrase(name, private_pem.as_bytes(), &mut prompt).unwrap();
        store.write(&record, public_pem, false).unwrap();
        RecipientDescriptor {
            kind: RECIPIENT_KIND_RSA.to_string(),
            name: name.to_string(),
            public_key: public_pem.clone(),
            encrypted_private_key: None,
        }
    }

    fn ctx<'a>(
        prompt: &'a mut ScriptedPrompt,
        signer: &'a mut FakeSigner,
    ) -> UnwrapContext<'a> {
        UnwrapContext { prompt, signer }
    }

    #[test]
    fn single_recipient_roundtrip() {
        let (root, store) = tmp_store();
        let desc = stored_recipient("alex", "pw", 0, &store);
        let method = MethodFile {
            methods: vec![desc],
        };

        let entries = encrypt_to_artifact(&method, None, b"hello\n").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "alex");
        assert_eq!(entries[0].kind, "rsa");

        let mut prompt = ScriptedPrompt::new(&["pw"]);
        let mut signer = FakeSigner::holding(&[]);
        let plaintext =
            decrypt_from_artifact(&entries, None, &store, &mut ctx(&mut prompt, &mut signer))
                .unwrap();
        assert_eq!(plaintext.as_slice(), b"hello\n");

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn artifact_preserves_method_order() {
        let (root, store) = tmp_store();
        let alex = stored_recipient("alex", "a", 0, &store);
        let mathieu = stored_recipient("mathieu", "m", 1, &store);
        let method = MethodFile {
            methods: vec![alex, mathieu],
        };

        let entries = encrypt_to_artifact(&method, None, b"payload").unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["alex", "mathieu"]);

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn declined_prompt_skips_to_next_recipient() {
        let (root, store) = tmp_store();
        let alex = stored_recipient("alex", "a-pw", 0, &store);
        let mathieu = stored_recipient("mathieu", "m-pw", 1, &store);
        let method = MethodFile {
            methods: vec![alex, mathieu],
        };
        let entries = encrypt_to_artifact(&method, None, b"payload").unwrap();

        // Blank entry skips alex; mathieu's passphrase succeeds.
        let mut prompt = ScriptedPrompt::new(&["", "m-pw"]);
        let mut signer = FakeSigner::holding(&[]);
        let plaintext =
            decrypt_from_artifact(&entries, None, &store, &mut ctx(&mut prompt, &mut signer))
                .unwrap();
        assert_eq!(plaintext.as_slice(), b"payload");

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn all_failures_are_aggregated_in_attempt_order() {
        let (root, store) = tmp_store();
        let alex = stored_recipient("alex", "a-pw", 0, &store);
        let mathieu = stored_recipient("mathieu", "m-pw", 1, &store);
        let method = MethodFile {
            methods: vec![alex, mathieu],
        };
        let entries = encrypt_to_artifact(&method, None, b"payload").unwrap();

        let mut prompt = ScriptedPrompt::new(&["", "wrong"]);
        let mut signer = FakeSigner::holding(&[]);
        let err =
            decrypt_from_artifact(&entries, None, &store, &mut ctx(&mut prompt, &mut signer))
                .unwrap_err();
        match err {
            Error::AllRecipientsFailed(causes) => {
                assert_eq!(causes.len(), 2);
                assert_eq!(causes[0].0, "alex");
                assert_eq!(causes[1].0, "mathieu");
                assert!(matches!(
                    &causes[0].1,
                    Error::DecryptFailed { cause, .. } if matches!(**cause, Error::UserDeclined)
                ));
            }
            other => panic!("expected AllRecipientsFailed, got {other}"),
        }

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn filter_restricts_encryption() {
        let (root, store) = tmp_store();
        let alex = stored_recipient("alex", "a", 0, &store);
        let mathieu = stored_recipient("mathieu", "m", 1, &store);
        let method = MethodFile {
            methods: vec![alex, mathieu],
        };

        let entries = encrypt_to_artifact(&method, Some("mathieu"), b"payload").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "mathieu");

        assert!(matches!(
            encrypt_to_artifact(&method, Some("nobody"), b"payload"),
            Err(Error::ConfigInvalid(_))
        ));

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn filter_restricts_decryption() {
        let (root, store) = tmp_store();
        let alex = stored_recipient("alex", "a-pw", 0, &store);
        let mathieu = stored_recipient("mathieu", "m-pw", 1, &store);
        let method = MethodFile {
            methods: vec![alex, mathieu],
        };
        let entries = encrypt_to_artifact(&method, None, b"payload").unwrap();

        // Only mathieu is attempted, so only one prompt is consumed.
        let mut prompt = ScriptedPrompt::new(&["m-pw"]);
        let mut signer = FakeSigner::holding(&[]);
        let plaintext = decrypt_from_artifact(
            &entries,
            Some("mathieu"),
            &store,
            &mut ctx(&mut prompt, &mut signer),
        )
        .unwrap();
        assert_eq!(plaintext.as_slice(), b"payload");
        assert_eq!(prompt.prompts_seen.len(), 1);
        assert!(prompt.prompts_seen[0].contains("mathieu"));

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn embedded_key_decrypts_with_empty_store() {
        let (root, store) = tmp_store();
        let (private_pem, public_pem) = test_keypair(0);
        let mut prompt = ScriptedPrompt::new(&["pw", "pw"]);
        let record =
            protect::wrap_with_passphrase("alex", private_pem.as_bytes(), &mut prompt).unwrap();
        let desc = RecipientDescriptor {
            kind: RECIPIENT_KIND_RSA.to_string(),
            name: "alex".to_string(),
            public_key: public_pem.clone(),
            encrypted_private_key: Some(record),
        };
        let method = MethodFile {
            methods: vec![desc],
        };
        let entries = encrypt_to_artifact(&method, None, b"roaming").unwrap();

        // The store directory was never created.
        let mut prompt = ScriptedPrompt::new(&["pw"]);
        let mut signer = FakeSigner::holding(&[]);
        let plaintext =
            decrypt_from_artifact(&entries, None, &store, &mut ctx(&mut prompt, &mut signer))
                .unwrap();
        assert_eq!(plaintext.as_slice(), b"roaming");

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn missing_store_without_embed_fails_with_store_cause() {
        let (root, _unused) = tmp_store();
        let (_, public_pem) = test_keypair(0);
        let desc = RecipientDescriptor {
            kind: RECIPIENT_KIND_RSA.to_string(),
            name: "alex".to_string(),
            public_key: public_pem.clone(),
            encrypted_private_key: None,
        };
        let method = MethodFile {
            methods: vec![desc],
        };
        let entries = encrypt_to_artifact(&method, None, b"x").unwrap();

        let empty_store = KeyStore::at(root.join("nonexistent"));
        let mut prompt = ScriptedPrompt::new(&[]);
        let mut signer = FakeSigner::holding(&[]);
        let err = decrypt_from_artifact(
            &entries,
            None,
            &empty_store,
            &mut ctx(&mut prompt, &mut signer),
        )
        .unwrap_err();
        match err {
            Error::AllRecipientsFailed(causes) => {
                assert!(matches!(
                    &causes[0].1,
                    Error::DecryptFailed { cause, .. }
                        if matches!(**cause, Error::KeyStoreMissing(_))
                ));
            }
            other => panic!("expected AllRecipientsFailed, got {other}"),
        }

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn diverged_public_key_fails_before_prompting() {
        let (root, store) = tmp_store();
        let mut desc = stored_recipient("alex", "pw", 0, &store);
        // The descriptor travels with a different key than the store holds.
        let (_, other_pub) = test_keypair(1);
        desc.public_key = other_pub.clone();
        let envelope = encrypt_for(&desc, b"payload").unwrap();

        let mut prompt = ScriptedPrompt::new(&[]);
        let mut signer = FakeSigner::holding(&[]);
        let err = decrypt_with(&envelope, &store, &mut ctx(&mut prompt, &mut signer)).unwrap_err();
        assert!(matches!(
            err,
            Error::DecryptFailed { cause, .. } if matches!(*cause, Error::PublicKeyMismatch(_))
        ));
        // No prompt was consumed: the binding check comes first.
        assert!(prompt.prompts_seen.is_empty());

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let (_, public_pem) = test_keypair(0);
        let desc = RecipientDescriptor {
            kind: RECIPIENT_KIND_RSA.to_string(),
            name: "alex".to_string(),
            public_key: public_pem.clone(),
            encrypted_private_key: None,
        };
        let payload = vec![0u8; 191];
        let err = encrypt_for(&desc, &payload).unwrap_err();
        assert!(matches!(
            err,
            Error::PayloadTooLarge { size: 191, max: 190 }
        ));

        // Exactly at the limit is fine.
        assert!(encrypt_for(&desc, &vec![0u8; 190]).is_ok());
    }

    #[test]
    fn unknown_recipient_kind_is_rejected() {
        let desc = RecipientDescriptor {
            kind: "x25519".to_string(),
            name: "alex".to_string(),
            public_key: String::new(),
            encrypted_private_key: None,
        };
        assert!(matches!(
            encrypt_for(&desc, b"x"),
            Err(Error::UnsupportedRecipientKind(k)) if k == "x25519"
        ));
    }

    #[test]
    fn artifact_text_roundtrips() {
        let (root, store) = tmp_store();
        let desc = stored_recipient("alex", "pw", 0, &store);
        let method = MethodFile {
            methods: vec![desc],
        };
        let entries = encrypt_to_artifact(&method, None, b"hello\n").unwrap();

        let text = render_artifact(&entries).unwrap();
        let parsed = parse_artifact(&text).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].encrypted.ciphertext, entries[0].encrypted.ciphertext);

        assert!(matches!(
            parse_artifact("not json"),
            Err(Error::ConfigInvalid(_))
        ));

        let _ = std::fs::remove_dir_all(root);
    }
}
