//! Passphrase wrapping: scrypt key derivation + AES-256-GCM.
//!
//! The record carries its own KDF tag and scrypt parameters, so `unwrap`
//! re-derives from what is stored rather than from current defaults.  A
//! failed GCM tag check is indistinguishable from a wrong passphrase and is
//! reported as such.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::types::{KDF_SCRYPT_AES_GCM, KEY_LEN, NONCE_LEN, ScryptParams, WrapRecord};

/// Encrypt `plaintext` under a key derived from `password`.
pub fn wrap(password: &[u8], plaintext: &[u8]) -> Result<WrapRecord> {
    let params = ScryptParams::fresh();
    let key = derive_key(password, &params)?;

    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce);

    let cipher = Aes256Gcm::new_from_slice(key.as_slice())
        .map_err(|e| Error::Crypto(format!("AES-GCM init: {e}")))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| Error::Crypto("AES-GCM encrypt failed".to_string()))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);

    Ok(WrapRecord {
        kind: KDF_SCRYPT_AES_GCM.to_string(),
        scrypt: params,
        ciphertext: hex::encode(sealed),
    })
}

/// Decrypt a wrap record with `password`.
pub fn unwrap(password: &[u8], record: &WrapRecord) -> Result<Zeroizing<Vec<u8>>> {
    if record.kind != KDF_SCRYPT_AES_GCM {
        return Err(Error::UnsupportedKdf(record.kind.clone()));
    }
    let key = derive_key(password, &record.scrypt)?;

    let sealed = hex::decode(&record.ciphertext)
        .map_err(|e| Error::ConfigInvalid(format!("ciphertext is not valid hex: {e}")))?;
    if sealed.len() < NONCE_LEN {
        return Err(Error::ConfigInvalid(
            "ciphertext shorter than the AES-GCM nonce".to_string(),
        ));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);

    let cipher = Aes256Gcm::new_from_slice(key.as_slice())
        .map_err(|e| Error::Crypto(format!("AES-GCM init: {e}")))?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::BadPassphrase)?;

    Ok(Zeroizing::new(plaintext))
}

fn derive_key(password: &[u8], params: &ScryptParams) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    if params.length as usize != KEY_LEN {
        return Err(Error::ConfigInvalid(format!(
            "scrypt output length {} (expected {KEY_LEN})",
            params.length
        )));
    }
    if !params.n.is_power_of_two() || params.n < 2 {
        return Err(Error::ConfigInvalid(format!(
            "scrypt N={} is not a power of two",
            params.n
        )));
    }
    let salt = hex::decode(&params.salt)
        .map_err(|e| Error::ConfigInvalid(format!("scrypt salt is not valid hex: {e}")))?;

    let log_n = params.n.trailing_zeros() as u8;
    let scrypt_params = scrypt::Params::new(log_n, params.r, params.p, KEY_LEN)
        .map_err(|e| Error::ConfigInvalid(format!("scrypt parameters: {e}")))?;

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    scrypt::scrypt(password, &salt, &scrypt_params, key.as_mut_slice())
        .map_err(|e| Error::Crypto(format!("scrypt: {e}")))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_unwrap_roundtrip() {
        let record = wrap(b"pw", b"the private key").unwrap();
        let plaintext = unwrap(b"pw", &record).unwrap();
        assert_eq!(plaintext.as_slice(), b"the private key");
    }

    #[test]
    fn wrong_password_fails() {
        let record = wrap(b"pw", b"secret").unwrap();
        assert!(matches!(
            unwrap(b"wrong", &record),
            Err(Error::BadPassphrase)
        ));
    }

    #[test]
    fn record_fields_are_lowercase_hex() {
        let record = wrap(b"pw", b"secret").unwrap();
        assert_eq!(record.kind, "scrypt-aes-gcm");
        assert_eq!(record.ciphertext, record.ciphertext.to_lowercase());
        assert!(record.ciphertext.chars().all(|c| c.is_ascii_hexdigit()));
        // nonce + at least the 16-byte GCM tag
        assert!(record.ciphertext.len() >= (NONCE_LEN + 16) * 2);
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let mut record = wrap(b"pw", b"secret").unwrap();
        let mut sealed = hex::decode(&record.ciphertext).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        record.ciphertext = hex::encode(sealed);
        assert!(matches!(unwrap(b"pw", &record), Err(Error::BadPassphrase)));
    }

    #[test]
    fn tampered_salt_fails() {
        let mut record = wrap(b"pw", b"secret").unwrap();
        let mut salt = hex::decode(&record.scrypt.salt).unwrap();
        salt[0] ^= 0xff;
        record.scrypt.salt = hex::encode(salt);
        assert!(matches!(unwrap(b"pw", &record), Err(Error::BadPassphrase)));
    }

    #[test]
    fn unknown_kdf_type_is_rejected() {
        let mut record = wrap(b"pw", b"secret").unwrap();
        record.kind = "argon2-aes-gcm".to_string();
        assert!(matches!(
            unwrap(b"pw", &record),
            Err(Error::UnsupportedKdf(k)) if k == "argon2-aes-gcm"
        ));
    }

    #[test]
    fn params_are_read_from_the_record() {
        let mut record = wrap(b"pw", b"secret").unwrap();
        // A different (valid) N must change the derived key and fail the tag.
        record.scrypt.n = 4096;
        assert!(matches!(unwrap(b"pw", &record), Err(Error::BadPassphrase)));
    }

    #[test]
    fn non_power_of_two_n_is_config_error() {
        let mut record = wrap(b"pw", b"secret").unwrap();
        record.scrypt.n = 1000;
        assert!(matches!(
            unwrap(b"pw", &record),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn empty_plaintext_roundtrips() {
        let record = wrap(b"pw", b"").unwrap();
        let plaintext = unwrap(b"pw", &record).unwrap();
        assert!(plaintext.is_empty());
    }
}
