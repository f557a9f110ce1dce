//! Error taxonomy.
//!
//! Every failure a command can surface is one of these variants.  Causes are
//! preserved via `#[source]` so the CLI's debug mode can print the full
//! chain; the `Display` strings alone are the terse one-line form.

use ssops_agent::AgentError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A persisted document is missing a field or fails to parse.
    #[error("invalid document: {0}")]
    ConfigInvalid(String),

    #[error("unsupported KDF type {0:?}")]
    UnsupportedKdf(String),

    #[error("unsupported recipient kind {0:?}")]
    UnsupportedRecipientKind(String),

    #[error("passphrase entries do not match")]
    PassphraseMismatch,

    /// AES-GCM tag check failed: wrong passphrase or tampered record.
    #[error("wrong passphrase or corrupted data")]
    BadPassphrase,

    /// The user left a decrypt prompt empty to skip this key.
    #[error("no passphrase entered")]
    UserDeclined,

    #[error("SSH agent unavailable: {0}")]
    AgentUnavailable(String),

    #[error("SSH agent refused the request")]
    AgentRefused,

    #[error("identity is not present in the SSH agent")]
    KeyNotInAgent,

    #[error("agent returned an unusable signature: {0}")]
    BadSignature(String),

    #[error("public key for {0:?} does not match the local key store")]
    PublicKeyMismatch(String),

    #[error("payload of {size} bytes exceeds the {max}-byte RSA-OAEP limit")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("decrypt failed for recipient {name:?}")]
    DecryptFailed {
        name: String,
        #[source]
        cause: Box<Error>,
    },

    /// Every artifact entry failed; causes are kept in attempt order.
    #[error("{}", render_failures(.0))]
    AllRecipientsFailed(Vec<(String, Error)>),

    #[error("recipient ({kind}, {name}) is already in the method")]
    DuplicateRecipient { kind: String, name: String },

    #[error("key {0:?} already exists in the key store")]
    KeyExists(String),

    #[error("key {0:?} not found in the key store")]
    KeyMissing(String),

    #[error("key store directory {0} does not exist")]
    KeyStoreMissing(String),

    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn render_failures(causes: &[(String, Error)]) -> String {
    if causes.is_empty() {
        return "no recipients to attempt".to_string();
    }
    let joined: Vec<String> = causes
        .iter()
        .map(|(name, err)| format!("{name}: {}", innermost(err)))
        .collect();
    format!("no recipient could decrypt ({})", joined.join("; "))
}

/// Walk to the innermost cause for the terse per-recipient summary.
fn innermost(err: &Error) -> String {
    let mut current: &dyn std::error::Error = err;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string()
}

impl From<AgentError> for Error {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::Unavailable(msg) => Error::AgentUnavailable(msg),
            AgentError::Refused => Error::AgentRefused,
            AgentError::Protocol(msg) => {
                Error::AgentUnavailable(format!("malformed agent response: {msg}"))
            }
            AgentError::Io(e) => Error::Io(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_recipients_failed_joins_innermost_causes() {
        let err = Error::AllRecipientsFailed(vec![
            (
                "alex".to_string(),
                Error::DecryptFailed {
                    name: "alex".to_string(),
                    cause: Box::new(Error::UserDeclined),
                },
            ),
            ("mathieu".to_string(), Error::BadPassphrase),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("alex: no passphrase entered"));
        assert!(msg.contains("mathieu: wrong passphrase or corrupted data"));
    }

    #[test]
    fn decrypt_failed_preserves_source() {
        let err = Error::DecryptFailed {
            name: "alex".to_string(),
            cause: Box::new(Error::BadPassphrase),
        };
        let source = std::error::Error::source(&err).expect("cause must be linked");
        assert!(source.to_string().contains("wrong passphrase"));
    }

    #[test]
    fn agent_errors_map_to_taxonomy() {
        assert!(matches!(
            Error::from(AgentError::Refused),
            Error::AgentRefused
        ));
        assert!(matches!(
            Error::from(AgentError::Unavailable("gone".to_string())),
            Error::AgentUnavailable(_)
        ));
    }
}
