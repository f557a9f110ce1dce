//! Agent connection and message exchange.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

use tracing::debug;

use crate::proto::{
    AGENT_FAILURE, AGENT_IDENTITIES_ANSWER, AGENT_SIGN_RESPONSE, AGENTC_REQUEST_IDENTITIES,
    AGENTC_SIGN_REQUEST, FrameError, WireReader, WireWriter,
};

/// Environment variable naming the agent's Unix socket.
pub const SSH_AUTH_SOCK: &str = "SSH_AUTH_SOCK";

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("SSH agent unavailable: {0}")]
    Unavailable(String),

    /// The agent answered with `SSH_AGENT_FAILURE`.
    #[error("SSH agent refused the request")]
    Refused,

    #[error("malformed agent response: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<FrameError> for AgentError {
    fn from(err: FrameError) -> Self {
        AgentError::Protocol(err.to_string())
    }
}

/// One identity held by the agent: the public-key blob plus its comment.
#[derive(Debug, Clone)]
pub struct Identity {
    pub blob: Vec<u8>,
    pub comment: String,
}

/// Synchronous agent connection.  One request/response exchange at a time.
#[derive(Debug)]
pub struct AgentClient {
    stream: UnixStream,
}

impl AgentClient {
    /// Connect to the socket named by `SSH_AUTH_SOCK`.
    pub fn connect() -> Result<Self, AgentError> {
        let path = std::env::var_os(SSH_AUTH_SOCK)
            .ok_or_else(|| AgentError::Unavailable(format!("{SSH_AUTH_SOCK} is not set")))?;
        Self::connect_to(Path::new(&path))
    }

    /// Connect to an explicit socket path.
    pub fn connect_to(path: &Path) -> Result<Self, AgentError> {
        let stream = UnixStream::connect(path).map_err(|e| {
            AgentError::Unavailable(format!("cannot connect to {}: {e}", path.display()))
        })?;
        debug!(socket = %path.display(), "connected to SSH agent");
        Ok(Self { stream })
    }

    /// List the identities the agent currently holds.
    pub fn list_identities(&mut self) -> Result<Vec<Identity>, AgentError> {
        let mut request = WireWriter::new();
        request.put_u8(AGENTC_REQUEST_IDENTITIES);
        let response = self.roundtrip(&request.into_bytes())?;

        let mut reader = WireReader::new(&response);
        match reader.take_u8()? {
            AGENT_IDENTITIES_ANSWER => {}
            AGENT_FAILURE => return Err(AgentError::Refused),
            other => {
                return Err(AgentError::Protocol(format!(
                    "unexpected message type {other} to identities request"
                )));
            }
        }

        let count = reader.take_u32()?;
        let mut identities = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let blob = reader.take_string()?.to_vec();
            let comment = String::from_utf8_lossy(reader.take_string()?).into_owned();
            identities.push(Identity { blob, comment });
        }
        debug!(count = identities.len(), "agent identities listed");
        Ok(identities)
    }

    /// Ask the agent to sign `data` with the key identified by `key_blob`.
    ///
    /// Returns the `(algorithm, signature)` pair from the response.  `flags`
    /// should include [`crate::proto::SIGN_FLAG_RSA_SHA2_256`] whenever the
    /// signature is later used as key material — the PKCS#1 v1.5 scheme it
    /// selects is deterministic for a fixed `(key, data)` input.
    pub fn sign(
        &mut self,
        key_blob: &[u8],
        data: &[u8],
        flags: u32,
    ) -> Result<(String, Vec<u8>), AgentError> {
        let mut request = WireWriter::new();
        request.put_u8(AGENTC_SIGN_REQUEST);
        request.put_string(key_blob);
        request.put_string(data);
        request.put_u32(flags);
        let response = self.roundtrip(&request.into_bytes())?;

        let mut reader = WireReader::new(&response);
        match reader.take_u8()? {
            AGENT_SIGN_RESPONSE => {}
            AGENT_FAILURE => return Err(AgentError::Refused),
            other => {
                return Err(AgentError::Protocol(format!(
                    "unexpected message type {other} to sign request"
                )));
            }
        }

        // The signature field is itself a wire structure:
        // string algorithm || string signature bytes.
        let signature_blob = reader.take_string()?;
        let mut sig_reader = WireReader::new(signature_blob);
        let algorithm = String::from_utf8_lossy(sig_reader.take_string()?).into_owned();
        let signature = sig_reader.take_string()?.to_vec();
        debug!(%algorithm, sig_len = signature.len(), "agent produced signature");
        Ok((algorithm, signature))
    }

    /// Send one framed request and read back one framed response.
    ///
    /// Requests go out as `u32 total_length || payload`.  Responses are read
    /// the same way; `read_exact` reassembles partial reads from the socket.
    fn roundtrip(&mut self, payload: &[u8]) -> Result<Vec<u8>, AgentError> {
        let mut framed = Vec::with_capacity(4 + payload.len());
        framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        framed.extend_from_slice(payload);
        self.stream.write_all(&framed)?;
        self.stream.flush()?;

        let mut len_bytes = [0u8; 4];
        self.stream.read_exact(&mut len_bytes)?;
        let len = u32::from_be_bytes(len_bytes) as usize;

        let mut response = vec![0u8; len];
        self.stream.read_exact(&mut response)?;
        Ok(response)
    }
}
