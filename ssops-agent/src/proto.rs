//! SSH wire-format primitives.
//!
//! The agent protocol uses the SSH byte conventions: unsigned 32-bit
//! big-endian lengths, and a `string` is a length followed by that many raw
//! bytes (binary allowed).  [`WireWriter`] builds outgoing payloads,
//! [`WireReader`] walks incoming ones with an advancing cursor; reading past
//! the end is an error, never a panic.

/// `SSH_AGENTC_REQUEST_IDENTITIES`
pub const AGENTC_REQUEST_IDENTITIES: u8 = 11;
/// `SSH_AGENT_IDENTITIES_ANSWER`
pub const AGENT_IDENTITIES_ANSWER: u8 = 12;
/// `SSH_AGENTC_SIGN_REQUEST`
pub const AGENTC_SIGN_REQUEST: u8 = 13;
/// `SSH_AGENT_SIGN_RESPONSE`
pub const AGENT_SIGN_RESPONSE: u8 = 14;
/// `SSH_AGENT_FAILURE`
pub const AGENT_FAILURE: u8 = 5;

/// Flag bit requesting an `rsa-sha2-256` signature (RFC 8332).
pub const SIGN_FLAG_RSA_SHA2_256: u32 = 2;

/// Attempted to read past the end of a wire buffer.
#[derive(Debug, thiserror::Error)]
#[error("wire buffer under-run: needed {needed} more bytes, {available} available")]
pub struct FrameError {
    pub needed: usize,
    pub available: usize,
}

/// Builds an outgoing message payload field by field.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Append a `string` field: u32 length followed by the raw bytes.
    pub fn put_string(&mut self, data: &[u8]) {
        self.put_u32(data.len() as u32);
        self.buf.extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a received message payload.
#[derive(Debug)]
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FrameError> {
        let available = self.data.len() - self.pos;
        if n > available {
            return Err(FrameError {
                needed: n - available,
                available,
            });
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn take_u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.take(1)?[0])
    }

    pub fn take_u32(&mut self) -> Result<u32, FrameError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a `string` field: u32 length followed by that many raw bytes.
    pub fn take_string(&mut self) -> Result<&'a [u8], FrameError> {
        let len = self.take_u32()? as usize;
        self.take(len)
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}

/// Read the algorithm name from a public-key blob (its first `string`).
pub fn blob_algorithm(blob: &[u8]) -> Result<String, FrameError> {
    let mut reader = WireReader::new(blob);
    let name = reader.take_string()?;
    Ok(String::from_utf8_lossy(name).into_owned())
}

/// Split an `ssh-rsa` public-key blob into its `(e, n)` mpint fields,
/// big-endian, as stored on the wire.
///
/// Fails with a [`FrameError`] if the blob is truncated.  The caller is
/// expected to have checked the algorithm via [`blob_algorithm`] first;
/// non-RSA blobs will typically fail here because their field layout
/// differs.
pub fn parse_ssh_rsa(blob: &[u8]) -> Result<(Vec<u8>, Vec<u8>), FrameError> {
    let mut reader = WireReader::new(blob);
    let _algorithm = reader.take_string()?;
    let e = reader.take_string()?.to_vec();
    let n = reader.take_string()?.to_vec();
    Ok((e, n))
}
