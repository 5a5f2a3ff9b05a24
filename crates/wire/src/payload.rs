//! Payload codecs for control and coordination packets.
//!
//! Each payload type decodes from the exact byte slice a [`crate::Packet`]
//! carried; like the outer codec, decoders reject short input and trailing
//! bytes rather than guessing.

use std::net::SocketAddr;

use crate::{decode_endpoint, encode_endpoint, WireError};

/// Length of the subheader every DATA payload starts with.
pub const DATA_HEADER_LEN: usize = 12;

fn read_u16(data: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([data[at], data[at + 1]])
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[at..at + 8]);
    u64::from_be_bytes(bytes)
}

fn read_prefixed_str(data: &[u8]) -> Result<(String, usize), WireError> {
    if data.len() < 2 {
        return Err(WireError::malformed("missing string length"));
    }
    let len = read_u16(data, 0) as usize;
    if data.len() < 2 + len {
        return Err(WireError::malformed("truncated string"));
    }
    let text = std::str::from_utf8(&data[2..2 + len])
        .map_err(|_| WireError::malformed("invalid utf-8"))?
        .to_owned();
    Ok((text, 2 + len))
}

fn write_prefixed_str(buf: &mut Vec<u8>, text: &str) {
    buf.extend_from_slice(&(text.len() as u16).to_be_bytes());
    buf.extend_from_slice(text.as_bytes());
}

/// COORD_REGISTER payload: the session the client wants to join.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RegisterPayload {
    /// Session identifier shared by both peers out of band.
    pub session_id: String,
}

impl RegisterPayload {
    /// Serialises the payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + self.session_id.len());
        write_prefixed_str(&mut buf, &self.session_id);
        buf
    }

    /// Parses a REGISTER payload.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let (session_id, used) = read_prefixed_str(data)?;
        if used != data.len() {
            return Err(WireError::malformed("trailing bytes"));
        }
        Ok(Self { session_id })
    }
}

/// COORD_AUTH payload: session id plus the HMAC-SHA256 proof.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AuthPayload {
    /// Session being authenticated.
    pub session_id: String,
    /// `HMAC-SHA256(PSK, nonce ‖ session_id)`.
    pub hmac: [u8; 32],
}

impl AuthPayload {
    /// Serialises the payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + self.session_id.len() + 32);
        write_prefixed_str(&mut buf, &self.session_id);
        buf.extend_from_slice(&self.hmac);
        buf
    }

    /// Parses an AUTH payload.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let (session_id, used) = read_prefixed_str(data)?;
        if data.len() != used + 32 {
            return Err(WireError::malformed("bad hmac length"));
        }
        let mut hmac = [0u8; 32];
        hmac.copy_from_slice(&data[used..]);
        Ok(Self { session_id, hmac })
    }
}

/// COORD_CHALLENGE payload: the 32-byte server nonce.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChallengePayload {
    /// Fresh random nonce the client must sign.
    pub nonce: [u8; 32],
}

impl ChallengePayload {
    /// Serialises the payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        self.nonce.to_vec()
    }

    /// Parses a CHALLENGE payload.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() != 32 {
            return Err(WireError::malformed("bad nonce length"));
        }
        let mut nonce = [0u8; 32];
        nonce.copy_from_slice(data);
        Ok(Self { nonce })
    }
}

/// COORD_OK and COORD_PEER_INFO payload: a single endpoint.
pub fn encode_endpoint_payload(endpoint: SocketAddr) -> Vec<u8> {
    let mut buf = Vec::with_capacity(19);
    encode_endpoint(&mut buf, endpoint);
    buf
}

/// Parses an endpoint-only payload, rejecting trailing bytes.
pub fn decode_endpoint_payload(data: &[u8]) -> Result<SocketAddr, WireError> {
    let (endpoint, used) = decode_endpoint(data)?;
    if used != data.len() {
        return Err(WireError::malformed("trailing bytes"));
    }
    Ok(endpoint)
}

/// COORD_ERROR / ERROR payload: numeric code plus a short message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ErrorPayload {
    /// Machine-readable failure code.
    pub code: u16,
    /// Human-readable description.
    pub message: String,
}

impl ErrorPayload {
    /// Serialises the payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + self.message.len());
        buf.extend_from_slice(&self.code.to_be_bytes());
        buf.extend_from_slice(self.message.as_bytes());
        buf
    }

    /// Parses an error payload.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < 2 {
            return Err(WireError::malformed("short error payload"));
        }
        let message = std::str::from_utf8(&data[2..])
            .map_err(|_| WireError::malformed("invalid utf-8"))?
            .to_owned();
        Ok(Self {
            code: read_u16(data, 0),
            message,
        })
    }
}

/// Subheader at the front of every DATA payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DataHeader {
    /// Zero-based chunk number within the transfer.
    pub chunk_index: u32,
    /// Absolute offset of the chunk within the file.
    pub byte_offset: u64,
}

impl DataHeader {
    /// Builds the full DATA payload: subheader followed by the chunk bytes.
    #[must_use]
    pub fn encode_with(self, chunk: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DATA_HEADER_LEN + chunk.len());
        buf.extend_from_slice(&self.chunk_index.to_be_bytes());
        buf.extend_from_slice(&self.byte_offset.to_be_bytes());
        buf.extend_from_slice(chunk);
        buf
    }

    /// Splits a DATA payload into its subheader and chunk bytes.
    ///
    /// Chunk length is implied: everything past the subheader is data.
    pub fn decode(payload: &[u8]) -> Result<(Self, &[u8]), WireError> {
        if payload.len() < DATA_HEADER_LEN {
            return Err(WireError::malformed("short data payload"));
        }
        Ok((
            Self {
                chunk_index: read_u32(payload, 0),
                byte_offset: read_u64(payload, 4),
            },
            &payload[DATA_HEADER_LEN..],
        ))
    }
}

/// SACK payload: cumulative edge, advertised window, and received ranges.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SackInfo {
    /// Last sequence received contiguously.
    pub cumulative_ack: u32,
    /// Packets the receiver is currently willing to buffer.
    pub receiver_window: u32,
    /// Inclusive `[start, end]` ranges received above the cumulative edge.
    pub ranges: Vec<(u32, u32)>,
}

impl SackInfo {
    /// Serialises the payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.ranges.len() * 8);
        buf.extend_from_slice(&self.cumulative_ack.to_be_bytes());
        buf.extend_from_slice(&self.receiver_window.to_be_bytes());
        for &(start, end) in &self.ranges {
            buf.extend_from_slice(&start.to_be_bytes());
            buf.extend_from_slice(&end.to_be_bytes());
        }
        buf
    }

    /// Parses a SACK payload.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < 8 {
            return Err(WireError::malformed("short sack payload"));
        }
        if (data.len() - 8) % 8 != 0 {
            return Err(WireError::malformed("ragged sack ranges"));
        }
        let mut ranges = Vec::with_capacity((data.len() - 8) / 8);
        let mut at = 8;
        while at < data.len() {
            ranges.push((read_u32(data, at), read_u32(data, at + 4)));
            at += 8;
        }
        Ok(Self {
            cumulative_ack: read_u32(data, 0),
            receiver_window: read_u32(data, 4),
            ranges,
        })
    }
}

/// FILE_OFFER payload: everything the receiver needs to place the file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileMetadata {
    /// Random 128-bit transfer identifier.
    pub transfer_id: [u8; 16],
    /// Total size of the source file in bytes.
    pub file_size: u64,
    /// SHA-256 of the whole source file.
    pub sha256: [u8; 32],
    /// Suggested filename; untrusted, sanitised by the receiver.
    pub filename: String,
}

impl FileMetadata {
    /// Serialises the payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + 8 + 32 + 2 + self.filename.len());
        buf.extend_from_slice(&self.transfer_id);
        buf.extend_from_slice(&self.file_size.to_be_bytes());
        buf.extend_from_slice(&self.sha256);
        write_prefixed_str(&mut buf, &self.filename);
        buf
    }

    /// Parses a FILE_OFFER payload.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < 16 + 8 + 32 + 2 {
            return Err(WireError::malformed("short file metadata"));
        }
        let mut transfer_id = [0u8; 16];
        transfer_id.copy_from_slice(&data[..16]);
        let file_size = read_u64(data, 16);
        let mut sha256 = [0u8; 32];
        sha256.copy_from_slice(&data[24..56]);
        let (filename, used) = read_prefixed_str(&data[56..])?;
        if 56 + used != data.len() {
            return Err(WireError::malformed("trailing bytes"));
        }
        Ok(Self {
            transfer_id,
            file_size,
            sha256,
            filename,
        })
    }
}

/// FILE_ACCEPT payload: transfer id plus the offset to resume from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileAccept {
    /// Transfer this acceptance answers.
    pub transfer_id: [u8; 16],
    /// Bytes already on disk; the sender starts here.
    pub resume_offset: u64,
}

impl FileAccept {
    /// Serialises the payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(24);
        buf.extend_from_slice(&self.transfer_id);
        buf.extend_from_slice(&self.resume_offset.to_be_bytes());
        buf
    }

    /// Parses a FILE_ACCEPT payload.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() != 24 {
            return Err(WireError::malformed("bad file accept length"));
        }
        let mut transfer_id = [0u8; 16];
        transfer_id.copy_from_slice(&data[..16]);
        Ok(Self {
            transfer_id,
            resume_offset: read_u64(data, 16),
        })
    }
}

/// COMPLETE payload: the sender's whole-file digest.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CompletePayload {
    /// SHA-256 the receiver must reproduce.
    pub sha256: [u8; 32],
}

impl CompletePayload {
    /// Serialises the payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        self.sha256.to_vec()
    }

    /// Parses a COMPLETE payload.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() != 32 {
            return Err(WireError::malformed("bad digest length"));
        }
        let mut sha256 = [0u8; 32];
        sha256.copy_from_slice(data);
        Ok(Self { sha256 })
    }
}
