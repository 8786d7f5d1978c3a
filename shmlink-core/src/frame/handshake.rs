// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Handshake packets exchanged over the rendezvous socket.
//!
//! The client sends a [`ConnectRequest`] carrying its protocol version and
//! buffer size hints. The server answers with a [`ConnectReply`] carrying the
//! negotiated sizes and the names of the two shared memory regions it
//! created. Both packets are fixed-size, little-endian and end with a CRC32 of
//! everything before it.

use crate::config::MIN_BUFFER_SIZE;
use crate::error::ProtocolError;
use crate::types::{BufferSizes, USE_SERVER_BUFFER_SIZE};

/// Wire protocol version. Must match exactly on both ends.
pub const PROTOCOL_VERSION: u32 = 2;

/// Magic number opening every handshake packet ("SLNK").
pub const HANDSHAKE_MAGIC: u32 = 0x4B4E_4C53;

/// Encoded size of a [`ConnectRequest`].
pub const CONNECT_REQUEST_SIZE: usize = 20;

/// Encoded size of a [`ConnectReply`].
pub const CONNECT_REPLY_SIZE: usize = 88;

/// Space reserved for a region name, including the NUL terminator.
pub const REGION_NAME_CAPACITY: usize = 32;

/// Opening packet of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    pub version: u32,
    pub client_to_server_hint: u32,
    pub server_to_client_hint: u32,
}

impl ConnectRequest {
    /// Request for the current protocol version.
    pub fn new(client_to_server_hint: usize, server_to_client_hint: usize) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            client_to_server_hint: saturate(client_to_server_hint),
            server_to_client_hint: saturate(server_to_client_hint),
        }
    }

    pub fn encode(&self) -> [u8; CONNECT_REQUEST_SIZE] {
        let mut bytes = [0u8; CONNECT_REQUEST_SIZE];
        put_u32(&mut bytes, 0, HANDSHAKE_MAGIC);
        put_u32(&mut bytes, 4, self.version);
        put_u32(&mut bytes, 8, self.client_to_server_hint);
        put_u32(&mut bytes, 12, self.server_to_client_hint);
        let crc = crc32fast::hash(&bytes[..16]);
        put_u32(&mut bytes, 16, crc);
        bytes
    }

    pub fn decode(bytes: &[u8; CONNECT_REQUEST_SIZE]) -> Result<Self, ProtocolError> {
        check_envelope(bytes, "connect request")?;
        Ok(Self {
            version: get_u32(bytes, 4),
            client_to_server_hint: get_u32(bytes, 8),
            server_to_client_hint: get_u32(bytes, 12),
        })
    }
}

/// Outcome the server reports to a connecting client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyStatus {
    Accepted = 0,
    VersionMismatch = 1,
    BacklogFull = 2,
    ResourceExhausted = 3,
}

impl ReplyStatus {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::VersionMismatch => "version mismatch",
            Self::BacklogFull => "backlog full",
            Self::ResourceExhausted => "resource exhausted",
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Accepted),
            1 => Some(Self::VersionMismatch),
            2 => Some(Self::BacklogFull),
            3 => Some(Self::ResourceExhausted),
            _ => None,
        }
    }
}

/// Server answer to a [`ConnectRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectReply {
    pub status: ReplyStatus,
    pub version: u32,
    pub sizes: BufferSizes,
    pub client_to_server_region: String,
    pub server_to_client_region: String,
}

impl ConnectReply {
    /// Reply carrying only a failure status.
    pub fn rejected(status: ReplyStatus) -> Self {
        Self {
            status,
            version: PROTOCOL_VERSION,
            sizes: BufferSizes {
                client_to_server: 0,
                server_to_client: 0,
            },
            client_to_server_region: String::new(),
            server_to_client_region: String::new(),
        }
    }

    pub fn encode(&self) -> Result<[u8; CONNECT_REPLY_SIZE], ProtocolError> {
        let mut bytes = [0u8; CONNECT_REPLY_SIZE];
        put_u32(&mut bytes, 0, HANDSHAKE_MAGIC);
        bytes[4] = self.status as u8;
        put_u32(&mut bytes, 8, self.version);
        put_u32(&mut bytes, 12, saturate(self.sizes.client_to_server));
        put_u32(&mut bytes, 16, saturate(self.sizes.server_to_client));
        put_name(&mut bytes[20..52], &self.client_to_server_region)?;
        put_name(&mut bytes[52..84], &self.server_to_client_region)?;
        let crc = crc32fast::hash(&bytes[..84]);
        put_u32(&mut bytes, 84, crc);
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8; CONNECT_REPLY_SIZE]) -> Result<Self, ProtocolError> {
        check_envelope(bytes, "connect reply")?;
        let status = ReplyStatus::from_u8(bytes[4]).ok_or_else(|| malformed(format!(
            "unknown reply status {}",
            bytes[4]
        )))?;

        Ok(Self {
            status,
            version: get_u32(bytes, 8),
            sizes: BufferSizes {
                client_to_server: get_u32(bytes, 12) as usize,
                server_to_client: get_u32(bytes, 16) as usize,
            },
            client_to_server_region: get_name(&bytes[20..52])?,
            server_to_client_region: get_name(&bytes[52..84])?,
        })
    }
}

/// Server-side bounds applied to client hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationLimits {
    /// Largest client-to-server capacity the server grants.
    pub max_client_to_server: usize,
    /// Server-to-client capacity configured on the acceptor; also the cap.
    pub server_to_client: usize,
    /// Used when the client sends no client-to-server hint.
    pub default_buffer_size: usize,
}

/// Decide the ring buffer capacities for a connect request.
///
/// The server's limits are authoritative: hints above the cap are clamped
/// down, hints below [`MIN_BUFFER_SIZE`] are raised to it.
pub fn negotiate(request: &ConnectRequest, limits: &NegotiationLimits) -> BufferSizes {
    let s2c_cap = limits.server_to_client.max(MIN_BUFFER_SIZE);
    let c2s_cap = limits.max_client_to_server.max(MIN_BUFFER_SIZE);

    let server_to_client = match request.server_to_client_hint as usize {
        USE_SERVER_BUFFER_SIZE => s2c_cap,
        hint => hint.clamp(MIN_BUFFER_SIZE, s2c_cap),
    };
    let client_to_server = match request.client_to_server_hint as usize {
        0 => limits.default_buffer_size.clamp(MIN_BUFFER_SIZE, c2s_cap),
        hint => hint.clamp(MIN_BUFFER_SIZE, c2s_cap),
    };

    BufferSizes {
        client_to_server,
        server_to_client,
    }
}

fn saturate(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn malformed(reason: String) -> ProtocolError {
    ProtocolError::MalformedHandshake { reason }
}

fn put_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn get_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn check_envelope(bytes: &[u8], packet: &str) -> Result<(), ProtocolError> {
    let body = bytes.len() - 4;
    let magic = get_u32(bytes, 0);
    if magic != HANDSHAKE_MAGIC {
        return Err(malformed(format!("{}: bad magic {:#010x}", packet, magic)));
    }

    let expected = get_u32(bytes, body);
    let actual = crc32fast::hash(&bytes[..body]);
    if expected != actual {
        return Err(malformed(format!(
            "{}: checksum mismatch (expected {:#010x}, got {:#010x})",
            packet, expected, actual
        )));
    }
    Ok(())
}

fn put_name(slot: &mut [u8], name: &str) -> Result<(), ProtocolError> {
    if name.len() >= REGION_NAME_CAPACITY || name.bytes().any(|b| b == 0 || b == b'/') {
        return Err(malformed(format!("invalid region name {:?}", name)));
    }
    slot[..name.len()].copy_from_slice(name.as_bytes());
    Ok(())
}

fn get_name(slot: &[u8]) -> Result<String, ProtocolError> {
    let len = slot.iter().position(|&b| b == 0).unwrap_or(slot.len());
    if len == slot.len() {
        return Err(malformed("region name is not terminated".to_string()));
    }
    let name = std::str::from_utf8(&slot[..len])
        .map_err(|_| malformed("region name is not valid UTF-8".to_string()))?;
    if name.contains('/') {
        return Err(malformed(format!("invalid region name {:?}", name)));
    }
    Ok(name.to_string())
}
