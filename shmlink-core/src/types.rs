// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Newtype wrappers and small value types shared across the transport.
//!
//! All types validate their invariants at creation time.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Requests "whatever the server configured" for the server-to-client
/// buffer size during connection negotiation.
pub const USE_SERVER_BUFFER_SIZE: usize = 0;

/// Process-local rendezvous key of an acceptor.
///
/// Two endpoints meet when they use equal addresses and share the same
/// socket directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnicastAddress {
    domain: u32,
    port: u32,
}

impl UnicastAddress {
    pub const fn new(domain: u32, port: u32) -> Self {
        Self { domain, port }
    }

    pub const fn domain(&self) -> u32 {
        self.domain
    }

    pub const fn port(&self) -> u32 {
        self.port
    }

    /// Path of the listening socket for this address inside `socket_dir`.
    pub fn socket_path(&self, socket_dir: &Path) -> PathBuf {
        socket_dir.join(format!("shmlink-{}-{}.sock", self.domain, self.port))
    }
}

impl fmt::Display for UnicastAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.domain, self.port)
    }
}

impl FromStr for UnicastAddress {
    type Err = ConfigError;

    /// Parses the `"<domain>:<port>"` form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidFieldValue {
            field: "address",
            value: s.to_string(),
            reason: reason.to_string(),
        };

        let (domain, port) = s
            .split_once(':')
            .ok_or_else(|| invalid("Expected the form <domain>:<port>"))?;
        let domain = domain
            .trim()
            .parse::<u32>()
            .map_err(|_| invalid("Domain must be an unsigned 32-bit integer"))?;
        let port = port
            .trim()
            .parse::<u32>()
            .map_err(|_| invalid("Port must be an unsigned 32-bit integer"))?;

        Ok(Self::new(domain, port))
    }
}

/// Validated process ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessId(u32);

impl ProcessId {
    /// Create a new ProcessId with validation.
    pub fn new(pid: u32) -> Result<Self, ConfigError> {
        if pid == 0 {
            return Err(ConfigError::InvalidFieldValue {
                field: "process_id",
                value: "0".to_string(),
                reason: "Process ID 0 is reserved".to_string(),
            });
        }
        Ok(Self(pid))
    }

    /// Get the inner PID value.
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<ProcessId> for u32 {
    fn from(pid: ProcessId) -> Self {
        pid.0
    }
}

/// Identity of the process on the other end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub pid: Option<ProcessId>,
    pub uid: u32,
    pub gid: u32,
}

/// Negotiated ring buffer capacities of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferSizes {
    pub client_to_server: usize,
    pub server_to_client: usize,
}

impl fmt::Display for BufferSizes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "c2s={} s2c={}",
            self.client_to_server, self.server_to_client
        )
    }
}
