// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Custom error types for shmlink.
//!
//! Every public operation returns a [`TransportError`]. Callers are expected to
//! match on [`TransportError::kind`] to decide between retry and abort, never on
//! the message text.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::UnicastAddress;

/// Top-level error type for the transport.
#[derive(Debug, Error)]
pub enum TransportError {
    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    #[error("Object is not connected or listening")]
    Uninitialized,

    #[error("Another {operation} operation is already outstanding")]
    Busy { operation: &'static str },

    #[error("Connection is already established")]
    AlreadyConnected,

    #[error("Pending {operation} operation was canceled by close")]
    Canceled { operation: &'static str },

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(#[from] StateTransitionError),

    // =========================================================================
    // Addressing Errors
    // =========================================================================
    #[error("Address {address} is not available: {reason}")]
    AddressNotAvailable {
        address: UnicastAddress,
        reason: String,
    },

    #[error("Insufficient privileges: {reason}")]
    InsufficientPrivileges { reason: String },

    // =========================================================================
    // System Errors
    // =========================================================================
    #[error("Resource exhausted: {reason}")]
    Resource { reason: String },

    #[error("System environment error: {context} - {source}")]
    SystemEnvironment {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Shared memory error: {0}")]
    SharedMemory(#[from] SharedMemoryError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    // =========================================================================
    // Data Path Errors
    // =========================================================================
    #[error("Operation would block")]
    WouldBlock,

    #[error("Peer disconnected ({0})")]
    Disconnected(DisconnectKind),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Message of {size} bytes exceeds the maximum of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Message truncated: {message_size} bytes received into a {buffer_size}-byte buffer")]
    Truncated {
        message_size: usize,
        buffer_size: usize,
    },

    #[error("API misuse: {reason}")]
    Api { reason: String },
}

/// Coarse classification of a [`TransportError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Uninitialized,
    Busy,
    AlreadyConnected,
    Canceled,
    AddressNotAvailable,
    InsufficientPrivileges,
    Resource,
    SystemEnvironment,
    WouldBlock,
    Disconnected(DisconnectKind),
    Protocol,
    Size,
    Truncation,
    Api,
}

/// How the peer went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectKind {
    /// The peer closed its side after announcing it.
    Orderly,
    /// The peer vanished without saying goodbye (crash, reset).
    Abnormal,
}

impl DisconnectKind {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Orderly => "orderly",
            Self::Abnormal => "abnormal",
        }
    }
}

impl fmt::Display for DisconnectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl TransportError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Uninitialized => ErrorKind::Uninitialized,
            Self::Busy { .. } => ErrorKind::Busy,
            Self::AlreadyConnected => ErrorKind::AlreadyConnected,
            Self::Canceled { .. } => ErrorKind::Canceled,
            Self::InvalidStateTransition(_) => ErrorKind::Api,
            Self::AddressNotAvailable { .. } => ErrorKind::AddressNotAvailable,
            Self::InsufficientPrivileges { .. } => ErrorKind::InsufficientPrivileges,
            Self::Resource { .. } => ErrorKind::Resource,
            Self::SystemEnvironment { .. } => ErrorKind::SystemEnvironment,
            Self::SharedMemory(err) => err.kind(),
            Self::Config(_) => ErrorKind::Api,
            Self::WouldBlock => ErrorKind::WouldBlock,
            Self::Disconnected(kind) => ErrorKind::Disconnected(*kind),
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::MessageTooLarge { .. } => ErrorKind::Size,
            Self::Truncated { .. } => ErrorKind::Truncation,
            Self::Api { .. } => ErrorKind::Api,
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::WouldBlock | ErrorKind::Busy | ErrorKind::Resource
        )
    }

    /// Map an OS error onto the transport taxonomy.
    pub(crate) fn from_io(context: &'static str, err: io::Error) -> Self {
        if let Some(code) = err.raw_os_error() {
            if matches!(
                code,
                libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM | libc::EAGAIN
            ) {
                return Self::Resource {
                    reason: format!("{}: {}", context, err),
                };
            }
        }

        match err.kind() {
            io::ErrorKind::PermissionDenied => Self::InsufficientPrivileges {
                reason: format!("{}: {}", context, err),
            },
            io::ErrorKind::WouldBlock | io::ErrorKind::OutOfMemory => Self::Resource {
                reason: format!("{}: {}", context, err),
            },
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof => Self::Disconnected(DisconnectKind::Abnormal),
            _ => Self::SystemEnvironment {
                context,
                source: err,
            },
        }
    }

    /// Map an OS error raised while reaching or binding `address`.
    pub(crate) fn from_address_io(
        address: UnicastAddress,
        context: &'static str,
        err: io::Error,
    ) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::AddrInUse
            | io::ErrorKind::AddrNotAvailable => Self::AddressNotAvailable {
                address,
                reason: format!("{}: {}", context, err),
            },
            _ => Self::from_io(context, err),
        }
    }
}

/// Protocol violations. Always fatal to the connection they occur on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Corrupted message frame: {0}")]
    Corruption(#[from] CorruptionError),

    #[error("Protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: u32, remote: u32 },

    #[error("Malformed handshake packet: {reason}")]
    MalformedHandshake { reason: String },

    #[error("Unexpected control byte {value} on the side-channel")]
    UnexpectedControl { value: u8 },

    #[error("Memory handle {actual} arrived while handle {expected} was expected")]
    HandleOutOfOrder { expected: u32, actual: u32 },
}

/// Reasons a message frame header fails validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CorruptionError {
    #[error("Unknown message format tag {tag:#04x}")]
    UnknownFormat { tag: u8 },

    #[error("Format check {check:#04x} is not the complement of tag {tag:#04x}")]
    FormatCheckMismatch { tag: u8, check: u8 },

    #[error("Size check {check:#010x} is not the complement of size {size}")]
    SizeCheckMismatch { size: u32, check: u32 },

    #[error("Sequence number {actual} does not match expected {expected}")]
    UnexpectedSequence { expected: u16, actual: u16 },

    #[error("Handle sequence check {check:#010x} is not the complement of {handle_seq}")]
    HandleCheckMismatch { handle_seq: u32, check: u32 },

    #[error("Message of {size} bytes does not fit the {readable} readable bytes of the channel")]
    IncompleteMessage { size: usize, readable: usize },
}

/// State transition errors for the connection and acceptor state machines.
#[derive(Debug, Error)]
pub enum StateTransitionError {
    #[error("Cannot transition {machine} from {from} to {to}")]
    InvalidTransition {
        machine: &'static str,
        from: &'static str,
        to: &'static str,
    },
}

/// Shared memory errors.
#[derive(Debug, Error)]
pub enum SharedMemoryError {
    #[error("Failed to create shared memory region: {name} - {reason}")]
    CreateFailed { name: String, reason: String },

    #[error("Failed to open shared memory region: {name} - {reason}")]
    OpenFailed { name: String, reason: String },

    #[error("Failed to map shared memory: {reason}")]
    MapFailed { reason: String },

    #[error("Ring buffer full - cannot write {size} bytes")]
    RingBufferFull { size: usize },

    #[error("Ring buffer empty - no data available")]
    RingBufferEmpty,

    #[error("Invalid buffer state: {reason}")]
    InvalidBufferState { reason: String },
}

impl SharedMemoryError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::CreateFailed { .. } | Self::MapFailed { .. } => ErrorKind::Resource,
            Self::OpenFailed { .. } => ErrorKind::SystemEnvironment,
            Self::RingBufferFull { .. } | Self::RingBufferEmpty => ErrorKind::WouldBlock,
            Self::InvalidBufferState { .. } => ErrorKind::Protocol,
        }
    }
}

/// Configuration errors. Invalid configuration is rejected before any
/// endpoint is created.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Configuration parse error: {message}")]
    Parse { message: String },

    #[error("Invalid field value: {field} = {value} - {reason}")]
    InvalidFieldValue {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Result type alias using TransportError.
pub type TransportResult<T> = Result<T, TransportError>;
