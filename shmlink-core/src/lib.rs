// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! shmlink Core Library
//!
//! Point-to-point, connection-oriented message transport between processes on
//! one host. Messages travel through lock-free ring buffers in POSIX shared
//! memory; a Unix socket side-channel carries wake-ups, single-byte
//! notifications and file descriptors. The tokio runtime acts as the reactor.
//!
//! An [`Acceptor`] listens on a [`UnicastAddress`]; a [`Connection`] connects
//! to it and negotiates one ring per direction.

pub mod acceptor;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handle;
mod handshake;
pub mod shm;
pub mod side_channel;
pub mod state;
pub mod stats;
mod sync;
pub mod types;

// Re-export commonly used types
pub use acceptor::{Acceptor, BacklogEviction};
pub use config::{ConfigLoader, TransportConfig};
pub use connection::{
    ChunkProgress, ChunkSink, Connection, MessageInfo, ReceivedMessage, SendOutcome,
};
pub use error::{DisconnectKind, ErrorKind, ProtocolError, TransportError, TransportResult};
pub use handle::MemoryHandle;
pub use side_channel::MAX_USER_NOTIFICATION;
pub use state::{AcceptorState, ConnectionState};
pub use stats::TransportStats;
pub use types::{BufferSizes, PeerIdentity, UnicastAddress, USE_SERVER_BUFFER_SIZE};
