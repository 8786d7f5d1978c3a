// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Connection establishment over the rendezvous socket.
//!
//! 1. Client sends a [`ConnectRequest`] (version and size hints).
//! 2. Server negotiates sizes, creates both rings and answers with a
//!    [`ConnectReply`] naming them.
//! 3. Client maps the rings and sends the attach byte; the server unlinks the
//!    region names. The socket stays open as the side-channel.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::config::{TransportConfig, MAX_BUFFER_SIZE, MIN_BUFFER_SIZE};
use crate::connection::{Link, Role};
use crate::error::{ProtocolError, TransportError, TransportResult};
use crate::frame::handshake::{CONNECT_REPLY_SIZE, CONNECT_REQUEST_SIZE};
use crate::frame::{
    negotiate, ConnectReply, ConnectRequest, NegotiationLimits, ReplyStatus, PROTOCOL_VERSION,
};
use crate::shm::RingBuffer;
use crate::side_channel::{ControlCode, SideChannel};
use crate::types::{BufferSizes, UnicastAddress};

/// How long a refused client gets to deliver its request before the reply.
const REJECT_READ_TIMEOUT: Duration = Duration::from_millis(500);

static NEXT_REGION: AtomicU32 = AtomicU32::new(0);

fn region_name(direction: char) -> String {
    format!(
        "shmlink-{:x}-{:x}-{}",
        std::process::id(),
        NEXT_REGION.fetch_add(1, Ordering::Relaxed),
        direction
    )
}

/// Client side: run the handshake against the acceptor at `address`.
pub(crate) async fn connect(
    config: &TransportConfig,
    address: UnicastAddress,
    client_to_server: usize,
    server_to_client: usize,
) -> TransportResult<Link> {
    let path = address.socket_path(&config.socket_dir);
    let mut stream = UnixStream::connect(&path)
        .await
        .map_err(|err| TransportError::from_address_io(address, "connecting to acceptor", err))?;

    let client_to_server = match client_to_server {
        0 => config.default_buffer_size,
        hint => hint,
    };
    let request = ConnectRequest::new(client_to_server, server_to_client);
    stream
        .write_all(&request.encode())
        .await
        .map_err(|err| TransportError::from_io("sending connect request", err))?;

    let mut raw = [0u8; CONNECT_REPLY_SIZE];
    stream
        .read_exact(&mut raw)
        .await
        .map_err(|err| handshake_read_error(address, err))?;
    let reply = ConnectReply::decode(&raw)?;

    match reply.status {
        ReplyStatus::Accepted => {}
        ReplyStatus::VersionMismatch => {
            return Err(ProtocolError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: reply.version,
            }
            .into())
        }
        ReplyStatus::BacklogFull | ReplyStatus::ResourceExhausted => {
            return Err(TransportError::Resource {
                reason: format!("Acceptor {} refused connection: {}", address, reply.status.name()),
            })
        }
    }

    if reply.version != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch {
            local: PROTOCOL_VERSION,
            remote: reply.version,
        }
        .into());
    }
    check_sizes(&reply.sizes)?;

    let outbound =
        RingBuffer::open_named(&reply.client_to_server_region, reply.sizes.client_to_server)?;
    let inbound =
        RingBuffer::open_named(&reply.server_to_client_region, reply.sizes.server_to_client)?;

    stream
        .write_all(&[ControlCode::Attached as u8])
        .await
        .map_err(|err| TransportError::from_io("acknowledging attach", err))?;

    let side = into_side_channel(stream)?;
    tracing::debug!(address = %address, sizes = %reply.sizes, "Handshake complete");
    Ok(Link::new(Role::Client, outbound, inbound, side, reply.sizes))
}

/// Server side: answer one connect request and build the link.
pub(crate) async fn serve(
    mut stream: UnixStream,
    config: &TransportConfig,
    server_to_client: usize,
) -> TransportResult<Link> {
    let mut raw = [0u8; CONNECT_REQUEST_SIZE];
    stream
        .read_exact(&mut raw)
        .await
        .map_err(|err| TransportError::from_io("reading connect request", err))?;
    let request = ConnectRequest::decode(&raw)?;

    if request.version != PROTOCOL_VERSION {
        send_reply(&mut stream, &ConnectReply::rejected(ReplyStatus::VersionMismatch)).await;
        return Err(ProtocolError::VersionMismatch {
            local: PROTOCOL_VERSION,
            remote: request.version,
        }
        .into());
    }

    let sizes = negotiate(
        &request,
        &NegotiationLimits {
            max_client_to_server: config.max_buffer_size,
            server_to_client,
            default_buffer_size: config.default_buffer_size,
        },
    );

    let rings = RingBuffer::create(&region_name('c'), sizes.client_to_server).and_then(
        |inbound| Ok((inbound, RingBuffer::create(&region_name('s'), sizes.server_to_client)?)),
    );
    let (mut inbound, mut outbound) = match rings {
        Ok(rings) => rings,
        Err(err) => {
            send_reply(&mut stream, &ConnectReply::rejected(ReplyStatus::ResourceExhausted))
                .await;
            return Err(err.into());
        }
    };

    let reply = ConnectReply {
        status: ReplyStatus::Accepted,
        version: PROTOCOL_VERSION,
        sizes,
        client_to_server_region: inbound.region_name().to_string(),
        server_to_client_region: outbound.region_name().to_string(),
    };
    stream
        .write_all(&reply.encode()?)
        .await
        .map_err(|err| TransportError::from_io("sending connect reply", err))?;

    let mut ack = [0u8; 1];
    stream
        .read_exact(&mut ack)
        .await
        .map_err(|err| TransportError::from_io("reading attach acknowledgement", err))?;
    if ack[0] != ControlCode::Attached as u8 {
        return Err(ProtocolError::UnexpectedControl { value: ack[0] }.into());
    }

    // Both sides are mapped, the names are no longer needed.
    inbound.unlink();
    outbound.unlink();

    let side = into_side_channel(stream)?;
    Ok(Link::new(Role::Server, outbound, inbound, side, sizes))
}

/// Refuse a client with `status`, without allocating anything for it.
pub(crate) async fn reject(mut stream: UnixStream, status: ReplyStatus) {
    let mut raw = [0u8; CONNECT_REQUEST_SIZE];
    // Closing with the request unread would reset the client's socket before
    // it sees the reply.
    if let Ok(Err(err)) =
        tokio::time::timeout(REJECT_READ_TIMEOUT, stream.read_exact(&mut raw)).await
    {
        tracing::debug!(error = %err, "Refused client went away");
        return;
    }
    send_reply(&mut stream, &ConnectReply::rejected(status)).await;
}

async fn send_reply(stream: &mut UnixStream, reply: &ConnectReply) {
    let result = match reply.encode() {
        Ok(bytes) => stream.write_all(&bytes).await,
        Err(err) => Err(io::Error::new(io::ErrorKind::InvalidData, err)),
    };
    if let Err(err) = result {
        tracing::debug!(status = reply.status.name(), error = %err, "Failed to send reply");
    }
}

fn handshake_read_error(address: UnicastAddress, err: io::Error) -> TransportError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        return TransportError::AddressNotAvailable {
            address,
            reason: "Acceptor closed the connection during the handshake".to_string(),
        };
    }
    TransportError::from_io("reading connect reply", err)
}

fn check_sizes(sizes: &BufferSizes) -> TransportResult<()> {
    for size in [sizes.client_to_server, sizes.server_to_client] {
        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&size) {
            return Err(ProtocolError::MalformedHandshake {
                reason: format!("negotiated buffer size {} out of range", size),
            }
            .into());
        }
    }
    Ok(())
}

fn into_side_channel(stream: UnixStream) -> TransportResult<SideChannel> {
    let stream = stream
        .into_std()
        .map_err(|err| TransportError::from_io("detaching side-channel", err))?;
    SideChannel::new(stream).map_err(|err| TransportError::from_io("registering side-channel", err))
}
