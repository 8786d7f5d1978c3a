// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `shmlink listen` command - Echo server.
//!
//! Accepts connections until Ctrl-C and echoes every message back to its
//! sender. Notifications are logged.

use shmlink_core::{Acceptor, Connection, ErrorKind, TransportConfig, UnicastAddress};

pub async fn execute(
    config: TransportConfig,
    address: UnicastAddress,
    buffer_size: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let acceptor = Acceptor::new(config);
    acceptor.init(address, buffer_size)?;

    println!(
        "Listening on {} (server-to-client buffer: {} bytes)",
        address,
        acceptor.server_buffer_size().unwrap_or(buffer_size)
    );
    println!("Press Ctrl-C to stop.");

    let mut next_id: u64 = 0;
    loop {
        tokio::select! {
            accepted = acceptor.accept() => match accepted {
                Ok(connection) => {
                    next_id += 1;
                    tokio::spawn(echo(next_id, connection));
                }
                Err(err) if err.is_transient() => {
                    tracing::warn!(error = %err, "Accept failed, continuing");
                }
                Err(err) => return Err(err.into()),
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!();
    println!("Shutting down...");
    acceptor.close();
    Ok(())
}

async fn echo(id: u64, connection: Connection) {
    let sizes = match connection.buffer_sizes() {
        Ok(sizes) => sizes,
        Err(err) => {
            tracing::warn!(id, error = %err, "Accepted connection is unusable");
            return;
        }
    };
    let peer = connection.peer_identity().ok();
    tracing::info!(
        id,
        sizes = %sizes,
        peer_pid = ?peer.and_then(|peer| peer.pid).map(|pid| pid.value()),
        "Client connected"
    );

    if let Err(err) = connection.register_notification_handler(move |value| {
        tracing::info!(id, value, "Notification received");
    }) {
        tracing::warn!(id, error = %err, "Failed to register notification handler");
    }

    let mut buffer = vec![0u8; sizes.client_to_server];
    loop {
        let len = match connection.receive(&mut buffer).await {
            Ok(len) => len,
            Err(err) if matches!(err.kind(), ErrorKind::Disconnected(_)) => {
                tracing::info!(id, error = %err, "Client went away");
                break;
            }
            Err(err) => {
                tracing::warn!(id, error = %err, "Receive failed, dropping client");
                break;
            }
        };

        match connection.send(&buffer[..len], None).await {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::Size => {
                tracing::warn!(id, len, error = %err, "Message too large to echo");
            }
            Err(err) => {
                tracing::warn!(id, error = %err, "Echo failed, dropping client");
                break;
            }
        }
    }

    if let Ok(stats) = connection.stats() {
        tracing::debug!(
            id,
            messages = stats.messages_received,
            bytes = stats.bytes_received,
            "Client session finished"
        );
    }
    connection.close();
}
