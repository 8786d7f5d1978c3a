// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `shmlink notify` command - Send one notification.

use shmlink_core::{Connection, TransportConfig, UnicastAddress, USE_SERVER_BUFFER_SIZE};

pub async fn execute(
    config: TransportConfig,
    address: UnicastAddress,
    value: u8,
) -> Result<(), Box<dyn std::error::Error>> {
    let connection = Connection::new(config);
    connection.connect(address, 0, USE_SERVER_BUFFER_SIZE).await?;

    // The echo server installs its handler before it starts echoing, so one
    // round trip guarantees the notification is not dropped.
    let mut reply = [0u8; 1];
    connection.send(&[0], None).await?;
    connection.receive(&mut reply).await?;

    connection.send_notification(value)?;
    connection.close();

    println!("✓ Sent notification {} to {}", value, address);
    Ok(())
}
