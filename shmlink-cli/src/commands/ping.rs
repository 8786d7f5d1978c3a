// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `shmlink ping` command - Round-trip latency against an echo server.

use std::time::{Duration, Instant};

use serde::Serialize;
use shmlink_core::{
    Connection, TransportConfig, TransportStats, UnicastAddress, USE_SERVER_BUFFER_SIZE,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PingError {
    #[error("Round trip {round}: echo of {received} bytes does not match the {sent}-byte payload")]
    EchoMismatch {
        round: usize,
        sent: usize,
        received: usize,
    },

    #[error("Payload of {size} bytes exceeds the connection limit of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Count must be at least 1")]
    NoRounds,
}

/// Latency summary in microseconds.
#[derive(Debug, Serialize)]
struct PingReport {
    address: String,
    count: usize,
    payload_bytes: usize,
    min_us: f64,
    avg_us: f64,
    p50_us: f64,
    p99_us: f64,
    max_us: f64,
    stats: TransportStats,
}

pub async fn execute(
    config: TransportConfig,
    address: UnicastAddress,
    count: usize,
    size: usize,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if count == 0 {
        return Err(PingError::NoRounds.into());
    }

    let connection = Connection::new(config);
    connection.connect(address, 0, USE_SERVER_BUFFER_SIZE).await?;
    tracing::debug!(sizes = %connection.buffer_sizes()?, "Connected to echo server");

    let max = connection.max_message_size(false)?;
    if size > max {
        return Err(PingError::PayloadTooLarge { size, max }.into());
    }

    let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    let mut reply = vec![0u8; size];
    let mut samples = Vec::with_capacity(count);

    for round in 0..count {
        let start = Instant::now();
        connection.send(&payload, None).await?;
        let received = connection.receive(&mut reply).await?;
        samples.push(start.elapsed());

        if received != size || reply != payload {
            return Err(PingError::EchoMismatch {
                round,
                sent: size,
                received,
            }
            .into());
        }
    }

    let report = summarize(address, size, &mut samples, connection.stats()?);
    connection.close();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{} round trips of {} bytes to {}", report.count, size, address);
        println!(
            "  min {:.1}us  avg {:.1}us  p50 {:.1}us  p99 {:.1}us  max {:.1}us",
            report.min_us, report.avg_us, report.p50_us, report.p99_us, report.max_us
        );
        println!(
            "  sent {} msgs / {} bytes, received {} msgs / {} bytes, {} send waits",
            report.stats.messages_sent,
            report.stats.bytes_sent,
            report.stats.messages_received,
            report.stats.bytes_received,
            report.stats.send_would_block
        );
    }
    Ok(())
}

fn summarize(
    address: UnicastAddress,
    size: usize,
    samples: &mut [Duration],
    stats: TransportStats,
) -> PingReport {
    samples.sort_unstable();
    let micros = |d: Duration| d.as_secs_f64() * 1e6;
    let percentile = |p: f64| {
        let index = ((samples.len() as f64 * p).ceil() as usize).clamp(1, samples.len()) - 1;
        micros(samples[index])
    };
    let total: Duration = samples.iter().sum();

    PingReport {
        address: address.to_string(),
        count: samples.len(),
        payload_bytes: size,
        min_us: micros(samples[0]),
        avg_us: micros(total) / samples.len() as f64,
        p50_us: percentile(0.50),
        p99_us: percentile(0.99),
        max_us: micros(samples[samples.len() - 1]),
        stats,
    }
}
