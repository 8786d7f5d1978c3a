// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Connection round-trip benchmarks.
//!
//! Compares request/reply latency over a shmlink connection with the same
//! exchange over a plain Unix domain socket pair.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use shmlink_core::{Acceptor, Connection, TransportConfig, UnicastAddress};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::runtime::Runtime;

/// Payload sizes for IPC benchmarks.
const PAYLOAD_SIZES: &[usize] = &[64, 1024, 4096, 16384];

const BUFFER_SIZE: usize = 256 * 1024;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("Failed to build runtime")
}

/// Echo server on its own task, plus a connected client.
async fn echo_pair(dir: &TempDir) -> (Acceptor, Connection) {
    let config = TransportConfig::default().with_socket_dir(dir.path());
    let address = UnicastAddress::new(1, 1);
    let acceptor = Acceptor::new(config.clone());
    acceptor
        .init(address, BUFFER_SIZE)
        .expect("Failed to listen");

    let client = Connection::new(config);
    let (connected, accepted) = tokio::join!(
        client.connect(address, BUFFER_SIZE, BUFFER_SIZE),
        acceptor.accept()
    );
    connected.expect("Failed to connect");
    let server = accepted.expect("Failed to accept");

    tokio::spawn(async move {
        let mut buf = vec![0u8; BUFFER_SIZE];
        while let Ok(len) = server.receive(&mut buf).await {
            if server.send(&buf[..len], None).await.is_err() {
                break;
            }
        }
    });

    (acceptor, client)
}

fn bench_shm_roundtrip(c: &mut Criterion) {
    let rt = runtime();
    let dir = TempDir::new().expect("Failed to create socket dir");
    let (_acceptor, client) = rt.block_on(echo_pair(&dir));

    let mut group = c.benchmark_group("roundtrip_shm");
    group.measurement_time(Duration::from_secs(5));

    for &size in PAYLOAD_SIZES {
        group.throughput(Throughput::Bytes(size as u64 * 2));

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let payload = vec![0xABu8; size];
            let mut reply = vec![0u8; size];

            b.iter(|| {
                rt.block_on(async {
                    client.send(&payload, None).await.expect("Send failed");
                    client.receive(&mut reply).await.expect("Receive failed");
                })
            });
        });
    }

    group.finish();
}

fn bench_unix_socket_roundtrip(c: &mut Criterion) {
    let rt = runtime();

    let mut group = c.benchmark_group("roundtrip_unix_socket");
    group.measurement_time(Duration::from_secs(5));

    for &size in PAYLOAD_SIZES {
        group.throughput(Throughput::Bytes(size as u64 * 2));

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let (mut client, mut server) =
                rt.block_on(async { tokio::net::UnixStream::pair().expect("Failed to pair") });
            rt.spawn(async move {
                let mut buf = vec![0u8; size];
                while server.read_exact(&mut buf).await.is_ok() {
                    if server.write_all(&buf).await.is_err() {
                        break;
                    }
                }
            });

            let payload = vec![0xABu8; size];
            let mut reply = vec![0u8; size];

            b.iter(|| {
                rt.block_on(async {
                    client.write_all(&payload).await.expect("Write failed");
                    client.read_exact(&mut reply).await.expect("Read failed");
                })
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_shm_roundtrip, bench_unix_socket_roundtrip);
criterion_main!(benches);
