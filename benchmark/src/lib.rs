// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! shmlink benchmarks
//!
//! Everything lives under `benches/`:
//!
//! - **ring_buffer**: frame codec and ring buffer write/read cycles at
//!   various payload sizes
//! - **ipc_roundtrip**: request/reply latency over a full connection,
//!   against a plain Unix socket baseline
