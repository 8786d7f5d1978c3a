// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Per-connection traffic counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Snapshot of a connection's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TransportStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub notifications_sent: u64,
    pub notifications_received: u64,
    pub handles_sent: u64,
    pub handles_received: u64,
    /// Handle messages that went out as plain data.
    pub handles_degraded: u64,
    /// Sends that found the outbound ring full.
    pub send_would_block: u64,
}

/// Live counters updated on the data path.
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    notifications_sent: AtomicU64,
    notifications_received: AtomicU64,
    handles_sent: AtomicU64,
    handles_received: AtomicU64,
    handles_degraded: AtomicU64,
    send_would_block: AtomicU64,
}

impl StatsCounters {
    pub fn record_send(&self, bytes: usize, with_handle: bool) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        if with_handle {
            self.handles_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_receive(&self, bytes: usize, with_handle: bool) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        if with_handle {
            self.handles_received.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_notification_sent(&self) {
        self.notifications_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_notification_received(&self) {
        self.notifications_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_degraded_handle(&self) {
        self.handles_degraded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_would_block(&self) {
        self.send_would_block.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransportStats {
        TransportStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            notifications_received: self.notifications_received.load(Ordering::Relaxed),
            handles_sent: self.handles_sent.load(Ordering::Relaxed),
            handles_received: self.handles_received.load(Ordering::Relaxed),
            handles_degraded: self.handles_degraded.load(Ordering::Relaxed),
            send_would_block: self.send_would_block.load(Ordering::Relaxed),
        }
    }
}
