// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Per-connection driver task.
//!
//! Drains the side-channel, runs the notification handler, queues incoming
//! handles and wakes pending operations. It is the only place where a peer
//! disconnect is detected.

use std::sync::Arc;

use crate::error::DisconnectKind;
use crate::side_channel::SideEvent;

use super::link::Link;
use super::ConnectionInner;

pub(super) async fn run(inner: Arc<ConnectionInner>, link: Arc<Link>, generation: u64) {
    let role = link.role().name();
    let mut goodbye = false;

    let outcome = loop {
        let batch = match link.side().recv().await {
            Ok(batch) => batch,
            Err(err) => {
                tracing::debug!(role, error = %err, "Side-channel failed");
                break DisconnectKind::Abnormal;
            }
        };

        let mut readable = false;
        let mut writable = false;

        for event in batch.events {
            match event {
                SideEvent::Notification(value) => {
                    link.stats().record_notification_received();
                    inner.dispatch_notification(value);
                }
                SideEvent::DataAvailable => readable = true,
                SideEvent::Writable => writable = true,
                SideEvent::Handle(handle) => {
                    link.push_handle(handle);
                    readable = true;
                }
                SideEvent::Goodbye => goodbye = true,
                SideEvent::Attached => {
                    tracing::trace!(role, "Ignoring repeated attach acknowledgement");
                }
                SideEvent::Reserved(value) => {
                    tracing::warn!(role, value, "Ignoring reserved side-channel byte");
                }
            }
        }

        if readable {
            inner.readable.notify_one();
        }
        if writable {
            inner.writable.notify_one();
        }

        if batch.eof {
            break if goodbye {
                DisconnectKind::Orderly
            } else {
                DisconnectKind::Abnormal
            };
        }
    };

    inner.mark_disconnected(generation, outcome);
}
