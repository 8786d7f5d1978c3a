// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Wire formats: message frame headers and handshake packets.

pub mod handshake;
pub mod header;

pub use handshake::{
    negotiate, ConnectReply, ConnectRequest, NegotiationLimits, ReplyStatus, PROTOCOL_VERSION,
};
pub use header::{
    CommonHeader, ExtendedHeader, MessageFormat, SequenceCounter, COMMON_HEADER_SIZE,
    EXTENDED_HEADER_SIZE,
};
