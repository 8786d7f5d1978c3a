// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! CLI command modules.

pub mod listen;
pub mod notify;
pub mod ping;
pub mod validate;
