// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `shmlink validate` command - Validate configuration file.

use std::path::Path;

use shmlink_core::ConfigLoader;

pub async fn execute(file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(file = %file.display(), "Validating configuration");

    match ConfigLoader::load_file(file) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!();
            println!("Transport Settings:");
            println!("  Socket Directory:    {}", config.socket_dir.display());
            println!("  Default Buffer Size: {} bytes", config.default_buffer_size);
            println!("  Max Buffer Size:     {} bytes", config.max_buffer_size);
            println!("  Backlog:             {}", config.backlog);
            match config.handshake_timeout {
                Some(timeout) => println!("  Handshake Timeout:   {}ms", timeout.as_millis()),
                None => println!("  Handshake Timeout:   none (never evict)"),
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed:");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}
