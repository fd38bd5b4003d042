// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Thin facade re-exporting the harness's member crates for downstream
//! embedding. Carries no CLI of its own — the CLI/transport/persistence
//! layers around this engine are an external collaborator's concern.
pub use harness_config as config;
pub use harness_core as core;
pub use harness_model as model;
pub use harness_queue as queue;
pub use harness_tools as tools;

use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// Initialise a `tracing` subscriber writing to stderr, honouring `RUST_LOG`.
/// Embedding applications that already run their own subscriber should skip
/// this and call `tracing_subscriber::registry()` themselves instead.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init();
}
