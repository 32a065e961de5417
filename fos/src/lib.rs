//! File-operation service: a JSON-RPC 2.0 front end over a rooted
//! directory tree, with appends coordinated across instances through an
//! external lock coordinator.

pub mod config;
pub mod http;
pub mod rpc;

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Stderr logging with `RUST_LOG` filtering, `info` by default.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            fmt::Layer::new()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}
