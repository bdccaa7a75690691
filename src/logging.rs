//! Diagnostic tracing for the explorer binaries.
//!
//! Tracing is for developers: it reads `RUST_LOG` and writes to stderr.
//! Reports, screenshots and the memory index are product output and are
//! written regardless of the filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "board_explorer=info";

/// Initialize the global subscriber.
///
/// Reads `RUST_LOG`, defaulting to `board_explorer=info`. Safe to call more
/// than once; later calls are ignored.
///
/// ```bash
/// RUST_LOG=board_explorer=debug board-explorer cycle --board 8,1,9,8
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
