//! Process-wide tracing setup shared by hosts of the recoverability engine.

/// Initialize tracing with JSON output, filtered by `RUST_LOG` (default `info`).
///
/// Safe to call multiple times; only the first call installs a subscriber.
pub fn init() {
    tracing::init(tracing::DEFAULT_DIRECTIVE);
}

/// Tracing subscriber configuration.
pub mod tracing;
