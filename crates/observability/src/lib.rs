//! Logging setup shared by binaries, benches and tests.

/// Initialize process-wide tracing (JSON logs, `RUST_LOG` filter).
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init();
}

/// Initialize tracing for tests: human-readable, captured by the test harness.
pub fn init_for_tests() {
    tracing::init_for_tests();
}

/// Tracing configuration (filters, layers).
pub mod tracing;
