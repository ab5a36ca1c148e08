//! Logger setup for binaries and tests

use env_logger::Env;

/// Initialize `env_logger` with an `info` default, overridable through `RUST_LOG`.
///
/// Calling it more than once is harmless.
pub fn init() {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}

/// Initialize a test-friendly logger that writes through the test harness capture
pub fn init_for_tests() {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or("debug"))
        .is_test(true)
        .try_init();
}
