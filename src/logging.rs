//! `env_logger` setup. Detected corruption is logged at `warn`, traversal at
//! `debug` and `trace`.

use env_logger::{Builder, Env};

/// Log to stderr, filtered by `RUST_LOG` (default `warn`). Calling it twice
/// is harmless.
pub fn init() {
    let _ = Builder::from_env(Env::default().default_filter_or("warn")).try_init();
}

/// Like [`init`], but captured by the test harness.
pub fn init_for_tests() {
    let _ = Builder::from_env(Env::default().default_filter_or("debug"))
        .is_test(true)
        .try_init();
}
