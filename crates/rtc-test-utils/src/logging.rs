//! Opt-in log output for tests.
//!
//! Set `RUST_LOG` (e.g. `RUST_LOG=rtc.session=debug,rtc.quality=debug`) to
//! see engine logs interleaved with test output.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a test-writer subscriber once per test binary.
///
/// Safe to call from every test: later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}
