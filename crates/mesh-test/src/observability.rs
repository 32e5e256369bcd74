//! Test logging setup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "mesh_test=debug";

/// Install a fmt subscriber that writes through the test harness.
///
/// Output is captured per test and shown only for failing tests. Safe to call
/// from every test; only the first call installs the subscriber. Set
/// `MESH_TEST_LOG_JSON=1` for JSON lines.
pub fn init_test_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_FILTER.into());

    let json = std::env::var("MESH_TEST_LOG_JSON").is_ok_and(|v| v == "1");

    // try_init fails once a global subscriber exists, which is the idempotent case
    let _ = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_test_writer())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init()
    };
}
