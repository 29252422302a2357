//! Tracing initialisation shared by sync binaries and tests.

use std::sync::Once;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Default directive used when `RUST_LOG` is not set.
const DEFAULT_LOG_LEVEL: &str = "info";

static INIT_TEST_TRACING: Once = Once::new();

/// Error returned when a global subscriber was already installed.
pub type TracingInitError = tracing_subscriber::util::TryInitError;

/// Installs the global tracing subscriber for an application.
///
/// Log records emitted through the `log` facade are forwarded into `tracing` by the subscriber's
/// `tracing-log` integration. The filter is read from `RUST_LOG` and falls back to
/// `{app_name}=info,info`.
pub fn init_tracing(app_name: &str) -> Result<(), TracingInitError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{app_name}={DEFAULT_LOG_LEVEL},{DEFAULT_LOG_LEVEL}"))
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
}

/// Installs a test subscriber writing through the test harness capture.
///
/// Safe to call from every test, only the first call installs the subscriber. Set `RUST_LOG` to
/// see output, e.g. `RUST_LOG=sync_engine=debug`.
pub fn init_test_tracing() {
    INIT_TEST_TRACING.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("off"));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_test_writer()
            .try_init();
    });
}
