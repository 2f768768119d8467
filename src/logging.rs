//! Log output setup.
//!
//! The engine logs through `tracing` and never installs a subscriber on its own.
//! Applications either bring their own or call [`init`], which installs a fmt
//! subscriber filtered by the `IRONFRAME_LOG` environment variable (`EnvFilter`
//! syntax, e.g. `IRONFRAME_LOG=ironframe=debug`), falling back to `default_filter`.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable read by [`init`].
pub const LOG_ENV: &str = "IRONFRAME_LOG";

/// Install a global fmt subscriber.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init(default_filter: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .try_init()?;
    Ok(())
}

/// Like [`init`], but writing through the test harness's captured output and
/// ignoring an already installed subscriber.
pub fn init_for_tests() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}
