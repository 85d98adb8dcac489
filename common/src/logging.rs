use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{EngineError, EngineResult};

/// Default filter when `RUST_LOG` is not set
fn default_filter(level: &str) -> String {
    format!("tidechain_consensus={level},tidechain_common={level}")
}

/// Install the global tracing subscriber. `RUST_LOG` takes precedence over
/// `level`. Fails if a subscriber is already installed.
pub fn init_tracing(level: &str) -> EngineResult<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(level).into()))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| EngineError::Internal(format!("Failed to install tracing subscriber: {}", e)))
}

/// Subscriber for tests; output is captured by the test harness.
/// Safe to call more than once.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(default_filter("debug")))
        .with_test_writer()
        .try_init();
}
