//! Logging setup for the operator binary.
//!
//! Level comes from `RUST_LOG`, falling back to `default_level`. Output goes
//! to stderr so command output on stdout can be piped.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::errors::{AvError, AvResult};

pub fn init(default_level: &str) -> AvResult<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| AvError::internal(format!("logging already initialized: {e}")))
}
