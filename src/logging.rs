//! Tracing initialisation.
//!
//! `RUST_LOG` takes precedence over the configured level, so a single module can be turned
//! up without editing the configuration file:
//!
//! ```bash
//! RUST_LOG=rust_synth::controller=debug rust_synth run plans/demo.toml --simulate
//! ```

use tracing_subscriber::EnvFilter;

use crate::config::ApplicationConfig;
use crate::error::{AppResult, SynthError};

/// Install the global tracing subscriber.
///
/// # Errors
///
/// Returns `Configuration` if a global subscriber is already installed.
pub fn init(config: &ApplicationConfig) -> AppResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = if config.json_logs {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|err| SynthError::Configuration(format!("Failed to initialise tracing: {err}")))
}
