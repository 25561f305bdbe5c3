use tracing_subscriber::EnvFilter;

use crate::italia::opendata::error::{DatasetError, Result};

/// Installs the global tracing subscriber. Events go to stderr so stdout stays
/// free for command output. `RUST_LOG` overrides `default_directive`.
pub fn init_logging(default_directive: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .map_err(|err| DatasetError::Logging(err.to_string()))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| DatasetError::Logging(err.to_string()))
}
