//! Tracing setup and the in-memory log buffer.

pub mod log_buffer;

pub use log_buffer::{LogBuffer, LogBufferLayer, LogRecord};

use crate::config::LoggingConfig;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install the global subscriber: stderr formatting plus a [`LogBuffer`].
///
/// `RUST_LOG` overrides the configured filter. If a global subscriber is
/// already installed the buffer is still returned, but stays empty.
pub fn init_tracing(config: &LoggingConfig) -> LogBuffer {
    let buffer = LogBuffer::new(config.buffer_capacity);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(LogBufferLayer::new(buffer.clone()))
        .try_init();
    if let Err(e) = installed {
        tracing::debug!("tracing already initialised: {e}");
    }
    buffer
}
