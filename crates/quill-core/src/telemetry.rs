//! # Logging
//!
//! Both binaries log through `tracing`. A single console subscriber is
//! installed at startup; `RUST_LOG` controls filtering and defaults to `info`.
//!
//! ## Formats
//!
//! - [`LogFormat::Pretty`]: multi-line human-readable output for local runs.
//! - [`LogFormat::Json`]: one JSON object per event for log shippers.
//!
//! Request handling opens spans carrying `request_id` (and `chat_id` where one
//! exists) so every event of a stream can be correlated across the gateway and
//! the worker.

use crate::config::LogFormat;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

pub fn init_telemetry(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let fmt = tracing_subscriber::fmt::layer()
        .with_thread_ids(true)
        .with_line_number(true)
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_file(true);

    let fmt = match format {
        LogFormat::Pretty => fmt.pretty().boxed(),
        LogFormat::Json => fmt.json().boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt)
        .try_init()?;

    Ok(())
}
