//! Tracing initialisation for the core.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::{fmt, EnvFilter};

/// Console-only tracing, honouring `RUST_LOG` (default `info`).
pub fn init_tracing() {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(env_filter))
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_level(true)
        .compact()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// File-backed tracing for the desktop build: everything the filter passes
/// is appended to `claude_station.log` in the data directory.
pub fn init_tracing_to_file(log_path: &Path) -> std::io::Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(log_path)?;
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".into());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(env_filter))
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_writer(Arc::new(file))
        .with_ansi(false)
        .compact()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
    Ok(())
}
