use anyhow::{Context, Result};
use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing::{Subscriber, info};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Scoped subscriber for the work done before the configured one exists,
/// so config loading diagnostics are not lost.
pub fn bootstrap_subscriber<W>(level: &str, writer: W) -> impl Subscriber + Send + Sync
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    fmt()
        .with_env_filter(env_filter(level))
        .with_writer(writer)
        .finish()
}

/// Installs the global subscriber. `RUST_LOG` wins over `level` when set.
pub fn init_logging(level: &str, log_file: Option<&Path>, json: bool) -> Result<()> {
    let filter = env_filter(level);

    match log_file {
        Some(path) => {
            let file = Arc::new(
                std::fs::File::create(path)
                    .with_context(|| format!("create log file: {}", path.display()))?,
            );
            let layer = fmt::layer()
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true)
                .with_writer(file);
            if json {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(layer.json())
                    .try_init()?;
            } else {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(layer)
                    .try_init()?;
            }
        }
        None => {
            let layer = fmt::layer().with_writer(io::stderr);
            if json {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(layer.json())
                    .try_init()?;
            } else {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(layer)
                    .try_init()?;
            }
        }
    }

    info!("logging initialized");
    Ok(())
}
