//! Logging setup for Tessera binaries.
use std::path::Path;

use anyhow::{Context, Result};
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};

/// Handle used to change the active filter at runtime.
pub type ReloadHandle = reload::Handle<EnvFilter, Registry>;

/// Log file prefix inside the log directory.
pub const FILE_PREFIX: &str = "tessera.log";

fn filter(level: Level) -> EnvFilter {
    EnvFilter::default().add_directive(level.into())
}

/// Initialize structured JSON logging with hourly rolling files under `dir`.
/// Returns a handle that can swap the level filter at runtime.
pub fn init(dir: impl AsRef<Path>, level: Level) -> Result<ReloadHandle> {
    let appender = RollingFileAppender::new(Rotation::HOURLY, dir.as_ref(), FILE_PREFIX);
    let (filter_layer, handle) = reload::Layer::new(filter(level));
    let fmt_layer = fmt::layer()
        .with_writer(appender)
        .json()
        .with_current_span(false)
        .with_span_list(false);
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init()
        .context("install file subscriber")?;
    Ok(handle)
}

/// Human-readable logging to stdout, for interactive commands.
pub fn init_stdout(level: Level) -> Result<ReloadHandle> {
    let (filter_layer, handle) = reload::Layer::new(filter(level));
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().compact().with_target(false))
        .try_init()
        .context("install stdout subscriber")?;
    Ok(handle)
}

/// Replace the active filter with `level`.
pub fn set_level(handle: &ReloadHandle, level: Level) -> Result<()> {
    handle.reload(filter(level)).context("reload log filter")
}

/// Replace the active filter with an `EnvFilter` directive string such as
/// `tessera_router=debug,info`.
pub fn set_directives(handle: &ReloadHandle, directives: &str) -> Result<()> {
    let filter = EnvFilter::try_new(directives).with_context(|| format!("bad filter {directives:?}"))?;
    handle.reload(filter).context("reload log filter")
}
