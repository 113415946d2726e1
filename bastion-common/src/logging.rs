use std::sync::Arc;

use anyhow::{Context, Result};
use time::{format_description, UtcOffset};
use tracing_subscriber::filter::dynamic_filter_fn;
use tracing_subscriber::fmt::time::OffsetTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Initializes the process-wide tracing subscriber.
///
/// No admin database or log-shipping destinations here, just the one layer
/// that matters for a process meant to run under a supervisor: a
/// timestamped, env-filtered text layer on stderr.
pub fn init_logging(default_directive: &str) -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", default_directive);
    }

    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    let env_filter = Arc::new(EnvFilter::from_default_env());
    let enable_colors = console::user_attended();

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_ansi(enable_colors)
        .with_timer(OffsetTime::new(
            offset,
            format_description::parse("[day].[month].[year] [hour]:[minute]:[second]")
                .context("invalid timestamp format")?,
        ))
        .with_filter(dynamic_filter_fn(move |m, c| env_filter.enabled(m, c.clone())));

    tracing_subscriber::registry().with(fmt_layer).try_init()?;
    Ok(())
}
