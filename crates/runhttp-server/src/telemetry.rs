//! Log output for runhttp-server.
//!
//! Filter from `RUST_LOG`, or `RUNHTTP_LOG_LEVEL` as a bare level or a full
//! directive list. `RUNHTTP_LOG_FORMAT=pretty` switches from JSON to
//! human-readable output.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_DIRECTIVES: &str = "info,runhttp=debug,runhttp_server=debug";

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("pretty") | Some("text") => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }
}

fn default_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_DIRECTIVES)
}

/// Directives for the given `RUST_LOG` and `RUNHTTP_LOG_LEVEL` values.
fn filter_directives(rust_log: Option<&str>, level: Option<&str>) -> String {
    if let Some(filter) = rust_log {
        return filter.to_string();
    }

    if let Some(level_or_filter) = level.map(str::trim).filter(|l| !l.is_empty()) {
        if level_or_filter.contains('=') || level_or_filter.contains(',') {
            return level_or_filter.to_string();
        }
        return format!(
            "{level},runhttp={level},runhttp_server={level}",
            level = level_or_filter
        );
    }

    DEFAULT_DIRECTIVES.to_string()
}

fn build_log_filter() -> EnvFilter {
    let rust_log = std::env::var("RUST_LOG").ok();
    let level = std::env::var("RUNHTTP_LOG_LEVEL").ok();
    let directives = filter_directives(rust_log.as_deref(), level.as_deref());
    EnvFilter::try_new(directives).unwrap_or_else(|_| default_filter())
}

/// Install the global subscriber.
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = build_log_filter();
    let format = LogFormat::parse(std::env::var("RUNHTTP_LOG_FORMAT").ok().as_deref());

    match format {
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(true)
                .with_line_number(true);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()?;
        }
        LogFormat::Pretty => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()?;
        }
    }

    tracing::info!(format = ?format, "Telemetry initialized");

    Ok(())
}
