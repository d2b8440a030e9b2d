/// Telemetry - Structured Logging with Tracing
///
/// One subscriber, initialised at startup from configuration:
/// - LOG_LEVEL drives the env filter (RUST_LOG overrides when set)
/// - LOG_FORMAT selects json or pretty output
/// - CHAINSYNC_LOG_FILE enables a daily-rotated file appender

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub log_format: String,
    pub log_file: Option<String>,
}

impl TelemetryConfig {
    pub fn new(log_level: &str, log_format: &str) -> Self {
        Self {
            // `fatal` is accepted in config for parity with the level set the
            // deployment tooling knows; tracing has no fatal level, error is
            // the closest filter.
            log_level: if log_level == "fatal" {
                "error".to_string()
            } else {
                log_level.to_string()
            },
            log_format: log_format.to_string(),
            log_file: std::env::var("CHAINSYNC_LOG_FILE").ok(),
        }
    }
}

/// Install the global tracing subscriber. Call exactly once.
pub fn init_tracing(config: TelemetryConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if let Some(log_file_path) = config.log_file {
        let path = std::path::Path::new(&log_file_path);
        let directory = path
            .parent()
            .ok_or("Invalid log file path: no parent directory")?;
        let filename_prefix = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or("Invalid log file path: no filename")?;

        let file_appender = tracing_appender::rolling::daily(directory, filename_prefix);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if config.log_format == "json" {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .with_target(false)
                        .with_writer(non_blocking),
                )
                .init();
        }

        // Guard must outlive the process or buffered lines are dropped.
        std::mem::forget(guard);
    } else if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_current_span(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .init();
    }

    Ok(())
}

/// Shorten a hash for a log line: `0xddf252ad…` instead of 66 chars.
pub fn short_hash(hex: &str) -> String {
    if hex.len() <= 12 {
        hex.to_string()
    } else {
        format!("{}…", &hex[..12])
    }
}
