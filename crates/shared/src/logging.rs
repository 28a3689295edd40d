//! Logging infrastructure.
//!
//! Structured tracing with an env-filter, console output and
//! daily-rotated file output, optionally JSON formatted.

use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use std::path::Path;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Initialize tracing for one component from the logging config.
///
/// `RUST_LOG` overrides the configured default level. Noisy HTTP
/// internals are pinned to warn.
pub fn init(component: &str, config: &LoggingConfig) -> Result<()> {
    let level: Level = config
        .default_level
        .parse()
        .unwrap_or(Level::INFO);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{}={},shared={},stream_resolver={},hyper=warn,reqwest=warn,h2=warn",
            component.replace('-', "_"),
            level,
            level,
            level
        ))
    });

    let mut layers = Vec::new();

    if config.console {
        layers.push(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_span_events(FmtSpan::NONE)
                .with_writer(std::io::stdout)
                .boxed(),
        );
    }

    if config.file {
        let log_dir = Path::new(&config.log_dir);
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed to create log directory: {}", config.log_dir))?;

        let file_appender = tracing_appender::rolling::daily(log_dir, component);

        let file_layer = if config.json_format {
            fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(true)
                .with_writer(file_appender)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_writer(file_appender)
                .boxed()
        };
        layers.push(file_layer);
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    tracing::info!(component = component, "Logging initialized");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parsing_falls_back_to_info() {
        let config = LoggingConfig {
            default_level: "not-a-level".to_string(),
            ..Default::default()
        };
        let level: Level = config.default_level.parse().unwrap_or(Level::INFO);
        assert_eq!(level, Level::INFO);
    }

    #[test]
    fn test_default_config_enables_console_and_file() {
        let config = LoggingConfig::default();
        assert!(config.console);
        assert!(config.file);
        assert!(!config.json_format);
    }
}
