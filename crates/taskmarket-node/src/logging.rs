use crate::config::LoggingConfig;
use std::fs::{File, OpenOptions};
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Effective level: `-v` is debug, `-vv` and above is trace.
pub fn effective_level(config: &LoggingConfig, verbosity: u8) -> &str {
    match verbosity {
        0 => &config.level,
        1 => "debug",
        _ => "trace",
    }
}

/// Build the filter. `RUST_LOG` replaces the base directive when set.
pub fn build_filter(config: &LoggingConfig, verbosity: u8) -> anyhow::Result<EnvFilter> {
    let level = effective_level(config, verbosity);
    let base = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| format!("taskmarket_core={level},taskmarket_node={level}"));
    let mut filter = EnvFilter::try_new(base)?;

    for (module, module_level) in &config.module_filters {
        filter = filter.add_directive(format!("{module}={module_level}").parse()?);
    }
    Ok(filter)
}

fn open_log_file(config: &LoggingConfig) -> anyhow::Result<Option<File>> {
    config
        .file_output
        .as_ref()
        .map(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(anyhow::Error::from)
        })
        .transpose()
}

/// Initialize the global subscriber
pub fn init_logging(config: &LoggingConfig, verbosity: u8) -> anyhow::Result<()> {
    let filter = build_filter(config, verbosity)?;
    let file = open_log_file(config)?;
    let subscriber = tracing_subscriber::registry().with(filter);

    match config.format.as_str() {
        "json" => {
            let json_layer = fmt::layer()
                .json()
                .with_current_span(true)
                .with_thread_ids(true)
                .with_line_number(true)
                .with_file(true);
            let file_layer = file.map(|f| {
                fmt::layer()
                    .json()
                    .with_writer(Mutex::new(f))
                    .with_ansi(false)
            });
            subscriber.with(json_layer).with(file_layer).try_init()?;
        }
        "compact" => {
            let compact_layer = fmt::layer()
                .compact()
                .with_target(false)
                .with_line_number(false)
                .with_file(false);
            let file_layer = file.map(|f| {
                fmt::layer()
                    .compact()
                    .with_writer(Mutex::new(f))
                    .with_ansi(false)
            });
            subscriber.with(compact_layer).with(file_layer).try_init()?;
        }
        _ => {
            let show_location = matches!(effective_level(config, verbosity), "debug" | "trace");
            let pretty_layer = fmt::layer()
                .with_target(show_location)
                .with_line_number(show_location)
                .with_file(show_location);
            let file_layer =
                file.map(|f| fmt::layer().with_writer(Mutex::new(f)).with_ansi(false));
            subscriber.with(pretty_layer).with(file_layer).try_init()?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_overrides_level() {
        let config = LoggingConfig::default();
        assert_eq!(effective_level(&config, 0), "info");
        assert_eq!(effective_level(&config, 1), "debug");
        assert_eq!(effective_level(&config, 3), "trace");
    }

    #[test]
    fn test_module_filters_parse() {
        let mut config = LoggingConfig::default();
        config
            .module_filters
            .insert("taskmarket_core::escrow".to_string(), "trace".to_string());
        assert!(build_filter(&config, 0).is_ok());

        config
            .module_filters
            .insert("bad module".to_string(), "not-a-level".to_string());
        assert!(build_filter(&config, 0).is_err());
    }

    #[test]
    fn test_log_file_created() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            file_output: Some(dir.path().join("market.log")),
            ..Default::default()
        };
        assert!(open_log_file(&config).unwrap().is_some());
        assert!(dir.path().join("market.log").exists());
        assert!(open_log_file(&LoggingConfig::default()).unwrap().is_none());
    }
}
