pub mod audit;
pub mod metrics;

use tracelens_settings::LoggingSettings;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log filter {filter:?}: {detail}")]
    Filter { filter: String, detail: String },

    #[error("global subscriber already installed: {0}")]
    AlreadyInitialized(String),
}

/// Handle returned by [`init_telemetry`]. Keeps the effective filter around
/// for diagnostics.
#[derive(Debug)]
pub struct TelemetryGuard {
    filter: String,
    json: bool,
}

impl TelemetryGuard {
    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub fn is_json(&self) -> bool {
        self.json
    }
}

/// Install the global tracing subscriber, writing to stderr. Call once at
/// startup.
///
/// `RUST_LOG` takes precedence over the configured directives.
pub fn init_telemetry(settings: &LoggingSettings) -> Result<TelemetryGuard, TelemetryError> {
    let configured = filter_directives(settings);
    let (env_filter, effective) = match EnvFilter::try_from_default_env() {
        Ok(filter) => {
            let s = filter.to_string();
            (filter, s)
        }
        Err(_) => {
            let filter = EnvFilter::try_new(&configured).map_err(|e| TelemetryError::Filter {
                filter: configured.clone(),
                detail: e.to_string(),
            })?;
            (filter, configured)
        }
    };

    let fmt_layer = if settings.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .try_init()
        .map_err(|e| TelemetryError::AlreadyInitialized(e.to_string()))?;

    Ok(TelemetryGuard {
        filter: effective,
        json: settings.json,
    })
}

/// Build an `EnvFilter` directive string from settings, e.g.
/// `info,tracelens_store=debug`.
pub fn filter_directives(settings: &LoggingSettings) -> String {
    let mut filter = settings.level.to_lowercase();
    for (module, level) in &settings.modules {
        filter.push_str(&format!(",{}={}", module, level.to_lowercase()));
    }
    filter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_include_module_overrides() {
        let mut settings = LoggingSettings::default();
        settings.level = "WARN".into();
        settings.modules.insert("tracelens_store".into(), "debug".into());
        settings.modules.insert("tracelens::audit".into(), "info".into());
        assert_eq!(
            filter_directives(&settings),
            "warn,tracelens::audit=info,tracelens_store=debug"
        );
    }

    #[test]
    fn default_directives() {
        assert_eq!(filter_directives(&LoggingSettings::default()), "info");
    }

    #[test]
    fn directives_parse_as_env_filter() {
        let mut settings = LoggingSettings::default();
        settings.modules.insert("tracelens_engine".into(), "trace".into());
        assert!(EnvFilter::try_new(filter_directives(&settings)).is_ok());
    }
}
