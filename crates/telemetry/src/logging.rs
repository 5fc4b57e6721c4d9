use serde::{Deserialize, Serialize};
use std::env;
use std::io;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable multi-line output
    #[default]
    Pretty,
    /// Single-line text output
    Compact,
    /// JSON lines for log shippers
    Json,
}

impl LogFormat {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "json" => Self::Json,
            "compact" => Self::Compact,
            _ => Self::Pretty,
        }
    }

    /// Read `LPR_LOG_FORMAT`, defaulting to pretty output
    pub fn from_env() -> Self {
        Self::parse(&env::var("LPR_LOG_FORMAT").unwrap_or_default())
    }
}

/// Configuration for structured logging
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Name attached to the start-up line (e.g. "lpr-pipeline")
    pub service_name: String,
    pub service_version: String,
    /// Site or deployment label (gate, car park, ...)
    pub site: Option<String>,
    /// Emit span open/close events
    pub enable_span_events: bool,
    /// Directory for daily-rolling JSON log files
    pub log_dir: Option<String>,
}

impl LogConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            format: LogFormat::from_env(),
            service_name: service_name.into(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            site: env::var("LPR_SITE").ok(),
            enable_span_events: env::var("LPR_LOG_SPAN_EVENTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
            log_dir: env::var("LPR_LOG_DIR").ok(),
        }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = version.into();
        self
    }

    pub fn with_site(mut self, site: impl Into<String>) -> Self {
        self.site = Some(site.into());
        self
    }

    pub fn with_span_events(mut self, enable: bool) -> Self {
        self.enable_span_events = enable;
        self
    }

    pub fn with_file_logging(mut self, log_dir: impl Into<String>) -> Self {
        self.log_dir = Some(log_dir.into());
        self
    }

    fn span_events(&self) -> FmtSpan {
        if self.enable_span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

fn env_filter() -> EnvFilter {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match "ort=warn".parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    }
}

/// Install the global subscriber.
///
/// When file logging is configured the returned guard must be held for the
/// lifetime of the process, otherwise buffered lines are lost on exit.
pub fn init_structured_logging(config: LogConfig) -> Option<WorkerGuard> {
    let span_events = config.span_events();

    let stdout_layer = match config.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_span_events(span_events.clone())
            .with_current_span(true)
            .with_target(true)
            .with_thread_names(true)
            .with_writer(io::stdout)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_span_events(span_events.clone())
            .with_target(true)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_span_events(span_events.clone())
            .with_target(true)
            .with_line_number(true)
            .boxed(),
    };

    let (file_layer, guard) = match config.log_dir.as_deref() {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "lpr.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_span_events(span_events)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(env_filter())
        .with(stdout_layer)
        .with(file_layer)
        .try_init();

    if installed.is_ok() {
        tracing::info!(
            service.name = %config.service_name,
            service.version = %config.service_version,
            site = ?config.site,
            format = ?config.format,
            "structured logging initialized"
        );
    }

    guard
}

/// Initialize logging for a named binary with environment-driven defaults
pub fn init_with_service(service_name: impl Into<String>) -> Option<WorkerGuard> {
    init_structured_logging(LogConfig::new(service_name))
}
