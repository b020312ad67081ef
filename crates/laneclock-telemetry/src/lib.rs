mod logging;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "laneclock_server" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Where to persist warn+ logs. `None` disables persistence.
    pub log_db_path: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
            log_db_path: None,
        }
    }
}

impl TelemetryConfig {
    /// Defaults plus `LANECLOCK_LOG_LEVEL`, `LANECLOCK_LOG_MODULES`,
    /// `LANECLOCK_LOG_DB` and `LANECLOCK_LOG_JSON`. Unparseable values are
    /// reported on stderr and skipped, since logging is not up yet.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(level) = lookup("LANECLOCK_LOG_LEVEL") {
            match Level::from_str(&level) {
                Ok(level) => config.log_level = level,
                Err(_) => eprintln!("laneclock-telemetry: ignoring LANECLOCK_LOG_LEVEL={level}"),
            }
        }
        if let Some(modules) = lookup("LANECLOCK_LOG_MODULES") {
            for spec in modules.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                match parse_module_level(spec) {
                    Ok(pair) => config.module_levels.push(pair),
                    Err(e) => eprintln!("laneclock-telemetry: {e}"),
                }
            }
        }
        if let Some(path) = lookup("LANECLOCK_LOG_DB").filter(|p| !p.is_empty()) {
            config.log_db_path = Some(PathBuf::from(path));
        }
        if let Some(flag) = lookup("LANECLOCK_LOG_JSON") {
            config.json = matches!(flag.as_str(), "1" | "true" | "yes");
        }
        config
    }

    /// EnvFilter directive string built from the level and overrides.
    pub fn filter_directives(&self) -> String {
        let mut filter_str = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter_str
    }
}

/// Parse a `module=level` override, e.g. `laneclock_server=debug`.
pub fn parse_module_level(spec: &str) -> Result<(String, Level), String> {
    let (module, level) = spec
        .split_once('=')
        .ok_or_else(|| format!("expected module=level, got {spec:?}"))?;
    let module = module.trim();
    if module.is_empty() {
        return Err(format!("missing module name in {spec:?}"));
    }
    let level = Level::from_str(level.trim()).map_err(|_| format!("unknown log level in {spec:?}"))?;
    Ok((module.to_string(), level))
}

/// Keeps the persistent log sink reachable after init.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
}

impl TelemetryGuard {
    /// The persisted-log store, when `log_db_path` was set and opened.
    pub fn logs(&self) -> Option<Arc<SqliteLogSink>> {
        self.log_sink.clone()
    }
}

/// Initialize logging. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    let (sqlite_layer, sqlite_sink) = match &config.log_db_path {
        Some(path) => match SqliteLogSink::new(path) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                (Some(SqliteLogLayer::new(sink.clone())), Some(sink))
            }
            Err(e) => {
                eprintln!("laneclock-telemetry: failed to open log DB: {e}");
                (None, None)
            }
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sqlite_layer)
        .init();

    TelemetryGuard { log_sink: sqlite_sink }
}
