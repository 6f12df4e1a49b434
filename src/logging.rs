//! Tracing setup.
//!
//! Level comes from `LOG_LEVEL` (case-insensitive; `warning` accepted as an
//! alias for `warn`; full `EnvFilter` directives also work), falling back to
//! the config file's `log.level`, then `info`. If `log.file` is set, logs go
//! to both stdout and a daily-rolling file. The filter is installed behind a
//! reload layer so a config reload can change the level without a restart.

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

static RELOAD_HANDLE: OnceCell<tracing_subscriber::reload::Handle<EnvFilter, Registry>> =
    OnceCell::new();

/// Resolve the effective filter directive string.
pub fn resolve_level(config_level: Option<&str>) -> String {
    let raw = std::env::var("LOG_LEVEL")
        .ok()
        .filter(|s| !s.is_empty())
        .or_else(|| config_level.map(str::to_string))
        .unwrap_or_else(|| "info".to_string());
    normalize_level(&raw)
}

fn normalize_level(raw: &str) -> String {
    match raw.to_ascii_lowercase().as_str() {
        "debug" => "debug".to_string(),
        "info" => "info".to_string(),
        "warn" | "warning" => "warn".to_string(),
        "error" => "error".to_string(),
        // Anything else is passed through as an EnvFilter directive string.
        other => other.to_string(),
    }
}

/// Install the global subscriber. Returns the non-blocking writer guard when
/// a log file is in use — the caller must keep it alive for the life of the
/// process or buffered lines are lost on exit.
pub fn init(
    level: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, handle) = tracing_subscriber::reload::Layer::new(filter);
    let _ = RELOAD_HANDLE.set(handle);

    let mut guard = None;
    let file_layer = log_file.and_then(|path| {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("navigator.log"));
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — logging to stdout only",
                dir.display()
            );
            return None;
        }
        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, g) = tracing_appender::non_blocking(appender);
        guard = Some(g);
        Some(tracing_subscriber::fmt::layer().with_writer(non_blocking))
    });

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer().compact())
        .with(file_layer)
        .init();

    guard
}

/// Swap the active level filter; used by the reload path. A bad directive is
/// logged and the previous filter stays in place.
pub fn set_level(level: &str) {
    let Some(handle) = RELOAD_HANDLE.get() else {
        return;
    };
    match EnvFilter::try_new(normalize_level(level)) {
        Ok(filter) => {
            if let Err(e) = handle.reload(filter) {
                tracing::warn!(err = %e, "failed to install new log filter");
            }
        }
        Err(e) => tracing::warn!(level = %level, err = %e, "invalid log level — keeping current"),
    }
}
