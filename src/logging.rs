//! Logging setup
//!
//! The crate logs through the `log` facade. Applications that do not bring
//! their own logger can call [`init`] to install `env_logger` with the
//! configured default filter; `RUST_LOG` still takes precedence.

use log::{debug, LevelFilter};

use crate::config::LoggingConfig;

/// Parses a configured level name, falling back to `Info`
pub fn level_filter(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" | "warning" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

/// Installs `env_logger` as the global logger.
///
/// Returns `false` if a logger was already installed; records then keep
/// going to that logger.
pub fn init(config: &LoggingConfig) -> bool {
    let default_filter = level_filter(&config.level).to_string().to_lowercase();
    let installed = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter),
    )
    .try_init()
    .is_ok();

    if installed {
        debug!("📝 Logging initialized at {}", config.level);
    }
    installed
}
