//! Ambient logging setup (`spec.md` §2 item 12, §6 `logging.*` keys).

use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};

/// Initializes the global `tracing` subscriber from `logging.log_level`.
/// Modules listed in `verbose_modules` are forced to `debug` regardless of
/// the global level, mirroring the original's per-module logger overrides.
pub fn init(config: &LoggingConfig) {
    let mut filter = EnvFilter::new(config.log_level.as_env_filter_directive());
    for module in &config.verbose_modules {
        if let Ok(directive) = format!("{module}=debug").parse() {
            filter = filter.add_directive(directive);
        }
    }

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let _ = match config.log_format {
        LogFormat::Compact => subscriber.compact().try_init(),
        LogFormat::Json => subscriber.json().try_init(),
    };
}
