// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Logging setup.
//!
//! All library code logs through the `log` facade, mostly via the
//! context-tagged macros in [`wrapper`]. An embedder either installs its
//! own logger or calls one of the initialisers here:
//!
//! * [`init`] – `env_logger`, honouring `RUST_LOG`;
//! * [`init_with_config`] – `env_logger`, or a `slog` drain bridged from
//!   `log` when [`LoggingConfig::structured`] is set;
//! * [`init_from_config`] – reads `proxy.logging` and calls the above.

pub mod config;
pub mod structured;
pub mod wrapper;

#[cfg(test)]
pub mod test_logger;

#[cfg(test)]
mod tests;

pub use config::LoggingConfig;

use std::sync::Once;
use std::sync::atomic::{AtomicBool, Ordering};

use log::LevelFilter;
use once_cell::sync::OnceCell;
use slog_scope::GlobalLoggerGuard;

use crate::config::{Config, ConfigError};
use crate::info_fmt;

static INIT: Once = Once::new();
static USING_STRUCTURED: AtomicBool = AtomicBool::new(false);
static SLOG_GUARD: OnceCell<GlobalLoggerGuard> = OnceCell::new();

fn level_name(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Trace => "trace",
        LevelFilter::Debug => "debug",
        LevelFilter::Info => "info",
        LevelFilter::Warn => "warn",
        LevelFilter::Error => "error",
        LevelFilter::Off => "off",
    }
}

/// Install `env_logger` at `level` (default `info`) unless `RUST_LOG` says otherwise.
///
/// Only the first initialisation in a process takes effect.
pub fn init(level: Option<LevelFilter>) {
    INIT.call_once(|| {
        let env = env_logger::Env::default()
            .filter_or("RUST_LOG", level.map_or("info", level_name));

        // another logger may already be installed by the embedder
        if env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_target(true)
            .try_init()
            .is_ok()
        {
            info_fmt!("Logging", "initialized at level {}", log::max_level());
        }
    });
}

/// Initialise logging from a [`LoggingConfig`].
///
/// `level`, when given, overrides the configured level.
pub fn init_with_config(level: Option<LevelFilter>, config: &LoggingConfig) {
    let level = level.unwrap_or_else(|| config.level_filter());
    if !config.structured {
        init(Some(level));
        return;
    }

    INIT.call_once(|| {
        SLOG_GUARD.get_or_init(|| {
            let logger = structured::create_logger(&config.to_logger_config());
            slog_scope::set_global_logger(logger)
        });

        let bridged = level
            .to_level()
            .map_or(Ok(()), slog_stdlog::init_with_level);
        match bridged {
            Ok(()) => {
                USING_STRUCTURED.store(true, Ordering::SeqCst);
                info_fmt!("Logging", "structured {} logging at level {}", config.format, level);
            }
            Err(e) => eprintln!("structured logging not installed: {e}"),
        }
    });
}

/// Read `proxy.logging` and initialise logging from it.
pub fn init_from_config(config: &Config, level: Option<LevelFilter>) -> Result<(), ConfigError> {
    match config.get::<LoggingConfig>("proxy.logging")? {
        Some(logging) => init_with_config(level, &logging),
        None => init(level),
    }
    Ok(())
}

/// Whether log records are going to the `slog` drain.
pub fn is_structured_logging() -> bool {
    USING_STRUCTURED.load(Ordering::SeqCst)
}
