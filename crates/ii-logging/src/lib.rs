// Copyright (C) 2024  dbgp-proxy contributors
//
// This file is part of dbgp-proxy.
//
// dbgp-proxy is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Logging boilerplate and configuration
//!
//! This crate smooths over a few things `slog` and `slog_async` leave to the
//! application:
//! - A global shared `Logger` instance backed by `slog_async`
//! - Runtime configuration of the global instance
//! - Logging macros that operate on the shared instance
//! - Flushing of logs on application exit
//!
//! It also re-exports `slog` so dependent crates only need one logging
//! dependency.
//!
//! The global instance is created lazily, on first use, via `lazy_static`.
//! Once created it cannot be reconfigured from scratch (though its level and
//! target can still be adjusted). Configure it with `set_logger_config()` or
//! one of `setup()` / `setup_for_app()` before anything logs.
//!
//! The global logger also applies `slog_envlogger` filters from the
//! `RUST_LOG` environment variable, when set and non-empty; otherwise the
//! configured `Level` is used.
//!
//! If nothing configures the logger before first use, it defaults to
//! `LoggingConfig::for_testing()`, since Rust's test harness has no common
//! setup/teardown hook to rely on instead.

use std::env;
use std::fmt;
use std::fs::OpenOptions;
use std::mem;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex, MutexGuard,
};

use lazy_static::lazy_static;
use slog::{o, Discard, Drain, FilterLevel, Logger};
use slog_async::{Async, AsyncGuard};
use slog_envlogger::EnvLogger;
use slog_term;

pub use slog;
pub use slog::Level;

/// Where the logger writes its output.
#[derive(Clone, Debug)]
pub enum LoggingTarget {
    Stderr,
    Stdout,
    File(PathBuf),
    /// Discard everything.
    None,
}

/// Runtime-configurable logger setup.
#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub target: LoggingTarget,
    /// Default level; overridden by `RUST_LOG` when it's set and non-empty.
    pub level: Level,
    /// Channel size for the async drain; larger values tolerate bursts
    /// without dropping records.
    pub drain_channel_size: usize,
}

impl LoggingConfig {
    pub const ASYNC_LOGGER_DRAIN_CHANNEL_SIZE: usize = 128;

    /// Suitable for test harnesses: logs to a temp file instead of polluting
    /// the terminal.
    pub fn for_testing() -> Self {
        Self {
            target: LoggingTarget::File(env::temp_dir().join("dbgp-proxy-test-log.txt")),
            level: Level::Trace,
            drain_channel_size: Self::ASYNC_LOGGER_DRAIN_CHANNEL_SIZE,
        }
    }

    /// Default setup for the standalone binary. `Debug` in debug builds,
    /// `Info` in release builds.
    pub fn for_app(drain_channel_size: usize) -> Self {
        Self {
            target: LoggingTarget::Stderr,
            level: if cfg!(debug_assertions) {
                Level::Debug
            } else {
                Level::Info
            },
            drain_channel_size,
        }
    }

    pub fn no_logging() -> Self {
        Self {
            target: LoggingTarget::None,
            level: Level::Error,
            drain_channel_size: Self::ASYNC_LOGGER_DRAIN_CHANNEL_SIZE,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self::for_testing()
    }
}

#[inline(always)]
fn lock_logger_config() -> MutexGuard<'static, Option<LoggingConfig>> {
    LOGGER_CONFIG.lock().expect("logger config mutex poisoned")
}

/// Replace the pending logger configuration, returning the previous one.
///
/// # Panics
/// Panics if `LOGGER` has already been instantiated.
pub fn set_logger_config(config: LoggingConfig) -> LoggingConfig {
    lock_logger_config()
        .replace(config)
        .expect("LOGGER already instantiated, configuration is frozen")
}

/// Configure the logger and return its `FlushGuard`.
///
/// # Panics
/// Panics if `LOGGER` has already been instantiated.
pub fn setup(config: LoggingConfig) -> FlushGuard {
    set_logger_config(config);
    LOGGER.take_guard()
}

/// Configure the logger for application use (`main()`) and return a
/// `FlushGuard` that must be kept alive for the duration of the program.
pub fn setup_for_app(drain_channel_size: usize) -> FlushGuard {
    setup(LoggingConfig::for_app(drain_channel_size))
}

/// Idempotent logging setup for integration tests. Safe to call from
/// multiple test threads; only the first call takes effect.
///
/// `RUST_LOG`, if present, must be valid; `Debug` is assumed otherwise.
pub fn init_test_logging() -> Option<FlushGuard> {
    static INITIALIZED: AtomicBool = AtomicBool::new(false);

    if INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        Some(setup_for_app(LoggingConfig::ASYNC_LOGGER_DRAIN_CHANNEL_SIZE))
    } else {
        None
    }
}

fn build_envlogger_from_filters<D: Drain>(drain: D, filters: &str) -> EnvLogger<D> {
    let builder = slog_envlogger::LogBuilder::new(drain);
    builder.parse(filters).build()
}

fn build_envlogger<D: Drain>(drain: D, default_level: Level) -> EnvLogger<D> {
    let rust_log_result = env::var("RUST_LOG");
    let filters: &str = match rust_log_result {
        Ok(ref rust_log) if !rust_log.is_empty() => rust_log.as_str(),
        _ => default_level.as_short_str(),
    };
    build_envlogger_from_filters(drain, filters)
}

fn get_terminal_drain(stderr: bool) -> impl Drain<Ok = (), Err = impl fmt::Debug> {
    let builder = slog_term::TermDecorator::new();
    let builder = if stderr {
        builder.stderr()
    } else {
        builder.stdout()
    };
    let terminal_decorator = builder.build();
    slog_term::FullFormat::new(terminal_decorator).build()
}

fn get_file_drain(path: &Path) -> impl Drain<Ok = (), Err = impl fmt::Debug> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(true)
        .truncate(false)
        .open(path)
        .unwrap_or_else(|e| {
            panic!(
                "logging setup error: could not open `{}` for logging: {}",
                path.display(),
                e
            )
        });

    let file_decorator = slog_term::PlainDecorator::new(file);
    slog_term::FullFormat::new(file_decorator).build()
}

/// RAII guard that flushes the async logger when dropped. Hold this for the
/// lifetime of `main()`.
#[must_use = "dropping FlushGuard flushes and stops the associated logger"]
pub struct FlushGuard(Option<AsyncGuard>);

/// Holds the `Logger` instance plus the machinery to swap its drain at
/// runtime (used by `set_filter_level`/`set_filters`) and a `FlushGuard`
/// that can be taken out once.
pub struct GuardedLogger {
    pub logger: Logger,
    drain_switch_ctrl: Option<slog_atomic::AtomicSwitchCtrl>,
    guard: Mutex<FlushGuard>,
    current_config: LoggingConfig,
}

impl GuardedLogger {
    #[inline]
    fn drain_switch_ctrl(&self) -> &slog_atomic::AtomicSwitchCtrl {
        self.drain_switch_ctrl
            .as_ref()
            .expect("drain switch not present")
    }

    fn switch_drain<D, E>(&self, drain: D, filters: Option<String>) -> FlushGuard
    where
        D: Drain<Ok = (), Err = E> + Send + 'static,
        E: fmt::Debug,
    {
        let (drain, guard) = Async::new(drain.fuse())
            .chan_size(self.current_config.drain_channel_size)
            .build_with_guard();
        match filters {
            Some(filters) => {
                let filtered_drain = build_envlogger_from_filters(drain, filters.as_str());
                self.drain_switch_ctrl()
                    .set(Mutex::new(filtered_drain.fuse()).fuse())
            }
            None => {
                let filtered_drain = drain.filter_level(self.current_config.level);
                self.drain_switch_ctrl().set(filtered_drain.fuse());
            }
        };

        FlushGuard(Some(guard))
    }

    pub fn set_config(&mut self, config: LoggingConfig) -> FlushGuard {
        self.current_config = config;
        self.switch_target(None)
    }

    /// Adjust the level; `FilterLevel::Off` discards everything.
    pub fn set_filter_level(&mut self, filter_level: FilterLevel) -> FlushGuard {
        match filter_level {
            FilterLevel::Off => self.current_config.target = LoggingTarget::None,
            level => {
                self.current_config.level = Level::from_usize(level.as_usize())
                    .expect("slog::FilterLevel <-> slog::Level conversion failed")
            }
        };
        self.switch_target(None)
    }

    pub fn set_filters(&self, filters: String) -> FlushGuard {
        self.switch_target(Some(filters))
    }

    fn switch_target(&self, filters: Option<String>) -> FlushGuard {
        use LoggingTarget::*;

        match &self.current_config.target {
            None => self.switch_drain(Discard, filters),
            Stderr => self.switch_drain(get_terminal_drain(true), filters),
            Stdout => self.switch_drain(get_terminal_drain(false), filters),
            File(path) => self.switch_drain(get_file_drain(path), filters),
        }
    }

    fn new(config: &LoggingConfig) -> Self {
        use LoggingTarget::*;

        match &config.target {
            None => Self::with_discard(),
            Stderr => Self::with_drain(config, get_terminal_drain(true)),
            Stdout => Self::with_drain(config, get_terminal_drain(false)),
            File(path) => Self::with_drain(config, get_file_drain(path)),
        }
    }

    fn with_drain<D, E>(config: &LoggingConfig, drain: D) -> Self
    where
        D: Drain<Ok = (), Err = E> + Send + 'static,
        E: fmt::Debug,
    {
        let drain = build_envlogger(drain, config.level);
        let (drain, guard) = Async::new(drain.fuse())
            .chan_size(config.drain_channel_size)
            .build_with_guard();
        let drain_switch = slog_atomic::AtomicSwitch::new(drain.fuse());
        let drain_switch_ctrl = Some(drain_switch.ctrl());
        Self {
            logger: Logger::root(drain_switch, o!()),
            drain_switch_ctrl,
            guard: Mutex::new(FlushGuard(Some(guard))),
            current_config: config.clone(),
        }
    }

    fn with_discard() -> Self {
        Self {
            logger: Logger::root(Discard, o!()),
            drain_switch_ctrl: None,
            guard: Mutex::new(FlushGuard(None)),
            current_config: LoggingConfig::no_logging(),
        }
    }

    /// Take the `FlushGuard`. Returns an empty guard if already taken.
    pub fn take_guard(&self) -> FlushGuard {
        let mut locker = self.guard.lock().expect("GuardedLogger mutex poisoned");
        mem::replace(&mut *locker, FlushGuard(None))
    }

    /// Take and drop the guard immediately, flushing the logger.
    ///
    /// Has no effect if the guard was already taken and dropped elsewhere.
    pub fn flush(&self) {
        drop(self.take_guard());
    }
}

impl Deref for GuardedLogger {
    type Target = Logger;

    fn deref(&self) -> &Logger {
        &self.logger
    }
}

lazy_static! {
    static ref LOGGER_CONFIG: Mutex<Option<LoggingConfig>> = Mutex::new(Some(LoggingConfig::default()));

    /// Global logger instance, shared across the whole process.
    pub static ref LOGGER: GuardedLogger = {
        let mut config_lock = lock_logger_config();
        let config = config_lock
            .take()
            .expect("LOGGER_CONFIG empty during LOGGER initialization");

        GuardedLogger::new(&config)
    };
}

#[macro_export]
macro_rules! crit(
    (#$tag:expr, $($args:tt)+) => {
        $crate::slog::slog_log!($crate::LOGGER, $crate::Level::Critical, $tag, $($args)+)
    };
    ($($args:tt)+) => {
        $crate::slog::slog_log!($crate::LOGGER, $crate::Level::Critical, "", $($args)+)
    };
);

#[macro_export]
macro_rules! error(
    (#$tag:expr, $($args:tt)+) => {
        $crate::slog::slog_log!($crate::LOGGER, $crate::Level::Error, $tag, $($args)+)
    };
    ($($args:tt)+) => {
        $crate::slog::slog_log!($crate::LOGGER, $crate::Level::Error, "", $($args)+)
    };
);

#[macro_export]
macro_rules! warn(
    (#$tag:expr, $($args:tt)+) => {
        $crate::slog::slog_log!($crate::LOGGER, $crate::Level::Warning, $tag, $($args)+)
    };
    ($($args:tt)+) => {
        $crate::slog::slog_log!($crate::LOGGER, $crate::Level::Warning, "", $($args)+)
    };
);

#[macro_export]
macro_rules! info(
    (#$tag:expr, $($args:tt)*) => {
        $crate::slog::slog_log!($crate::LOGGER, $crate::Level::Info, $tag, $($args)*)
    };
    ($($args:tt)*) => {
        $crate::slog::slog_log!($crate::LOGGER, $crate::Level::Info, "", $($args)*)
    };
);

#[macro_export]
macro_rules! debug(
    (#$tag:expr, $($args:tt)+) => {
        $crate::slog::slog_log!($crate::LOGGER, $crate::Level::Debug, $tag, $($args)+)
    };
    ($($args:tt)+) => {
        $crate::slog::slog_log!($crate::LOGGER, $crate::Level::Debug, "", $($args)+)
    };
);

#[macro_export]
macro_rules! trace(
    (#$tag:expr, $($args:tt)+) => {
        $crate::slog::slog_log!($crate::LOGGER, $crate::Level::Trace, $tag, $($args)+)
    };
    ($($args:tt)+) => {
        $crate::slog::slog_log!($crate::LOGGER, $crate::Level::Trace, "", $($args)+)
    };
);

/// Re-exports all logging macros for `use ii_logging::macros::*;`.
pub mod macros {
    pub use super::{crit, debug, error, info, trace, warn};
}

/// Parses the `-l`/`--log-level` CLI value into a `slog::Level`.
pub fn parse_level(name: &str) -> Option<Level> {
    match name.to_ascii_uppercase().as_str() {
        "CRITICAL" => Some(Level::Critical),
        "ERROR" => Some(Level::Error),
        "WARN" | "WARNING" => Some(Level::Warning),
        "INFO" => Some(Level::Info),
        "DEBUG" => Some(Level::Debug),
        "TRACE" => Some(Level::Trace),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_levels() {
        assert_eq!(parse_level("info"), Some(Level::Info));
        assert_eq!(parse_level("DEBUG"), Some(Level::Debug));
        assert_eq!(parse_level("bogus"), None);
    }
}
