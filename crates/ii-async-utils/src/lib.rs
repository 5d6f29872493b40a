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

//! Small async helpers shared across the proxy: cooperative shutdown
//! ([`halthandle`]), future timeouts, and a panic hook that brings the whole
//! process down instead of silently losing a task.

pub mod halthandle;

pub use halthandle::{HaltError, HaltHandle, TaskMsg, Trigger, Tripwire};

use std::future::Future;
use std::panic;
use std::process;
use std::time::Duration;

use ii_logging::macros::*;
use tokio::time::{error::Elapsed, Timeout};

/// Adds [`timeout`](FutureExt::timeout) to every future.
pub trait FutureExt: Future + Sized {
    /// Bound how long this future is allowed to run.
    fn timeout(self, duration: Duration) -> Timeout<Self> {
        tokio::time::timeout(duration, self)
    }
}

impl<F: Future> FutureExt for F {}

/// Re-exported so callers matching on a timed-out future don't need a
/// direct `tokio` dependency just for this type.
pub type TimeoutError = Elapsed;

/// Install a panic hook that logs the panic through the shared logger and
/// then aborts the process.
///
/// Tokio tasks that panic are, by default, silently dropped: the rest of
/// the process keeps running with one fewer worker, which for a proxy
/// means a connection quietly stops being serviced. Call this once, near
/// the top of `main()`, so a bug anywhere in the pipeline surfaces loudly.
pub fn setup_panic_handling() {
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        crit!("panic: {}", panic_info);
        default_hook(panic_info);
        process::exit(101);
    }));
}
