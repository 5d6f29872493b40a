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

//! Cooperative shutdown primitives.
//!
//! A [`Trigger`]/[`Tripwire`] pair is a one-shot broadcast: firing the
//! `Trigger` resolves every clone of the `Tripwire`, including ones taken
//! out after the fire. [`HaltHandle`] builds on top of that to track a set
//! of named background tasks, fire their tripwire on `halt()`, and join them
//! within a bounded timeout.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::error::Elapsed;

use ii_logging::macros::*;

/// Fires the associated [`Tripwire`](s). Dropping the trigger without
/// calling [`fire`](Trigger::fire) also trips the wire, so tasks don't hang
/// forever if the handle holding the trigger is dropped.
pub struct Trigger(Option<watch::Sender<bool>>);

impl Trigger {
    fn new(sender: watch::Sender<bool>) -> Self {
        Self(Some(sender))
    }

    /// Trip all wires derived from this trigger.
    pub fn fire(mut self) {
        if let Some(sender) = self.0.take() {
            let _ = sender.send(true);
        }
    }
}

impl Drop for Trigger {
    fn drop(&mut self) {
        if let Some(sender) = self.0.take() {
            let _ = sender.send(true);
        }
    }
}

/// A future that resolves once the matching [`Trigger`] fires (or is
/// dropped). Cheaply cloneable; every clone observes the same event.
#[derive(Clone)]
pub struct Tripwire(watch::Receiver<bool>);

impl Tripwire {
    /// Create a fresh, independent `Trigger`/`Tripwire` pair.
    pub fn new() -> (Trigger, Self) {
        let (tx, rx) = watch::channel(false);
        (Trigger::new(tx), Self(rx))
    }

    /// True if the trigger has already fired.
    pub fn is_tripped(&self) -> bool {
        *self.0.borrow()
    }

    /// Wait for the trigger to fire.
    pub async fn tripped(&mut self) {
        if *self.0.borrow() {
            return;
        }
        // `changed()` only errors if every Sender was dropped without a
        // final send, which `Trigger`'s Drop impl prevents.
        let _ = self.0.changed().await;
    }
}

impl Future for Tripwire {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if *self.0.borrow() {
            return Poll::Ready(());
        }
        let changed = self.0.changed();
        tokio::pin!(changed);
        match changed.poll(cx) {
            Poll::Ready(_) => Poll::Ready(()),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Error returned by [`HaltHandle::halt`] when tasks don't finish within the
/// configured timeout.
#[derive(Debug, thiserror::Error)]
pub enum HaltError {
    #[error("{0} task(s) did not halt within the timeout")]
    Timeout(usize),
    #[error("task `{name}` panicked during shutdown")]
    TaskPanicked { name: &'static str },
}

impl From<Elapsed> for HaltError {
    fn from(_: Elapsed) -> Self {
        HaltError::Timeout(0)
    }
}

/// A message a managed task can send back while it runs; currently used
/// only to label log lines, reserved for richer status reporting.
#[derive(Debug, Clone)]
pub struct TaskMsg {
    pub name: &'static str,
}

impl fmt::Display for TaskMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

struct Managed {
    name: &'static str,
    handle: JoinHandle<()>,
}

/// Coordinates shutdown of a set of spawned tasks.
///
/// Clone and hand a [`Tripwire`] (via [`subscribe`](HaltHandle::subscribe))
/// to each long-running task; have the task `select!` on it alongside its
/// normal work and return when it trips. Call [`halt`](HaltHandle::halt)
/// once, typically from a SIGTERM/SIGINT handler, to fire the tripwire for
/// everyone and wait for all registered tasks to finish.
pub struct HaltHandle {
    trigger: Mutex<Option<Trigger>>,
    tripwire: Tripwire,
    tasks: Mutex<Vec<Managed>>,
}

impl HaltHandle {
    /// Construct a new handle, wrapped in an `Arc` since it's normally
    /// shared between the main task and every spawned worker.
    pub fn arc() -> Arc<Self> {
        let (trigger, tripwire) = Tripwire::new();
        Arc::new(Self {
            trigger: Mutex::new(Some(trigger)),
            tripwire,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Get a tripwire that resolves when [`halt`](HaltHandle::halt) is
    /// called.
    pub fn subscribe(&self) -> Tripwire {
        self.tripwire.clone()
    }

    /// Spawn a future as a managed task, tracked for joining on halt.
    ///
    /// The future is responsible for observing its own tripwire (e.g. via
    /// `tokio::select!` against [`subscribe`](HaltHandle::subscribe)) and
    /// returning promptly once tripped; `HaltHandle` itself only waits for
    /// the task to finish, it doesn't abort it.
    pub fn spawn<F>(self: &Arc<Self>, name: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        self.tasks
            .lock()
            .expect("HaltHandle task list mutex poisoned")
            .push(Managed { name, handle });
    }

    /// Fire the shared tripwire and wait (up to `timeout`) for every
    /// managed task spawned via [`spawn`](HaltHandle::spawn) to finish.
    pub async fn halt(self: Arc<Self>, timeout: Duration) -> Result<(), HaltError> {
        if let Some(trigger) = self
            .trigger
            .lock()
            .expect("HaltHandle trigger mutex poisoned")
            .take()
        {
            trigger.fire();
        }

        let tasks = std::mem::take(
            &mut *self.tasks.lock().expect("HaltHandle task list mutex poisoned"),
        );
        let deadline = tokio::time::Instant::now() + timeout;
        let mut unfinished = 0;

        for managed in tasks {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, managed.handle).await {
                Ok(Ok(())) => debug!("task `{}` halted cleanly", managed.name),
                Ok(Err(join_err)) if join_err.is_panic() => {
                    error!("task `{}` panicked during shutdown", managed.name);
                    return Err(HaltError::TaskPanicked { name: managed.name });
                }
                Ok(Err(_)) => {
                    // cancelled, treat as clean halt
                }
                Err(_) => {
                    warn!("task `{}` did not halt within the timeout", managed.name);
                    unfinished += 1;
                }
            }
        }

        if unfinished > 0 {
            Err(HaltError::Timeout(unfinished))
        } else {
            Ok(())
        }
    }
}
