// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common facilities for background tasks

use futures::future::BoxFuture;
use slog::Logger;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::Notify;

/// An operation activated both periodically and by other parts of the
/// controller
///
/// Activations of one task never overlap.  Whatever the task wants to report
/// about an activation goes in the returned JSON value, which the driver
/// keeps as the task's last result.
pub trait BackgroundTask: Send + Sync {
    fn activate<'a>(
        &'a mut self,
        log: &'a Logger,
    ) -> BoxFuture<'a, serde_json::Value>;
}

/// Name of a registered background task
#[derive(Clone, Debug, Ord, PartialOrd, PartialEq, Eq)]
pub struct TaskName(String);

impl TaskName {
    pub(crate) fn new(name: impl Into<String>) -> TaskName {
        TaskName(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Activates a background task from outside the driver
///
/// An `Activator` is created before its task is registered, so that the
/// parts of the controller that need to wake a task up can be given one
/// without having to know about the driver.  Each activator is wired up to
/// exactly one task.
pub struct Activator {
    pub(crate) notify: Arc<Notify>,
    pub(crate) wired_up: AtomicBool,
}

impl Activator {
    pub fn new() -> Activator {
        Activator {
            notify: Arc::new(Notify::new()),
            wired_up: AtomicBool::new(false),
        }
    }

    /// Activates the task
    ///
    /// If the task is running, it runs again once the current activation
    /// completes.  Activations requested while one is already pending are
    /// collapsed into that one.
    pub fn activate(&self) {
        self.notify.notify_one();
    }

    /// Marks this activator as used by a task, returning false if it
    /// already was
    pub(crate) fn wire_up(&self) -> bool {
        self.wired_up
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl Default for Activator {
    fn default() -> Self {
        Activator::new()
    }
}
