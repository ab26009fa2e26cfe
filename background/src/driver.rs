// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Manages execution of background tasks

use crate::interfaces::CoordinationStore;
use crate::Activator;
use crate::BackgroundTask;
use crate::TaskName;
use assert_matches::assert_matches;
use chrono::Utc;
use fleet_types::background::ActivationReason;
use fleet_types::background::CurrentStatus;
use fleet_types::background::CurrentStatusRunning;
use fleet_types::background::LastResult;
use fleet_types::background::LastResultCompleted;
use fleet_types::background::TaskStatus;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::FutureExt;
use futures::StreamExt;
use serde_json::json;
use slog::debug;
use slog::o;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use tokio::sync::watch;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

/// Drives the execution of background tasks
///
/// A controller has only one Driver.  All background tasks are registered
/// with it at startup.  The Driver runs each background task in a separate
/// tokio task and provides interfaces for monitoring the high-level state of
/// each task (e.g., when it last ran, whether it's currently running, etc.).
pub struct Driver {
    log: Logger,
    lease: Option<TaskLease>,
    tasks: BTreeMap<TaskName, Task>,
}

/// Lease each activation must hold in the coordination store
///
/// Several controllers may run the same tasks.  Before each activation the
/// driver takes the lock named after the task, and skips the activation if
/// another controller holds it.  The lock is renewed every half `ttl` for as
/// long as the activation runs.
#[derive(Clone)]
pub struct TaskLease {
    pub store: Arc<dyn CoordinationStore>,
    /// identifies this controller as the lock owner
    pub owner: Uuid,
    /// how long a lease lasts if it is not released
    pub ttl: Duration,
}

/// Everything needed to register a background task
pub struct TaskDefinition<'a> {
    /// unique name of the task
    pub name: &'static str,
    /// what this task does (for developers)
    pub description: &'static str,
    /// how often the task is activated when nothing else activates it
    pub period: Duration,
    /// the work of the task
    pub task_impl: Box<dyn BackgroundTask>,
    /// watch channels whose changes activate the task
    pub watchers: Vec<Box<dyn GenericWatcher>>,
    /// used by other parts of the controller to activate the task
    pub activator: &'a Activator,
}

/// Driver-side state of a background task
struct Task {
    /// what this task does (for developers)
    description: String,
    /// configured period of the task
    period: Duration,
    /// channel used to receive updates from the background task's tokio task
    /// about what the background task is doing
    status: watch::Receiver<TaskStatus>,
    /// join handle for the tokio task that's executing this background task
    tokio_task: tokio::task::JoinHandle<()>,
    /// `Notify` used to wake up the tokio task when a caller explicitly wants
    /// to activate the background task
    notify: Arc<Notify>,
}

impl Driver {
    /// Returns a driver whose tasks run without taking any lock
    pub fn new(log: &Logger) -> Driver {
        Driver { log: log.clone(), lease: None, tasks: BTreeMap::new() }
    }

    /// Returns a driver whose tasks only run while holding `lease`
    pub fn with_lease(log: &Logger, lease: TaskLease) -> Driver {
        Driver { log: log.clone(), lease: Some(lease), tasks: BTreeMap::new() }
    }

    /// Register a new background task
    ///
    /// The task is activated once right away, then whenever it has not run
    /// for `period`, whenever one of its `watchers` sees a change, and
    /// whenever someone calls [`Activator::activate()`] on its activator.
    ///
    /// This function panics if the name conflicts with that of a
    /// previously-registered task, or if the activator is already wired up
    /// to another task.
    pub fn register(&mut self, taskdef: TaskDefinition<'_>) -> TaskName {
        let name = taskdef.name;

        // Activation of the background task happens in a separate tokio task.
        // Set up a channel so that tokio task can report status back to us.
        let (status_tx, status_rx) = watch::channel(TaskStatus {
            current: CurrentStatus::Idle,
            last: LastResult::NeverCompleted,
        });

        if !taskdef.activator.wire_up() {
            panic!(
                "attempted to wire up the same background task activator \
                twice: currently attempting to wire it up to task {:?}",
                name
            );
        }
        let notify = Arc::clone(&taskdef.activator.notify);

        let log = self.log.new(o!("background_task" => name));
        let task_exec = TaskExec {
            name: TaskName::new(name),
            period: taskdef.period,
            imp: taskdef.task_impl,
            notify: Arc::clone(&notify),
            log,
            lease: self.lease.clone(),
            status_tx,
            iteration: 0,
        };
        let tokio_task = tokio::task::spawn(task_exec.run(taskdef.watchers));

        let task = Task {
            description: taskdef.description.to_owned(),
            period: taskdef.period,
            status: status_rx,
            tokio_task,
            notify,
        };
        if self.tasks.insert(TaskName::new(name), task).is_some() {
            panic!("started two background tasks called {:?}", name);
        }

        TaskName::new(name)
    }

    /// Enumerate all registered background tasks
    pub fn tasks(&self) -> impl Iterator<Item = &TaskName> {
        self.tasks.keys()
    }

    fn task_required(&self, task: &TaskName) -> &Task {
        self.tasks.get(task).unwrap_or_else(|| {
            panic!("attempted to get non-existent background task: {:?}", task)
        })
    }

    /// Returns a summary of what this task does (for developers)
    pub fn task_description(&self, task: &TaskName) -> &str {
        &self.task_required(task).description
    }

    /// Returns the configured period of the task
    pub fn task_period(&self, task: &TaskName) -> Duration {
        self.task_required(task).period
    }

    /// Activate the specified background task
    ///
    /// If the task is currently running, it will be activated again when it
    /// finishes.
    pub fn activate(&self, task: &TaskName) {
        self.task_required(task).notify.notify_one();
    }

    /// Returns the runtime status of the background task
    pub fn task_status(&self, task: &TaskName) -> TaskStatus {
        // Borrowing from a watch channel's receiver blocks the sender.  Clone
        // the status to avoid an errant caller gumming up the works by hanging
        // on to a reference.
        self.task_required(task).status.borrow().clone()
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        // When the driver is dropped, terminate all tokio tasks that were used
        // to run background tasks.
        for (_, t) in &self.tasks {
            t.tokio_task.abort();
        }
    }
}

/// Encapsulates state needed by the background tokio task to manage activation
/// of the background task
struct TaskExec {
    name: TaskName,
    /// how often the background task should be activated
    period: Duration,
    /// impl of the background task
    imp: Box<dyn BackgroundTask>,
    /// used to receive notifications from the Driver that someone has requested
    /// explicit activation
    notify: Arc<Notify>,
    /// passed through to the background task impl when activated
    log: Logger,
    lease: Option<TaskLease>,
    /// used to send current status back to the Driver
    status_tx: watch::Sender<TaskStatus>,
    /// counts iterations of the task, for debuggability
    iteration: u64,
}

impl TaskExec {
    /// Body of the tokio task that manages activation of this background task
    async fn run(mut self, mut deps: Vec<Box<dyn GenericWatcher>>) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Wait for either the timeout to elapse, or an explicit activation
        // signal, or for one of our dependencies ("watch" channels) to
        // trigger an activation.
        loop {
            let mut dependencies: FuturesUnordered<_> =
                deps.iter_mut().map(|w| w.wait_for_change()).collect();

            tokio::select! {
                _ = interval.tick() => {
                    self.activate(ActivationReason::Timeout).await;
                },

                _ = self.notify.notified() => {
                    self.activate(ActivationReason::Signaled).await;
                }

                _ = dependencies.next(), if !dependencies.is_empty() => {
                    self.activate(ActivationReason::Dependency).await;
                }
            }
        }
    }

    /// "Activate" the background task
    ///
    /// This takes the task's lease, invokes `activate()` on the underlying
    /// `BackgroundTask` impl and gives the lease back, with a bunch of
    /// runtime observability around doing so.  If the lease cannot be taken,
    /// the activation is recorded as skipped.
    async fn activate(&mut self, reason: ActivationReason) {
        self.iteration += 1;
        let iteration = self.iteration;
        let start_time = Utc::now();
        let start_instant = Instant::now();

        debug!(
            &self.log,
            "activating";
            "reason" => ?reason,
            "iteration" => iteration
        );

        // Update our status with the driver.
        self.status_tx.send_modify(|status| {
            assert_matches!(status.current, CurrentStatus::Idle);
            status.current = CurrentStatus::Running(CurrentStatusRunning {
                start_time,
                start_instant,
                reason,
                iteration,
            });
        });

        let details = match self.take_lease().await {
            Ok(()) => {
                let details = self.activate_holding_lease().await;
                self.release_lease().await;
                details
            }
            Err(skipped) => json!({ "skipped": skipped }),
        };

        let elapsed = start_instant.elapsed();

        // Update our status with the driver.
        self.status_tx.send_modify(|status| {
            assert!(!status.current.is_idle());
            let current = status.current.unwrap_running();
            assert_eq!(current.iteration, iteration);
            *status = TaskStatus {
                current: CurrentStatus::Idle,
                last: LastResult::Completed(LastResultCompleted {
                    iteration,
                    start_time,
                    reason,
                    elapsed,
                    details,
                }),
            };
        });

        debug!(
            &self.log,
            "activation complete";
            "elapsed" => ?elapsed,
            "iteration" => iteration,
        );
    }

    /// Takes the lease for this task, or says why the activation should be
    /// skipped
    async fn take_lease(&self) -> Result<(), String> {
        let Some(lease) = &self.lease else {
            return Ok(());
        };
        match lease
            .store
            .try_lock(self.name.as_str(), lease.owner, lease.ttl)
            .await
        {
            Ok(true) => Ok(()),
            Ok(false) => {
                debug!(&self.log, "lock held elsewhere; skipping activation");
                Err(String::from("lock held elsewhere"))
            }
            Err(error) => {
                warn!(
                    &self.log,
                    "failed to take task lock; skipping activation";
                    "error" => %error,
                );
                Err(format!("failed to take lock: {error}"))
            }
        }
    }

    /// Runs the background task impl, renewing the lease until it finishes
    async fn activate_holding_lease(&mut self) -> serde_json::Value {
        let Some(lease) = self.lease.clone() else {
            return self.imp.activate(&self.log).await;
        };
        let every = (lease.ttl / 2).max(Duration::from_millis(1));
        let mut renewal = tokio::time::interval_at(
            tokio::time::Instant::now() + every,
            every,
        );
        renewal.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut work = self.imp.activate(&self.log);
        loop {
            tokio::select! {
                details = &mut work => return details,
                _ = renewal.tick() => {
                    renew_lease(&self.log, &self.name, &lease).await;
                }
            }
        }
    }

    async fn release_lease(&self) {
        let Some(lease) = &self.lease else {
            return;
        };
        // The lease expires on its own if this fails.
        if let Err(error) =
            lease.store.unlock(self.name.as_str(), lease.owner).await
        {
            warn!(
                &self.log,
                "failed to release task lock";
                "error" => %error,
            );
        }
    }
}

async fn renew_lease(log: &Logger, name: &TaskName, lease: &TaskLease) {
    match lease.store.try_lock(name.as_str(), lease.owner, lease.ttl).await {
        Ok(true) => debug!(log, "renewed task lock"),
        Ok(false) => {
            warn!(log, "task lock was taken over while the activation ran")
        }
        Err(error) => {
            warn!(log, "failed to renew task lock"; "error" => %error)
        }
    }
}

/// Used to erase the specific type of a `tokio::sync::watch::Receiver`
///
/// This allows the `Driver` to treat these generically, activating a task when
/// any of the watch channels changes, regardless of what data is stored in the
/// channel.
pub trait GenericWatcher: Send {
    fn wait_for_change(
        &mut self,
    ) -> BoxFuture<'_, Result<(), watch::error::RecvError>>;
}

impl<T: Send + Sync> GenericWatcher for watch::Receiver<T> {
    fn wait_for_change(
        &mut self,
    ) -> BoxFuture<'_, Result<(), watch::error::RecvError>> {
        async { self.changed().await }.boxed()
    }
}
