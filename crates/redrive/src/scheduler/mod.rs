/*
 *  Copyright 2025-2026 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Self-rescheduling recurring-task runner.
//!
//! Every periodic job in this crate, including the compensation engine, is
//! built on [`TaskScheduler`]. A scheduled task owns mutable schedule state
//! (mode, period) that its own command may rewrite through the
//! [`TaskHandle`] it is invoked with, enabling runtime-adaptive cadences
//! without re-registering the task.
//!
//! The reschedule decision after each firing uses the *mode captured when
//! the firing began*, so a command mutating the mode mid-run cannot make
//! the decision inconsistent with the run that actually happened. The
//! period is read live at decision time, which is what makes adaptive
//! back-off take effect on the very next firing.
//!
//! Firings never overlap: the next one is only armed after the current one
//! returns, command error or not.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info};

use crate::error::SchedulerError;

/// How the next firing time is computed after a run completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleMode {
    /// Fire once, then end the chain (unless the command upgrades the mode
    /// mid-run, in which case one reschedule happens under the new mode).
    Once,
    /// Anchor the next firing to the previous firing's *start* plus period.
    /// An overrun fires again immediately; missed firings never accumulate.
    FixedRate,
    /// Wait exactly `period` after the previous firing *completes*.
    FixedDelay,
}

/// Mutable schedule state of a recurring task.
#[derive(Debug, Clone)]
pub struct TaskSchedule {
    mode: ScheduleMode,
    initial_delay: Duration,
    period: Duration,
}

impl TaskSchedule {
    /// A one-shot schedule.
    pub fn once(initial_delay: Duration) -> Self {
        Self {
            mode: ScheduleMode::Once,
            initial_delay,
            period: Duration::ZERO,
        }
    }

    /// A fixed-rate schedule.
    pub fn fixed_rate(initial_delay: Duration, period: Duration) -> Result<Self, SchedulerError> {
        if period.is_zero() {
            return Err(SchedulerError::ZeroPeriod);
        }
        Ok(Self {
            mode: ScheduleMode::FixedRate,
            initial_delay,
            period,
        })
    }

    /// A fixed-delay schedule.
    pub fn fixed_delay(initial_delay: Duration, period: Duration) -> Result<Self, SchedulerError> {
        if period.is_zero() {
            return Err(SchedulerError::ZeroPeriod);
        }
        Ok(Self {
            mode: ScheduleMode::FixedDelay,
            initial_delay,
            period,
        })
    }
}

/// Bookkeeping mutated only by the task's own executing thread.
#[derive(Debug)]
struct TaskRuntime {
    run_count: u64,
    last_fired_at: Option<Instant>,
}

#[derive(Debug)]
struct TaskState {
    schedule: TaskSchedule,
    runtime: TaskRuntime,
}

/// Handle to a scheduled task's state.
///
/// The handle is passed to the command on every firing so it can read or
/// rewrite its own schedule before the reschedule decision is taken.
/// `run_count` and the last-fired timestamp are only ever written by the
/// executing task itself and are monotonically non-decreasing.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: u64,
    state: Arc<Mutex<TaskState>>,
}

impl TaskHandle {
    fn new(id: u64, schedule: TaskSchedule) -> Self {
        Self {
            id,
            state: Arc::new(Mutex::new(TaskState {
                schedule,
                runtime: TaskRuntime {
                    run_count: 0,
                    last_fired_at: None,
                },
            })),
        }
    }

    /// Process-local monotonic task id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current scheduling mode.
    pub fn mode(&self) -> ScheduleMode {
        self.state.lock().unwrap().schedule.mode
    }

    /// Rewrites the scheduling mode; takes effect at the next reschedule
    /// decision (or, for a running `Once` task, upgrades it).
    pub fn set_mode(&self, mode: ScheduleMode) {
        self.state.lock().unwrap().schedule.mode = mode;
    }

    /// Current period.
    pub fn period(&self) -> Duration {
        self.state.lock().unwrap().schedule.period
    }

    /// Rewrites the period; the next reschedule decision uses it.
    /// A zero period is rejected for the same reason the constructors
    /// reject one: a recurring task would busy-loop.
    pub fn set_period(&self, period: Duration) -> Result<(), SchedulerError> {
        if period.is_zero() {
            return Err(SchedulerError::ZeroPeriod);
        }
        self.state.lock().unwrap().schedule.period = period;
        Ok(())
    }

    /// Number of completed firings.
    pub fn run_count(&self) -> u64 {
        self.state.lock().unwrap().runtime.run_count
    }

    /// Instant the latest firing began, if any.
    pub fn last_fired_at(&self) -> Option<Instant> {
        self.state.lock().unwrap().runtime.last_fired_at
    }

    fn initial_delay(&self) -> Duration {
        self.state.lock().unwrap().schedule.initial_delay
    }

    /// Called by the executing task at firing start; never externally.
    fn mark_fired(&self, at: Instant) {
        let mut state = self.state.lock().unwrap();
        state.runtime.run_count += 1;
        state.runtime.last_fired_at = Some(at);
    }
}

/// The unit of recurring work.
#[async_trait]
pub trait RecurringCommand: Send + Sync + 'static {
    /// One firing. Errors are logged by the scheduler and do not kill the
    /// chain; the reschedule decision still runs.
    async fn run(
        &self,
        task: &TaskHandle,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Cross-cutting context injected around each firing.
///
/// The hook receives the task handle explicitly; there is no ambient or
/// thread-local state involved.
#[async_trait]
pub trait FiringHook: Send + Sync + 'static {
    async fn before(&self, task: &TaskHandle);
    async fn after(&self, task: &TaskHandle);
}

/// Recurring-task runner.
///
/// Each scheduled task runs on its own tokio task; within one scheduled
/// task, firings are strictly sequential. Shutdown is cooperative via a
/// broadcast channel; a task waiting out its delay wakes and ends, a task
/// mid-firing ends after the firing completes.
pub struct TaskScheduler {
    next_id: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl TaskScheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            next_id: AtomicU64::new(1),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Arms a task: it fires after the schedule's initial delay, then
    /// re-arms itself according to its mode. Returns a handle that shares
    /// the task's schedule state.
    pub fn schedule(
        &self,
        schedule: TaskSchedule,
        command: Arc<dyn RecurringCommand>,
        hook: Option<Arc<dyn FiringHook>>,
    ) -> TaskHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = TaskHandle::new(id, schedule);
        let shutdown_rx = self.shutdown_tx.subscribe();

        debug!(task_id = id, "Arming recurring task");
        let join = tokio::spawn(run_task(handle.clone(), command, hook, shutdown_rx));
        self.handles.lock().unwrap().push(join);

        handle
    }

    /// Signals all tasks to end and waits for them to finish.
    pub async fn shutdown(&self) {
        info!("Task scheduler shutting down");
        let _ = self.shutdown_tx.send(());
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_task(
    handle: TaskHandle,
    command: Arc<dyn RecurringCommand>,
    hook: Option<Arc<dyn FiringHook>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let initial = handle.initial_delay();
    tokio::select! {
        _ = sleep(initial) => {}
        _ = shutdown_rx.recv() => {
            debug!(task_id = handle.id(), "Task ended before first firing");
            return;
        }
    }

    loop {
        let fired_at = Instant::now();
        // Mode snapshot: the reschedule decision below must reflect the
        // mode in effect when this firing began, not whatever the command
        // left behind mid-run.
        let mode_at_start = handle.mode();
        handle.mark_fired(fired_at);

        if let Some(hook) = &hook {
            hook.before(&handle).await;
        }
        let result = command.run(&handle).await;
        if let Some(hook) = &hook {
            hook.after(&handle).await;
        }

        if let Err(e) = result {
            error!(
                task_id = handle.id(),
                run = handle.run_count(),
                error = %e,
                "Recurring command failed; chain continues"
            );
        }

        // Reschedule decision, taken even when the command failed.
        let delay = match mode_at_start {
            ScheduleMode::Once => {
                let mode_now = handle.mode();
                if mode_now == ScheduleMode::Once {
                    debug!(task_id = handle.id(), "One-shot task completed");
                    break;
                }
                // Upgraded mid-run: reschedule once under the new mode.
                // An upgrade that never set a period would busy-loop at
                // zero delay, so it ends the chain instead.
                let period = handle.period();
                if period.is_zero() {
                    error!(
                        task_id = handle.id(),
                        "Task upgraded to a recurring mode without a period; ending chain"
                    );
                    break;
                }
                delay_for(mode_now, fired_at, period)
            }
            mode => delay_for(mode, fired_at, handle.period()),
        };

        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown_rx.recv() => {
                debug!(task_id = handle.id(), "Task ended during delay");
                break;
            }
        }
    }
}

/// Next-firing delay for a recurring mode.
///
/// FixedRate anchors to the firing's start: an overrun yields a zero delay
/// rather than a backlog of catch-up runs.
fn delay_for(mode: ScheduleMode, fired_at: Instant, period: Duration) -> Duration {
    match mode {
        ScheduleMode::FixedRate => {
            let target = fired_at + period;
            target.saturating_duration_since(Instant::now())
        }
        ScheduleMode::FixedDelay => period,
        ScheduleMode::Once => Duration::ZERO,
    }
}
