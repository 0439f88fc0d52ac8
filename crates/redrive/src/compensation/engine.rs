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

//! The compensation engine: periodic scans that re-drive every
//! `WAIT_SEND` outbox record through the publisher.
//!
//! A cycle pages through due records in `(next_send_time, id)` order from
//! a resumable cursor, dispatches each one, and persists the advanced
//! cursor after every batch so a crash never loses more than one batch of
//! progress. Re-running a range is safe: every page is re-filtered by
//! status, so already-delivered records drop out on their own.
//!
//! Nothing in a cycle is fatal. Lock contention is a skip, cache loss is
//! a wider rescan, a bad record is one warning, and a store failure ends
//! the cycle for the scheduler to retry at the next firing.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::CompensationConfig;
use crate::cache::CursorCache;
use crate::cursor::ScanCursor;
use crate::error::CompensationError;
use crate::lock::{run_exclusively, DistributedLock};
use crate::models::MonitorStatus;
use crate::publish::RecordingPublisher;
use crate::scheduler::{RecurringCommand, TaskHandle, TaskSchedule, TaskScheduler};
use crate::store::OutboxStore;

/// Counters from one compensation cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    /// Cycle skipped because another instance holds the lock.
    pub lock_skipped: bool,
    /// Records handed to the publisher.
    pub scanned: u64,
    /// Records whose publish attempt succeeded.
    pub dispatched: u64,
    /// Records whose publish attempt failed (left for a later cycle).
    pub failed: u64,
    /// Batches fully consumed and persisted.
    pub batches: u64,
}

/// Orchestrates periodic outbox scans.
///
/// Armed once at warm-up as a fixed-rate task; see [`CompensationEngine::arm`].
pub struct CompensationEngine {
    store: Arc<dyn OutboxStore>,
    cache: Arc<dyn CursorCache>,
    lock: Option<Arc<dyn DistributedLock>>,
    publisher: Arc<RecordingPublisher>,
    config: CompensationConfig,
    running: AtomicBool,
}

impl CompensationEngine {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        cache: Arc<dyn CursorCache>,
        publisher: Arc<RecordingPublisher>,
        config: CompensationConfig,
    ) -> Self {
        Self {
            store,
            cache,
            lock: None,
            publisher,
            config,
            running: AtomicBool::new(true),
        }
    }

    /// Enables cross-instance mutual exclusion at cycle granularity.
    pub fn with_lock(mut self, lock: Arc<dyn DistributedLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Registers the engine on `scheduler` as a fixed-rate task.
    pub fn arm(
        self: &Arc<Self>,
        scheduler: &TaskScheduler,
    ) -> Result<TaskHandle, crate::error::SchedulerError> {
        let schedule = TaskSchedule::fixed_rate(self.config.interval, self.config.interval)?;
        info!(
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            single_runner = self.config.single_runner,
            "Compensation engine armed"
        );
        Ok(scheduler.schedule(schedule, self.clone(), None))
    }

    /// Stops new work: the next firing observes the flag and skips.
    /// An in-flight cycle stops at its next batch boundary.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// One compensation cycle.
    pub async fn run_cycle(&self) -> Result<CycleStats, CompensationError> {
        if !self.running.load(Ordering::SeqCst) {
            info!("Compensation engine stopped; skipping firing");
            return Ok(CycleStats::default());
        }

        let started = std::time::Instant::now();
        let stats = match &self.lock {
            Some(lock) if self.config.single_runner => {
                let outcome = run_exclusively(
                    lock.clone(),
                    &self.config.lock_name,
                    self.config.lock_lease,
                    || self.scan(),
                )
                .await?;
                match outcome {
                    Some(result) => result?,
                    None => {
                        info!(
                            lock = %self.config.lock_name,
                            "Compensation cycle skipped; lock held by another instance"
                        );
                        CycleStats {
                            lock_skipped: true,
                            ..CycleStats::default()
                        }
                    }
                }
            }
            _ => self.scan().await?,
        };

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            scanned = stats.scanned,
            dispatched = stats.dispatched,
            failed = stats.failed,
            batches = stats.batches,
            "Compensation cycle complete"
        );
        Ok(stats)
    }

    /// The scan itself: cursor resolution, paging, dispatch, persist.
    async fn scan(&self) -> Result<CycleStats, CompensationError> {
        let mut cursor = self.resolve_cursor().await?;
        let now = Utc::now();
        let mut stats = CycleStats::default();
        // Ids of the previous batch, so a page boundary falling inside a
        // shared-timestamp run cannot re-dispatch its boundary rows.
        let mut prev_ids: HashSet<i64> = HashSet::new();

        loop {
            if !self.running.load(Ordering::SeqCst) {
                info!("Engine stopping; ending cycle at batch boundary");
                break;
            }

            let batch = self
                .store
                .select_since(
                    cursor.since,
                    MonitorStatus::WaitSend,
                    cursor.min_id,
                    self.config.batch_size,
                )
                .await
                .map_err(|e| {
                    error!(
                        cursor = %cursor,
                        error = %e,
                        "Store query failed; aborting cycle"
                    );
                    e
                })?;
            if batch.is_empty() {
                break;
            }

            // Ordering puts future-due records last; the cursor must not
            // move past a record that is not yet eligible.
            let full_len = batch.len();
            let due: Vec<_> = batch
                .into_iter()
                .take_while(|m| m.next_send_time <= now)
                .collect();
            if due.is_empty() {
                break;
            }
            let reached_future = due.len() < full_len;
            let batch_ids: HashSet<i64> = due.iter().map(|m| m.id).collect();

            for monitor in &due {
                if prev_ids.contains(&monitor.id) {
                    continue;
                }
                stats.scanned += 1;
                let mut monitor = monitor.clone();
                match self.publisher.deliver(&mut monitor).await {
                    Ok(()) => stats.dispatched += 1,
                    Err(e) => {
                        // One bad record never aborts the batch.
                        stats.failed += 1;
                        debug!(id = monitor.id, error = %e, "Record left for a later cycle");
                    }
                }
            }

            if let Some(last) = due.last() {
                cursor = cursor.advance_past(last);
                self.cache
                    .put_cursor(cursor, self.config.cursor_ttl)
                    .await
                    .map_err(|e| {
                        error!(
                            cursor = %cursor,
                            error = %e,
                            "Cursor persist failed; cycle abandoned, next one redoes this range"
                        );
                        e
                    })?;
                debug!(cursor = %cursor, "Cursor persisted");
            }
            stats.batches += 1;
            prev_ids = batch_ids;

            if reached_future {
                break;
            }
        }

        Ok(stats)
    }

    /// Resolves the scan start position: resume cursor, else baseline,
    /// else the store's true minimum due time (falling back to now),
    /// seeding both cache entries on the way out.
    async fn resolve_cursor(&self) -> Result<ScanCursor, CompensationError> {
        match self.cache.get_cursor().await {
            Ok(Some(cursor)) => {
                // Resuming from the cursor never reads the baseline, so
                // keep it alive lazily instead of letting it lapse and
                // forcing a store recompute on the next cold start.
                if let Err(e) = self.cache.expire_baseline(self.config.baseline_ttl).await {
                    warn!(error = %e, "Baseline TTL refresh failed; continuing");
                }
                return Ok(cursor);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Cursor cache read failed; recomputing from baseline");
            }
        }

        let baseline = match self.cache.get_baseline().await {
            Ok(Some(baseline)) => baseline,
            other => {
                if let Err(e) = other {
                    warn!(error = %e, "Baseline cache read failed; recomputing from store");
                }
                let baseline = self
                    .store
                    .min_next_send_time(MonitorStatus::WaitSend)
                    .await?
                    .unwrap_or_else(Utc::now);
                if let Err(e) = self
                    .cache
                    .put_baseline(baseline, self.config.baseline_ttl)
                    .await
                {
                    warn!(error = %e, "Baseline cache write failed; continuing uncached");
                }
                baseline
            }
        };

        let cursor = ScanCursor::at(baseline);
        if let Err(e) = self.cache.put_cursor(cursor, self.config.cursor_ttl).await {
            warn!(error = %e, "Cursor seed write failed; continuing uncached");
        }
        debug!(cursor = %cursor, "Scan cursor resolved from baseline");
        Ok(cursor)
    }
}

#[async_trait]
impl RecurringCommand for CompensationEngine {
    async fn run(
        &self,
        _task: &TaskHandle,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.run_cycle().await?;
        Ok(())
    }
}
