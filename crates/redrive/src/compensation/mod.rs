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

//! Periodic re-driving of undelivered outbox records.

mod engine;

pub use engine::{CompensationEngine, CycleStats};

use std::time::Duration;

/// Tuning for the compensation engine.
#[derive(Debug, Clone)]
pub struct CompensationConfig {
    /// Fixed-rate interval between cycle firings.
    pub interval: Duration,
    /// Records per scan page.
    pub batch_size: i64,
    /// When true and a lock is configured, at most one instance in the
    /// fleet runs a cycle at a time.
    pub single_runner: bool,
    /// Lock name shared by all instances scanning the same table.
    pub lock_name: String,
    /// Lock lease; auto-renewed while a cycle runs.
    pub lock_lease: Duration,
    /// Resume-cursor cache TTL. Expiry forces a rescan from the baseline.
    pub cursor_ttl: Duration,
    /// Baseline cache TTL. Expiry forces a min-due-time recompute from
    /// the store.
    pub baseline_ttl: Duration,
}

impl Default for CompensationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            batch_size: 20,
            single_runner: true,
            lock_name: "redrive.compensation".to_string(),
            lock_lease: Duration::from_secs(30),
            cursor_ttl: Duration::from_secs(3600),
            baseline_ttl: Duration::from_secs(86400),
        }
    }
}

impl CompensationConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_single_runner(mut self, single_runner: bool) -> Self {
        self.single_runner = single_runner;
        self
    }

    pub fn with_lock_name(mut self, lock_name: &str) -> Self {
        self.lock_name = lock_name.to_string();
        self
    }

    pub fn with_lock_lease(mut self, lock_lease: Duration) -> Self {
        self.lock_lease = lock_lease;
        self
    }

    pub fn with_cursor_ttl(mut self, cursor_ttl: Duration) -> Self {
        self.cursor_ttl = cursor_ttl;
        self
    }

    pub fn with_baseline_ttl(mut self, baseline_ttl: Duration) -> Self {
        self.baseline_ttl = baseline_ttl;
        self
    }
}
