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

//! Cursor persistence between compensation cycles.
//!
//! The cache is an optimization layer, never a source of truth: a cold or
//! wiped cache only costs a wider rescan of the outbox table. Entries
//! carry a TTL on purpose — expiry is what forces the periodic full
//! rescan that picks up records whose due time was never bumped forward.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::cursor::ScanCursor;
use crate::error::CacheError;

/// Cross-cycle storage for the scan cursor and the baseline timestamp.
///
/// The two entries expire independently. Implementations may lose
/// entries at any time; callers must treat a cursor miss as "start from
/// the baseline" and a baseline miss as "recompute from the store".
#[async_trait]
pub trait CursorCache: Send + Sync {
    async fn get_cursor(&self) -> Result<Option<ScanCursor>, CacheError>;
    async fn put_cursor(&self, cursor: ScanCursor, ttl: Duration) -> Result<(), CacheError>;
    /// Resets the cursor entry's TTL without rewriting its value.
    /// Returns whether a live entry was there to refresh.
    async fn expire_cursor(&self, ttl: Duration) -> Result<bool, CacheError>;
    async fn get_baseline(&self) -> Result<Option<DateTime<Utc>>, CacheError>;
    async fn put_baseline(&self, baseline: DateTime<Utc>, ttl: Duration)
        -> Result<(), CacheError>;
    /// Resets the baseline entry's TTL without rewriting its value.
    /// Returns whether a live entry was there to refresh.
    async fn expire_baseline(&self, ttl: Duration) -> Result<bool, CacheError>;
}

struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-process cursor cache with per-entry TTL.
///
/// Suitable for single-instance deployments and for tests; a shared
/// deployment wants a [`CursorCache`] over an external store so all
/// instances resume from the same position.
pub struct MemoryCursorCache {
    entries: Mutex<HashMap<&'static str, Entry>>,
}

const CURSOR_KEY: &str = "compensation.cursor";
const BASELINE_KEY: &str = "compensation.baseline";

impl MemoryCursorCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn get_live(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn put(&self, key: &'static str, value: String, ttl: Duration) {
        self.entries.lock().unwrap().insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn refresh(&self, key: &str, ttl: Duration) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                entry.expires_at = Instant::now() + ttl;
                true
            }
            Some(_) => {
                entries.remove(key);
                false
            }
            None => false,
        }
    }
}

impl Default for MemoryCursorCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CursorCache for MemoryCursorCache {
    async fn get_cursor(&self) -> Result<Option<ScanCursor>, CacheError> {
        match self.get_live(CURSOR_KEY) {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| CacheError::Corrupt {
                    key: CURSOR_KEY.to_string(),
                    message: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    async fn put_cursor(&self, cursor: ScanCursor, ttl: Duration) -> Result<(), CacheError> {
        let raw = serde_json::to_string(&cursor).map_err(|e| CacheError::Corrupt {
            key: CURSOR_KEY.to_string(),
            message: e.to_string(),
        })?;
        self.put(CURSOR_KEY, raw, ttl);
        Ok(())
    }

    async fn expire_cursor(&self, ttl: Duration) -> Result<bool, CacheError> {
        Ok(self.refresh(CURSOR_KEY, ttl))
    }

    async fn get_baseline(&self) -> Result<Option<DateTime<Utc>>, CacheError> {
        match self.get_live(BASELINE_KEY) {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| CacheError::Corrupt {
                    key: BASELINE_KEY.to_string(),
                    message: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    async fn put_baseline(
        &self,
        baseline: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let raw = serde_json::to_string(&baseline).map_err(|e| CacheError::Corrupt {
            key: BASELINE_KEY.to_string(),
            message: e.to_string(),
        })?;
        self.put(BASELINE_KEY, raw, ttl);
        Ok(())
    }

    async fn expire_baseline(&self, ttl: Duration) -> Result<bool, CacheError> {
        Ok(self.refresh(BASELINE_KEY, ttl))
    }
}
