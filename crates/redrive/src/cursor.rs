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

//! Resumable scan position for the compensation engine.
//!
//! The cursor is a two-part value: a timestamp with whole-second
//! granularity and an optional record-id tie-break. The id disambiguates
//! within a one-second bucket where many records can share the same
//! due time; across buckets the id resets and the timestamp alone
//! carries the position.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::models::MessageMonitor;

/// Position of a compensation scan over the outbox table.
///
/// Ordering of the scan is `(next_send_time, id)` ascending; the cursor
/// always points at the last record already handed out, so the next page
/// starts strictly after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCursor {
    /// Whole-second scan timestamp. Records due before this are behind
    /// the cursor.
    pub since: DateTime<Utc>,
    /// Id of the last record consumed inside the `since` bucket, if the
    /// scan stopped mid-bucket.
    pub min_id: Option<i64>,
}

impl ScanCursor {
    /// Cursor positioned at `since`, truncated to whole seconds, with no
    /// tie-break.
    pub fn at(since: DateTime<Utc>) -> Self {
        Self {
            since: since.trunc_subsecs(0),
            min_id: None,
        }
    }

    /// Advances past a fully-consumed batch ending in `last`.
    ///
    /// If `last` is due inside the current bucket the id becomes the
    /// tie-break; otherwise the cursor jumps to `last`'s (truncated)
    /// bucket with the id reset — by then every record of the old bucket
    /// has been seen.
    pub fn advance_past(&self, last: &MessageMonitor) -> Self {
        let last_bucket = last.next_send_time.trunc_subsecs(0);
        if last_bucket == self.since {
            Self {
                since: self.since,
                min_id: Some(last.id),
            }
        } else {
            Self {
                since: last_bucket,
                min_id: None,
            }
        }
    }
}

impl std::fmt::Display for ScanCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.min_id {
            Some(id) => write!(f, "{}#{}", self.since.format("%Y-%m-%dT%H:%M:%S"), id),
            None => write!(f, "{}", self.since.format("%Y-%m-%dT%H:%M:%S")),
        }
    }
}
