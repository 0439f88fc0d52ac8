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

//! Outbox row-store contract and its implementations.
//!
//! The compensation engine only sees [`OutboxStore`]; the diesel-backed
//! [`DatabaseOutboxStore`] is the production implementation and
//! [`MemoryOutboxStore`] backs tests and embedded use.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};

use crate::dal::DAL;
use crate::database::Database;
use crate::error::StoreError;
use crate::models::{MessageMonitor, MonitorStatus, NewMessageMonitor};

/// Narrow query/update contract over the `message_monitor` table.
///
/// `select_since` pages in `(next_send_time, id)` ascending order; with
/// `min_id` set it returns rows of the `since` second-bucket with a
/// greater id, plus everything due from the following bucket on. That
/// shape is what makes the two-part scan cursor resumable without
/// skipping rows that share a timestamp.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Inserts unless a record with the same `(biz_no, topic, tag)`
    /// already exists; returns the new id, or `None` on conflict.
    async fn insert_if_absent(&self, new: NewMessageMonitor) -> Result<Option<i64>, StoreError>;

    /// Writes a record's mutable columns back; returns affected count.
    async fn update_by_id(&self, monitor: &MessageMonitor) -> Result<usize, StoreError>;

    async fn get_by_id(&self, id: i64) -> Result<Option<MessageMonitor>, StoreError>;

    /// Minimum `next_send_time` over records in `status`, if any.
    async fn min_next_send_time(
        &self,
        status: MonitorStatus,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// One ordered page of records in `status` due at or after `since`.
    async fn select_since(
        &self,
        since: DateTime<Utc>,
        status: MonitorStatus,
        min_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<MessageMonitor>, StoreError>;

    /// Closes a `WAIT_RECEIPT` record by broker delivery id; returns
    /// affected count.
    async fn confirm_receipt(&self, msg_id: &str, success: bool) -> Result<usize, StoreError>;
}

/// Production store over the diesel DAL.
pub struct DatabaseOutboxStore {
    dal: DAL,
}

impl DatabaseOutboxStore {
    pub fn new(database: Database) -> Self {
        Self {
            dal: DAL::new(database),
        }
    }
}

#[async_trait]
impl OutboxStore for DatabaseOutboxStore {
    async fn insert_if_absent(&self, new: NewMessageMonitor) -> Result<Option<i64>, StoreError> {
        self.dal.message_monitor().insert_if_absent(new).await
    }

    async fn update_by_id(&self, monitor: &MessageMonitor) -> Result<usize, StoreError> {
        self.dal.message_monitor().update_by_id(monitor).await
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<MessageMonitor>, StoreError> {
        self.dal.message_monitor().get_by_id(id).await
    }

    async fn min_next_send_time(
        &self,
        status: MonitorStatus,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.dal.message_monitor().min_next_send_time(status).await
    }

    async fn select_since(
        &self,
        since: DateTime<Utc>,
        status: MonitorStatus,
        min_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<MessageMonitor>, StoreError> {
        self.dal
            .message_monitor()
            .select_since(since, status, min_id, limit)
            .await
    }

    async fn confirm_receipt(&self, msg_id: &str, success: bool) -> Result<usize, StoreError> {
        self.dal
            .message_monitor()
            .confirm_receipt(msg_id, success)
            .await
    }
}

/// In-process store with the same query semantics as the database one.
pub struct MemoryOutboxStore {
    records: Mutex<HashMap<i64, MessageMonitor>>,
    next_id: AtomicI64,
}

impl MemoryOutboxStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }
}

impl Default for MemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

fn bucket_end(since: DateTime<Utc>) -> DateTime<Utc> {
    since.trunc_subsecs(0) + chrono::Duration::seconds(1)
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn insert_if_absent(&self, new: NewMessageMonitor) -> Result<Option<i64>, StoreError> {
        let mut records = self.records.lock().unwrap();
        let exists = records
            .values()
            .any(|m| m.biz_no == new.biz_no && m.topic == new.topic && m.tag == new.tag);
        if exists {
            return Ok(None);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut monitor = MessageMonitor::from_new(new);
        monitor.id = id;
        // Due times are stored at whole-second precision, same as the
        // database stores.
        monitor.next_send_time = monitor.next_send_time.trunc_subsecs(0);
        records.insert(id, monitor);
        Ok(Some(id))
    }

    async fn update_by_id(&self, monitor: &MessageMonitor) -> Result<usize, StoreError> {
        let mut records = self.records.lock().unwrap();
        match records.get_mut(&monitor.id) {
            Some(stored) => {
                let mut updated = monitor.clone();
                updated.next_send_time = updated.next_send_time.trunc_subsecs(0);
                updated.update_time = Utc::now();
                updated.publish_config = None;
                *stored = updated;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<MessageMonitor>, StoreError> {
        Ok(self.records.lock().unwrap().get(&id).cloned())
    }

    async fn min_next_send_time(
        &self,
        status: MonitorStatus,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|m| m.status == status)
            .map(|m| m.next_send_time)
            .min())
    }

    async fn select_since(
        &self,
        since: DateTime<Utc>,
        status: MonitorStatus,
        min_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<MessageMonitor>, StoreError> {
        let records = self.records.lock().unwrap();
        let mut page: Vec<MessageMonitor> = records
            .values()
            .filter(|m| m.status == status && m.next_send_time >= since)
            .filter(|m| match min_id {
                // Within the cursor's bucket only ids past the tie-break
                // qualify; later buckets qualify whole.
                Some(min_id) => m.next_send_time >= bucket_end(since) || m.id > min_id,
                None => true,
            })
            .cloned()
            .collect();
        page.sort_by_key(|m| (m.next_send_time, m.id));
        page.truncate(limit.max(0) as usize);
        Ok(page)
    }

    async fn confirm_receipt(&self, msg_id: &str, success: bool) -> Result<usize, StoreError> {
        let mut records = self.records.lock().unwrap();
        let mut affected = 0;
        for monitor in records.values_mut() {
            if monitor.msg_id.as_deref() == Some(msg_id)
                && monitor.status == MonitorStatus::WaitReceipt
            {
                monitor.transition(if success {
                    MonitorStatus::Success
                } else {
                    MonitorStatus::Fail
                })?;
                monitor.receipt_time = Some(Utc::now());
                monitor.update_time = Utc::now();
                affected += 1;
            }
        }
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn due_at(s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, s).unwrap()
    }

    async fn seed(store: &MemoryOutboxStore, biz_no: &str, due: DateTime<Utc>) -> i64 {
        let mut new = NewMessageMonitor::new(biz_no, "orders", "created", "{}");
        new.next_send_time = due;
        store.insert_if_absent(new).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_insert_if_absent_dedups_on_business_key() {
        let store = MemoryOutboxStore::new();
        let first = store
            .insert_if_absent(NewMessageMonitor::new("order-1", "orders", "created", "{}"))
            .await
            .unwrap();
        assert!(first.is_some());

        let dup = store
            .insert_if_absent(NewMessageMonitor::new("order-1", "orders", "created", "{}"))
            .await
            .unwrap();
        assert!(dup.is_none());

        // Same biz_no under a different tag is a distinct message.
        let other = store
            .insert_if_absent(NewMessageMonitor::new("order-1", "orders", "paid", "{}"))
            .await
            .unwrap();
        assert!(other.is_some());
    }

    #[tokio::test]
    async fn test_min_next_send_time_filters_by_status() {
        let store = MemoryOutboxStore::new();
        assert!(store
            .min_next_send_time(MonitorStatus::WaitSend)
            .await
            .unwrap()
            .is_none());

        seed(&store, "a", due_at(10)).await;
        let later = seed(&store, "b", due_at(20)).await;
        let mut done = store.get_by_id(later).await.unwrap().unwrap();
        done.transition(MonitorStatus::Success).unwrap();
        store.update_by_id(&done).await.unwrap();

        assert_eq!(
            store
                .min_next_send_time(MonitorStatus::WaitSend)
                .await
                .unwrap(),
            Some(due_at(10))
        );
    }

    #[tokio::test]
    async fn test_select_since_orders_and_pages() {
        let store = MemoryOutboxStore::new();
        let r1 = seed(&store, "a", due_at(10)).await;
        let r2 = seed(&store, "b", due_at(10)).await;
        let r3 = seed(&store, "c", due_at(11)).await;

        let page = store
            .select_since(due_at(10), MonitorStatus::WaitSend, None, 2)
            .await
            .unwrap();
        assert_eq!(page.iter().map(|m| m.id).collect::<Vec<_>>(), vec![r1, r2]);

        // Tie-break resumes within the bucket without losing r3.
        let page = store
            .select_since(due_at(10), MonitorStatus::WaitSend, Some(r2), 2)
            .await
            .unwrap();
        assert_eq!(page.iter().map(|m| m.id).collect::<Vec<_>>(), vec![r3]);
    }

    #[tokio::test]
    async fn test_select_since_tie_break_keeps_later_buckets() {
        let store = MemoryOutboxStore::new();
        // Id order deliberately disagrees with due order across buckets.
        let r1 = seed(&store, "a", due_at(20)).await;
        let r2 = seed(&store, "b", due_at(10)).await;

        let page = store
            .select_since(due_at(10), MonitorStatus::WaitSend, Some(r2), 10)
            .await
            .unwrap();
        assert_eq!(page.iter().map(|m| m.id).collect::<Vec<_>>(), vec![r1]);
    }

    #[tokio::test]
    async fn test_confirm_receipt_closes_wait_receipt_only() {
        let store = MemoryOutboxStore::new();
        let id = seed(&store, "a", due_at(10)).await;
        let mut monitor = store.get_by_id(id).await.unwrap().unwrap();
        monitor.msg_id = Some("msg-1".to_string());
        monitor.transition(MonitorStatus::WaitReceipt).unwrap();
        store.update_by_id(&monitor).await.unwrap();

        assert_eq!(store.confirm_receipt("msg-1", true).await.unwrap(), 1);
        let stored = store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(stored.status, MonitorStatus::Success);

        // Already closed: no second confirmation.
        assert_eq!(store.confirm_receipt("msg-1", true).await.unwrap(), 0);
    }
}
