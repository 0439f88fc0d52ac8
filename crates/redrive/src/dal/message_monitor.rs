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

//! Message Monitor DAL with runtime backend selection.
//!
//! This is the narrow query/update contract the compensation engine relies
//! on. `select_since` implements the two-part cursor predicate: rows at or
//! after the cursor timestamp, excluding rows of the cursor's whole-second
//! bucket whose id is at or below the tie-break id. A naive
//! `WHERE next_send_time > cursor` would silently skip records sharing a
//! timestamp with the previous page's last row.

use super::models::{to_naive, to_utc, MessageMonitorRow, NewMessageMonitorRow};
use super::DAL;
use crate::database::schema::message_monitor;
use crate::error::StoreError;
use crate::models::{MessageMonitor, MonitorStatus, NewMessageMonitor};
use chrono::{DateTime, Duration, SubsecRound, Timelike, Utc};
use diesel::prelude::*;

/// Data access layer for outbox records.
#[derive(Clone)]
pub struct MessageMonitorDAL<'a> {
    dal: &'a DAL,
}

impl<'a> MessageMonitorDAL<'a> {
    /// Creates a new MessageMonitorDAL instance.
    pub fn new(dal: &'a DAL) -> Self {
        Self { dal }
    }

    /// Inserts a new outbox record unless one with the same
    /// `(biz_no, topic, tag)` already exists.
    ///
    /// Returns the new record's id, or `None` when the insert was a no-op.
    pub async fn insert_if_absent(
        &self,
        new: NewMessageMonitor,
    ) -> Result<Option<i64>, StoreError> {
        crate::dispatch_backend!(
            self.dal.backend(),
            self.insert_if_absent_postgres(new).await,
            self.insert_if_absent_sqlite(new).await
        )
    }

    #[cfg(feature = "postgres")]
    async fn insert_if_absent_postgres(
        &self,
        new: NewMessageMonitor,
    ) -> Result<Option<i64>, StoreError> {
        let conn = self
            .dal
            .database
            .get_postgres_connection()
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;

        let row = NewMessageMonitorRow::from_domain(new, Utc::now());
        let id: Option<i64> = conn
            .interact(move |conn| {
                diesel::insert_into(message_monitor::table)
                    .values(&row)
                    .on_conflict_do_nothing()
                    .returning(message_monitor::id)
                    .get_result(conn)
                    .optional()
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;

        Ok(id)
    }

    #[cfg(feature = "sqlite")]
    async fn insert_if_absent_sqlite(
        &self,
        new: NewMessageMonitor,
    ) -> Result<Option<i64>, StoreError> {
        let conn = self
            .dal
            .database
            .get_sqlite_connection()
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;

        let row = NewMessageMonitorRow::from_domain(new, Utc::now());
        let id: Option<i64> = conn
            .interact(move |conn| {
                diesel::insert_into(message_monitor::table)
                    .values(&row)
                    .on_conflict_do_nothing()
                    .returning(message_monitor::id)
                    .get_result(conn)
                    .optional()
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;

        Ok(id)
    }

    /// Writes a record's mutable columns back by id, bumping `update_time`.
    ///
    /// Returns the affected row count (0 when the id does not exist).
    pub async fn update_by_id(&self, monitor: &MessageMonitor) -> Result<usize, StoreError> {
        crate::dispatch_backend!(
            self.dal.backend(),
            self.update_by_id_postgres(monitor.clone()).await,
            self.update_by_id_sqlite(monitor.clone()).await
        )
    }

    #[cfg(feature = "postgres")]
    async fn update_by_id_postgres(&self, monitor: MessageMonitor) -> Result<usize, StoreError> {
        let conn = self
            .dal
            .database
            .get_postgres_connection()
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;

        let affected: usize = conn
            .interact(move |conn| {
                diesel::update(message_monitor::table.find(monitor.id))
                    .set((
                        message_monitor::msg_id.eq(monitor.msg_id.clone()),
                        message_monitor::next_send_time.eq(to_naive(monitor.next_send_time.trunc_subsecs(0))),
                        message_monitor::status.eq(monitor.status.as_str()),
                        message_monitor::need_receipt.eq(monitor.need_receipt),
                        message_monitor::try_times.eq(monitor.try_times),
                        message_monitor::max_try_times.eq(monitor.max_try_times),
                        message_monitor::retry_interval.eq(monitor.retry_interval),
                        message_monitor::publish_listener.eq(monitor.publish_listener.clone()),
                        message_monitor::send_time.eq(monitor.send_time.map(to_naive)),
                        message_monitor::receipt_time.eq(monitor.receipt_time.map(to_naive)),
                        message_monitor::update_time.eq(to_naive(Utc::now())),
                    ))
                    .execute(conn)
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;

        Ok(affected)
    }

    #[cfg(feature = "sqlite")]
    async fn update_by_id_sqlite(&self, monitor: MessageMonitor) -> Result<usize, StoreError> {
        let conn = self
            .dal
            .database
            .get_sqlite_connection()
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;

        let affected: usize = conn
            .interact(move |conn| {
                diesel::update(message_monitor::table.find(monitor.id))
                    .set((
                        message_monitor::msg_id.eq(monitor.msg_id.clone()),
                        message_monitor::next_send_time.eq(to_naive(monitor.next_send_time.trunc_subsecs(0))),
                        message_monitor::status.eq(monitor.status.as_str()),
                        message_monitor::need_receipt.eq(monitor.need_receipt),
                        message_monitor::try_times.eq(monitor.try_times),
                        message_monitor::max_try_times.eq(monitor.max_try_times),
                        message_monitor::retry_interval.eq(monitor.retry_interval),
                        message_monitor::publish_listener.eq(monitor.publish_listener.clone()),
                        message_monitor::send_time.eq(monitor.send_time.map(to_naive)),
                        message_monitor::receipt_time.eq(monitor.receipt_time.map(to_naive)),
                        message_monitor::update_time.eq(to_naive(Utc::now())),
                    ))
                    .execute(conn)
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;

        Ok(affected)
    }

    /// Loads a record by id.
    pub async fn get_by_id(&self, id: i64) -> Result<Option<MessageMonitor>, StoreError> {
        crate::dispatch_backend!(
            self.dal.backend(),
            self.get_by_id_postgres(id).await,
            self.get_by_id_sqlite(id).await
        )
    }

    #[cfg(feature = "postgres")]
    async fn get_by_id_postgres(&self, id: i64) -> Result<Option<MessageMonitor>, StoreError> {
        let conn = self
            .dal
            .database
            .get_postgres_connection()
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;

        let row: Option<MessageMonitorRow> = conn
            .interact(move |conn| message_monitor::table.find(id).first(conn).optional())
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;

        row.map(TryInto::try_into).transpose()
    }

    #[cfg(feature = "sqlite")]
    async fn get_by_id_sqlite(&self, id: i64) -> Result<Option<MessageMonitor>, StoreError> {
        let conn = self
            .dal
            .database
            .get_sqlite_connection()
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;

        let row: Option<MessageMonitorRow> = conn
            .interact(move |conn| message_monitor::table.find(id).first(conn).optional())
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;

        row.map(TryInto::try_into).transpose()
    }

    /// The minimum `next_send_time` among records in `status`, used to seed
    /// the scan baseline. `None` when no such records exist.
    pub async fn min_next_send_time(
        &self,
        status: MonitorStatus,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        crate::dispatch_backend!(
            self.dal.backend(),
            self.min_next_send_time_postgres(status).await,
            self.min_next_send_time_sqlite(status).await
        )
    }

    #[cfg(feature = "postgres")]
    async fn min_next_send_time_postgres(
        &self,
        status: MonitorStatus,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = self
            .dal
            .database
            .get_postgres_connection()
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;

        let min: Option<chrono::NaiveDateTime> = conn
            .interact(move |conn| {
                message_monitor::table
                    .filter(message_monitor::status.eq(status.as_str()))
                    .select(diesel::dsl::min(message_monitor::next_send_time))
                    .first(conn)
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;

        Ok(min.map(to_utc))
    }

    #[cfg(feature = "sqlite")]
    async fn min_next_send_time_sqlite(
        &self,
        status: MonitorStatus,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = self
            .dal
            .database
            .get_sqlite_connection()
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;

        let min: Option<chrono::NaiveDateTime> = conn
            .interact(move |conn| {
                message_monitor::table
                    .filter(message_monitor::status.eq(status.as_str()))
                    .select(diesel::dsl::min(message_monitor::next_send_time))
                    .first(conn)
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;

        Ok(min.map(to_utc))
    }

    /// Pages records in `status` ordered by `(next_send_time ASC, id ASC)`,
    /// starting at `since`.
    ///
    /// When `min_id` is given, rows inside `since`'s whole-second bucket
    /// with `id <= min_id` are excluded; rows in later buckets are returned
    /// regardless of id.
    pub async fn select_since(
        &self,
        since: DateTime<Utc>,
        status: MonitorStatus,
        min_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<MessageMonitor>, StoreError> {
        crate::dispatch_backend!(
            self.dal.backend(),
            self.select_since_postgres(since, status, min_id, limit)
                .await,
            self.select_since_sqlite(since, status, min_id, limit).await
        )
    }

    /// End of the whole-second bucket containing `since` (exclusive bound).
    fn bucket_end(since: DateTime<Utc>) -> DateTime<Utc> {
        let bucket_start = since.with_nanosecond(0).unwrap_or(since);
        bucket_start + Duration::seconds(1)
    }

    #[cfg(feature = "postgres")]
    async fn select_since_postgres(
        &self,
        since: DateTime<Utc>,
        status: MonitorStatus,
        min_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<MessageMonitor>, StoreError> {
        let conn = self
            .dal
            .database
            .get_postgres_connection()
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;

        let since_naive = to_naive(since);
        let bucket_end = to_naive(Self::bucket_end(since));

        let rows: Vec<MessageMonitorRow> = conn
            .interact(move |conn| {
                let mut query = message_monitor::table
                    .filter(message_monitor::status.eq(status.as_str()))
                    .filter(message_monitor::next_send_time.ge(since_naive))
                    .into_boxed();

                if let Some(min_id) = min_id {
                    query = query.filter(
                        message_monitor::next_send_time
                            .ge(bucket_end)
                            .or(message_monitor::id.gt(min_id)),
                    );
                }

                query
                    .order((
                        message_monitor::next_send_time.asc(),
                        message_monitor::id.asc(),
                    ))
                    .limit(limit)
                    .load(conn)
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    #[cfg(feature = "sqlite")]
    async fn select_since_sqlite(
        &self,
        since: DateTime<Utc>,
        status: MonitorStatus,
        min_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<MessageMonitor>, StoreError> {
        let conn = self
            .dal
            .database
            .get_sqlite_connection()
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;

        let since_naive = to_naive(since);
        let bucket_end = to_naive(Self::bucket_end(since));

        let rows: Vec<MessageMonitorRow> = conn
            .interact(move |conn| {
                let mut query = message_monitor::table
                    .filter(message_monitor::status.eq(status.as_str()))
                    .filter(message_monitor::next_send_time.ge(since_naive))
                    .into_boxed();

                if let Some(min_id) = min_id {
                    query = query.filter(
                        message_monitor::next_send_time
                            .ge(bucket_end)
                            .or(message_monitor::id.gt(min_id)),
                    );
                }

                query
                    .order((
                        message_monitor::next_send_time.asc(),
                        message_monitor::id.asc(),
                    ))
                    .limit(limit)
                    .load(conn)
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Closes the WAIT_RECEIPT leg for the record carrying `msg_id`.
    ///
    /// Returns the affected row count; 0 means no record with that delivery
    /// id is currently awaiting a receipt.
    pub async fn confirm_receipt(&self, msg_id: &str, success: bool) -> Result<usize, StoreError> {
        crate::dispatch_backend!(
            self.dal.backend(),
            self.confirm_receipt_postgres(msg_id.to_string(), success)
                .await,
            self.confirm_receipt_sqlite(msg_id.to_string(), success)
                .await
        )
    }

    #[cfg(feature = "postgres")]
    async fn confirm_receipt_postgres(
        &self,
        msg_id: String,
        success: bool,
    ) -> Result<usize, StoreError> {
        let conn = self
            .dal
            .database
            .get_postgres_connection()
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;

        let target = if success {
            MonitorStatus::Success
        } else {
            MonitorStatus::Fail
        };
        let now = to_naive(Utc::now());

        let affected: usize = conn
            .interact(move |conn| {
                diesel::update(
                    message_monitor::table
                        .filter(message_monitor::msg_id.eq(msg_id))
                        .filter(message_monitor::status.eq(MonitorStatus::WaitReceipt.as_str())),
                )
                .set((
                    message_monitor::status.eq(target.as_str()),
                    message_monitor::receipt_time.eq(Some(now)),
                    message_monitor::update_time.eq(now),
                ))
                .execute(conn)
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;

        Ok(affected)
    }

    #[cfg(feature = "sqlite")]
    async fn confirm_receipt_sqlite(
        &self,
        msg_id: String,
        success: bool,
    ) -> Result<usize, StoreError> {
        let conn = self
            .dal
            .database
            .get_sqlite_connection()
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;

        let target = if success {
            MonitorStatus::Success
        } else {
            MonitorStatus::Fail
        };
        let now = to_naive(Utc::now());

        let affected: usize = conn
            .interact(move |conn| {
                diesel::update(
                    message_monitor::table
                        .filter(message_monitor::msg_id.eq(msg_id))
                        .filter(message_monitor::status.eq(MonitorStatus::WaitReceipt.as_str())),
                )
                .set((
                    message_monitor::status.eq(target.as_str()),
                    message_monitor::receipt_time.eq(Some(now)),
                    message_monitor::update_time.eq(now),
                ))
                .execute(conn)
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;

        Ok(affected)
    }
}
