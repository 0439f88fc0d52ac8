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

//! Row models for the `message_monitor` table.
//!
//! Every column type used here maps identically on PostgreSQL and SQLite,
//! so one set of row structs serves both backends. Domain types live in
//! [`crate::models::message_monitor`]; conversion happens at the DAL
//! boundary (row timestamps are naive UTC, domain timestamps are
//! `DateTime<Utc>`).

use crate::database::schema::message_monitor;
use crate::error::StoreError;
use crate::models::{MessageMonitor, MonitorStatus};
use chrono::{DateTime, NaiveDateTime, SubsecRound, TimeZone, Utc};
use diesel::prelude::*;

/// Converts a stored naive UTC timestamp into the domain representation.
pub(crate) fn to_utc(naive: NaiveDateTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&naive)
}

/// Converts a domain timestamp into the stored naive UTC representation.
pub(crate) fn to_naive(dt: DateTime<Utc>) -> NaiveDateTime {
    dt.naive_utc()
}

/// A `message_monitor` row as loaded from the database.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = message_monitor)]
pub struct MessageMonitorRow {
    pub id: i64,
    pub biz_no: String,
    pub topic: String,
    pub tag: String,
    pub content: String,
    pub msg_id: Option<String>,
    pub next_send_time: NaiveDateTime,
    pub status: String,
    pub need_receipt: bool,
    pub try_times: i32,
    pub max_try_times: i32,
    pub retry_interval: i64,
    pub publish_listener: Option<String>,
    pub send_time: Option<NaiveDateTime>,
    pub receipt_time: Option<NaiveDateTime>,
    pub create_time: NaiveDateTime,
    pub update_time: NaiveDateTime,
}

impl TryFrom<MessageMonitorRow> for MessageMonitor {
    type Error = StoreError;

    fn try_from(row: MessageMonitorRow) -> Result<Self, Self::Error> {
        Ok(MessageMonitor {
            id: row.id,
            biz_no: row.biz_no,
            topic: row.topic,
            tag: row.tag,
            content: row.content,
            msg_id: row.msg_id,
            next_send_time: to_utc(row.next_send_time),
            status: MonitorStatus::parse(&row.status)?,
            need_receipt: row.need_receipt,
            try_times: row.try_times,
            max_try_times: row.max_try_times,
            retry_interval: row.retry_interval,
            publish_listener: row.publish_listener,
            send_time: row.send_time.map(to_utc),
            receipt_time: row.receipt_time.map(to_utc),
            create_time: to_utc(row.create_time),
            update_time: to_utc(row.update_time),
            publish_config: None,
        })
    }
}

/// A new `message_monitor` row to insert.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = message_monitor)]
pub struct NewMessageMonitorRow {
    pub biz_no: String,
    pub topic: String,
    pub tag: String,
    pub content: String,
    pub next_send_time: NaiveDateTime,
    pub status: String,
    pub need_receipt: bool,
    pub try_times: i32,
    pub max_try_times: i32,
    pub retry_interval: i64,
    pub publish_listener: Option<String>,
    pub create_time: NaiveDateTime,
    pub update_time: NaiveDateTime,
}

impl NewMessageMonitorRow {
    /// Builds an insertable row from the domain type; `status` starts at
    /// WAIT_SEND and both audit timestamps are set to `now`.
    ///
    /// `next_send_time` is stored at whole-second precision; the scan
    /// cursor's bucket arithmetic depends on due times never diverging
    /// inside a second.
    pub fn from_domain(new: crate::models::NewMessageMonitor, now: DateTime<Utc>) -> Self {
        Self {
            biz_no: new.biz_no,
            topic: new.topic,
            tag: new.tag,
            content: new.content,
            next_send_time: to_naive(new.next_send_time.trunc_subsecs(0)),
            status: MonitorStatus::WaitSend.as_str().to_string(),
            need_receipt: new.need_receipt,
            try_times: 0,
            max_try_times: new.max_try_times,
            retry_interval: new.retry_interval,
            publish_listener: new.publish_listener,
            create_time: to_naive(now),
            update_time: to_naive(now),
        }
    }
}
