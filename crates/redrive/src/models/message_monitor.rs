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

//! Message Monitor Model
//!
//! A message monitor is a persisted intent to deliver one message: the
//! durable row that decouples the business-transaction commit from the
//! actual broker publish. Rows are written by the business, re-driven by the
//! compensation engine while they remain `WAIT_SEND`, and closed out by the
//! publish adaptor's outcome. This crate never physically deletes them.

use crate::error::StoreError;
use crate::publish::PublishConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Delivery status of an outbox record.
///
/// Transitions are driven by the publish adaptor's outcome, not by the
/// compensation engine:
///
/// ```text
/// WAIT_SEND -> SUCCESS | FAIL | WAIT_RECEIPT
/// WAIT_RECEIPT -> SUCCESS | FAIL
/// any -> CANCEL
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MonitorStatus {
    /// Awaiting (re)delivery; eligible once `next_send_time <= now`.
    WaitSend,
    /// Sent to the broker, awaiting a consumer receipt.
    WaitReceipt,
    /// Delivered (and, if required, receipted).
    Success,
    /// Gave up after `max_try_times` attempts.
    Fail,
    /// Withdrawn by the business; never redelivered.
    Cancel,
}

impl MonitorStatus {
    /// The persisted column value for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorStatus::WaitSend => "WAIT_SEND",
            MonitorStatus::WaitReceipt => "WAIT_RECEIPT",
            MonitorStatus::Success => "SUCCESS",
            MonitorStatus::Fail => "FAIL",
            MonitorStatus::Cancel => "CANCEL",
        }
    }

    /// Parses a persisted column value.
    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "WAIT_SEND" => Ok(MonitorStatus::WaitSend),
            "WAIT_RECEIPT" => Ok(MonitorStatus::WaitReceipt),
            "SUCCESS" => Ok(MonitorStatus::Success),
            "FAIL" => Ok(MonitorStatus::Fail),
            "CANCEL" => Ok(MonitorStatus::Cancel),
            other => Err(StoreError::InvalidStatus(other.to_string())),
        }
    }

    /// Whether the state machine permits moving from `self` to `to`.
    pub fn can_transition(&self, to: MonitorStatus) -> bool {
        use MonitorStatus::*;
        match (self, to) {
            (_, Cancel) => true,
            (WaitSend, Success) | (WaitSend, Fail) | (WaitSend, WaitReceipt) => true,
            (WaitReceipt, Success) | (WaitReceipt, Fail) => true,
            _ => false,
        }
    }

    /// True for statuses with no further transitions other than CANCEL.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MonitorStatus::Success | MonitorStatus::Fail | MonitorStatus::Cancel
        )
    }
}

impl fmt::Display for MonitorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A persisted outbox record (domain type).
///
/// Maps one-to-one onto the `message_monitor` table, plus an ephemeral
/// publish configuration that is never persisted and applies only to the
/// current delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMonitor {
    /// Surrogate id (BIGSERIAL / AUTOINCREMENT); monotonic per table.
    pub id: i64,
    /// Business key of the message.
    pub biz_no: String,
    /// Destination topic.
    pub topic: String,
    /// Destination tag within the topic.
    pub tag: String,
    /// Message payload.
    pub content: String,
    /// Delivery id assigned by the broker once sent.
    pub msg_id: Option<String>,
    /// Due time for the next delivery attempt.
    pub next_send_time: DateTime<Utc>,
    /// Current delivery status.
    pub status: MonitorStatus,
    /// Whether a consumer receipt is required before SUCCESS.
    pub need_receipt: bool,
    /// Delivery attempts made so far.
    pub try_times: i32,
    /// Attempts after which the record is marked FAIL.
    pub max_try_times: i32,
    /// Seconds added to `next_send_time` after a failed attempt.
    pub retry_interval: i64,
    /// Name of the result listener to invoke with the final outcome.
    pub publish_listener: Option<String>,
    /// When the message was last handed to the broker.
    pub send_time: Option<DateTime<Utc>>,
    /// When the consumer receipt arrived.
    pub receipt_time: Option<DateTime<Utc>>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    /// Publish configuration for the current attempt only; not persisted.
    #[serde(skip)]
    pub publish_config: Option<PublishConfig>,
}

impl MessageMonitor {
    /// Materializes a record from its insert form, as a store would on
    /// insert. `id` is left at 0 for the store to assign.
    pub fn from_new(new: NewMessageMonitor) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            biz_no: new.biz_no,
            topic: new.topic,
            tag: new.tag,
            content: new.content,
            msg_id: None,
            next_send_time: new.next_send_time,
            status: MonitorStatus::WaitSend,
            need_receipt: new.need_receipt,
            try_times: 0,
            max_try_times: new.max_try_times,
            retry_interval: new.retry_interval,
            publish_listener: new.publish_listener,
            send_time: None,
            receipt_time: None,
            create_time: now,
            update_time: now,
            publish_config: None,
        }
    }

    /// Whether this record is eligible for (re)delivery at `now`.
    ///
    /// Eligibility is re-evaluated on every scan, never cached.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == MonitorStatus::WaitSend && self.next_send_time <= now
    }

    /// Moves the record to `to`, enforcing the state machine.
    pub fn transition(&mut self, to: MonitorStatus) -> Result<(), StoreError> {
        if !self.status.can_transition(to) {
            return Err(StoreError::IllegalTransition {
                from: self.status.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        self.status = to;
        Ok(())
    }
}

/// A new outbox record to insert (domain type).
///
/// `status` starts at `WAIT_SEND`; timestamps are assigned by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessageMonitor {
    pub biz_no: String,
    pub topic: String,
    pub tag: String,
    pub content: String,
    /// Due time for the first delivery attempt; "now" for immediate.
    pub next_send_time: DateTime<Utc>,
    pub need_receipt: bool,
    pub max_try_times: i32,
    pub retry_interval: i64,
    pub publish_listener: Option<String>,
}

impl NewMessageMonitor {
    /// A monitor due immediately with default retry policy.
    pub fn new(biz_no: &str, topic: &str, tag: &str, content: &str) -> Self {
        Self {
            biz_no: biz_no.to_string(),
            topic: topic.to_string(),
            tag: tag.to_string(),
            content: content.to_string(),
            next_send_time: Utc::now(),
            need_receipt: false,
            max_try_times: 5,
            retry_interval: 60,
            publish_listener: None,
        }
    }
}
