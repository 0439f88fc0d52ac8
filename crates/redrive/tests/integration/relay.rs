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

//! End-to-end relay tests against the SQLite-backed store.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serial_test::serial;
use tempfile::TempDir;

use redrive::{
    CompensationConfig, MonitorStatus, NewMessageMonitor, OutboxRelay, PublishAdaptor,
    PublishConfig, PublishError,
};

struct RecordingAdaptor {
    sent: Mutex<Vec<String>>,
    fail_times: AtomicU32,
}

impl RecordingAdaptor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            fail_times: AtomicU32::new(0),
        })
    }

    fn failing(times: u32) -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            fail_times: AtomicU32::new(times),
        })
    }

    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl PublishAdaptor for RecordingAdaptor {
    async fn send(
        &self,
        topic: &str,
        _tag: &str,
        _content: &str,
        biz_no: &str,
        _config: Option<&PublishConfig>,
    ) -> Result<String, PublishError> {
        if self.fail_times.load(Ordering::SeqCst) > 0 {
            self.fail_times.fetch_sub(1, Ordering::SeqCst);
            return Err(PublishError::SendFailed {
                topic: topic.to_string(),
                message: "broker down".to_string(),
            });
        }
        self.sent.lock().unwrap().push(biz_no.to_string());
        Ok(format!("msg-{biz_no}"))
    }
}

struct RelayFixture {
    relay: OutboxRelay,
    adaptor: Arc<RecordingAdaptor>,
    url: String,
    _temp: TempDir,
}

async fn sqlite_relay(adaptor: Arc<RecordingAdaptor>) -> RelayFixture {
    let temp = TempDir::new().expect("Failed to create temp directory");
    let url = format!("sqlite://{}", temp.path().join("outbox.db").display());
    let relay = OutboxRelay::builder(
        adaptor.clone(),
        // Long interval: tests drive cycles explicitly.
        CompensationConfig::default().with_interval(Duration::from_secs(3600)),
    )
    .with_database(&url, "", 1)
    .await
    .expect("Failed to set up database")
    .build()
    .expect("Failed to build relay");
    RelayFixture {
        relay,
        adaptor,
        url,
        _temp: temp,
    }
}

#[tokio::test]
#[serial]
async fn test_enqueue_then_compensate_delivers() {
    let f = sqlite_relay(RecordingAdaptor::new()).await;

    let mut new = NewMessageMonitor::new("order-1", "orders", "created", "{}");
    new.next_send_time = Utc::now() - ChronoDuration::seconds(5);
    let id = f.relay.enqueue(new).await.unwrap().unwrap();

    let stats = f.relay.compensate_now().await.unwrap();
    assert_eq!(stats.dispatched, 1);
    assert_eq!(f.adaptor.sent(), vec!["order-1".to_string()]);

    let stored = f.relay.store().get_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.status, MonitorStatus::Success);
    assert_eq!(stored.msg_id.as_deref(), Some("msg-order-1"));
    f.relay.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_failed_delivery_survives_relay_restart() {
    let f = sqlite_relay(RecordingAdaptor::failing(1)).await;

    let mut new = NewMessageMonitor::new("order-1", "orders", "created", "{}");
    new.next_send_time = Utc::now() - ChronoDuration::seconds(5);
    // Immediate retry so the record is due again right away.
    new.retry_interval = 0;
    let id = f.relay.enqueue(new).await.unwrap().unwrap();

    let stats = f.relay.compensate_now().await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.dispatched, 0);
    f.relay.shutdown().await;

    // A fresh relay over the same database file picks the record up:
    // the durable row, not process state, carries the intent.
    let adaptor = RecordingAdaptor::new();
    let relay = OutboxRelay::builder(
        adaptor.clone(),
        CompensationConfig::default().with_interval(Duration::from_secs(3600)),
    )
    .with_database(&f.url, "", 1)
    .await
    .expect("Failed to reopen database")
    .build()
    .expect("Failed to build relay");

    let stats = relay.compensate_now().await.unwrap();
    assert_eq!(stats.dispatched, 1);

    let stored = relay.store().get_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.status, MonitorStatus::Success);
    assert_eq!(stored.try_times, 2);
    relay.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_backlog_larger_than_batch_drains_in_one_cycle() {
    let f = sqlite_relay(RecordingAdaptor::new()).await;

    for i in 0..45 {
        let mut new = NewMessageMonitor::new(&format!("order-{i}"), "orders", "created", "{}");
        new.next_send_time = Utc::now() - ChronoDuration::seconds(300 - i);
        f.relay.enqueue(new).await.unwrap().unwrap();
    }

    // Default batch size is 20; one cycle pages through the whole backlog.
    let stats = f.relay.compensate_now().await.unwrap();
    assert_eq!(stats.dispatched, 45);
    assert!(stats.batches >= 3);

    let mut sent = f.adaptor.sent();
    sent.sort();
    sent.dedup();
    assert_eq!(sent.len(), 45);
    f.relay.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_receipt_round_trip_on_sqlite() {
    let f = sqlite_relay(RecordingAdaptor::new()).await;

    let mut new = NewMessageMonitor::new("order-1", "orders", "created", "{}");
    new.need_receipt = true;
    let id = f.relay.enqueue(new).await.unwrap().unwrap();

    let monitor = f.relay.publish_now(id).await.unwrap();
    assert_eq!(monitor.status, MonitorStatus::WaitReceipt);

    let msg_id = monitor.msg_id.expect("msg_id assigned on send");
    assert_eq!(f.relay.confirm_receipt(&msg_id, true).await.unwrap(), 1);

    let stored = f.relay.store().get_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.status, MonitorStatus::Success);

    // The closed record is invisible to further compensation.
    let stats = f.relay.compensate_now().await.unwrap();
    assert_eq!(stats.dispatched, 0);
    f.relay.shutdown().await;
}
