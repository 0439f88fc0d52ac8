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

//! Broker publishing seam and outcome recording.
//!
//! [`PublishAdaptor`] is the narrow contract a broker client implements.
//! [`RecordingPublisher`] wraps one and owns all status transitions: the
//! adaptor just sends, the recorder writes the outcome back to the store
//! per the state machine on [`crate::models::MonitorStatus`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use crate::error::PublishError;
use crate::models::{MessageMonitor, MonitorStatus};
use crate::store::OutboxStore;

/// Per-attempt publish options; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishConfig {
    /// Broker send timeout.
    pub timeout: Duration,
    /// Whether the message must go to an ordered partition keyed by
    /// `biz_no`.
    pub ordered: bool,
    /// Free-form broker properties (headers).
    pub properties: HashMap<String, String>,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            ordered: false,
            properties: HashMap::new(),
        }
    }
}

/// The broker client contract.
///
/// Implementations only move bytes; they never touch the outbox store.
#[async_trait]
pub trait PublishAdaptor: Send + Sync {
    /// Sends one message; returns the broker-assigned delivery id.
    async fn send(
        &self,
        topic: &str,
        tag: &str,
        content: &str,
        biz_no: &str,
        config: Option<&PublishConfig>,
    ) -> Result<String, PublishError>;

    /// Record-shaped variant used by the compensation engine.
    async fn send_from_monitor(&self, monitor: &MessageMonitor) -> Result<String, PublishError> {
        self.send(
            &monitor.topic,
            &monitor.tag,
            &monitor.content,
            &monitor.biz_no,
            monitor.publish_config.as_ref(),
        )
        .await
    }
}

/// Notified with a record's final outcome, looked up by the record's
/// `publish_listener` name.
#[async_trait]
pub trait PublishListener: Send + Sync {
    async fn on_success(&self, monitor: &MessageMonitor);
    async fn on_fail(&self, monitor: &MessageMonitor);
}

/// Publishes through an adaptor and records the outcome on the record.
///
/// Success sets `msg_id`/`send_time` and moves the record to `SUCCESS`
/// (`WAIT_RECEIPT` when a receipt is required). Failure bumps `try_times`,
/// pushes `next_send_time` out by `retry_interval`, and moves the record
/// to `FAIL` once the attempt budget is spent. Every outcome is written
/// back through the store before this returns.
pub struct RecordingPublisher {
    adaptor: Arc<dyn PublishAdaptor>,
    store: Arc<dyn OutboxStore>,
    listeners: HashMap<String, Arc<dyn PublishListener>>,
}

impl RecordingPublisher {
    pub fn new(adaptor: Arc<dyn PublishAdaptor>, store: Arc<dyn OutboxStore>) -> Self {
        Self {
            adaptor,
            store,
            listeners: HashMap::new(),
        }
    }

    /// Registers a named result listener.
    pub fn with_listener(mut self, name: &str, listener: Arc<dyn PublishListener>) -> Self {
        self.listeners.insert(name.to_string(), listener);
        self
    }

    /// One delivery attempt for `monitor`, outcome recorded.
    ///
    /// The original send error is returned after recording so the caller
    /// can count the failure; a record left `WAIT_SEND` here is picked up
    /// again by a later scan.
    pub async fn deliver(&self, monitor: &mut MessageMonitor) -> Result<(), PublishError> {
        if monitor.status != MonitorStatus::WaitSend {
            return Err(PublishError::NotEligible {
                id: monitor.id,
                status: monitor.status.to_string(),
            });
        }

        let now = Utc::now();
        monitor.try_times += 1;

        match self.adaptor.send_from_monitor(monitor).await {
            Ok(msg_id) => {
                monitor.msg_id = Some(msg_id);
                monitor.send_time = Some(now);
                let to = if monitor.need_receipt {
                    MonitorStatus::WaitReceipt
                } else {
                    MonitorStatus::Success
                };
                monitor.transition(to)?;
                self.store.update_by_id(monitor).await?;
                debug!(
                    id = monitor.id,
                    biz_no = %monitor.biz_no,
                    status = %monitor.status,
                    "Message published"
                );
                if monitor.status == MonitorStatus::Success {
                    self.notify_success(monitor).await;
                }
                Ok(())
            }
            Err(e) => {
                monitor.next_send_time = now + chrono::Duration::seconds(monitor.retry_interval);
                let spent = monitor.try_times >= monitor.max_try_times;
                if spent {
                    monitor.transition(MonitorStatus::Fail)?;
                }
                self.store.update_by_id(monitor).await?;
                warn!(
                    id = monitor.id,
                    biz_no = %monitor.biz_no,
                    try_times = monitor.try_times,
                    max_try_times = monitor.max_try_times,
                    error = %e,
                    "Publish attempt failed"
                );
                if spent {
                    self.notify_fail(monitor).await;
                }
                Err(e)
            }
        }
    }

    /// Closes the WAIT_RECEIPT leg for a delivered message.
    pub async fn record_receipt(
        &self,
        monitor: &mut MessageMonitor,
        success: bool,
    ) -> Result<(), PublishError> {
        let to = if success {
            MonitorStatus::Success
        } else {
            MonitorStatus::Fail
        };
        monitor.transition(to)?;
        monitor.receipt_time = Some(Utc::now());
        self.store.update_by_id(monitor).await?;
        if success {
            self.notify_success(monitor).await;
        } else {
            self.notify_fail(monitor).await;
        }
        Ok(())
    }

    async fn notify_success(&self, monitor: &MessageMonitor) {
        if let Some(listener) = self.listener_for(monitor) {
            listener.on_success(monitor).await;
        }
    }

    async fn notify_fail(&self, monitor: &MessageMonitor) {
        if let Some(listener) = self.listener_for(monitor) {
            listener.on_fail(monitor).await;
        }
    }

    fn listener_for(&self, monitor: &MessageMonitor) -> Option<&Arc<dyn PublishListener>> {
        monitor
            .publish_listener
            .as_deref()
            .and_then(|name| self.listeners.get(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewMessageMonitor;
    use crate::store::MemoryOutboxStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyAdaptor {
        fail_first: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl PublishAdaptor for FlakyAdaptor {
        async fn send(
            &self,
            topic: &str,
            _tag: &str,
            _content: &str,
            _biz_no: &str,
            _config: Option<&PublishConfig>,
        ) -> Result<String, PublishError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(PublishError::SendFailed {
                    topic: topic.to_string(),
                    message: "broker unavailable".to_string(),
                });
            }
            Ok(format!("msg-{n}"))
        }
    }

    async fn seeded(store: &MemoryOutboxStore) -> MessageMonitor {
        let new = NewMessageMonitor::new("order-1", "orders", "created", "{}");
        let id = store.insert_if_absent(new).await.unwrap().unwrap();
        store.get_by_id(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_success_records_msg_id_and_status() {
        let store = Arc::new(MemoryOutboxStore::new());
        let publisher = RecordingPublisher::new(
            Arc::new(FlakyAdaptor {
                fail_first: 0,
                calls: AtomicU32::new(0),
            }),
            store.clone(),
        );

        let mut monitor = seeded(&store).await;
        publisher.deliver(&mut monitor).await.unwrap();

        let stored = store.get_by_id(monitor.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MonitorStatus::Success);
        assert_eq!(stored.msg_id.as_deref(), Some("msg-0"));
        assert!(stored.send_time.is_some());
        assert_eq!(stored.try_times, 1);
    }

    #[tokio::test]
    async fn test_need_receipt_parks_in_wait_receipt() {
        let store = Arc::new(MemoryOutboxStore::new());
        let publisher = RecordingPublisher::new(
            Arc::new(FlakyAdaptor {
                fail_first: 0,
                calls: AtomicU32::new(0),
            }),
            store.clone(),
        );

        let mut new = NewMessageMonitor::new("order-2", "orders", "created", "{}");
        new.need_receipt = true;
        let id = store.insert_if_absent(new).await.unwrap().unwrap();
        let mut monitor = store.get_by_id(id).await.unwrap().unwrap();

        publisher.deliver(&mut monitor).await.unwrap();
        assert_eq!(monitor.status, MonitorStatus::WaitReceipt);

        publisher.record_receipt(&mut monitor, true).await.unwrap();
        let stored = store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(stored.status, MonitorStatus::Success);
        assert!(stored.receipt_time.is_some());
    }

    #[tokio::test]
    async fn test_failure_bumps_retry_and_stays_wait_send() {
        let store = Arc::new(MemoryOutboxStore::new());
        let publisher = RecordingPublisher::new(
            Arc::new(FlakyAdaptor {
                fail_first: 1,
                calls: AtomicU32::new(0),
            }),
            store.clone(),
        );

        let mut monitor = seeded(&store).await;
        let due_before = monitor.next_send_time;
        assert!(publisher.deliver(&mut monitor).await.is_err());

        let stored = store.get_by_id(monitor.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MonitorStatus::WaitSend);
        assert_eq!(stored.try_times, 1);
        assert!(stored.next_send_time > due_before);

        // Second attempt succeeds.
        publisher.deliver(&mut monitor).await.unwrap();
        let stored = store.get_by_id(monitor.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MonitorStatus::Success);
        assert_eq!(stored.try_times, 2);
    }

    #[tokio::test]
    async fn test_attempt_budget_spent_marks_fail() {
        let store = Arc::new(MemoryOutboxStore::new());
        let publisher = RecordingPublisher::new(
            Arc::new(FlakyAdaptor {
                fail_first: u32::MAX,
                calls: AtomicU32::new(0),
            }),
            store.clone(),
        );

        let mut new = NewMessageMonitor::new("order-3", "orders", "created", "{}");
        new.max_try_times = 2;
        let id = store.insert_if_absent(new).await.unwrap().unwrap();
        let mut monitor = store.get_by_id(id).await.unwrap().unwrap();

        assert!(publisher.deliver(&mut monitor).await.is_err());
        assert_eq!(monitor.status, MonitorStatus::WaitSend);
        assert!(publisher.deliver(&mut monitor).await.is_err());

        let stored = store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(stored.status, MonitorStatus::Fail);
        assert_eq!(stored.try_times, 2);
    }

    #[tokio::test]
    async fn test_terminal_record_is_not_eligible() {
        let store = Arc::new(MemoryOutboxStore::new());
        let publisher = RecordingPublisher::new(
            Arc::new(FlakyAdaptor {
                fail_first: 0,
                calls: AtomicU32::new(0),
            }),
            store.clone(),
        );

        let mut monitor = seeded(&store).await;
        publisher.deliver(&mut monitor).await.unwrap();
        let err = publisher.deliver(&mut monitor).await.unwrap_err();
        assert!(matches!(err, PublishError::NotEligible { .. }));
    }

    struct Observing {
        succeeded: AtomicU32,
        failed: AtomicU32,
    }

    #[async_trait]
    impl PublishListener for Observing {
        async fn on_success(&self, _monitor: &MessageMonitor) {
            self.succeeded.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_fail(&self, _monitor: &MessageMonitor) {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_listener_sees_final_outcome_only() {
        let store = Arc::new(MemoryOutboxStore::new());
        let observer = Arc::new(Observing {
            succeeded: AtomicU32::new(0),
            failed: AtomicU32::new(0),
        });
        let publisher = RecordingPublisher::new(
            Arc::new(FlakyAdaptor {
                fail_first: u32::MAX,
                calls: AtomicU32::new(0),
            }),
            store.clone(),
        )
        .with_listener("order-listener", observer.clone());

        let mut new = NewMessageMonitor::new("order-4", "orders", "created", "{}");
        new.max_try_times = 2;
        new.publish_listener = Some("order-listener".to_string());
        let id = store.insert_if_absent(new).await.unwrap().unwrap();
        let mut monitor = store.get_by_id(id).await.unwrap().unwrap();

        // First failure is not final.
        assert!(publisher.deliver(&mut monitor).await.is_err());
        assert_eq!(observer.failed.load(Ordering::SeqCst), 0);

        assert!(publisher.deliver(&mut monitor).await.is_err());
        assert_eq!(observer.failed.load(Ordering::SeqCst), 1);
        assert_eq!(observer.succeeded.load(Ordering::SeqCst), 0);
    }
}
