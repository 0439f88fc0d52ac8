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

//! # Redrive
//!
//! Reliable, at-least-once message delivery for systems that publish
//! events to an external broker while tolerating publisher crashes,
//! broker unavailability and multi-instance deployment races.
//!
//! Business code records a delivery intent as a durable outbox row after
//! its own transaction commits. A self-healing compensation engine then
//! scans for rows still awaiting delivery and re-drives them through a
//! pluggable broker adaptor, resuming after crashes from a persisted
//! two-part cursor and optionally coordinating across instances with a
//! leased distributed lock.
//!
//! Delivery is at-least-once by design: downstream consumers are expected
//! to handle duplicates idempotently. Exactly-once delivery and ordering
//! across topics are out of scope.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use redrive::{CompensationConfig, NewMessageMonitor, OutboxRelay, PublishAdaptor};
//! # use redrive::{PublishConfig, PublishError};
//! # struct MyBroker;
//! # #[async_trait::async_trait]
//! # impl PublishAdaptor for MyBroker {
//! #     async fn send(&self, _: &str, _: &str, _: &str, _: &str, _: Option<&PublishConfig>)
//! #         -> Result<String, PublishError> { Ok("msg-1".into()) }
//! # }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let relay = OutboxRelay::builder(Arc::new(MyBroker), CompensationConfig::default())
//!     .with_database("sqlite://outbox.db", "outbox", 5)
//!     .await?
//!     .build()?;
//!
//! // After the business transaction commits:
//! relay
//!     .enqueue(NewMessageMonitor::new("order-42", "orders", "created", "{\"id\":42}"))
//!     .await?;
//! // The armed engine delivers it; or push it out immediately:
//! # Ok(())
//! # }
//! ```
//!
//! ## Layout
//!
//! - [`scheduler`] — the self-rescheduling recurring-task runner.
//! - [`models`] / [`database`] / [`dal`] — the outbox row, its state
//!   machine and the diesel dual-backend storage.
//! - [`cursor`] / [`cache`] — the resumable scan position.
//! - [`lock`] — optional cross-instance mutual exclusion.
//! - [`publish`] — the broker seam and outcome recording.
//! - [`compensation`] — the periodic scan engine.
//! - [`relay`] — the assembled runtime.

pub mod cache;
pub mod compensation;
pub mod cursor;
pub mod dal;
pub mod database;
pub mod error;
pub mod lock;
pub mod models;
pub mod publish;
pub mod relay;
pub mod scheduler;
pub mod store;

pub use cache::{CursorCache, MemoryCursorCache};
pub use compensation::{CompensationConfig, CompensationEngine, CycleStats};
pub use cursor::ScanCursor;
pub use database::{BackendType, Database};
pub use error::{
    CacheError, CompensationError, LockError, PublishError, SchedulerError, StoreError,
};
pub use lock::{DistributedLock, LocalLock, LockLease};
pub use models::{MessageMonitor, MonitorStatus, NewMessageMonitor};
pub use publish::{PublishAdaptor, PublishConfig, PublishListener, RecordingPublisher};
pub use relay::{OutboxRelay, OutboxRelayBuilder};
pub use scheduler::{
    FiringHook, RecurringCommand, ScheduleMode, TaskHandle, TaskSchedule, TaskScheduler,
};
pub use store::{DatabaseOutboxStore, MemoryOutboxStore, OutboxStore};
