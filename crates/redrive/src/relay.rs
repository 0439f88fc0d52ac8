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

//! Top-level facade wiring store, cache, lock, publisher, scheduler and
//! engine into one owned runtime.

use std::sync::Arc;

use tracing::info;

use crate::cache::{CursorCache, MemoryCursorCache};
use crate::compensation::{CompensationConfig, CompensationEngine, CycleStats};
use crate::database::Database;
use crate::error::{CompensationError, PublishError, StoreError};
use crate::lock::DistributedLock;
use crate::models::{MessageMonitor, NewMessageMonitor};
use crate::publish::{PublishAdaptor, PublishListener, RecordingPublisher};
use crate::scheduler::TaskScheduler;
use crate::store::{DatabaseOutboxStore, OutboxStore};

/// Owns the outbox runtime: business writes go in through [`enqueue`],
/// the armed compensation engine drives them out through the adaptor.
///
/// [`enqueue`]: OutboxRelay::enqueue
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<RecordingPublisher>,
    engine: Arc<CompensationEngine>,
    scheduler: TaskScheduler,
}

/// Assembles an [`OutboxRelay`]; collaborators not supplied fall back to
/// the in-process implementations.
pub struct OutboxRelayBuilder {
    adaptor: Arc<dyn PublishAdaptor>,
    config: CompensationConfig,
    store: Option<Arc<dyn OutboxStore>>,
    cache: Option<Arc<dyn CursorCache>>,
    lock: Option<Arc<dyn DistributedLock>>,
    listeners: Vec<(String, Arc<dyn PublishListener>)>,
}

impl OutboxRelayBuilder {
    /// Backs the relay with the diesel store on `database_url`
    /// (`postgresql://` or `sqlite://`), running migrations first.
    pub async fn with_database(
        mut self,
        database_url: &str,
        database_name: &str,
        pool_size: u32,
    ) -> Result<Self, StoreError> {
        let database = Database::new(database_url, database_name, pool_size);
        database.run_migrations().await?;
        self.store = Some(Arc::new(DatabaseOutboxStore::new(database)));
        Ok(self)
    }

    pub fn with_store(mut self, store: Arc<dyn OutboxStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn CursorCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_lock(mut self, lock: Arc<dyn DistributedLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn with_listener(mut self, name: &str, listener: Arc<dyn PublishListener>) -> Self {
        self.listeners.push((name.to_string(), listener));
        self
    }

    /// Wires everything up and arms the compensation engine.
    pub fn build(self) -> Result<OutboxRelay, CompensationError> {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(crate::store::MemoryOutboxStore::new()));
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(MemoryCursorCache::new()));

        let mut publisher = RecordingPublisher::new(self.adaptor, store.clone());
        for (name, listener) in self.listeners {
            publisher = publisher.with_listener(&name, listener);
        }
        let publisher = Arc::new(publisher);

        let mut engine =
            CompensationEngine::new(store.clone(), cache, publisher.clone(), self.config);
        if let Some(lock) = self.lock {
            engine = engine.with_lock(lock);
        }
        let engine = Arc::new(engine);

        let scheduler = TaskScheduler::new();
        engine.arm(&scheduler)?;
        info!("Outbox relay started");

        Ok(OutboxRelay {
            store,
            publisher,
            engine,
            scheduler,
        })
    }
}

impl OutboxRelay {
    pub fn builder(adaptor: Arc<dyn PublishAdaptor>, config: CompensationConfig) -> OutboxRelayBuilder {
        OutboxRelayBuilder {
            adaptor,
            config,
            store: None,
            cache: None,
            lock: None,
            listeners: Vec::new(),
        }
    }

    /// Records a delivery intent; the engine picks it up once due.
    ///
    /// Returns the record id, or `None` when the same
    /// `(biz_no, topic, tag)` intent already exists.
    pub async fn enqueue(&self, new: NewMessageMonitor) -> Result<Option<i64>, StoreError> {
        self.store.insert_if_absent(new).await
    }

    /// Publishes one record immediately instead of waiting for the next
    /// compensation cycle. The outcome is recorded either way.
    pub async fn publish_now(&self, id: i64) -> Result<MessageMonitor, PublishError> {
        let mut monitor = self
            .store
            .get_by_id(id)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        self.publisher.deliver(&mut monitor).await?;
        Ok(monitor)
    }

    /// Closes the WAIT_RECEIPT leg for a broker delivery id.
    pub async fn confirm_receipt(&self, msg_id: &str, success: bool) -> Result<usize, StoreError> {
        self.store.confirm_receipt(msg_id, success).await
    }

    /// Runs a compensation cycle right now, outside the schedule.
    pub async fn compensate_now(&self) -> Result<CycleStats, CompensationError> {
        self.engine.run_cycle().await
    }

    pub fn store(&self) -> Arc<dyn OutboxStore> {
        self.store.clone()
    }

    /// Stops the engine and waits for scheduled tasks to end.
    pub async fn shutdown(&self) {
        self.engine.stop();
        self.scheduler.shutdown().await;
        info!("Outbox relay stopped");
    }
}
