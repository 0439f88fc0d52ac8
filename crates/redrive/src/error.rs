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

//! Error types for outbox storage, caching, locking, publishing and the
//! compensation engine.
//!
//! Every failure class here is recoverable: nothing escalates to the process.
//! The compensation engine degrades to "retry next cycle" for all of them.

use thiserror::Error;

/// Errors raised by the outbox store and its diesel-backed DAL.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to obtain or use a pooled database connection.
    #[error("Connection pool error: {0}")]
    ConnectionPool(String),

    /// Underlying database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),

    /// Database migrations could not be applied.
    #[error("Migration error: {0}")]
    Migration(String),

    /// A persisted status column held a value outside the state machine.
    #[error("Invalid monitor status: {0}")]
    InvalidStatus(String),

    /// A status transition not permitted by the state machine was requested.
    #[error("Illegal status transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    /// No record with the given id exists.
    #[error("Message monitor not found: {0}")]
    NotFound(i64),
}

/// Errors raised by the cursor cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cache backend is unreachable or refused the operation.
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    /// A cached value could not be decoded.
    #[error("Corrupt cache value for key '{key}': {message}")]
    Corrupt { key: String, message: String },
}

/// Errors raised by the distributed lock.
///
/// Failing to *acquire* the lock is not an error; the engine treats it as
/// "someone else is running this cycle". These variants cover real faults.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock backend is unreachable or refused the operation.
    #[error("Lock service unavailable: {0}")]
    Unavailable(String),

    /// A renew or release was attempted with a token that no longer owns
    /// the lock (lease expired and was taken by another instance).
    #[error("Lock lease lost for key '{0}'")]
    LeaseLost(String),
}

/// Errors raised by the publish adaptor when dispatching to the broker.
#[derive(Debug, Error)]
pub enum PublishError {
    /// Transient broker or network failure; the record stays WAIT_SEND and
    /// is retried on a later cycle.
    #[error("Broker send failed for topic '{topic}': {message}")]
    SendFailed { topic: String, message: String },

    /// The record is not in a publishable state.
    #[error("Record {id} is not eligible for publish (status {status})")]
    NotEligible { id: i64, status: String },

    /// Recording the publish outcome back to the store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised by a compensation cycle.
#[derive(Debug, Error)]
pub enum CompensationError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Errors raised when arming a task on the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// FixedRate and FixedDelay tasks must have a non-zero period or the
    /// task would fire in a busy loop.
    #[error("Recurring schedule requires a non-zero period")]
    ZeroPeriod,
}
