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

//! Data Access Layer with runtime backend selection.
//!
//! Each operation dispatches to a backend-specific implementation based on
//! the database the pool was built for. The row models live in
//! [`models`]; domain conversions happen at this boundary.

use crate::database::{AnyPool, BackendType, Database};

pub mod message_monitor;
pub mod models;

pub use message_monitor::MessageMonitorDAL;

/// Helper macro for dispatching operations based on backend type.
///
/// # Example
///
/// ```rust,ignore
/// crate::dispatch_backend!(
///     self.dal.backend(),
///     self.operation_postgres().await,
///     self.operation_sqlite().await
/// )
/// ```
#[macro_export]
macro_rules! dispatch_backend {
    ($backend:expr, $pg:expr, $sqlite:expr) => {
        match $backend {
            #[cfg(feature = "postgres")]
            $crate::database::BackendType::Postgres => $pg,
            #[cfg(feature = "sqlite")]
            $crate::database::BackendType::Sqlite => $sqlite,
            #[allow(unreachable_patterns)]
            _ => panic!("database backend not enabled at compile time"),
        }
    };
}

/// The Data Access Layer struct.
///
/// # Thread Safety
///
/// `DAL` is `Clone` and can be safely shared between threads. Each clone
/// references the same underlying connection pool.
#[derive(Clone, Debug)]
pub struct DAL {
    /// The database instance with connection pool
    pub database: Database,
}

impl DAL {
    /// Creates a new DAL instance.
    pub fn new(database: Database) -> Self {
        DAL { database }
    }

    /// Returns the backend type for this DAL instance.
    pub fn backend(&self) -> BackendType {
        self.database.backend()
    }

    /// Returns the connection pool.
    pub fn pool(&self) -> AnyPool {
        self.database.pool()
    }

    /// Returns a message monitor DAL for outbox operations.
    pub fn message_monitor(&self) -> MessageMonitorDAL<'_> {
        MessageMonitorDAL::new(self)
    }
}
