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

//! Diesel schema for the outbox table.
//!
//! The column set is identical on both backends; every SQL type used here
//! maps to the same Rust type under PostgreSQL and SQLite, so a single
//! `table!` definition serves both.

diesel::table! {
    message_monitor (id) {
        id -> BigInt,
        biz_no -> Text,
        topic -> Text,
        tag -> Text,
        content -> Text,
        msg_id -> Nullable<Text>,
        next_send_time -> Timestamp,
        status -> Text,
        need_receipt -> Bool,
        try_times -> Integer,
        max_try_times -> Integer,
        retry_interval -> BigInt,
        publish_listener -> Nullable<Text>,
        send_time -> Nullable<Timestamp>,
        receipt_time -> Nullable<Timestamp>,
        create_time -> Timestamp,
        update_time -> Timestamp,
    }
}
