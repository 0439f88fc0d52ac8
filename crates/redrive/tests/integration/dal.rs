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

//! Integration tests for the diesel-backed outbox store on SQLite.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serial_test::serial;
use tempfile::TempDir;

use redrive::{
    Database, DatabaseOutboxStore, MessageMonitor, MonitorStatus, NewMessageMonitor, OutboxStore,
};

struct DbFixture {
    store: DatabaseOutboxStore,
    // Held so the database file outlives the store.
    _temp: TempDir,
}

async fn sqlite_store() -> DbFixture {
    let temp = TempDir::new().expect("Failed to create temp directory");
    let db_path = temp.path().join("outbox.db");
    let url = format!("sqlite://{}", db_path.display());
    let database = Database::new(&url, "", 1);
    database
        .run_migrations()
        .await
        .expect("Failed to run migrations");
    DbFixture {
        store: DatabaseOutboxStore::new(database),
        _temp: temp,
    }
}

fn due_at(offset_secs: i64) -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0) + Duration::seconds(offset_secs)
}

async fn seed(store: &DatabaseOutboxStore, biz_no: &str, due: DateTime<Utc>) -> i64 {
    let mut new = NewMessageMonitor::new(biz_no, "orders", "created", "{\"k\":1}");
    new.next_send_time = due;
    store
        .insert_if_absent(new)
        .await
        .expect("insert failed")
        .expect("expected fresh insert")
}

async fn load(store: &DatabaseOutboxStore, id: i64) -> MessageMonitor {
    store
        .get_by_id(id)
        .await
        .expect("get failed")
        .expect("record missing")
}

#[tokio::test]
#[serial]
async fn test_insert_round_trips_through_sqlite() {
    let f = sqlite_store().await;
    let due = due_at(-100);
    let id = seed(&f.store, "order-1", due).await;

    let stored = load(&f.store, id).await;
    assert_eq!(stored.biz_no, "order-1");
    assert_eq!(stored.topic, "orders");
    assert_eq!(stored.status, MonitorStatus::WaitSend);
    assert_eq!(stored.next_send_time, due);
    assert_eq!(stored.try_times, 0);
    assert_eq!(stored.max_try_times, 5);
    assert!(stored.msg_id.is_none());
}

#[tokio::test]
#[serial]
async fn test_insert_if_absent_is_conflict_silent() {
    let f = sqlite_store().await;
    seed(&f.store, "order-1", due_at(-10)).await;

    let dup = f
        .store
        .insert_if_absent(NewMessageMonitor::new("order-1", "orders", "created", "{}"))
        .await
        .expect("insert failed");
    assert!(dup.is_none());

    let other_tag = f
        .store
        .insert_if_absent(NewMessageMonitor::new("order-1", "orders", "paid", "{}"))
        .await
        .expect("insert failed");
    assert!(other_tag.is_some());
}

#[tokio::test]
#[serial]
async fn test_update_by_id_persists_state_machine_outcome() {
    let f = sqlite_store().await;
    let id = seed(&f.store, "order-1", due_at(-10)).await;

    let mut monitor = load(&f.store, id).await;
    monitor.msg_id = Some("msg-1".to_string());
    monitor.send_time = Some(Utc::now());
    monitor.try_times = 1;
    monitor.transition(MonitorStatus::Success).unwrap();
    assert_eq!(f.store.update_by_id(&monitor).await.unwrap(), 1);

    let stored = load(&f.store, id).await;
    assert_eq!(stored.status, MonitorStatus::Success);
    assert_eq!(stored.msg_id.as_deref(), Some("msg-1"));
    assert_eq!(stored.try_times, 1);
    assert!(stored.send_time.is_some());
    assert!(stored.update_time >= stored.create_time);

    // Updating a nonexistent id affects nothing.
    monitor.id = 9999;
    assert_eq!(f.store.update_by_id(&monitor).await.unwrap(), 0);
}

#[tokio::test]
#[serial]
async fn test_min_next_send_time_ignores_terminal_records() {
    let f = sqlite_store().await;
    assert!(f
        .store
        .min_next_send_time(MonitorStatus::WaitSend)
        .await
        .unwrap()
        .is_none());

    let oldest = due_at(-300);
    let done_id = seed(&f.store, "done", due_at(-500)).await;
    seed(&f.store, "old", oldest).await;
    seed(&f.store, "new", due_at(-100)).await;

    let mut done = load(&f.store, done_id).await;
    done.transition(MonitorStatus::Success).unwrap();
    f.store.update_by_id(&done).await.unwrap();

    assert_eq!(
        f.store
            .min_next_send_time(MonitorStatus::WaitSend)
            .await
            .unwrap(),
        Some(oldest)
    );
}

#[tokio::test]
#[serial]
async fn test_select_since_pages_by_due_time_then_id() {
    let f = sqlite_store().await;
    let t = due_at(-100);
    let r1 = seed(&f.store, "r1", t).await;
    let r2 = seed(&f.store, "r2", t).await;
    let r3 = seed(&f.store, "r3", t + Duration::seconds(1)).await;

    let page = f
        .store
        .select_since(t, MonitorStatus::WaitSend, None, 2)
        .await
        .unwrap();
    assert_eq!(page.iter().map(|m| m.id).collect::<Vec<_>>(), vec![r1, r2]);

    // Resuming with the tie-break id picks up the next bucket without
    // re-reading the first two rows.
    let page = f
        .store
        .select_since(t, MonitorStatus::WaitSend, Some(r2), 2)
        .await
        .unwrap();
    assert_eq!(page.iter().map(|m| m.id).collect::<Vec<_>>(), vec![r3]);

    let page = f
        .store
        .select_since(t + Duration::seconds(1), MonitorStatus::WaitSend, None, 2)
        .await
        .unwrap();
    assert_eq!(page.iter().map(|m| m.id).collect::<Vec<_>>(), vec![r3]);
}

#[tokio::test]
#[serial]
async fn test_select_since_filters_status() {
    let f = sqlite_store().await;
    let t = due_at(-100);
    let r1 = seed(&f.store, "r1", t).await;
    seed(&f.store, "r2", t).await;

    let mut done = load(&f.store, r1).await;
    done.transition(MonitorStatus::Cancel).unwrap();
    f.store.update_by_id(&done).await.unwrap();

    let page = f
        .store
        .select_since(t, MonitorStatus::WaitSend, None, 10)
        .await
        .unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].biz_no, "r2");
}

#[tokio::test]
#[serial]
async fn test_confirm_receipt_by_msg_id() {
    let f = sqlite_store().await;
    let id = seed(&f.store, "r1", due_at(-10)).await;

    let mut monitor = load(&f.store, id).await;
    monitor.msg_id = Some("msg-9".to_string());
    monitor.transition(MonitorStatus::WaitReceipt).unwrap();
    f.store.update_by_id(&monitor).await.unwrap();

    assert_eq!(f.store.confirm_receipt("msg-9", false).await.unwrap(), 1);
    let stored = load(&f.store, id).await;
    assert_eq!(stored.status, MonitorStatus::Fail);
    assert!(stored.receipt_time.is_some());

    // Terminal records are not confirmable again.
    assert_eq!(f.store.confirm_receipt("msg-9", true).await.unwrap(), 0);
}
