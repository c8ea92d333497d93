//! Store contract tests, run against both adapters.

use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;

use mageflow::adapters::memory::InMemoryStore;
use mageflow::adapters::sqlite::SqliteStore;
use mageflow::domain::ports::store::{FieldOp, Store, StoreError};

async fn sqlite_store() -> (SqliteStore, TempDir) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("store.db");
    let url = format!("sqlite://{}", path.display());
    let store = SqliteStore::connect(&url).await.expect("connect");
    (store, dir)
}

async fn check_versions_and_cas(store: &dyn Store) {
    let v1 = store.save("k", json!({"n": 1}), None).await.expect("save");
    assert_eq!(v1, 1);
    let v2 = store.save("k", json!({"n": 2}), None).await.expect("save");
    assert_eq!(v2, 2);

    let loaded = store.load("k").await.expect("load");
    assert_eq!(loaded.value, json!({"n": 2}));
    assert_eq!(loaded.version, 2);

    let v3 = store
        .compare_and_save("k", 2, json!({"n": 3}))
        .await
        .expect("cas");
    assert_eq!(v3, 3);

    let err = store
        .compare_and_save("k", 2, json!({"n": 99}))
        .await
        .expect_err("stale version");
    assert!(matches!(err, StoreError::Conflict(_)));

    let err = store
        .compare_and_save("absent", 1, json!({}))
        .await
        .expect_err("absent key");
    assert!(matches!(err, StoreError::NotFound(_)));
}

async fn check_pipeline(store: &dyn Store) {
    store
        .save("p", json!({"tasks": [], "count": 0, "status": {"s": "pending"}}), None)
        .await
        .expect("save");

    let results = store
        .apply(
            "p",
            vec![
                FieldOp::ListAppend {
                    path: "tasks".into(),
                    value: json!("a"),
                },
                FieldOp::ListExtend {
                    path: "tasks".into(),
                    values: vec![json!("b"), json!("c")],
                },
                FieldOp::CounterAdd {
                    path: "count".into(),
                    delta: 5,
                },
                FieldOp::ListPopFront {
                    path: "tasks".into(),
                },
                FieldOp::MapMerge {
                    path: "status".into(),
                    entries: json!({"s": "active"}).as_object().cloned().unwrap(),
                },
            ],
        )
        .await
        .expect("apply");
    assert_eq!(results[2], json!(5));
    assert_eq!(results[3], json!("a"));

    let loaded = store.load("p").await.expect("load");
    assert_eq!(
        loaded.value,
        json!({"tasks": ["b", "c"], "count": 5, "status": {"s": "active"}})
    );

    let err = store
        .apply("absent", vec![FieldOp::ListClear { path: "x".into() }])
        .await
        .expect_err("absent key");
    assert!(matches!(err, StoreError::NotFound(_)));
}

async fn check_ttl(store: &dyn Store) {
    store
        .save("ephemeral", json!(1), Some(Duration::from_millis(60)))
        .await
        .expect("save");
    assert!(store.try_load("ephemeral").await.expect("load").is_some());

    // A mutation slides the expiry forward.
    tokio::time::sleep(Duration::from_millis(40)).await;
    store
        .apply(
            "ephemeral",
            vec![FieldOp::Set {
                path: "touched".into(),
                value: json!(true),
            }],
        )
        .await
        .expect("apply");
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(
        store.try_load("ephemeral").await.expect("load").is_some(),
        "mutation should refresh the sliding TTL"
    );

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(store.try_load("ephemeral").await.expect("load").is_none());
    assert!(!store
        .live_keys()
        .await
        .expect("keys")
        .contains(&"ephemeral".to_string()));
}

async fn check_locks(store: &dyn Store) {
    let token = store
        .try_lock("locked", Duration::from_secs(5))
        .await
        .expect("lock")
        .expect("acquired");
    assert!(store
        .try_lock("locked", Duration::from_secs(5))
        .await
        .expect("second lock attempt")
        .is_none());

    // A stale token does not release someone else's lock.
    store
        .unlock("locked", &"bogus".to_string())
        .await
        .expect("stale unlock is quiet");
    assert!(store
        .try_lock("locked", Duration::from_secs(5))
        .await
        .expect("still held")
        .is_none());

    store.unlock("locked", &token).await.expect("unlock");
    assert!(store
        .try_lock("locked", Duration::from_secs(5))
        .await
        .expect("lock after release")
        .is_some());

    // Expired leases are reacquirable.
    let _ = store
        .try_lock("leased", Duration::from_millis(30))
        .await
        .expect("lock")
        .expect("acquired");
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(store
        .try_lock("leased", Duration::from_secs(5))
        .await
        .expect("lock after lease expiry")
        .is_some());
}

async fn check_delete(store: &dyn Store) {
    store.save("d", json!(1), None).await.expect("save");
    assert!(store.delete("d").await.expect("delete"));
    assert!(!store.delete("d").await.expect("second delete"));
    assert!(matches!(
        store.load("d").await.expect_err("gone"),
        StoreError::NotFound(_)
    ));
}

#[tokio::test]
async fn memory_store_contract() {
    let store = InMemoryStore::new();
    check_versions_and_cas(&store).await;
    check_pipeline(&store).await;
    check_ttl(&store).await;
    check_locks(&store).await;
    check_delete(&store).await;
}

#[tokio::test]
async fn sqlite_store_contract() {
    let (store, _dir) = sqlite_store().await;
    check_versions_and_cas(&store).await;
    check_pipeline(&store).await;
    check_ttl(&store).await;
    check_locks(&store).await;
    check_delete(&store).await;
}

#[tokio::test]
async fn sqlite_store_survives_reconnect() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("store.db");
    let url = format!("sqlite://{}", path.display());

    {
        let store = SqliteStore::connect(&url).await.expect("connect");
        store
            .save("persistent", json!({"kept": true}), None)
            .await
            .expect("save");
    }

    let store = SqliteStore::connect(&url).await.expect("reconnect");
    let loaded = store.load("persistent").await.expect("load");
    assert_eq!(loaded.value, json!({"kept": true}));
    let _: Value = loaded.value;
}
