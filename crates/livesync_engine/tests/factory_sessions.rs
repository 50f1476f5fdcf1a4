//! Factory reuse, session teardown and scheduler-driven delivery.

use livesync_engine::{
    CoalesceConfig, Coalescer, Location, ManualClock, ReplicaConfig, ReplicaFactory,
};
use livesync_protocol::RemoteError;
use livesync_testkit::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn factory_recreates_after_error() {
    let store = seeded_store("items", &[("a", json!(1))]);
    let factory = ReplicaFactory::with_config(store.clone(), manual_config());

    let first = factory.ordered().unwrap();
    first.flush();
    assert_eq!(first.loaded().await.unwrap().len(), 1);

    store.cancel_subscriptions(RemoteError::permission_denied("revoked"));
    first.flush();
    assert!(first.is_destroyed());
    assert!(first.session().is_none());

    let second = factory.ordered().unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    second.flush();
    assert_eq!(second.keys(), vec!["a"]);
}

#[tokio::test]
async fn factory_writes_reach_replicas() {
    let store = memory_store("items");
    let factory = ReplicaFactory::with_config(store.clone(), manual_config());
    let list = factory.ordered().unwrap();
    let whole = factory.scalar().unwrap();
    list.flush();
    whole.flush();

    let ack = factory.push(json!({"n": 1})).await.unwrap();
    factory.set(Some("fixed"), json!({"n": 2, ".priority": -1})).await.unwrap();
    list.flush();
    whole.flush();

    assert_eq!(list.keys(), vec![ack.key.clone(), "fixed".to_string()]);
    let record = whole.record();
    assert_eq!(record.get(&ack.key), Some(&json!({"n": 1})));
    assert_eq!(record.get("fixed"), Some(&json!({"n": 2})));

    factory.update(None, json!({"fixed": null})).await.unwrap();
    list.flush();
    assert_eq!(list.keys(), vec![ack.key]);
}

#[tokio::test]
async fn transactions_reach_replicas() {
    let store = seeded_store("counters", &[("hits", json!(3))]);
    let factory = ReplicaFactory::with_config(store.clone(), manual_config());
    let list = factory.ordered().unwrap();
    list.flush();
    let watcher = RecordingWatcher::on_ordered(&list);

    let committed = factory
        .transaction(Some("hits"), |current| {
            current.as_i64().map(|n| json!(n + 1))
        })
        .await
        .unwrap();
    assert_eq!(committed.map(|snapshot| snapshot.value), Some(json!(4)));

    list.flush();
    assert_eq!(watcher.names(), vec!["updated"]);
    assert_eq!(list.get_record("hits").unwrap().scalar_value(), Some(&json!(4)));

    let skipped = factory
        .transaction(Some("missing"), |current| {
            current.as_i64().map(|n| json!(n + 1))
        })
        .await
        .unwrap();
    assert!(skipped.is_none());
    assert_eq!(store.write_count(), 1);
}

#[tokio::test]
async fn manual_clock_drives_batches() {
    let clock = Arc::new(ManualClock::new(0));
    let config = ReplicaConfig::new()
        .with_clock(clock.clone())
        .with_coalesce(CoalesceConfig::manual(Duration::from_millis(50)));
    let store = memory_store("items");
    let factory = ReplicaFactory::with_config(store.clone(), config);
    let list = factory.ordered().unwrap();
    let session = list.session().unwrap();

    assert_eq!(session.flush_due(), 0);
    clock.advance(50);
    assert_eq!(session.flush_due(), 1);
    assert!(list.loaded().await.is_ok());

    for (i, key) in ["a", "b", "c"].iter().enumerate() {
        store.remote_set(Location::child(*key), json!(i));
        clock.advance(30);
    }
    assert_eq!(session.pending(), 3);
    assert_eq!(session.flush_due(), 0);
    clock.advance(20);
    assert_eq!(session.flush_due(), 3);
    assert_eq!(list.keys(), vec!["a", "b", "c"]);
}

#[test]
fn continuous_events_flush_by_max_wait() {
    let clock = Arc::new(ManualClock::new(0));
    let coalescer = Coalescer::new(
        CoalesceConfig::manual(Duration::from_millis(10)),
        clock.clone(),
    );
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler = coalescer.wrap(move |n: u32| sink.lock().push(n));

    let mut flushed_at = None;
    for n in 0..30 {
        handler.call(n);
        if coalescer.flush_due() > 0 {
            flushed_at = Some(n);
            break;
        }
        clock.advance(9);
    }

    assert_eq!(flushed_at, Some(12));
    assert_eq!(*seen.lock(), (0..=12).collect::<Vec<u32>>());
}
