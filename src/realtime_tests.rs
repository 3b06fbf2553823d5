use super::*;
use crate::storage::{to_fields, DocumentStore, MemoryDocumentStore, OrderSpec, Query};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct Row {
    name: String,
    #[serde(rename = "createdAt")]
    created_at: i64,
}

fn rows_key() -> SubscriptionKey { Query::new("rows", OrderSpec::desc("createdAt")) }

async fn put(store: &MemoryDocumentStore, id: &str, name: &str, at: i64) {
    let fields = to_fields(&json!({"name": name, "createdAt": at})).unwrap();
    store.set("rows", id, fields).await.unwrap();
}

async fn next_snapshot(rx: &mut mpsc::UnboundedReceiver<CollectionEvent<Row>>) -> Snapshot<Row> {
    match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
        Ok(Some(CollectionEvent::Snapshot(s))) => s,
        other => panic!("expected snapshot, got {:?}", other),
    }
}

#[tokio::test]
async fn snapshots_arrive_sorted_and_in_order() {
    let store = MemoryDocumentStore::new();
    put(&store, "a", "first", 1).await;
    let coll: RealtimeCollection<Row> = RealtimeCollection::new(Arc::new(store.clone()));
    let (_h, mut rx) = coll.watch(rows_key()).unwrap();

    assert_eq!(next_snapshot(&mut rx).await.ids(), vec!["a"]);
    put(&store, "b", "second", 2).await;
    put(&store, "c", "third", 3).await;
    let s = next_snapshot(&mut rx).await;
    assert_eq!(s.ids(), vec!["b", "a"]);
    let s = next_snapshot(&mut rx).await;
    assert_eq!(s.ids(), vec!["c", "b", "a"]);
    assert_eq!(s.items()[0].record.name, "third");
}

#[tokio::test]
async fn shared_key_uses_one_upstream_and_survives_partial_dispose() {
    let store = MemoryDocumentStore::new();
    let shared: SharedDocumentStore = Arc::new(store.clone());
    let hub = SubscriptionHub::new();
    let a: RealtimeCollection<Row> = RealtimeCollection::with_hub(Arc::clone(&shared), hub.clone());
    let b: RealtimeCollection<Row> = RealtimeCollection::with_hub(shared, hub.clone());

    let (ha, mut rx_a) = a.watch(rows_key()).unwrap();
    let (hb, mut rx_b) = b.watch(rows_key()).unwrap();
    assert_eq!(hub.upstream_count(), 1);
    assert_eq!(store.watcher_count("rows"), 1);
    assert_eq!(hub.view_count(&rows_key()), 2);

    next_snapshot(&mut rx_a).await;
    next_snapshot(&mut rx_b).await;

    ha.dispose();
    assert!(!ha.is_active());
    assert!(hb.is_active());
    put(&store, "x", "after", 10).await;
    assert_eq!(next_snapshot(&mut rx_b).await.ids(), vec!["x"]);
    assert!(rx_a.try_recv().is_err());

    hb.dispose();
    assert_eq!(hub.upstream_count(), 0);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(store.watcher_count("rows"), 0);
}

#[tokio::test]
async fn late_joiner_receives_latest_snapshot() {
    let store = MemoryDocumentStore::new();
    put(&store, "a", "one", 1).await;
    let shared: SharedDocumentStore = Arc::new(store.clone());
    let hub = SubscriptionHub::new();
    let coll: RealtimeCollection<Row> = RealtimeCollection::with_hub(shared, hub);
    let (_h1, mut rx1) = coll.watch(rows_key()).unwrap();
    next_snapshot(&mut rx1).await;

    let (_h2, mut rx2) = coll.watch(rows_key()).unwrap();
    assert_eq!(next_snapshot(&mut rx2).await.ids(), vec!["a"]);
}

#[tokio::test]
async fn dispose_is_idempotent() {
    let store = MemoryDocumentStore::new();
    let coll: RealtimeCollection<Row> = RealtimeCollection::new(Arc::new(store.clone()));
    let (h, _rx) = coll.watch(rows_key()).unwrap();
    h.dispose();
    h.dispose();
    coll.dispose(&h);
    assert_eq!(coll.hub().upstream_count(), 0);
}

#[tokio::test]
async fn no_callback_after_dispose_even_with_events_in_flight() {
    let store = MemoryDocumentStore::new();
    let coll: RealtimeCollection<Row> = RealtimeCollection::new(Arc::new(store.clone()));
    let calls = Arc::new(AtomicU64::new(0));
    let seen = Arc::clone(&calls);
    let h = coll
        .subscribe(rows_key(), move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    // queue several emissions without yielding to the pump
    for i in 0..5 {
        put(&store, &format!("r{}", i), "n", i).await;
    }
    h.dispose();
    let after_dispose = calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), after_dispose);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dispose_mid_delivery_blocks_late_callbacks_while_other_view_streams() {
    let store = MemoryDocumentStore::new();
    let shared: SharedDocumentStore = Arc::new(store.clone());
    let hub = SubscriptionHub::new();
    let coll: RealtimeCollection<Row> = RealtimeCollection::with_hub(shared, hub.clone());

    // keeps the upstream and its pump alive across rounds
    let kept_calls = Arc::new(AtomicU64::new(0));
    let kept_seen = Arc::clone(&kept_calls);
    let kept = coll
        .subscribe(rows_key(), move |_| {
            kept_seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let writer = {
        let store = store.clone();
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            let mut i: i64 = 0;
            while !stop.load(Ordering::SeqCst) {
                put(&store, &format!("w{}", i % 16), "w", i).await;
                i += 1;
                tokio::task::yield_now().await;
            }
        })
    };

    let mut total_delivered = 0;
    for _ in 0..100 {
        let disposed = Arc::new(AtomicBool::new(false));
        let late = Arc::new(AtomicU64::new(0));
        let delivered = Arc::new(AtomicU64::new(0));
        let (flag, late_hits, hits) = (Arc::clone(&disposed), Arc::clone(&late), Arc::clone(&delivered));
        let view = coll
            .subscribe(rows_key(), move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
                // hold the delivery open so dispose lands mid-callback
                std::thread::sleep(Duration::from_micros(200));
                if flag.load(Ordering::SeqCst) {
                    late_hits.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1)).await;
        view.dispose();
        disposed.store(true, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(late.load(Ordering::SeqCst), 0, "callback ran after dispose returned");
        total_delivered += delivered.load(Ordering::SeqCst);
        assert!(!view.is_active());
        assert!(kept.is_active());
    }

    stop.store(true, Ordering::SeqCst);
    writer.await.unwrap();
    assert!(total_delivered > 0);
    assert_eq!(hub.upstream_count(), 1);
    assert_eq!(hub.view_count(&rows_key()), 1);
    let before = kept_calls.load(Ordering::SeqCst);
    put(&store, "final", "f", i64::MAX).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(kept_calls.load(Ordering::SeqCst) > before);
}

#[tokio::test]
async fn dropping_the_handle_releases_the_watcher() {
    let store = MemoryDocumentStore::new();
    let coll: RealtimeCollection<Row> = RealtimeCollection::new(Arc::new(store.clone()));
    {
        let _h = coll.subscribe(rows_key(), |_| {}).unwrap();
        assert_eq!(store.watcher_count("rows"), 1);
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(store.watcher_count("rows"), 0);
    assert_eq!(coll.hub().upstream_count(), 0);
}

#[tokio::test]
async fn broken_feed_surfaces_failure_and_ends_subscription() {
    let store = MemoryDocumentStore::new();
    let coll: RealtimeCollection<Row> = RealtimeCollection::new(Arc::new(store.clone()));
    let (h, mut rx) = coll.watch(rows_key()).unwrap();
    next_snapshot(&mut rx).await;

    assert_eq!(store.break_subscriptions("rows", "quota exceeded"), 1);
    match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
        Ok(Some(CollectionEvent::Failed(e))) => {
            assert!(matches!(e, AppError::Subscription { .. }));
            assert!(e.message().contains("quota"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(!h.is_active());
    assert_eq!(coll.hub().upstream_count(), 0);

    put(&store, "z", "late", 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(matches!(rx.try_recv(), Err(_)));
}

#[tokio::test]
async fn undecodable_documents_fail_the_view() {
    let store = MemoryDocumentStore::new();
    store.set("rows", "bad", to_fields(&json!({"createdAt": 1})).unwrap()).await.unwrap();
    let coll: RealtimeCollection<Row> = RealtimeCollection::new(Arc::new(store.clone()));
    let (h, mut rx) = coll.watch(rows_key()).unwrap();
    match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
        Ok(Some(CollectionEvent::Failed(e))) => assert_eq!(e.code_str(), "decode_failed"),
        other => panic!("expected decode failure, got {:?}", other),
    }
    assert!(!h.is_active());
}

#[tokio::test]
async fn subscribe_while_offline_is_a_subscription_error() {
    let store = MemoryDocumentStore::new();
    store.set_offline(true);
    let coll: RealtimeCollection<Row> = RealtimeCollection::new(Arc::new(store));
    let err = coll.subscribe(rows_key(), |_| {}).err().unwrap();
    assert!(matches!(err, AppError::Subscription { .. }));
    assert_eq!(coll.hub().upstream_count(), 0);
}

#[tokio::test]
async fn read_once_missing_is_not_found() {
    let store = MemoryDocumentStore::new();
    put(&store, "a", "one", 1).await;
    let coll: RealtimeCollection<Row> = RealtimeCollection::new(Arc::new(store));
    let got = coll.read_once("rows", "a").await.unwrap();
    assert_eq!(got.record, Row { name: "one".into(), created_at: 1 });
    assert!(coll.read_once("rows", "nope").await.unwrap_err().is_not_found());
    assert_eq!(coll.fetch(&rows_key()).await.unwrap().len(), 1);
}
