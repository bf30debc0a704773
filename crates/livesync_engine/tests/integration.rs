//! Integration tests for the sync engine against the reference authority.

use livesync_engine::{
    ConnectionState, ItemSnapshot, ObjectKind, ObjectSnapshot, QueryOptions, StaticTokenProvider,
    StreamMessage, SubscriptionState, SyncClient, SyncError, Transport, TransportEvent,
};
use livesync_protocol::{Command, Notification};
use livesync_testkit::prelude::*;
use proptest::prelude::*;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Long enough for a duplicate push to show up if it were going to.
const SETTLE: Duration = Duration::from_millis(50);

fn value_of(data: &livesync_engine::JsonObject, key: &str) -> Option<i64> {
    data.get(key).and_then(|v| v.as_i64())
}

#[tokio::test]
async fn handles_share_one_instance_and_see_updates_once() {
    init_tracing();
    let bed = TestBed::new();
    let alice = bed.client("alice").await;
    let bob = bed.client("bob").await;

    let first = alice.documents().create(Some("shared"), None).await.unwrap();
    let second = alice.documents().open_existing(first.sid().as_str()).await.unwrap();
    let by_name = alice.documents().open_existing("shared").await.unwrap();
    assert_eq!(first.id(), second.id());
    assert_eq!(first.id(), by_name.id());
    assert_eq!(alice.open_object_count(), 1);
    first.wait_established().await.unwrap();

    let first_events = EventRecorder::<ObjectSnapshot>::new();
    let second_events = EventRecorder::<ObjectSnapshot>::new();
    first.on_updated(first_events.listener());
    second.on_updated(second_events.listener());

    bob.documents()
        .update_document("shared", object(json!({"colour": "blue"})))
        .await
        .unwrap();

    first_events.wait_for(1).await;
    second_events.wait_for(1).await;
    tokio::time::sleep(SETTLE).await;

    let first_seen = first_events.events();
    let second_seen = second_events.events();
    assert_eq!(first_seen.len(), 1);
    assert_eq!(second_seen.len(), 1);
    assert_eq!(first_seen[0].data, second_seen[0].data);
    assert_eq!(first.data(), object(json!({"colour": "blue"})));
    assert_eq!(by_name.revision(), first_seen[0].revision);
}

#[tokio::test]
async fn set_ttl_zero_clears_expiry() {
    let bed = TestBed::new();
    let alice = bed.client("alice").await;

    for ttl in [None, Some(Duration::from_secs(60))] {
        let doc = alice.documents().create(None, ttl).await.unwrap();
        let snapshot = doc.set_ttl(Duration::ZERO).await.unwrap();
        assert_eq!(snapshot.date_expires, None);
        assert_eq!(doc.date_expires(), None);
    }

    let list = alice.lists().create(Some("temp"), Some(Duration::from_secs(5))).await.unwrap();
    let snapshot = alice.lists().set_ttl("temp", Duration::ZERO).await.unwrap();
    assert_eq!(snapshot.date_expires, None);
    assert_eq!(list.sid(), &snapshot.sid);
}

#[tokio::test]
async fn mutate_without_contention_applies_once() {
    let bed = TestBed::new();
    let alice = bed.client("alice").await;
    let doc = alice.documents().create(None, None).await.unwrap();
    doc.set_data(object(json!({"count": 41}))).await.unwrap();
    doc.wait_established().await.unwrap();

    let other = alice.documents().open_existing(doc.sid().as_str()).await.unwrap();
    let own_events = EventRecorder::<ObjectSnapshot>::new();
    let other_events = EventRecorder::<ObjectSnapshot>::new();
    doc.on_updated(own_events.listener());
    other.on_updated(other_events.listener());

    let calls = AtomicUsize::new(0);
    let snapshot = doc
        .mutate_data(|mut data| {
            calls.fetch_add(1, Ordering::SeqCst);
            let count = value_of(&data, "count").unwrap_or(0);
            data.insert("count".into(), json!(count + 1));
            Some(data)
        })
        .await
        .unwrap();
    tokio::time::sleep(SETTLE).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(value_of(&doc.data(), "count"), Some(42));
    for events in [own_events.events(), other_events.events()] {
        assert_eq!(events.len(), 1);
        assert_eq!(events[0], snapshot);
    }
}

#[tokio::test]
async fn mutate_merges_with_concurrent_writer() {
    let bed = TestBed::new();
    let alice = bed.client("alice").await;
    let doc = alice.documents().create(Some("tally"), None).await.unwrap();
    doc.set_data(object(json!({"alice": 0, "bob": 0}))).await.unwrap();

    let authority = Arc::clone(&bed.authority);
    let calls = AtomicUsize::new(0);
    let snapshot = doc
        .mutate_data(|mut data| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                // Another writer gets in between the read and the write.
                authority
                    .handle_as_admin(Command::UpdateDocument {
                        target: "tally".into(),
                        data: object(json!({"alice": 0, "bob": 1})),
                        if_revision: None,
                        ttl: None,
                    })
                    .unwrap();
            }
            data.insert("alice".into(), json!(1));
            Some(data)
        })
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(snapshot.data, Some(object(json!({"alice": 1, "bob": 1}))));
    assert_eq!(doc.data(), object(json!({"alice": 1, "bob": 1})));
}

#[tokio::test]
async fn mutate_gives_up_after_bounded_attempts() {
    let bed = TestBed::new();
    let alice = bed.client("alice").await;
    alice.documents().create(Some("hot"), None).await.unwrap();

    let authority = Arc::clone(&bed.authority);
    let calls = AtomicUsize::new(0);
    let result = alice
        .documents()
        .mutate_document("hot", |data| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            authority
                .handle_as_admin(Command::UpdateDocument {
                    target: "hot".into(),
                    data: object(json!({ "writer": n })),
                    if_revision: None,
                    ttl: None,
                })
                .unwrap();
            Some(data)
        })
        .await;

    assert!(matches!(result, Err(SyncError::Conflict(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 8);
}

#[tokio::test]
async fn stale_set_surfaces_conflict() {
    let bed = TestBed::new();
    let alice = bed.client("alice").await;
    let doc = alice.documents().create(Some("strict"), None).await.unwrap();
    doc.wait_established().await.unwrap();

    // Bob writes while Alice is offline, and Alice's subscription cannot
    // come back to deliver the change.
    alice.transport.disconnect();
    bed.admin(Command::UpdateDocument {
        target: "strict".into(),
        data: object(json!({"by": "bob"})),
        if_revision: None,
        ttl: None,
    });
    alice.transport.fail_next("subscribe", 1_000_000);
    alice.transport.reconnect().unwrap();

    let err = doc.set_data(object(json!({"by": "alice"}))).await.unwrap_err();
    assert!(matches!(err, SyncError::Conflict(_)));
    assert!(err.is_retryable());

    // The failed write leaves the cache untouched.
    assert_eq!(doc.revision(), 1);
    assert!(doc.data().is_empty());
}

#[tokio::test]
async fn removal_is_terminal() {
    let bed = TestBed::new();
    let alice = bed.client("alice").await;
    let bob = bed.client("bob").await;

    let doc = alice.documents().create(Some("doomed"), None).await.unwrap();
    doc.wait_established().await.unwrap();
    let removals = EventRecorder::<String>::new();
    let updates = EventRecorder::<ObjectSnapshot>::new();
    let removed = removals.clone();
    doc.on_removed(move |id| removed.record(id.sid().to_string()));
    doc.on_updated(updates.listener());

    bob.documents().remove("doomed").await.unwrap();
    removals.wait_for(1).await;
    assert!(doc.is_removed());

    // A late push for the removed object changes nothing.
    let mut late = doc.snapshot();
    late.revision += 10;
    alice
        .transport
        .emit(TransportEvent::Notification(Notification::ObjectUpdated(late)));
    tokio::time::sleep(SETTLE).await;

    assert!(doc.is_removed());
    assert_eq!(removals.len(), 1);
    assert!(updates.is_empty());
    assert!(matches!(
        doc.set_data(object(json!({}))).await,
        Err(SyncError::NotFound(_))
    ));
}

#[tokio::test]
async fn list_iteration_open_and_not_open() {
    let bed = TestBed::new();
    let alice = bed.client("alice").await;
    let bob = bed.client("bob").await;

    let list = alice.lists().create(Some("steps"), None).await.unwrap();
    list.add_item(object(json!({"step": "a"}))).await.unwrap();
    list.add_item(object(json!({"step": "b"}))).await.unwrap();
    list.set_item(1, object(json!({"step": "b2"}))).await.unwrap();

    let open = list.query_items(QueryOptions::new()).unwrap().collect_all().await.unwrap();
    let not_open = bob
        .lists()
        .query_items("steps", QueryOptions::new().with_page_size(1))
        .unwrap()
        .collect_all()
        .await
        .unwrap();

    for items in [&open, &not_open] {
        let indices: Vec<u64> = items.iter().filter_map(ItemSnapshot::index).collect();
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(items[1].data, object(json!({"step": "b2"})));
    }
    assert_eq!(bob.open_object_count(), 0);

    let mut descending = list.query_items(QueryOptions::new().descending()).unwrap();
    assert!(descending.has_next().await.unwrap());
    assert_eq!(descending.next().await.unwrap().unwrap().index(), Some(1));
    descending.close();
    assert!(descending.is_finished());
}

#[tokio::test]
async fn list_item_events_and_removal() {
    let bed = TestBed::new();
    let alice = bed.client("alice").await;
    let bob = bed.client("bob").await;

    let list = alice.lists().create(Some("feed"), None).await.unwrap();
    list.wait_established().await.unwrap();
    let added = EventRecorder::<ItemSnapshot>::new();
    let removed = EventRecorder::<(u64, bool)>::new();
    list.on_item_added(added.listener());
    let sink = removed.clone();
    list.on_item_removed(move |index, previous| sink.record((index, previous.is_some())));

    let item = bob.lists().add_list_item("feed", object(json!({"n": 1}))).await.unwrap();
    added.wait_for(1).await;
    bob.lists().remove_list_item("feed", 0).await.unwrap();
    removed.wait_for(1).await;

    assert_eq!(added.events()[0].index(), Some(0));
    assert_eq!(removed.events(), vec![(0, true)]);

    // Indices are never reused.
    let next = list.add_item(object(json!({"n": 2}))).await.unwrap();
    assert_eq!(next.index(), Some(item.index().unwrap() + 1));
    assert!(matches!(list.get_item(0).await, Err(SyncError::NotFound(_))));
}

#[tokio::test]
async fn map_query_returns_latest_values() {
    let bed = TestBed::new();
    let alice = bed.client("alice").await;
    let bob = bed.client("bob").await;

    let map = scenarios::populated_map(&alice, "settings", &["b", "a", "c"]).await;
    map.set_item("a", object(json!({"key": "a", "v": 2}))).await.unwrap();
    map.mutate_item("c", |mut data| {
        data.insert("v".into(), json!(3));
        Some(data)
    })
    .await
    .unwrap();

    let open = map.query_items(QueryOptions::new()).unwrap().collect_all().await.unwrap();
    let not_open = bob
        .maps()
        .query_items("settings", QueryOptions::new().with_page_size(2))
        .unwrap()
        .collect_all()
        .await
        .unwrap();

    for items in [&open, &not_open] {
        let keys: Vec<&str> = items.iter().filter_map(ItemSnapshot::key).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(items[0].data.get("v"), Some(&json!(2)));
        assert_eq!(items[2].data.get("v"), Some(&json!(3)));
    }

    let from_b = map
        .query_items(QueryOptions::new().starting_at("b", false))
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    assert_eq!(from_b.len(), 1);
    assert_eq!(from_b[0].key(), Some("c"));
}

#[tokio::test]
async fn map_mutate_creates_missing_key() {
    let bed = TestBed::new();
    let alice = bed.client("alice").await;
    let map = alice.maps().create(None, None).await.unwrap();

    let item = map
        .mutate_item("fresh", |mut data| {
            assert!(data.is_empty());
            data.insert("created".into(), json!(true));
            Some(data)
        })
        .await
        .unwrap();
    assert_eq!(item.key(), Some("fresh"));
    assert_eq!(map.get_item("fresh").await.unwrap().data, item.data);

    let aborted = map.mutate_item("fresh", |_| None).await;
    assert!(matches!(aborted, Err(SyncError::Aborted)));
}

#[tokio::test]
async fn ttl_scenario_end_to_end() {
    let bed = TestBed::new();
    let alice = bed.client("alice").await;

    let doc = alice
        .documents()
        .create(None, Some(Duration::from_secs(3600)))
        .await
        .unwrap();
    let expires = doc.date_expires().expect("TTL sets an expiry");
    assert!(expires > chrono::Utc::now());

    doc.set_ttl(Duration::ZERO).await.unwrap();
    assert_eq!(doc.date_expires(), None);

    doc.wait_established().await.unwrap();
    bed.authority
        .admin_set_ttl(ObjectKind::Document, doc.sid().as_str(), Duration::from_secs(1000))
        .unwrap();
    eventually(|| doc.date_expires().is_some()).await;
}

#[tokio::test]
async fn expiry_is_observed_as_removal() {
    let bed = TestBed::new();
    let alice = bed.client("alice").await;
    let doc = alice.documents().create(None, None).await.unwrap();
    doc.wait_established().await.unwrap();

    bed.authority
        .admin_set_ttl(ObjectKind::Document, doc.sid().as_str(), Duration::from_millis(1))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    bed.authority.expire_due(chrono::Utc::now());

    eventually(|| doc.is_removed()).await;
}

#[tokio::test]
async fn stream_scenario_end_to_end() {
    let bed = TestBed::new();
    let alice = bed.client("alice").await;
    let bob = bed.client("bob").await;

    let alice_stream = alice.streams().open_or_create("chat", None).await.unwrap();
    let bob_stream = bob.streams().open_existing("chat").await.unwrap();
    alice_stream.wait_established().await.unwrap();
    bob_stream.wait_established().await.unwrap();

    let alice_seen = EventRecorder::<StreamMessage>::new();
    let bob_seen = EventRecorder::<StreamMessage>::new();
    alice_stream.on_message_published(alice_seen.listener());
    bob_stream.on_message_published(bob_seen.listener());

    let sent = alice_stream
        .publish_message(object(json!({"text": "hello"})))
        .await
        .unwrap();

    let a = alice_seen.wait_for(1).await;
    let b = bob_seen.wait_for(1).await;
    assert_eq!(a[0].sid, sent.sid);
    assert_eq!(b[0].sid, sent.sid);
    assert_eq!(a[0].data, b[0].data);
    assert_eq!(b[0].data, object(json!({"text": "hello"})));
}

#[tokio::test]
async fn subscription_suspends_and_recovers() {
    let bed = TestBed::new();
    let alice = bed.client("alice").await;
    let bob = bed.client("bob").await;

    let doc = alice.documents().create(Some("resilient"), None).await.unwrap();
    doc.wait_established().await.unwrap();
    let states = EventRecorder::<SubscriptionState>::new();
    doc.on_subscription_state_changed(states.listener());
    let updates = EventRecorder::<ObjectSnapshot>::new();
    doc.on_updated(updates.listener());

    alice.transport.disconnect();
    states.wait_for(1).await;
    assert_eq!(doc.subscription_state(), SubscriptionState::Suspended);

    // Missed while suspended.
    bob.documents()
        .update_document("resilient", object(json!({"missed": true})))
        .await
        .unwrap();

    alice.transport.reconnect().unwrap();
    doc.wait_established().await.unwrap();
    assert_eq!(
        states.wait_for(3).await,
        vec![
            SubscriptionState::Suspended,
            SubscriptionState::Establishing,
            SubscriptionState::Established,
        ]
    );
    updates.wait_for(1).await;
    assert_eq!(doc.data(), object(json!({"missed": true})));
}

#[tokio::test]
async fn subscribe_failures_are_retried() {
    let bed = TestBed::new();
    let alice = bed.client("alice").await;
    alice.transport.fail_next("subscribe", 2);

    let doc = alice.documents().create(None, None).await.unwrap();
    doc.wait_established().await.unwrap();

    let stats = alice.subscription_stats();
    assert!(stats.retries >= 2);
    assert!(stats.last_error.is_some());
    assert_eq!(stats.established, 1);
}

#[tokio::test]
async fn subscription_fails_when_object_is_gone() {
    let bed = TestBed::new();
    let alice = bed.client("alice").await;
    let doc = alice.documents().create(Some("ghost"), None).await.unwrap();
    doc.wait_established().await.unwrap();
    let removals = EventRecorder::<String>::new();
    let removed = removals.clone();
    doc.on_removed(move |id| removed.record(id.sid().to_string()));

    alice.transport.disconnect();
    eventually(|| doc.subscription_state() == SubscriptionState::Suspended).await;
    bed.admin(Command::Remove {
        kind: ObjectKind::Document,
        target: "ghost".into(),
    });
    alice.transport.reconnect().unwrap();

    let err = doc.wait_established().await.unwrap_err();
    assert!(matches!(err, SyncError::NotFound(_)));
    assert!(doc.subscription_state().is_terminal());

    // The removal is observed as if it had been pushed.
    assert_eq!(removals.wait_for(1).await, vec![doc.sid().to_string()]);
    assert!(doc.is_removed());
    assert_eq!(alice.open_object_count(), 0);
    assert!(matches!(
        alice.documents().open_existing(doc.sid().as_str()).await,
        Err(SyncError::NotFound(_))
    ));
    tokio::time::sleep(SETTLE).await;
    assert_eq!(removals.len(), 1);
}

#[tokio::test]
async fn wait_established_does_not_trust_a_dropped_connection() {
    let bed = TestBed::new();
    let alice = bed.client("alice").await;
    let doc = alice.documents().create(None, None).await.unwrap();
    doc.wait_established().await.unwrap();

    alice.transport.disconnect();
    let early = tokio::time::timeout(SETTLE, doc.wait_established()).await;
    assert!(early.is_err());
    eventually(|| doc.subscription_state() == SubscriptionState::Suspended).await;

    alice.transport.reconnect().unwrap();
    doc.wait_established().await.unwrap();
    assert!(alice.transport.connection_state().is_connected());
}

#[tokio::test]
async fn subscription_fails_after_revocation() {
    let bed = TestBed::new();
    let alice = bed.client("alice").await;
    let bob = bed.client("bob").await;

    let map = alice.maps().create(Some("private"), None).await.unwrap();
    let bob_map = bob.maps().open_existing("private").await.unwrap();
    bob_map.wait_established().await.unwrap();

    bed.authority.revoke_access("bob", map.sid());
    bob.transport.disconnect();
    eventually(|| bob_map.subscription_state() == SubscriptionState::Suspended).await;
    bob.transport.reconnect().unwrap();

    let err = bob_map.wait_established().await.unwrap_err();
    assert!(matches!(err, SyncError::PermissionDenied(_)));
    assert!(matches!(
        bob_map.get_item("k").await,
        Err(SyncError::PermissionDenied(_))
    ));
    // Alice is unaffected.
    map.set_item("k", object(json!({}))).await.unwrap();
}

#[tokio::test]
async fn denied_connection_fails_subscriptions() {
    let bed = TestBed::new();
    let alice = bed.client("alice").await;
    let list = alice.lists().create(None, None).await.unwrap();
    list.wait_established().await.unwrap();

    let connection = EventRecorder::<ConnectionState>::new();
    alice.on_connection_state_changed(connection.listener());
    alice.transport.deny();

    assert_eq!(connection.wait_for(1).await, vec![ConnectionState::Denied]);
    eventually(|| list.subscription_state().is_terminal()).await;
    assert!(matches!(
        list.subscription_state().error(),
        Some(SyncError::PermissionDenied(_))
    ));
}

#[tokio::test]
async fn rejected_token_fails_connect() {
    let bed = TestBed::with_auth();
    let transport = LoopbackTransport::new(Arc::clone(&bed.authority));
    let result = SyncClient::connect(
        fast_config(),
        transport.clone(),
        Arc::new(StaticTokenProvider::new("alice")),
    )
    .await;

    assert!(matches!(result, Err(SyncError::PermissionDenied(_))));
    assert_eq!(transport.connection_state(), ConnectionState::Denied);
}

#[tokio::test]
async fn expired_token_is_refetched() {
    let bed = TestBed::with_auth();
    let alice = bed.client("alice").await;
    assert_eq!(alice.tokens.fetch_count(), 1);

    alice.transport.expire_token();
    eventually(|| alice.tokens.fetch_count() == 2).await;

    alice.transport.token_about_to_expire();
    eventually(|| alice.tokens.fetch_count() == 3).await;

    // The refreshed session keeps working.
    alice.documents().create(None, None).await.unwrap();
}

#[tokio::test]
async fn validation_errors_surface_immediately() {
    let bed = TestBed::new();
    let alice = bed.client("alice").await;

    assert!(matches!(
        alice.documents().create(Some(""), None).await,
        Err(SyncError::InvalidArgument(_))
    ));
    assert!(matches!(
        alice
            .documents()
            .create(None, Some(Duration::from_secs(400 * 24 * 3600)))
            .await,
        Err(SyncError::InvalidArgument(_))
    ));
    alice.documents().create(Some("taken"), None).await.unwrap();
    assert!(matches!(
        alice.documents().create(Some("taken"), None).await,
        Err(SyncError::AlreadyExists(_))
    ));
    assert!(matches!(
        alice.maps().open_existing("missing").await,
        Err(SyncError::NotFound(_))
    ));
}

#[tokio::test]
async fn shutdown_closes_the_session() {
    let bed = TestBed::new();
    let alice = bed.client("alice").await;
    let doc = alice.documents().create(None, None).await.unwrap();
    assert_eq!(bed.authority.session_count(), 1);

    alice.shutdown().await;
    assert!(alice.is_shut_down());
    assert_eq!(bed.authority.session_count(), 0);
    assert!(matches!(
        doc.set_data(object(json!({}))).await,
        Err(SyncError::Shutdown)
    ));
}

#[tokio::test]
async fn closing_last_handle_unsubscribes() {
    let bed = TestBed::new();
    let alice = bed.client("alice").await;
    let doc = alice.documents().create(None, None).await.unwrap();
    doc.wait_established().await.unwrap();
    let session = alice.transport.session().unwrap();
    assert_eq!(bed.authority.subscriptions(session), vec![doc.sid().clone()]);

    let copy = doc.clone();
    doc.close();
    assert_eq!(alice.open_object_count(), 1);
    assert_eq!(copy.subscription_state(), SubscriptionState::Established);
    copy.close();
    assert_eq!(alice.open_object_count(), 0);
    eventually(|| bed.authority.subscriptions(session).is_empty()).await;

    // Reopening starts a fresh entry and subscription.
    let reopened = alice.documents().open_existing(doc.sid().as_str()).await.unwrap();
    reopened.wait_established().await.unwrap();
    assert_eq!(alice.open_object_count(), 1);
    assert_eq!(bed.authority.subscriptions(session), vec![doc.sid().clone()]);
}

#[tokio::test]
async fn list_changes_missed_while_suspended_are_replayed() {
    let bed = TestBed::new();
    let alice = bed.client("alice").await;
    let bob = bed.client("bob").await;

    let list = alice.lists().create(Some("backlog"), None).await.unwrap();
    list.wait_established().await.unwrap();
    list.add_item(object(json!({"n": 0}))).await.unwrap();
    list.add_item(object(json!({"n": 1}))).await.unwrap();

    let added = EventRecorder::<ItemSnapshot>::new();
    let updated = EventRecorder::<ItemSnapshot>::new();
    let removed = EventRecorder::<(u64, bool)>::new();
    list.on_item_added(added.listener());
    list.on_item_updated(updated.listener());
    let sink = removed.clone();
    list.on_item_removed(move |index, previous| sink.record((index, previous.is_some())));

    alice.transport.disconnect();
    eventually(|| list.subscription_state() == SubscriptionState::Suspended).await;

    bob.lists()
        .add_list_item("backlog", object(json!({"n": 2})))
        .await
        .unwrap();
    bob.lists()
        .set_list_item("backlog", 1, object(json!({"n": 10})))
        .await
        .unwrap();
    bob.lists().remove_list_item("backlog", 0).await.unwrap();

    alice.transport.reconnect().unwrap();
    list.wait_established().await.unwrap();

    assert_eq!(added.wait_for(1).await[0].index(), Some(2));
    assert_eq!(updated.wait_for(1).await[0].data, object(json!({"n": 10})));
    assert_eq!(removed.wait_for(1).await, vec![(0, true)]);

    tokio::time::sleep(SETTLE).await;
    assert_eq!(added.len(), 1);
    assert_eq!(updated.len(), 1);
    assert_eq!(removed.len(), 1);
}

/// Replays out-of-order and duplicate pushes and returns the revisions
/// the update listener saw.
async fn replay_pushes(offsets: Vec<u64>) -> (Vec<u64>, u64) {
    let bed = TestBed::new();
    let alice = bed.client("alice").await;
    let doc = alice.documents().create(None, None).await.unwrap();
    doc.wait_established().await.unwrap();

    let seen = EventRecorder::<ObjectSnapshot>::new();
    doc.on_updated(seen.listener());

    let base = doc.snapshot();
    let push = |revision: u64| {
        let mut snapshot = base.clone();
        snapshot.revision = revision;
        snapshot.data = Some(object(json!({ "revision": revision })));
        alice
            .transport
            .emit(TransportEvent::Notification(Notification::ObjectUpdated(snapshot)));
    };
    for offset in offsets {
        push(base.revision + offset);
    }
    let sentinel = base.revision + 1_000;
    push(sentinel);
    seen.wait_until(|events| events.last().is_some_and(|s| s.revision == sentinel))
        .await;

    let revisions = seen.events().iter().map(|s| s.revision).collect();
    (revisions, base.revision)
}

proptest! {
    #![proptest_config(PropTestConfig::quick().to_proptest_config())]

    #[test]
    fn stale_and_duplicate_pushes_are_discarded(offsets in push_revisions_strategy(20)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (seen, base) = runtime.block_on(replay_pushes(offsets.clone()));

        let mut expected = Vec::new();
        let mut latest = base;
        for offset in offsets {
            if base + offset > latest {
                latest = base + offset;
                expected.push(latest);
            }
        }
        expected.push(base + 1_000);
        prop_assert_eq!(seen, expected);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_never_lose_updates() {
    let bed = TestBed::new();
    let config = StressConfig {
        clients: 4,
        operations_per_client: 10,
        ..StressConfig::default()
    };
    let (result, value) = stress_concurrent_increments(&bed, &config).await;
    assert_eq!(result.failed_ops, 0);
    assert_eq!(value, 40);
}
