//! Behaviour every backlog substrate must share.
//!
//! Each function expects a store with no prior state.

use futures_util::StreamExt;
use postbus_core::{BacklogError, BacklogStore, MessageLookup, MessageStream, PublishOptions};
use serde_json::json;
use std::time::Duration;

pub async fn publish_assigns_sequential_ids(store: &dyn BacklogStore) {
    let opts = PublishOptions::new();
    assert_eq!(store.last_id("/foo", None).await.unwrap(), 0);

    assert_eq!(store.publish("/foo", json!("bar"), &opts).await.unwrap(), 1);
    assert_eq!(store.publish("/foo", json!("baz"), &opts).await.unwrap(), 2);
    assert_eq!(store.publish("/other", json!(1), &opts).await.unwrap(), 1);

    assert_eq!(store.last_id("/foo", None).await.unwrap(), 2);

    let backlog = store.backlog("/foo", 0, None).await.unwrap();
    let data: Vec<_> = backlog.iter().map(|m| (m.message_id, m.data.clone())).collect();
    assert_eq!(data, vec![(1, json!("bar")), (2, json!("baz"))]);

    let after = store.backlog("/foo", 1, None).await.unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].data, json!("baz"));

    // Reads are idempotent.
    assert_eq!(store.backlog("/foo", 0, None).await.unwrap(), backlog);
}

pub async fn backlog_is_trimmed(store: &dyn BacklogStore) {
    let opts = PublishOptions::new().with_max_backlog_size(2);
    for i in 1..=4 {
        store.publish("/trim", json!(i), &opts).await.unwrap();
    }

    let ids: Vec<_> = store
        .backlog("/trim", 0, None)
        .await
        .unwrap()
        .iter()
        .map(|m| m.message_id)
        .collect();
    assert_eq!(ids, vec![3, 4]);

    assert_eq!(
        store.get_message("/trim", 1, None).await.unwrap(),
        MessageLookup::Expired
    );
    assert!(matches!(
        store.get_message("/trim", 4, None).await.unwrap(),
        MessageLookup::Found(m) if m.data == json!(4)
    ));
    assert_eq!(
        store.get_message("/trim", 5, None).await.unwrap(),
        MessageLookup::NotFound
    );
}

pub async fn global_backlog_spans_channels(store: &dyn BacklogStore) {
    let opts = PublishOptions::new();
    assert_eq!(store.last_global_id().await.unwrap(), 0);
    store.publish("/a", json!("a"), &opts).await.unwrap();
    store.publish("/b", json!("b"), &opts).await.unwrap();
    store.publish("/a", json!("c"), &opts).await.unwrap();

    let global = store.global_backlog(0).await.unwrap();
    let entries: Vec<_> = global
        .iter()
        .map(|m| (m.global_id, m.channel.as_str(), m.message_id))
        .collect();
    assert_eq!(entries, vec![(1, "/a", 1), (2, "/b", 1), (3, "/a", 2)]);
    assert_eq!(store.last_global_id().await.unwrap(), 3);

    assert_eq!(store.global_backlog(2).await.unwrap().len(), 1);
}

pub async fn targeting_survives_storage(store: &dyn BacklogStore) {
    let opts = PublishOptions::new()
        .with_site("tenant-a")
        .with_user_ids(vec![5])
        .with_group_ids(vec![7])
        .with_client_ids(vec!["abc".into()]);
    store.publish("/t", json!({"x": 1}), &opts).await.unwrap();

    assert!(store.backlog("/t", 0, None).await.unwrap().is_empty());

    let scoped = store.backlog("/t", 0, Some("tenant-a")).await.unwrap();
    assert_eq!(scoped.len(), 1);
    assert_eq!(scoped[0].site_id.as_deref(), Some("tenant-a"));
    assert_eq!(scoped[0].user_ids, vec![5]);
    assert_eq!(scoped[0].group_ids, vec![7]);
    assert_eq!(scoped[0].client_ids, vec!["abc".to_string()]);
}

pub async fn listen_receives_publishes(store: &dyn BacklogStore) {
    let mut stream: MessageStream = store.listen().await.unwrap();

    store
        .publish("/live", json!("now"), &PublishOptions::new())
        .await
        .unwrap();

    let message = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("no notification")
        .expect("stream closed")
        .unwrap();
    assert_eq!(message.channel, "/live");
    assert_eq!(message.message_id, 1);
    assert_eq!(message.data, json!("now"));
}

pub async fn reset_clears_state(store: &dyn BacklogStore) {
    store
        .publish("/gone", json!(1), &PublishOptions::new())
        .await
        .unwrap();
    store.reset().await.unwrap();

    assert_eq!(store.last_id("/gone", None).await.unwrap(), 0);
    assert_eq!(store.last_global_id().await.unwrap(), 0);
    assert!(store.global_backlog(0).await.unwrap().is_empty());
}

pub async fn rejects_invalid_input(store: &dyn BacklogStore) {
    let opts = PublishOptions::new();
    assert!(store.publish("", json!(1), &opts).await.is_err());
    assert!(store.publish("/__status", json!(1), &opts).await.is_err());
    assert!(store
        .publish("/ok", json!(1), &PublishOptions::new().with_site("a:b"))
        .await
        .is_err());

    let forever = PublishOptions::new().with_max_backlog_age(Duration::from_secs(u64::MAX));
    assert!(matches!(
        store.publish("/ok", json!(1), &forever).await,
        Err(BacklogError::InvalidRetention(_))
    ));

    // Rejected publishes assign no ids.
    let short = PublishOptions::new().with_max_backlog_age(Duration::from_secs(60));
    assert_eq!(store.publish("/ok", json!(2), &short).await.unwrap(), 1);
    assert_eq!(store.last_global_id().await.unwrap(), 1);
}
