use super::helpers::{collectives, collectives_with, fast_config, form_all, form_devices};
use clique::{
    CliqueError, CliqueIdCallback, CliqueKey, ConfigResolver, GroupRequest, KeyValueStore,
    KvStoreCallback, MemoryKvStore,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_exchange_through_kv_store() {
    let c = collectives();
    let store = Arc::new(MemoryKvStore::new());
    let cb: Arc<dyn CliqueIdCallback> = Arc::new(KvStoreCallback::new(Arc::clone(&store)));
    let key = CliqueKey::new([0, 1, 2, 3]).unwrap();

    let outcomes = form_all(&c, &key, Some(cb)).await;
    let id = outcomes[0].as_ref().unwrap().clique_id().clone();
    for outcome in &outcomes {
        assert_eq!(outcome.as_ref().unwrap().clique_id(), &id);
    }

    let stored = store
        .get(&format!("clique/{:016x}/0/id", key.group_key()), Duration::ZERO)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored, id.to_hex());

    c.shutdown().await.unwrap();
    assert!(store.is_empty(), "{} entries left after shutdown", store.len());
}

#[tokio::test]
async fn test_prefixes_isolate_jobs() {
    let c = collectives();
    let store = Arc::new(MemoryKvStore::new());
    let key = CliqueKey::new([0, 1]).unwrap();

    let job_a: Arc<dyn CliqueIdCallback> =
        Arc::new(KvStoreCallback::with_prefix(Arc::clone(&store), "job-a"));
    let a = form_all(&c, &key, Some(job_a)).await;
    c.shutdown().await.unwrap();

    let job_b: Arc<dyn CliqueIdCallback> =
        Arc::new(KvStoreCallback::with_prefix(Arc::clone(&store), "job-b"));
    let b = form_all(&c, &key, Some(job_b)).await;

    assert_ne!(
        a[0].as_ref().unwrap().clique_id(),
        b[0].as_ref().unwrap().clique_id()
    );
}

#[tokio::test]
async fn test_kv_missing_participant_times_out() {
    let c = collectives_with(ConfigResolver::new(false), fast_config());
    let store = Arc::new(MemoryKvStore::new());
    let cb: Arc<dyn CliqueIdCallback> = Arc::new(KvStoreCallback::new(store));
    let key = CliqueKey::new([0, 1, 2]).unwrap();

    let outcomes = form_devices(&c, &key, &[0, 2], Some(cb)).await;
    let mut timeouts = 0;
    for outcome in outcomes {
        match outcome {
            Err(CliqueError::Timeout { .. }) => timeouts += 1,
            Err(CliqueError::Cancelled { .. }) => {}
            other => panic!("expected timeout, got {other:?}"),
        }
    }
    assert!(timeouts >= 1);
}

#[tokio::test]
async fn test_kv_retry_after_timeout() {
    let c = collectives_with(ConfigResolver::new(false), fast_config());
    let cb: Arc<dyn CliqueIdCallback> =
        Arc::new(KvStoreCallback::new(Arc::new(MemoryKvStore::new())));
    let key = CliqueKey::new([0, 1]).unwrap();

    let failed = form_devices(&c, &key, &[0], Some(Arc::clone(&cb))).await;
    assert!(failed[0].as_ref().unwrap_err().is_retryable());

    // A late device 1 alone must not pick up the abandoned id.
    let late = form_devices(&c, &key, &[1], Some(Arc::clone(&cb))).await;
    assert!(
        matches!(late[0], Err(CliqueError::Timeout { .. })),
        "{:?}",
        late[0]
    );

    let outcomes = form_devices(&c, &key, &[0, 1], Some(cb)).await;
    assert_eq!(
        outcomes[0].as_ref().unwrap().clique_id(),
        outcomes[1].as_ref().unwrap().clique_id()
    );
}

#[tokio::test]
async fn test_kv_cancel_reaches_remote_participants() {
    // Two processes sharing one store: `host_a` drives device 0, `host_b`
    // drives device 1. Device 2 never arrives.
    let host_a = collectives();
    let host_b = collectives();
    let store = Arc::new(MemoryKvStore::new());
    let key = CliqueKey::new([0, 1, 2]).unwrap();

    let a = {
        let cb: Arc<dyn CliqueIdCallback> = Arc::new(KvStoreCallback::new(Arc::clone(&store)));
        let (c, key) = (Arc::clone(&host_a), key.clone());
        tokio::spawn(async move {
            c.form_group(GroupRequest::new(key, 0).with_callback(cb)).await
        })
    };
    let b = {
        let cb: Arc<dyn CliqueIdCallback> = Arc::new(KvStoreCallback::new(Arc::clone(&store)));
        let (c, key) = (Arc::clone(&host_b), key.clone());
        tokio::spawn(async move {
            c.form_group(GroupRequest::new(key, 1).with_callback(cb)).await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(host_b.cancel(&key).unwrap(), 1);

    let err_b = b.await.unwrap().unwrap_err();
    assert!(matches!(err_b, CliqueError::Cancelled { .. }), "{err_b}");
    let err_a = tokio::time::timeout(Duration::from_secs(2), a)
        .await
        .expect("device 0 must not wait for the full exchange timeout")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err_a, CliqueError::Cancelled { .. }), "{err_a}");
}
