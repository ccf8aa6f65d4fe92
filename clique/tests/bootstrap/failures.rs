use super::helpers::{collectives, collectives_with, fast_config, form_devices};
use clique::{
    BootstrapPhase, CliqueBootstrap, CliqueError, CliqueId, CliqueIdCallback, CliqueKey,
    CollectivesBackend, ConfigResolver, GroupRequest, InMemoryRendezvous, Result,
};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;

/// Callback whose link to the rendezvous is down.
struct BrokenLink {
    publish_fails: bool,
}

impl CliqueIdCallback for BrokenLink {
    fn publish<'a>(&'a self, _key: &'a CliqueKey, _id: &'a CliqueId) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.publish_fails {
                Err(CliqueError::transport("link down"))
            } else {
                Ok(())
            }
        })
    }

    fn fetch<'a>(
        &'a self,
        _key: &'a CliqueKey,
        _timeout: Duration,
    ) -> BoxFuture<'a, Result<CliqueId>> {
        Box::pin(async { Err(CliqueError::transport("link down")) })
    }
}

#[tokio::test]
async fn test_local_request_without_callback_fails_before_exchange() {
    let c = collectives();
    let key = CliqueKey::new([0, 1]).unwrap();

    for device in [0, 1] {
        let err = c
            .form_group(GroupRequest::new(key.clone(), device).local(true))
            .await
            .unwrap_err();
        assert!(matches!(err, CliqueError::Config { .. }), "{err}");
    }
    assert!(c.groups().unwrap().is_empty());
}

#[tokio::test]
async fn test_non_local_without_global_config_fails() {
    let c = collectives();
    let key = CliqueKey::new([0, 1]).unwrap();
    let err = c
        .form_group(GroupRequest::new(key, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, CliqueError::Config { .. }));
}

#[tokio::test]
async fn test_missing_participant_fails_everyone() {
    let c = collectives_with(ConfigResolver::new(false), fast_config());
    let key = CliqueKey::new([0, 1, 2]).unwrap();
    let rv: Arc<dyn CliqueIdCallback> = Arc::new(InMemoryRendezvous::new());

    // Device 2 never shows up. Whoever times out first closes the attempt,
    // so the other one may see it cancelled instead.
    let outcomes = form_devices(&c, &key, &[0, 1], Some(rv)).await;
    let mut timeouts = 0;
    for (rank, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            Err(CliqueError::Timeout { missing, .. }) => {
                assert!(missing.contains(&2), "rank {rank}: {missing:?}");
                timeouts += 1;
            }
            Err(CliqueError::Cancelled { .. }) => {}
            other => panic!("rank {rank}: expected timeout, got {other:?}"),
        }
    }
    assert!(timeouts >= 1);
    assert!(c.groups().unwrap().is_empty());
}

#[tokio::test]
async fn test_absent_originator_times_out() {
    let c = collectives_with(ConfigResolver::new(false), fast_config());
    let key = CliqueKey::new([0, 1]).unwrap();
    let rv: Arc<dyn CliqueIdCallback> = Arc::new(InMemoryRendezvous::new());

    let outcomes = form_devices(&c, &key, &[1], Some(rv)).await;
    match &outcomes[0] {
        Err(CliqueError::Timeout { missing, .. }) => assert_eq!(missing, &vec![0]),
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_retry_after_timeout_reuses_callback() {
    let c = collectives_with(ConfigResolver::new(false), fast_config());
    let key = CliqueKey::new([0, 1]).unwrap();
    let cb: Arc<dyn CliqueIdCallback> = Arc::new(InMemoryRendezvous::new());

    let failed = form_devices(&c, &key, &[0], Some(Arc::clone(&cb))).await;
    assert!(failed[0].as_ref().unwrap_err().is_retryable());

    let outcomes = form_devices(&c, &key, &[0, 1], Some(cb)).await;
    let a = outcomes[0].as_ref().unwrap();
    let b = outcomes[1].as_ref().unwrap();
    assert_eq!(a.clique_id(), b.clique_id());
}

#[tokio::test]
async fn test_failed_attempt_never_reaches_late_joiner() {
    let c = collectives_with(ConfigResolver::new(false), fast_config());
    let key = CliqueKey::new([0, 1]).unwrap();
    let cb: Arc<dyn CliqueIdCallback> = Arc::new(InMemoryRendezvous::new());

    form_devices(&c, &key, &[0], Some(Arc::clone(&cb))).await[0]
        .as_ref()
        .unwrap_err();

    // Device 1 arrives after the originator gave up: it must not become
    // ready on the abandoned id.
    let late = form_devices(&c, &key, &[1], Some(cb)).await;
    match &late[0] {
        Err(CliqueError::Timeout { missing, .. }) => assert_eq!(missing, &vec![0]),
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(c.groups().unwrap().is_empty());
}

#[tokio::test]
async fn test_retry_after_cancel_reuses_callback() {
    let c = collectives();
    let key = CliqueKey::new([0, 1]).unwrap();
    let cb: Arc<dyn CliqueIdCallback> = Arc::new(InMemoryRendezvous::new());

    let first = {
        let (c, key, cb) = (Arc::clone(&c), key.clone(), Arc::clone(&cb));
        tokio::spawn(async move {
            c.form_group(GroupRequest::new(key, 0).with_callback(cb)).await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(c.cancel(&key).unwrap(), 1);
    let err = first.await.unwrap().unwrap_err();
    assert!(matches!(err, CliqueError::Cancelled { .. }), "{err}");

    let outcomes = form_devices(&c, &key, &[0, 1], Some(cb)).await;
    assert_eq!(
        outcomes[0].as_ref().unwrap().clique_id(),
        outcomes[1].as_ref().unwrap().clique_id()
    );
}

#[tokio::test]
async fn test_fetch_transport_failure_names_rank() {
    let c = collectives();
    let key = CliqueKey::new([0, 1]).unwrap();
    let cb: Arc<dyn CliqueIdCallback> = Arc::new(BrokenLink {
        publish_fails: false,
    });

    let err = c
        .form_group(GroupRequest::new(key.clone(), 1).with_callback(cb))
        .await
        .unwrap_err();
    match &err {
        CliqueError::Transport { rank, .. } => assert_eq!(*rank, Some(1)),
        other => panic!("expected transport error, got {other}"),
    }
    assert!(err.is_retryable());
    assert!(c.group(&key, 1).unwrap().is_none());
    assert!(c.groups().unwrap().is_empty());
}

#[tokio::test]
async fn test_publish_transport_failure_names_originator() {
    let c = collectives();
    let key = CliqueKey::new([0, 1]).unwrap();
    let cb: Arc<dyn CliqueIdCallback> = Arc::new(BrokenLink {
        publish_fails: true,
    });

    let err = c
        .form_group(GroupRequest::new(key, 0).with_callback(cb))
        .await
        .unwrap_err();
    assert!(
        matches!(err, CliqueError::Transport { rank: Some(0), .. }),
        "{err}"
    );
    assert!(c.groups().unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_fails_local_and_remote_participants() {
    // Two processes sharing one exchange: `host_a` drives device 0, `host_b`
    // drives device 1. Device 2 never arrives.
    let host_a = collectives();
    let host_b = collectives();
    let key = CliqueKey::new([0, 1, 2]).unwrap();
    let rv: Arc<dyn CliqueIdCallback> = Arc::new(InMemoryRendezvous::new());

    let a = {
        let (c, key, rv) = (Arc::clone(&host_a), key.clone(), Arc::clone(&rv));
        tokio::spawn(async move {
            c.form_group(GroupRequest::new(key, 0).with_callback(rv)).await
        })
    };
    let b = {
        let (c, key, rv) = (Arc::clone(&host_b), key.clone(), Arc::clone(&rv));
        tokio::spawn(async move {
            c.form_group(GroupRequest::new(key, 1).with_callback(rv)).await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(host_b.cancel(&key).unwrap(), 1);

    let err_b = b.await.unwrap().unwrap_err();
    assert!(matches!(err_b, CliqueError::Cancelled { .. }), "{err_b}");
    let err_a = tokio::time::timeout(Duration::from_secs(2), a)
        .await
        .expect("originator must not wait for the full exchange timeout")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err_a, CliqueError::Cancelled { .. }), "{err_a}");
}

#[tokio::test]
async fn test_concurrent_request_is_rejected() {
    let c = collectives();
    let key = CliqueKey::new([0, 1]).unwrap();
    let rv: Arc<dyn CliqueIdCallback> = Arc::new(InMemoryRendezvous::new());

    let first = {
        let (c, key, rv) = (Arc::clone(&c), key.clone(), Arc::clone(&rv));
        tokio::spawn(async move {
            c.form_group(GroupRequest::new(key, 1).with_callback(rv)).await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = c
        .form_group(GroupRequest::new(key.clone(), 1).with_callback(Arc::clone(&rv)))
        .await
        .unwrap_err();
    assert!(matches!(err, CliqueError::InFlight { device: 1, .. }), "{err}");

    c.cancel(&key).unwrap();
    assert!(first.await.unwrap().is_err());

    // The slot is free again once the first attempt has failed.
    let outcomes = form_devices(&c, &key, &[0, 1], Some(rv)).await;
    for outcome in &outcomes {
        assert!(outcome.is_ok(), "{outcome:?}");
    }
}

#[tokio::test]
async fn test_duplicate_originator_is_inconsistent() {
    let key = CliqueKey::new([0, 1]).unwrap();
    let rv: Arc<dyn CliqueIdCallback> = Arc::new(InMemoryRendezvous::new());
    let backend: Arc<dyn CollectivesBackend> = Arc::new(ConfigResolver::new(false));

    // Two processes both believe they own device 0.
    let mut tasks = Vec::new();
    for _ in 0..2 {
        let mut bs = CliqueBootstrap::new(key.clone(), 0, Arc::clone(&backend))
            .unwrap()
            .with_callback(Arc::clone(&rv))
            .with_timeouts(&fast_config());
        tasks.push(tokio::spawn(async move { (bs.run().await, bs.phase()) }));
    }

    let mut inconsistent = 0;
    for t in tasks {
        let (outcome, phase) = t.await.unwrap();
        assert_eq!(phase, BootstrapPhase::Failed, "no participant may be ready");
        if matches!(outcome, Err(CliqueError::Consistency { .. })) {
            inconsistent += 1;
        }
    }
    assert!(inconsistent >= 1);
}
