//! Integration tests for lease scenarios across controllers.
//!
//! These tests drive the public getters end to end: claims racing through
//! several controllers sharing one store, token checks, expiry waits and
//! persistence across restarts.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, TestCluster, TestController, MODEL, OTHER_MODEL};
use juju_lease::{
    open_store, Checker, Claimer, LeaseConfig, LeaseError, LeaseKey, LeaseManagerGetter,
    LeaseMetrics, LeaseWorker, ModelLeaseManagerGetter, Revoker, SingularConfig, SingularFlag,
    StaticModelCatalog, Store, SystemClock, Waiter, WorkerDeps, APPLICATION_LEADERSHIP,
    SINGULAR_CONTROLLER,
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_leadership_handover_after_expiry() {
    let cluster = TestCluster::new(1);
    let controller = cluster.controller(0);
    let manager = controller.manager(MODEL);
    let claimer = manager.claimer(APPLICATION_LEADERSHIP);
    let checker = controller.leadership();

    // t=0: mysql/0 claims for 30s.
    claimer.claim("mysql", "mysql/0", Duration::from_secs(30)).await.unwrap();
    assert!(checker.token("mysql", "mysql/0").check().is_ok());

    // t=10: mysql/1 is denied.
    cluster.advance(1, Duration::from_secs(10)).await;
    let err = claimer
        .claim("mysql", "mysql/1", Duration::from_secs(30))
        .await
        .unwrap_err();
    assert!(matches!(err, LeaseError::ClaimDenied(_)));

    // t=35: the lease lapsed and mysql/1 takes over.
    cluster.advance(1, Duration::from_secs(25)).await;
    assert!(checker.token("mysql", "mysql/0").check().is_err());
    claimer.claim("mysql", "mysql/1", Duration::from_secs(30)).await.unwrap();
    assert!(checker.token("mysql", "mysql/1").check().is_ok());
    assert!(checker.token("mysql", "mysql/0").check().is_err());

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_single_winner() {
    let cluster = TestCluster::new(3);
    let mut tasks = Vec::new();
    for c in 0..3 {
        for u in 0..4 {
            let claimer = cluster.controller(c).manager(MODEL).claimer(APPLICATION_LEADERSHIP);
            let holder = format!("redis/{}", c * 4 + u);
            tasks.push(tokio::spawn(async move {
                let result = claimer.claim("redis", &holder, Duration::from_secs(60)).await;
                (holder, result)
            }));
        }
    }

    let mut winners = Vec::new();
    for task in tasks {
        let (holder, result) = task.await.unwrap();
        match result {
            Ok(()) => winners.push(holder),
            Err(LeaseError::ClaimDenied(_)) => {}
            Err(e) => panic!("unexpected claim error for {}: {}", holder, e),
        }
    }
    assert_eq!(winners.len(), 1, "winners: {:?}", winners);

    let leases = cluster.store.leases(MODEL, APPLICATION_LEADERSHIP).await.unwrap();
    assert_eq!(leases["redis"].holder, winners[0]);

    // Every controller converges on the winner once it refreshes.
    for c in 0..3 {
        let manager = cluster.controller(c).manager(MODEL);
        manager.refresh().await.unwrap();
        assert!(manager.token(LeaseKey::new(APPLICATION_LEADERSHIP, MODEL, "redis"), &winners[0]).check().is_ok());
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_reclaim_moves_expiry_forward() {
    let cluster = TestCluster::new(1);
    let manager = cluster.controller(0).manager(MODEL);
    let key = LeaseKey::new(APPLICATION_LEADERSHIP, MODEL, "postgresql");

    let claimer = manager.claimer(APPLICATION_LEADERSHIP);
    claimer.claim("postgresql", "postgresql/2", Duration::from_secs(30)).await.unwrap();
    let first = manager.view().leases[&key].expiry;

    claimer.claim("postgresql", "postgresql/2", Duration::from_secs(30)).await.unwrap();
    let second = manager.view().leases[&key].expiry;
    assert!(second > first);

    cluster.advance(1, Duration::from_secs(5)).await;
    claimer.claim("postgresql", "postgresql/2", Duration::from_secs(30)).await.unwrap();
    assert!(manager.view().leases[&key].expiry > second);

    let snapshot = cluster.controller(0).metrics.snapshot();
    assert_eq!(snapshot.claims_granted, 1);
    assert_eq!(snapshot.extended, 2);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_revoke_invalidates_tokens() {
    let cluster = TestCluster::new(2);
    let first = cluster.controller(0).manager(MODEL);
    let second = cluster.controller(1).manager(MODEL);
    let key = LeaseKey::new(APPLICATION_LEADERSHIP, MODEL, "mysql");

    first.claimer(APPLICATION_LEADERSHIP).claim("mysql", "mysql/0", Duration::from_secs(60)).await.unwrap();
    let token = first.token(key.clone(), "mysql/0");
    assert!(token.check().is_ok());

    // Revoked through another controller: seen after the next refresh.
    second.revoker(APPLICATION_LEADERSHIP).revoke("mysql", "mysql/0").await.unwrap();
    first.refresh().await.unwrap();
    assert!(matches!(token.check(), Err(LeaseError::NotHeld { .. })));

    // Revoking an absent lease is a no-op, twice over.
    let revoker = first.revoker(APPLICATION_LEADERSHIP);
    revoker.revoke("mysql", "mysql/0").await.unwrap();
    revoker.revoke("mysql", "mysql/0").await.unwrap();

    // Revoked locally: seen immediately.
    first.claimer(APPLICATION_LEADERSHIP).claim("mysql", "mysql/1", Duration::from_secs(60)).await.unwrap();
    let token = first.token(key, "mysql/1");
    assert!(token.check().is_ok());
    revoker.revoke("mysql", "mysql/1").await.unwrap();
    assert!(token.check().is_err());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_wait_until_expired_through_getter() {
    let cluster = TestCluster::new(1);
    let controller = cluster.controller(0);
    let getter = controller.worker.getter(APPLICATION_LEADERSHIP).for_model(MODEL);
    let checker = getter.get_lease_manager().unwrap();

    controller
        .manager(MODEL)
        .claimer(APPLICATION_LEADERSHIP)
        .claim("kafka", "kafka/0", Duration::from_secs(30))
        .await
        .unwrap();

    let (started_tx, started_rx) = oneshot::channel();
    let waiter = tokio::spawn({
        let checker = checker.clone();
        async move {
            checker
                .wait_until_expired("kafka", &CancellationToken::new(), Some(started_tx))
                .await
        }
    });
    started_rx.await.unwrap();
    assert!(!waiter.is_finished());

    cluster.advance(1, Duration::from_secs(31)).await;
    tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(controller.metrics.snapshot().waiters_notified, 1);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_wait_blocks_on_lease_claimed_by_other_controller() {
    let cluster = TestCluster::new(2);
    let holder = cluster.controller(0).manager(MODEL);
    let watcher = cluster.controller(1).manager(MODEL);
    watcher.refresh().await.unwrap();

    holder
        .claimer(APPLICATION_LEADERSHIP)
        .claim("mysql", "mysql/0", Duration::from_secs(60))
        .await
        .unwrap();

    let (started_tx, started_rx) = oneshot::channel();
    let waiter = tokio::spawn({
        let checker = watcher.checker_waiter(APPLICATION_LEADERSHIP);
        async move {
            checker
                .wait_until_expired("mysql", &CancellationToken::new(), Some(started_tx))
                .await
        }
    });
    started_rx.await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished());
    assert!(watcher
        .checker_waiter(APPLICATION_LEADERSHIP)
        .token("mysql", "mysql/0")
        .check()
        .is_ok());

    cluster.advance(2, Duration::from_secs(61)).await;
    tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(cluster.controller(1).metrics.snapshot().waiters_notified, 1);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_wait_cancelled_before_expiry() {
    let cluster = TestCluster::new(1);
    let controller = cluster.controller(0);
    let checker = controller.leadership();
    controller
        .manager(MODEL)
        .claimer(APPLICATION_LEADERSHIP)
        .claim("kafka", "kafka/0", Duration::from_secs(30))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let (started_tx, started_rx) = oneshot::channel();
    let waiter = tokio::spawn({
        let cancel = cancel.clone();
        async move { checker.wait_until_expired("kafka", &cancel, Some(started_tx)).await }
    });
    started_rx.await.unwrap();

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
    assert!(matches!(result, Err(LeaseError::Cancelled)));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_models_are_isolated() {
    let cluster = TestCluster::new(1);
    let controller = cluster.controller(0);
    let getter = controller.worker.getter(APPLICATION_LEADERSHIP);

    controller
        .manager(MODEL)
        .claimer(APPLICATION_LEADERSHIP)
        .claim("mysql", "mysql/0", Duration::from_secs(60))
        .await
        .unwrap();

    let here = getter.get_lease_manager(MODEL).unwrap();
    let there = getter.get_lease_manager(OTHER_MODEL).unwrap();
    assert!(here.token("mysql", "mysql/0").check().is_ok());
    assert!(there.token("mysql", "mysql/0").check().is_err());

    let unknown = getter.get_lease_manager("5f3e4c1a-9b8d-4e7f-a6c5-b4d3e2f1a0b9");
    assert!(matches!(unknown.err(), Some(LeaseError::NotFound(_))));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_invalid_requests_rejected() {
    let cluster = TestCluster::new(1);
    let manager = cluster.controller(0).manager(MODEL);

    let leadership = manager.claimer(APPLICATION_LEADERSHIP);
    let err = leadership.claim("mysql", "machine-0", Duration::from_secs(60)).await.unwrap_err();
    assert!(matches!(err, LeaseError::NotValid(_)));
    let err = leadership.claim("MySQL", "MySQL/0", Duration::from_secs(60)).await.unwrap_err();
    assert!(matches!(err, LeaseError::NotValid(_)));

    let unknown = manager.claimer("no-such-namespace");
    let err = unknown.claim("mysql", "mysql/0", Duration::from_secs(60)).await.unwrap_err();
    assert!(matches!(err, LeaseError::NotValid(_)));

    assert!(cluster.store.model_leases(MODEL).await.unwrap().is_empty());
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_singular_flag_fails_over() {
    let cluster = TestCluster::new(2);
    let config = SingularConfig {
        duration: Duration::from_secs(30),
        ..SingularConfig::default()
    };
    let key = LeaseKey::new(SINGULAR_CONTROLLER, MODEL, MODEL);

    let first = SingularFlag::start(
        cluster.controller(0).manager(MODEL),
        key.clone(),
        "controller-0",
        config.clone(),
        CancellationToken::new(),
    );
    let mut first_held = first.subscribe();
    tokio::time::timeout(Duration::from_secs(5), first_held.wait_for(|h| *h))
        .await
        .unwrap()
        .unwrap();

    let second_manager = cluster.controller(1).manager(MODEL);
    let second = SingularFlag::start(
        second_manager.clone(),
        key.clone(),
        "controller-1",
        config,
        CancellationToken::new(),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!second.is_held());

    // controller-0 releases the lease; controller-1 sees it on its next refresh.
    first.stop().await.unwrap();
    second_manager.refresh().await.unwrap();
    let mut second_held = second.subscribe();
    tokio::time::timeout(Duration::from_secs(5), second_held.wait_for(|h| *h))
        .await
        .unwrap()
        .unwrap();
    eventually(|| second_manager.token(key.clone(), "controller-1").check().is_ok()).await;

    second.stop().await.unwrap();
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_leases_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = LeaseConfig {
        data_dir: dir.path().to_path_buf(),
        models: vec![MODEL.to_string()],
        ..LeaseConfig::default()
    };
    let deps = |store| WorkerDeps {
        clock: Arc::new(SystemClock),
        store,
        models: Arc::new(StaticModelCatalog::new()),
        metrics: Arc::new(LeaseMetrics::new()),
    };

    {
        let (kv, store) = open_store(&config).unwrap();
        let worker = LeaseWorker::start(&config, deps(store)).unwrap();
        worker
            .registry()
            .manager(MODEL)
            .unwrap()
            .claimer(APPLICATION_LEADERSHIP)
            .claim("mysql", "mysql/0", Duration::from_secs(3_600))
            .await
            .unwrap();
        worker.shutdown().await;
        kv.checkpoint().unwrap();
    }

    let (_kv, store) = open_store(&config).unwrap();
    let worker = LeaseWorker::start(&config, deps(store)).unwrap();
    let checker = worker.getter(APPLICATION_LEADERSHIP).get_lease_manager(MODEL).unwrap();
    eventually(|| checker.token("mysql", "mysql/0").check().is_ok()).await;
    assert!(checker.token("mysql", "mysql/1").check().is_err());
    worker.shutdown().await;
}

#[tokio::test]
async fn test_stopped_worker_fails_tokens() {
    let cluster = TestCluster::new(1);
    let controller: &TestController = cluster.controller(0);
    let checker = controller.leadership();
    controller
        .manager(MODEL)
        .claimer(APPLICATION_LEADERSHIP)
        .claim("mysql", "mysql/0", Duration::from_secs(60))
        .await
        .unwrap();
    let token = checker.token("mysql", "mysql/0");
    assert!(token.check().is_ok());

    cluster.shutdown().await;
    assert!(matches!(token.check(), Err(LeaseError::Stopped)));
    assert!(matches!(
        controller.worker.registry().manager(MODEL),
        Err(LeaseError::Stopped)
    ));
}
