#![forbid(unsafe_code)]

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use korral_core::{DeploymentSnapshot, ErrorKind, LabelSelector, ResourceRef};
use korral_kubehub::{ClusterError, MockCluster};
use korral_ops::{CoordinatorConfig, MutationCoordinator, RetryPolicy, TicketState};
use tokio_util::sync::CancellationToken;

fn dep(name: &str, replicas: i32) -> DeploymentSnapshot {
    DeploymentSnapshot {
        name: name.into(),
        ready_replicas: replicas,
        desired_replicas: replicas,
        available_replicas: replicas,
        updated_replicas: replicas,
        images: vec![format!("shop/{}:1", name)],
        age_seconds: 60.0,
        healthy: true,
        selector: LabelSelector::from_labels([("app", name)]),
    }
}

fn config(attempts: u32) -> CoordinatorConfig {
    CoordinatorConfig { retry: RetryPolicy::no_delay(attempts), history_capacity: 8 }
}

fn web() -> ResourceRef {
    ResourceRef::deployment("default", "web").expect("valid ref")
}

#[tokio::test]
async fn concurrent_restarts_of_one_target_conflict() {
    let (mock, gate) = MockCluster::new().with_deployment("default", dep("web", 2)).with_patch_gate();
    let mock = Arc::new(mock);
    let coord = Arc::new(MutationCoordinator::new(mock.clone(), config(3)));

    let c1 = coord.clone();
    let first = tokio::spawn(async move { c1.restart(&web(), &CancellationToken::new()).await });
    gate.entered().await;
    assert!(coord.is_in_flight(&web()));

    let second = coord.restart(&web(), &CancellationToken::new()).await;
    assert!(!second.success());
    assert_eq!(second.error(), Some(ErrorKind::Conflict));
    assert!(second.message().contains("already in progress"));

    gate.open();
    let first = first.await.expect("join");
    assert!(first.success(), "{}", first.message());
    assert_eq!(mock.calls().patch_restart.load(Ordering::SeqCst), 1);
    assert!(!coord.is_in_flight(&web()));
}

#[tokio::test]
async fn scale_and_restart_share_the_ticket() {
    let (mock, gate) = MockCluster::new().with_deployment("default", dep("web", 2)).with_patch_gate();
    let mock = Arc::new(mock);
    let coord = Arc::new(MutationCoordinator::new(mock.clone(), config(3)));

    let c1 = coord.clone();
    let restart = tokio::spawn(async move { c1.restart(&web(), &CancellationToken::new()).await });
    gate.entered().await;
    let scale = coord.scale(&web(), 5, &CancellationToken::new()).await;
    assert_eq!(scale.error(), Some(ErrorKind::Conflict));
    gate.open();
    assert!(restart.await.expect("join").success());
    assert_eq!(mock.desired_replicas("default", "web"), Some(2));
}

#[tokio::test]
async fn different_targets_do_not_conflict() {
    let (mock, gate) = MockCluster::new()
        .with_deployment("default", dep("web", 1))
        .with_deployment("default", dep("api", 1))
        .with_patch_gate();
    let mock = Arc::new(mock);
    let coord = Arc::new(MutationCoordinator::new(mock.clone(), config(3)));

    let c1 = coord.clone();
    let a = tokio::spawn(async move { c1.restart(&web(), &CancellationToken::new()).await });
    let c2 = coord.clone();
    let b = tokio::spawn(async move {
        let api = ResourceRef::deployment("default", "api").expect("valid ref");
        c2.restart(&api, &CancellationToken::new()).await
    });
    gate.entered().await;
    gate.open();
    assert!(a.await.expect("join").success());
    assert!(b.await.expect("join").success());
    assert_eq!(mock.calls().patch_restart.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn sequential_restarts_both_succeed() {
    let mock = Arc::new(MockCluster::new().with_deployment("default", dep("web", 3)));
    let coord = MutationCoordinator::new(mock.clone(), config(3));

    let first = coord.restart(&web(), &CancellationToken::new()).await;
    assert!(first.success());
    assert_eq!(first.message(), "Deployment 'web' in namespace 'default' rollout restart initiated");
    let second = coord.restart(&web(), &CancellationToken::new()).await;
    assert!(second.success());

    assert_eq!(mock.restarts("default", "web").len(), 2);
    let history = coord.history();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|t| t.state == TicketState::Succeeded));
    assert_ne!(history[0].id, history[1].id);
    assert!(coord.in_flight().is_empty());
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let mock = Arc::new(MockCluster::new().with_deployment("default", dep("web", 2)));
    mock.fail_patches([ClusterError::Transient("etcd timeout".into()), ClusterError::Transient("503".into())]);
    let coord = MutationCoordinator::new(mock.clone(), config(3));

    let env = coord.restart(&web(), &CancellationToken::new()).await;
    assert!(env.success(), "{}", env.message());
    assert_eq!(mock.calls().patch_restart.load(Ordering::SeqCst), 3);
    let report = env.data().expect("report");
    assert_eq!(report.attempts, 3);
    let ts = report.restarted_at.as_deref().expect("timestamp");
    assert!(ts.ends_with('Z'));
    assert_eq!(mock.restarts("default", "web"), vec![ts.to_string()]);
}

#[tokio::test]
async fn exhausted_retries_report_the_last_error() {
    let mock = Arc::new(MockCluster::new().with_deployment("default", dep("web", 2)));
    mock.fail_patches((0..3).map(|i| ClusterError::Transient(format!("boom {}", i))));
    let coord = MutationCoordinator::new(mock.clone(), config(3));

    let env = coord.restart(&web(), &CancellationToken::new()).await;
    assert!(!env.success());
    assert_eq!(env.error(), Some(ErrorKind::Transient));
    assert!(env.message().contains("after 3 attempts"));
    assert!(env.message().contains("boom 2"));
    assert_eq!(mock.calls().patch_restart.load(Ordering::SeqCst), 3);
    assert_eq!(coord.history()[0].state, TicketState::Failed);
}

#[tokio::test]
async fn rejected_patches_are_not_retried() {
    let mock = Arc::new(MockCluster::new().with_deployment("default", dep("web", 2)));
    mock.fail_patches([ClusterError::Rejected { code: Some(403), message: "forbidden".into() }]);
    let coord = MutationCoordinator::new(mock.clone(), config(3));

    let env = coord.restart(&web(), &CancellationToken::new()).await;
    assert_eq!(env.error(), Some(ErrorKind::Rejected));
    assert_eq!(mock.calls().patch_restart.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn zero_replica_deployment_restart_is_acknowledged() {
    let mock = Arc::new(MockCluster::new().with_deployment("default", dep("web", 0)));
    let coord = MutationCoordinator::new(mock.clone(), config(3));
    let env = coord.restart(&web(), &CancellationToken::new()).await;
    assert!(env.success());
    assert_eq!(env.error(), None);
}

#[tokio::test]
async fn missing_deployment_is_not_found_without_patching() {
    let mock = Arc::new(MockCluster::new());
    let coord = MutationCoordinator::new(mock.clone(), config(3));
    let env = coord.restart(&web(), &CancellationToken::new()).await;
    assert_eq!(env.error(), Some(ErrorKind::NotFound));
    assert_eq!(env.message(), "Deployment 'web' not found in namespace 'default'");
    assert_eq!(mock.calls().patches(), 0);
    assert!(!coord.is_in_flight(&web()));
}

#[tokio::test]
async fn transient_existence_check_is_retried() {
    let mock = Arc::new(MockCluster::new().with_deployment("default", dep("web", 1)));
    mock.fail_gets([ClusterError::Transient("connection reset".into())]);
    let coord = MutationCoordinator::new(mock.clone(), config(3));
    let env = coord.restart(&web(), &CancellationToken::new()).await;
    assert!(env.success());
    assert_eq!(mock.calls().get_deployment.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn scale_patches_replicas() {
    let mock = Arc::new(MockCluster::new().with_deployment("default", dep("web", 2)));
    let coord = MutationCoordinator::new(mock.clone(), config(3));
    let env = coord.scale(&web(), 5, &CancellationToken::new()).await;
    assert!(env.success());
    assert_eq!(env.message(), "Deployment 'web' in namespace 'default' scaled to 5 replicas");
    assert_eq!(mock.desired_replicas("default", "web"), Some(5));
    assert!(env.data().expect("report").restarted_at.is_none());

    let negative = coord.scale(&web(), -1, &CancellationToken::new()).await;
    assert_eq!(negative.error(), Some(ErrorKind::Validation));
}

#[tokio::test]
async fn cancel_during_backoff_releases_the_ticket() {
    let mock = Arc::new(MockCluster::new().with_deployment("default", dep("web", 1)));
    mock.fail_patches([ClusterError::Transient("throttled".into())]);
    let slow = CoordinatorConfig {
        retry: RetryPolicy { max_attempts: 3, base_delay: Duration::from_secs(60), max_delay: Duration::from_secs(60) },
        history_capacity: 8,
    };
    let coord = Arc::new(MutationCoordinator::new(mock.clone(), slow));
    let cancel = CancellationToken::new();

    let c1 = coord.clone();
    let tok = cancel.clone();
    let task = tokio::spawn(async move { c1.restart(&web(), &tok).await });
    while mock.calls().patch_restart.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    cancel.cancel();

    let env = tokio::time::timeout(Duration::from_secs(5), task).await.expect("cancel observed").expect("join");
    assert_eq!(env.error(), Some(ErrorKind::Cancelled));
    assert_eq!(env.message(), "cancelled");
    assert!(!coord.is_in_flight(&web()));
    assert_eq!(mock.calls().patch_restart.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dropped_future_releases_the_ticket() {
    let (mock, gate) = MockCluster::new().with_deployment("default", dep("web", 1)).with_patch_gate();
    let mock = Arc::new(mock);
    let coord = Arc::new(MutationCoordinator::new(mock.clone(), config(3)));

    let c1 = coord.clone();
    let task = tokio::spawn(async move { c1.restart(&web(), &CancellationToken::new()).await });
    gate.entered().await;
    assert_eq!(coord.in_flight().len(), 1);
    task.abort();
    assert!(task.await.is_err());

    assert!(!coord.is_in_flight(&web()));
    let history = coord.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].state, TicketState::Failed);
    assert_eq!(history[0].outcome.as_deref(), Some("cancelled"));
}

#[tokio::test]
async fn non_deployment_targets_are_rejected() {
    let mock = Arc::new(MockCluster::new());
    let coord = MutationCoordinator::new(mock.clone(), config(3));
    let pod = ResourceRef::pod("default", "web-1").expect("valid ref");
    let env = coord.restart(&pod, &CancellationToken::new()).await;
    assert_eq!(env.error(), Some(ErrorKind::Validation));
    assert_eq!(mock.calls().total(), 0);
}

#[tokio::test]
async fn history_is_bounded() {
    let mock = Arc::new(MockCluster::new().with_deployment("default", dep("web", 1)));
    let coord = MutationCoordinator::new(mock.clone(), CoordinatorConfig { retry: RetryPolicy::no_delay(1), history_capacity: 2 });
    for _ in 0..5 {
        assert!(coord.restart(&web(), &CancellationToken::new()).await.success());
    }
    assert_eq!(coord.history().len(), 2);
}
