//! In-memory [`ClusterClient`] for tests and offline demos.
//!
//! Fixtures are added builder-style; failures are scripted per call kind and
//! consumed in order. Every trait call bumps a counter so tests can assert
//! that validation short-circuits before any "network" traffic.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use korral_core::{DeploymentSnapshot, LabelSelector, PodSnapshot};
use tokio::sync::{Notify, Semaphore};

use crate::{ClusterClient, ClusterError, ClusterResult};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct MockState {
    deployments: BTreeMap<Key, DeploymentSnapshot>,
    pods: BTreeMap<Key, PodSnapshot>,
    logs: HashMap<Key, ClusterResult<String>>,
    hanging_logs: HashSet<Key>,
    get_failures: VecDeque<ClusterError>,
    list_failures: VecDeque<ClusterError>,
    patch_failures: VecDeque<ClusterError>,
    restarts: Vec<(Key, String)>,
}

/// Per-operation call counters.
#[derive(Debug, Default)]
pub struct CallCounts {
    pub list_pods: AtomicUsize,
    pub list_deployments: AtomicUsize,
    pub get_deployment: AtomicUsize,
    pub patch_restart: AtomicUsize,
    pub patch_replicas: AtomicUsize,
    pub pod_logs: AtomicUsize,
}

impl CallCounts {
    pub fn patches(&self) -> usize {
        self.patch_restart.load(Ordering::SeqCst) + self.patch_replicas.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.list_pods.load(Ordering::SeqCst)
            + self.list_deployments.load(Ordering::SeqCst)
            + self.get_deployment.load(Ordering::SeqCst)
            + self.pod_logs.load(Ordering::SeqCst)
            + self.patches()
    }
}

/// Holds patch calls until opened. `entered` is signalled each time a patch
/// reaches the gate.
#[derive(Debug)]
pub struct PatchGate {
    entered: Notify,
    release: Semaphore,
}

impl PatchGate {
    fn new() -> Self {
        Self { entered: Notify::new(), release: Semaphore::new(0) }
    }

    /// Wait until some patch call is parked on the gate.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let every current and future patch call through.
    pub fn open(&self) {
        self.release.add_permits(1024);
    }

    async fn pass(&self) {
        self.entered.notify_one();
        if let Ok(permit) = self.release.acquire().await {
            permit.forget();
        }
    }
}

#[derive(Default)]
pub struct MockCluster {
    state: Mutex<MockState>,
    calls: CallCounts,
    gate: Option<Arc<PatchGate>>,
}

impl MockCluster {
    pub fn new() -> Self { Self::default() }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with_deployment(self, namespace: &str, snapshot: DeploymentSnapshot) -> Self {
        self.state().deployments.insert(key(namespace, &snapshot.name), snapshot);
        self
    }

    pub fn with_pod(self, namespace: &str, pod: PodSnapshot) -> Self {
        self.state().pods.insert(key(namespace, &pod.name), pod);
        self
    }

    pub fn with_logs(self, namespace: &str, pod: &str, text: &str) -> Self {
        self.state().logs.insert(key(namespace, pod), Ok(text.to_string()));
        self
    }

    pub fn with_log_error(self, namespace: &str, pod: &str, err: ClusterError) -> Self {
        self.state().logs.insert(key(namespace, pod), Err(err));
        self
    }

    /// Log reads for this pod never complete; only cancellation ends them.
    pub fn with_hanging_logs(self, namespace: &str, pod: &str) -> Self {
        self.state().hanging_logs.insert(key(namespace, pod));
        self
    }

    /// Park every patch call on a gate the test opens explicitly.
    pub fn with_patch_gate(mut self) -> (Self, Arc<PatchGate>) {
        let gate = Arc::new(PatchGate::new());
        self.gate = Some(gate.clone());
        (self, gate)
    }

    /// The next `errs.len()` patch calls fail with these errors, in order.
    pub fn fail_patches(&self, errs: impl IntoIterator<Item = ClusterError>) {
        self.state().patch_failures.extend(errs);
    }

    /// The next `errs.len()` deployment reads fail with these errors, in order.
    pub fn fail_gets(&self, errs: impl IntoIterator<Item = ClusterError>) {
        self.state().get_failures.extend(errs);
    }

    /// The next `errs.len()` pod or deployment listings fail with these errors, in order.
    pub fn fail_lists(&self, errs: impl IntoIterator<Item = ClusterError>) {
        self.state().list_failures.extend(errs);
    }

    pub fn calls(&self) -> &CallCounts { &self.calls }

    /// Restart timestamps written for a deployment, oldest first.
    pub fn restarts(&self, namespace: &str, name: &str) -> Vec<String> {
        let k = key(namespace, name);
        self.state().restarts.iter().filter(|(rk, _)| *rk == k).map(|(_, ts)| ts.clone()).collect()
    }

    pub fn desired_replicas(&self, namespace: &str, name: &str) -> Option<i32> {
        self.state().deployments.get(&key(namespace, name)).map(|d| d.desired_replicas)
    }

    async fn before_patch(&self) -> ClusterResult<()> {
        if let Some(gate) = &self.gate {
            gate.pass().await;
        }
        match self.state().patch_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl ClusterClient for MockCluster {
    async fn list_pods(&self, namespace: &str, selector: Option<&LabelSelector>) -> ClusterResult<Vec<PodSnapshot>> {
        self.calls.list_pods.fetch_add(1, Ordering::SeqCst);
        let mut st = self.state();
        if let Some(err) = st.list_failures.pop_front() {
            return Err(err);
        }
        Ok(st
            .pods
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, p)| p)
            .filter(|p| selector.map(|s| s.matches(&p.labels)).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn list_deployments(&self, namespace: &str) -> ClusterResult<Vec<DeploymentSnapshot>> {
        self.calls.list_deployments.fetch_add(1, Ordering::SeqCst);
        let mut st = self.state();
        if let Some(err) = st.list_failures.pop_front() {
            return Err(err);
        }
        Ok(st.deployments.iter().filter(|((ns, _), _)| ns == namespace).map(|(_, d)| d.clone()).collect())
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> ClusterResult<DeploymentSnapshot> {
        self.calls.get_deployment.fetch_add(1, Ordering::SeqCst);
        let mut st = self.state();
        if let Some(err) = st.get_failures.pop_front() {
            return Err(err);
        }
        st.deployments
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| ClusterError::not_found("deployment", namespace, name))
    }

    async fn patch_deployment_restart_annotation(&self, namespace: &str, name: &str, restarted_at: &str) -> ClusterResult<()> {
        self.calls.patch_restart.fetch_add(1, Ordering::SeqCst);
        self.before_patch().await?;
        let mut st = self.state();
        let k = key(namespace, name);
        if !st.deployments.contains_key(&k) {
            return Err(ClusterError::not_found("deployment", namespace, name));
        }
        st.restarts.push((k, restarted_at.to_string()));
        Ok(())
    }

    async fn patch_deployment_replicas(&self, namespace: &str, name: &str, replicas: i32) -> ClusterResult<()> {
        self.calls.patch_replicas.fetch_add(1, Ordering::SeqCst);
        self.before_patch().await?;
        let mut st = self.state();
        match st.deployments.get_mut(&key(namespace, name)) {
            Some(dep) => {
                dep.desired_replicas = replicas;
                dep.healthy = DeploymentSnapshot::is_healthy(dep.ready_replicas, replicas, dep.available_replicas);
                Ok(())
            }
            None => Err(ClusterError::not_found("deployment", namespace, name)),
        }
    }

    async fn stream_pod_logs(&self, namespace: &str, pod: &str, _since_seconds: i64, tail_lines: Option<i64>) -> ClusterResult<String> {
        self.calls.pod_logs.fetch_add(1, Ordering::SeqCst);
        let k = key(namespace, pod);
        let (hang, scripted) = {
            let st = self.state();
            (st.hanging_logs.contains(&k), st.logs.get(&k).cloned())
        };
        if hang {
            std::future::pending::<()>().await;
        }
        let text = match scripted {
            Some(res) => res?,
            None => return Err(ClusterError::not_found("pod", namespace, pod)),
        };
        Ok(match tail_lines {
            Some(n) => {
                let lines: Vec<&str> = text.lines().collect();
                let start = lines.len().saturating_sub(n.max(0) as usize);
                lines[start..].iter().map(|l| format!("{}\n", l)).collect()
            }
            None => text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use korral_core::PodPhase;

    fn pod(name: &str, app: &str) -> PodSnapshot {
        PodSnapshot {
            name: name.into(),
            phase: PodPhase::Running,
            ip: None,
            labels: BTreeMap::from([("app".to_string(), app.to_string())]),
        }
    }

    #[tokio::test]
    async fn list_pods_filters_by_namespace_and_selector() {
        let mock = MockCluster::new()
            .with_pod("default", pod("web-1", "web"))
            .with_pod("default", pod("db-1", "db"))
            .with_pod("other", pod("web-2", "web"));
        let sel = LabelSelector::from_labels([("app", "web")]);
        let pods = mock.list_pods("default", Some(&sel)).await.expect("list");
        assert_eq!(pods.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(), vec!["web-1"]);
        assert_eq!(mock.list_pods("default", None).await.expect("list").len(), 2);
        assert_eq!(mock.calls().list_pods.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn scripted_patch_failures_are_consumed_in_order() {
        let mock = MockCluster::new();
        mock.fail_patches([ClusterError::Transient("a".into()), ClusterError::Transient("b".into())]);
        let first = mock.patch_deployment_restart_annotation("default", "web", "t").await;
        let second = mock.patch_deployment_restart_annotation("default", "web", "t").await;
        let third = mock.patch_deployment_restart_annotation("default", "web", "t").await;
        assert_eq!(first, Err(ClusterError::Transient("a".into())));
        assert_eq!(second, Err(ClusterError::Transient("b".into())));
        assert_eq!(third, Err(ClusterError::not_found("deployment", "default", "web")));
        assert_eq!(mock.calls().patches(), 3);
    }

    #[tokio::test]
    async fn tail_lines_keeps_the_end() {
        let mock = MockCluster::new().with_logs("default", "web-1", "a\nb\nc\n");
        let out = mock.stream_pod_logs("default", "web-1", 3600, Some(2)).await.expect("logs");
        assert_eq!(out, "b\nc\n");
    }
}
