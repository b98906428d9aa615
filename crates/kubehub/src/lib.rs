//! Korral kubehub: the control-plane seam.
//!
//! [`ClusterClient`] is the only way the rest of the workspace talks to a
//! cluster. [`KubeCluster`] backs it with kube-rs; [`MockCluster`] is an
//! in-memory stand-in with scripted failures and call counters.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use k8s_openapi::api::{apps::v1::Deployment, core::v1::Pod};
use kube::{
    api::{Api, ListParams, LogParams, Patch, PatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    Client,
};
use korral_core::{DeploymentSnapshot, ErrorKind, LabelSelector, PodSnapshot};
use metrics::{counter, histogram};
use tracing::{debug, info};

mod convert;
mod mock;

pub use convert::{deployment_snapshot, label_selector, pod_snapshot};
pub use mock::{CallCounts, MockCluster, PatchGate};

/// Annotation `kubectl rollout restart` writes on the pod template.
pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// Outcome of a failed cluster call. The split drives retry policy upstream:
/// only `Transient` is ever retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    #[error("{kind} '{name}' not found in namespace '{namespace}'")]
    NotFound { kind: &'static str, namespace: String, name: String },
    #[error("transient api error: {0}")]
    Transient(String),
    #[error("api rejected request{}: {message}", status_suffix(.code))]
    Rejected { code: Option<u16>, message: String },
}

impl ClusterError {
    pub fn not_found(kind: &'static str, namespace: &str, name: &str) -> Self {
        ClusterError::NotFound { kind, namespace: namespace.to_string(), name: name.to_string() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ClusterError::NotFound { .. } => ErrorKind::NotFound,
            ClusterError::Transient(_) => ErrorKind::Transient,
            ClusterError::Rejected { .. } => ErrorKind::Rejected,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ClusterError::Transient(_))
    }

    /// Classify a kube-rs error for the object `kind` `namespace/name`.
    pub fn from_kube(err: kube::Error, kind: &'static str, namespace: &str, name: &str) -> Self {
        match err {
            kube::Error::Api(ae) => match ae.code {
                404 => ClusterError::not_found(kind, namespace, name),
                409 | 429 | 500..=599 => ClusterError::Transient(format!("{} ({}): {}", ae.reason, ae.code, ae.message)),
                code => ClusterError::Rejected { code: Some(code), message: ae.message },
            },
            e @ (kube::Error::HyperError(_) | kube::Error::Service(_) | kube::Error::ReadEvents(_)) => {
                ClusterError::Transient(e.to_string())
            }
            e => ClusterError::Rejected { code: None, message: e.to_string() },
        }
    }
}

fn status_suffix(code: &Option<u16>) -> String {
    code.map(|c| format!(" ({})", c)).unwrap_or_default()
}

pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

/// Control-plane operations the core needs. Implementations own nothing but
/// a connection handle.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    /// List pods in `namespace`, optionally narrowed by a label selector.
    async fn list_pods(&self, namespace: &str, selector: Option<&LabelSelector>) -> ClusterResult<Vec<PodSnapshot>>;

    async fn list_deployments(&self, namespace: &str) -> ClusterResult<Vec<DeploymentSnapshot>>;

    async fn get_deployment(&self, namespace: &str, name: &str) -> ClusterResult<DeploymentSnapshot>;

    /// Merge-patch the restart annotation onto the pod template.
    async fn patch_deployment_restart_annotation(&self, namespace: &str, name: &str, restarted_at: &str) -> ClusterResult<()>;

    async fn patch_deployment_replicas(&self, namespace: &str, name: &str, replicas: i32) -> ClusterResult<()>;

    /// Read a pod's logs for the last `since_seconds`, optionally only the last `tail_lines`.
    async fn stream_pod_logs(&self, namespace: &str, pod: &str, since_seconds: i64, tail_lines: Option<i64>) -> ClusterResult<String>;
}

/// How to reach the cluster. Built by the caller; nothing in the core reads
/// the environment.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Explicit kubeconfig; `None` infers (in-cluster, then default kubeconfig).
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self { kubeconfig: None, context: None, connect_timeout: Duration::from_secs(5), read_timeout: Duration::from_secs(30) }
    }
}

pub async fn connect(opts: &ConnectOptions) -> Result<Client> {
    let kco = KubeConfigOptions { context: opts.context.clone(), ..Default::default() };
    let mut config = match (&opts.kubeconfig, &opts.context) {
        (Some(path), _) => {
            let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig at {}", path.display()))?;
            kube::Config::from_custom_kubeconfig(kc, &kco).await.context("building config from kubeconfig")?
        }
        (None, Some(_)) => kube::Config::from_kubeconfig(&kco).await.context("loading default kubeconfig")?,
        (None, None) => kube::Config::infer().await.context("inferring kube config")?,
    };
    config.connect_timeout = Some(opts.connect_timeout);
    config.read_timeout = Some(opts.read_timeout);
    info!(cluster = %config.cluster_url, ns = %config.default_namespace, "kube client configured");
    Client::try_from(config).context("creating kube client")
}

/// kube-rs backed [`ClusterClient`].
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self { Self { client } }

    pub async fn connect(opts: &ConnectOptions) -> Result<Self> {
        Ok(Self::new(connect(opts).await?))
    }

    fn pods(&self, namespace: &str) -> Api<Pod> { Api::namespaced(self.client.clone(), namespace) }

    fn deployments(&self, namespace: &str) -> Api<Deployment> { Api::namespaced(self.client.clone(), namespace) }
}

fn observe(op: &'static str, t0: Instant) {
    histogram!("kube_call_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op);
}

#[async_trait::async_trait]
impl ClusterClient for KubeCluster {
    async fn list_pods(&self, namespace: &str, selector: Option<&LabelSelector>) -> ClusterResult<Vec<PodSnapshot>> {
        let t0 = Instant::now();
        let mut lp = ListParams::default();
        if let Some(sel) = selector.filter(|s| !s.is_empty()) {
            lp = lp.labels(&sel.render());
        }
        let list = self
            .pods(namespace)
            .list(&lp)
            .await
            .map_err(|e| ClusterError::from_kube(e, "namespace", namespace, namespace))?;
        observe("list_pods", t0);
        let pods: Vec<PodSnapshot> = list.items.iter().filter_map(pod_snapshot).collect();
        debug!(ns = %namespace, selector = ?lp.label_selector, count = pods.len(), "kube: pods listed");
        Ok(pods)
    }

    async fn list_deployments(&self, namespace: &str) -> ClusterResult<Vec<DeploymentSnapshot>> {
        let t0 = Instant::now();
        let list = self
            .deployments(namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| ClusterError::from_kube(e, "namespace", namespace, namespace))?;
        observe("list_deployments", t0);
        let now = chrono::Utc::now();
        Ok(list.items.iter().filter_map(|d| deployment_snapshot(d, now)).collect())
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> ClusterResult<DeploymentSnapshot> {
        let t0 = Instant::now();
        let dep = self
            .deployments(namespace)
            .get(name)
            .await
            .map_err(|e| ClusterError::from_kube(e, "deployment", namespace, name))?;
        observe("get_deployment", t0);
        deployment_snapshot(&dep, chrono::Utc::now())
            .ok_or_else(|| ClusterError::Rejected { code: None, message: format!("deployment '{}' has no metadata.name", name) })
    }

    async fn patch_deployment_restart_annotation(&self, namespace: &str, name: &str, restarted_at: &str) -> ClusterResult<()> {
        let t0 = Instant::now();
        let patch = serde_json::json!({
            "spec": {"template": {"metadata": {"annotations": {RESTARTED_AT_ANNOTATION: restarted_at}}}}
        });
        let pp = PatchParams::default();
        self.deployments(namespace)
            .patch(name, &pp, &Patch::Merge(&patch))
            .await
            .map_err(|e| ClusterError::from_kube(e, "deployment", namespace, name))?;
        observe("patch_restart", t0);
        counter!("kube_patch_total", 1u64, "op" => "restart");
        Ok(())
    }

    async fn patch_deployment_replicas(&self, namespace: &str, name: &str, replicas: i32) -> ClusterResult<()> {
        let t0 = Instant::now();
        let patch = serde_json::json!({"spec": {"replicas": replicas}});
        let pp = PatchParams::default();
        self.deployments(namespace)
            .patch(name, &pp, &Patch::Merge(&patch))
            .await
            .map_err(|e| ClusterError::from_kube(e, "deployment", namespace, name))?;
        observe("patch_replicas", t0);
        counter!("kube_patch_total", 1u64, "op" => "scale");
        Ok(())
    }

    async fn stream_pod_logs(&self, namespace: &str, pod: &str, since_seconds: i64, tail_lines: Option<i64>) -> ClusterResult<String> {
        let t0 = Instant::now();
        let mut lp = LogParams::default();
        lp.since_seconds = Some(since_seconds);
        lp.tail_lines = tail_lines;
        let text = self
            .pods(namespace)
            .logs(pod, &lp)
            .await
            .map_err(|e| ClusterError::from_kube(e, "pod", namespace, pod))?;
        observe("pod_logs", t0);
        debug!(ns = %namespace, pod = %pod, bytes = text.len(), since = since_seconds, tail = ?tail_lines, "kube: logs read");
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_err(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("status {}", code),
            reason: "Reason".into(),
            code,
        })
    }

    #[test]
    fn classifies_api_status_codes() {
        let nf = ClusterError::from_kube(api_err(404), "deployment", "default", "web");
        assert_eq!(nf, ClusterError::not_found("deployment", "default", "web"));
        assert_eq!(nf.kind(), ErrorKind::NotFound);
        assert_eq!(nf.to_string(), "deployment 'web' not found in namespace 'default'");

        for code in [409u16, 429, 500, 503] {
            assert!(ClusterError::from_kube(api_err(code), "deployment", "default", "web").is_transient(), "{code}");
        }
        let forbidden = ClusterError::from_kube(api_err(403), "deployment", "default", "web");
        assert_eq!(forbidden.kind(), ErrorKind::Rejected);
        assert_eq!(forbidden.to_string(), "api rejected request (403): status 403");
    }

    #[test]
    fn non_api_decode_errors_are_not_retried() {
        let serde_err = serde_json::from_str::<serde_json::Value>("{").expect_err("bad json");
        let e = ClusterError::from_kube(kube::Error::SerdeError(serde_err), "pod", "default", "p");
        assert!(!e.is_transient());
    }
}
