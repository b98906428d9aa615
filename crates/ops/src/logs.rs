//! Fan-out log retrieval across the pods behind a deployment.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use futures::stream::{self, StreamExt};
use korral_core::{ErrorKind, LogBundle, PodLog, ResourceKind, ResourceRef, ResultEnvelope};
use korral_kubehub::{ClusterClient, ClusterError};
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Upper bound on concurrent per-pod reads.
    pub max_concurrency: usize,
    /// Per-pod text budget in bytes; the tail is kept. 0 disables the cap.
    pub max_bytes_per_pod: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { max_concurrency: 8, max_bytes_per_pod: 64 * 1024 }
    }
}

/// Cancellation handle for one fetch. Cancelling the root stops every pod;
/// [`LogCancel::cancel_pod`] stops just one.
#[derive(Debug, Clone, Default)]
pub struct LogCancel {
    root: CancellationToken,
    pods: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl LogCancel {
    pub fn new() -> Self { Self::default() }

    /// Tie the fetch to an outer token.
    pub fn from_parent(parent: &CancellationToken) -> Self {
        Self { root: parent.child_token(), pods: Arc::default() }
    }

    fn pods(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.pods.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Token for `pod`, created on first use as a child of the root.
    pub fn token_for(&self, pod: &str) -> CancellationToken {
        self.pods().entry(pod.to_string()).or_insert_with(|| self.root.child_token()).clone()
    }

    pub fn cancel_pod(&self, pod: &str) {
        self.token_for(pod).cancel();
    }

    pub fn cancel_all(&self) {
        self.root.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.root.is_cancelled()
    }
}

/// Keep at most the last `max_bytes` of `text`, starting on a line boundary
/// when one exists inside the kept window. Returns the text and whether
/// anything was dropped.
pub fn truncate_tail(text: String, max_bytes: usize) -> (String, bool) {
    if max_bytes == 0 || text.len() <= max_bytes {
        return (text, false);
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    if let Some(nl) = text[start..].find('\n') {
        let after = start + nl + 1;
        if after < text.len() {
            start = after;
        }
    }
    (text[start..].to_string(), true)
}

pub struct LogAggregator {
    client: Arc<dyn ClusterClient>,
    config: LogConfig,
}

impl LogAggregator {
    pub fn new(client: Arc<dyn ClusterClient>, config: LogConfig) -> Self {
        Self { client, config }
    }

    /// Fetch the last `hours` of logs (optionally only `tail_lines` lines) for
    /// every pod selected by the deployment `target`. Pod failures stay in
    /// that pod's entry; the envelope fails only when the deployment is
    /// missing, unreadable, or selects no pods.
    pub async fn fetch(&self, target: &ResourceRef, hours: f64, tail_lines: Option<i64>, cancel: &LogCancel) -> ResultEnvelope<LogBundle> {
        let t0 = Instant::now();
        let (ns, name) = (target.namespace_str(), target.name());
        if target.kind() != ResourceKind::Deployment {
            return ResultEnvelope::fail(target.clone(), ErrorKind::Validation, format!("logs are fetched per deployment, got {}", target));
        }
        if !(hours.is_finite() && hours > 0.0) {
            return ResultEnvelope::fail(target.clone(), ErrorKind::Validation, format!("hours must be a positive number, got {}", hours));
        }
        if matches!(tail_lines, Some(n) if n < 0) {
            return ResultEnvelope::fail(target.clone(), ErrorKind::Validation, "tail_lines must be >= 0");
        }

        let deployment = match self.client.get_deployment(ns, name).await {
            Ok(d) => d,
            Err(e) => return fail_from(target, &e),
        };
        let no_pods = || {
            ResultEnvelope::fail(
                target.clone(),
                ErrorKind::NotFound,
                format!("No pods found for deployment '{}' in namespace '{}'", name, ns),
            )
        };
        // An empty selector would match every pod in the namespace.
        if deployment.selector.is_empty() {
            warn!(target = %target, "logs: deployment has an empty selector");
            return no_pods();
        }
        let pods = match self.client.list_pods(ns, Some(&deployment.selector)).await {
            Ok(p) => p,
            Err(e) => return fail_from(target, &e),
        };
        if pods.is_empty() {
            return no_pods();
        }

        let since_seconds = ((hours * 3600.0).ceil() as i64).max(1);
        let concurrency = self.config.max_concurrency.max(1);
        debug!(target = %target, pods = pods.len(), since_seconds, tail = ?tail_lines, concurrency, "logs: fan-out");

        let results: Vec<(String, PodLog)> = stream::iter(pods.into_iter().map(|p| p.name))
            .map(|pod| {
                let token = cancel.token_for(&pod);
                async move {
                    let entry = self.read_pod(ns, &pod, since_seconds, tail_lines, &token).await;
                    (pod, entry)
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut bundle = LogBundle::new(target.clone());
        bundle.per_pod.extend(results);
        let (ok, failed) = (bundle.ok_count(), bundle.failed_count());
        counter!("ops_logs_pods", ok as u64, "outcome" => "ok");
        counter!("ops_logs_pods", failed as u64, "outcome" => "err");
        histogram!("ops_logs_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(target = %target, ok, failed, took_ms = %t0.elapsed().as_millis(), "logs: fetch ok");

        let mut message = format!("Retrieved logs for {} pods in deployment '{}'", bundle.per_pod.len(), name);
        if failed > 0 {
            message.push_str(&format!(" ({} failed)", failed));
        }
        ResultEnvelope::ok(target.clone(), message, bundle)
    }

    async fn read_pod(&self, ns: &str, pod: &str, since_seconds: i64, tail_lines: Option<i64>, token: &CancellationToken) -> PodLog {
        if token.is_cancelled() {
            return PodLog::failed("cancelled");
        }
        let read = tokio::select! {
            biased;
            _ = token.cancelled() => return PodLog::failed("cancelled"),
            r = self.client.stream_pod_logs(ns, pod, since_seconds, tail_lines) => r,
        };
        match read {
            Ok(text) => {
                let (text, truncated) = truncate_tail(text, self.config.max_bytes_per_pod);
                PodLog::from_output(text, truncated)
            }
            Err(e) => {
                warn!(ns = %ns, pod = %pod, error = %e, "logs: pod read failed");
                PodLog::failed(format!("Error retrieving logs: {}", e))
            }
        }
    }
}

fn fail_from(target: &ResourceRef, err: &ClusterError) -> ResultEnvelope<LogBundle> {
    let message = match err {
        ClusterError::NotFound { namespace, name, .. } => format!("Deployment '{}' not found in namespace '{}'", name, namespace),
        e => format!("API Error: {}", e),
    };
    ResultEnvelope::fail(target.clone(), err.kind(), message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_untouched() {
        assert_eq!(truncate_tail("abc\n".into(), 10), ("abc\n".to_string(), false));
        assert_eq!(truncate_tail("abc\n".into(), 0), ("abc\n".to_string(), false));
    }

    #[test]
    fn keeps_tail_from_a_line_boundary() {
        let text = "first line\nsecond line\nthird\n".to_string();
        let (out, cut) = truncate_tail(text, 14);
        assert!(cut);
        assert_eq!(out, "third\n");
    }

    #[test]
    fn keeps_raw_tail_without_newline() {
        let (out, cut) = truncate_tail("abcdefghij".into(), 4);
        assert!(cut);
        assert_eq!(out, "ghij");
    }

    #[test]
    fn never_splits_a_char() {
        let (out, cut) = truncate_tail("ééé".into(), 3);
        assert!(cut);
        assert_eq!(out, "é");
    }

    #[test]
    fn pod_tokens_are_children_of_root() {
        let c = LogCancel::new();
        let a = c.token_for("a");
        let b = c.token_for("b");
        c.cancel_pod("a");
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        c.cancel_all();
        assert!(b.is_cancelled());
    }

    #[test]
    fn parent_cancellation_reaches_pods() {
        let parent = CancellationToken::new();
        let c = LogCancel::from_parent(&parent);
        let t = c.token_for("p");
        parent.cancel();
        assert!(t.is_cancelled());
        assert!(c.is_cancelled());
    }
}
