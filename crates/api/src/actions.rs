//! The fixed action catalog.

use std::time::Instant;

use async_trait::async_trait;
use korral_core::{ErrorKind, ResourceRef, ResultEnvelope, ValidationError};
use korral_kubehub::ClusterError;
use korral_ops::LogCancel;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::schema::{ActionSpec, Args, ParamSpec, ParamType, Safety};
use crate::{Action, ActionContext};

pub(crate) fn builtin() -> Vec<Box<dyn Action>> {
    vec![
        Box::new(ListPods::new()),
        Box::new(ListDeployments::new()),
        Box::new(GetDeployment::new()),
        Box::new(RestartDeployment::new()),
        Box::new(ScaleDeployment::new()),
        Box::new(GetDeploymentLogs::new()),
    ]
}

fn invalid(args: &Args, err: ValidationError) -> ResultEnvelope<Value> {
    let target = args.deployment().or_else(|_| args.namespace_ref()).unwrap_or_else(|_| ResourceRef::default_namespace());
    ResultEnvelope::fail(target, ErrorKind::Validation, err.to_string())
}

/// Read failures surface as-is; reads are never retried.
fn read_failed(target: ResourceRef, err: &ClusterError) -> ResultEnvelope<Value> {
    let message = match err {
        ClusterError::NotFound { kind: "namespace", name, .. } => format!("Namespace '{}' not found", name),
        ClusterError::NotFound { kind, namespace, name } => {
            format!("{} '{}' not found in namespace '{}'", title_case(kind), name, namespace)
        }
        e => format!("API Error: {}", e),
    };
    ResultEnvelope::fail(target, err.kind(), message)
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    chars.next().map(|c| c.to_uppercase().chain(chars).collect()).unwrap_or_default()
}

pub(crate) struct ListPods {
    spec: ActionSpec,
}

impl ListPods {
    pub(crate) fn new() -> Self {
        Self {
            spec: ActionSpec {
                name: "list_pods",
                description: "List pods in a namespace with their phase and IP",
                params: vec![ParamSpec::namespace()],
                safety: Safety::ReadOnly,
            },
        }
    }
}

#[async_trait]
impl Action for ListPods {
    fn spec(&self) -> &ActionSpec { &self.spec }

    async fn run(&self, ctx: &ActionContext, args: &Args, _cancel: &CancellationToken) -> ResultEnvelope<Value> {
        let target = match args.namespace_ref() {
            Ok(t) => t,
            Err(e) => return invalid(args, e),
        };
        let ns = target.namespace_str().to_string();
        match ctx.cluster.list_pods(&ns, None).await {
            Ok(pods) => {
                let message = format!("Found {} pods in namespace '{}'", pods.len(), ns);
                ResultEnvelope::ok(target, message, pods).into_json()
            }
            Err(e) => read_failed(target, &e),
        }
    }
}

pub(crate) struct ListDeployments {
    spec: ActionSpec,
}

impl ListDeployments {
    pub(crate) fn new() -> Self {
        Self {
            spec: ActionSpec {
                name: "list_deployments",
                description: "List deployments in a namespace with replica counts, images, age and health",
                params: vec![ParamSpec::namespace()],
                safety: Safety::ReadOnly,
            },
        }
    }
}

#[async_trait]
impl Action for ListDeployments {
    fn spec(&self) -> &ActionSpec { &self.spec }

    async fn run(&self, ctx: &ActionContext, args: &Args, _cancel: &CancellationToken) -> ResultEnvelope<Value> {
        let target = match args.namespace_ref() {
            Ok(t) => t,
            Err(e) => return invalid(args, e),
        };
        let ns = target.namespace_str().to_string();
        match ctx.cluster.list_deployments(&ns).await {
            Ok(deps) => {
                let unhealthy = deps.iter().filter(|d| !d.healthy).count();
                let mut message = format!("Found {} deployments in namespace '{}'", deps.len(), ns);
                if unhealthy > 0 {
                    message.push_str(&format!(" ({} unhealthy)", unhealthy));
                }
                ResultEnvelope::ok(target, message, deps).into_json()
            }
            Err(e) => read_failed(target, &e),
        }
    }
}

pub(crate) struct GetDeployment {
    spec: ActionSpec,
}

impl GetDeployment {
    pub(crate) fn new() -> Self {
        Self {
            spec: ActionSpec {
                name: "get_deployment",
                description: "Show one deployment's replica status and health",
                params: vec![ParamSpec::deployment_name(), ParamSpec::namespace()],
                safety: Safety::ReadOnly,
            },
        }
    }
}

#[async_trait]
impl Action for GetDeployment {
    fn spec(&self) -> &ActionSpec { &self.spec }

    async fn run(&self, ctx: &ActionContext, args: &Args, _cancel: &CancellationToken) -> ResultEnvelope<Value> {
        let target = match args.deployment() {
            Ok(t) => t,
            Err(e) => return invalid(args, e),
        };
        match ctx.cluster.get_deployment(target.namespace_str(), target.name()).await {
            Ok(d) => {
                let health = if d.healthy { "healthy" } else { "unhealthy" };
                let message = format!(
                    "Deployment '{}' in namespace '{}' is {} ({}/{} ready)",
                    d.name,
                    target.namespace_str(),
                    health,
                    d.ready_replicas,
                    d.desired_replicas
                );
                ResultEnvelope::ok(target, message, d).into_json()
            }
            Err(e) => read_failed(target, &e),
        }
    }
}

pub(crate) struct RestartDeployment {
    spec: ActionSpec,
}

impl RestartDeployment {
    pub(crate) fn new() -> Self {
        Self {
            spec: ActionSpec {
                name: "restart_deployment",
                description: "Rollout-restart a deployment (same effect as `kubectl rollout restart`)",
                params: vec![ParamSpec::deployment_name(), ParamSpec::namespace()],
                safety: Safety::Mutating,
            },
        }
    }
}

#[async_trait]
impl Action for RestartDeployment {
    fn spec(&self) -> &ActionSpec { &self.spec }

    async fn run(&self, ctx: &ActionContext, args: &Args, cancel: &CancellationToken) -> ResultEnvelope<Value> {
        let target = match args.deployment() {
            Ok(t) => t,
            Err(e) => return invalid(args, e),
        };
        ctx.coordinator.restart(&target, cancel).await.into_json()
    }
}

pub(crate) struct ScaleDeployment {
    spec: ActionSpec,
}

impl ScaleDeployment {
    pub(crate) fn new() -> Self {
        Self {
            spec: ActionSpec {
                name: "scale_deployment",
                description: "Set a deployment's desired replica count",
                params: vec![
                    ParamSpec::deployment_name(),
                    ParamSpec::required("replicas", ParamType::Integer, "Desired replica count (>= 0)"),
                    ParamSpec::namespace(),
                ],
                safety: Safety::Mutating,
            },
        }
    }
}

#[async_trait]
impl Action for ScaleDeployment {
    fn spec(&self) -> &ActionSpec { &self.spec }

    async fn run(&self, ctx: &ActionContext, args: &Args, cancel: &CancellationToken) -> ResultEnvelope<Value> {
        let (target, replicas) = match args.deployment().and_then(|t| Ok((t, args.replicas(ctx.settings.max_replicas)?))) {
            Ok(v) => v,
            Err(e) => return invalid(args, e),
        };
        ctx.coordinator.scale(&target, replicas, cancel).await.into_json()
    }
}

pub(crate) struct GetDeploymentLogs {
    spec: ActionSpec,
}

impl GetDeploymentLogs {
    pub(crate) fn new() -> Self {
        Self {
            spec: ActionSpec {
                name: "get_deployment_logs",
                description: "Fetch recent logs from every pod of a deployment",
                params: vec![
                    ParamSpec::deployment_name(),
                    ParamSpec::namespace(),
                    ParamSpec::optional("hours", ParamType::Number, Some(json!(1)), "How far back to read, in hours (> 0)"),
                    ParamSpec::optional("tail_lines", ParamType::Integer, None, "Only the last N lines per pod"),
                ],
                safety: Safety::ReadOnly,
            },
        }
    }
}

#[async_trait]
impl Action for GetDeploymentLogs {
    fn spec(&self) -> &ActionSpec { &self.spec }

    async fn run(&self, ctx: &ActionContext, args: &Args, cancel: &CancellationToken) -> ResultEnvelope<Value> {
        let parsed = args.deployment().and_then(|t| Ok((t, args.hours()?, args.tail_lines()?)));
        let (target, hours, tail_lines) = match parsed {
            Ok(v) => v,
            Err(e) => return invalid(args, e),
        };
        let t0 = Instant::now();
        debug!(target = %target, hours, tail = ?tail_lines, "api: logs requested");
        let env = ctx.logs.fetch(&target, hours, tail_lines, &LogCancel::from_parent(cancel)).await;
        info!(target = %target, ok = env.success(), took_ms = %t0.elapsed().as_millis(), "api: logs done");
        env.into_json()
    }
}
