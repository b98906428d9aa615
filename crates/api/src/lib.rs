//! Korral public API: the action registry shared by the CLI and agent
//! tool-binding layers.
//!
//! Callers hand in an action name and JSON arguments and always get a
//! [`ResultEnvelope`] back. Reads go straight to the [`ClusterClient`];
//! mutations go through the [`MutationCoordinator`]; logs through the
//! [`LogAggregator`].

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use korral_core::{ErrorKind, ResultEnvelope};
use korral_kubehub::ClusterClient;
use korral_ops::{LogAggregator, MutationCoordinator};
use metrics::{counter, histogram};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod actions;
mod schema;
mod settings;

pub use schema::{best_effort_target, ActionSpec, Args, ParamSpec, ParamType, Safety};
pub use settings::Settings;

/// Specs of the built-in actions, without a cluster behind them.
pub fn builtin_catalog() -> Vec<ActionSpec> {
    actions::builtin().iter().map(|a| a.spec().clone()).collect()
}

/// Lookup of a name that is not in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown action '{name}'; available: {available}")]
pub struct UnknownAction {
    pub name: String,
    pub available: String,
}

/// Shared collaborators every action runs against.
pub struct ActionContext {
    pub cluster: Arc<dyn ClusterClient>,
    pub coordinator: Arc<MutationCoordinator>,
    pub logs: Arc<LogAggregator>,
    pub settings: Settings,
}

impl ActionContext {
    pub fn new(cluster: Arc<dyn ClusterClient>, settings: Settings) -> Self {
        let coordinator = Arc::new(MutationCoordinator::new(cluster.clone(), settings.coordinator_config()));
        let logs = Arc::new(LogAggregator::new(cluster.clone(), settings.log_config()));
        Self { cluster, coordinator, logs, settings }
    }
}

/// One catalog entry: a declared input shape and a handler over validated
/// arguments. Handlers return an envelope on every path.
#[async_trait::async_trait]
pub trait Action: Send + Sync {
    fn spec(&self) -> &ActionSpec;

    async fn run(&self, ctx: &ActionContext, args: &Args, cancel: &CancellationToken) -> ResultEnvelope<Value>;
}

pub struct ActionRegistry {
    ctx: ActionContext,
    actions: Vec<Box<dyn Action>>,
}

impl ActionRegistry {
    pub fn new(cluster: Arc<dyn ClusterClient>, settings: Settings) -> Self {
        Self::with_context(ActionContext::new(cluster, settings))
    }

    pub fn with_context(ctx: ActionContext) -> Self {
        Self { ctx, actions: actions::builtin() }
    }

    pub fn resolve(&self, name: &str) -> Result<&dyn Action, UnknownAction> {
        self.actions.iter().find(|a| a.spec().name == name).map(|a| &**a).ok_or_else(|| UnknownAction {
            name: name.to_string(),
            available: self.actions.iter().map(|a| a.spec().name).collect::<Vec<_>>().join(", "),
        })
    }

    /// Every action spec, in catalog order.
    pub fn catalog(&self) -> Vec<&ActionSpec> {
        self.actions.iter().map(|a| a.spec()).collect()
    }

    /// Resolve, validate and run. Unknown names, malformed arguments and
    /// mutations on a read-only registry fail with `Validation` before any
    /// cluster traffic.
    pub async fn invoke(&self, name: &str, args: Value, cancel: &CancellationToken) -> ResultEnvelope<Value> {
        let t0 = Instant::now();
        let action = match self.resolve(name) {
            Ok(a) => a,
            Err(e) => {
                warn!(action = %name, "api: unknown action");
                counter!("api_action_total", 1u64, "action" => "unknown", "outcome" => "err");
                return ResultEnvelope::fail(best_effort_target(&args), ErrorKind::Validation, e.to_string());
            }
        };
        let spec = action.spec();
        let target_hint = best_effort_target(&args);
        let checked = match Args::check(spec, args) {
            Ok(a) => a,
            Err(e) => {
                info!(action = spec.name, error = %e, "api: invalid arguments");
                counter!("api_action_total", 1u64, "action" => spec.name, "outcome" => "invalid");
                return ResultEnvelope::fail(target_hint, ErrorKind::Validation, e.to_string());
            }
        };
        if spec.is_mutating() && !self.ctx.settings.allow_mutations {
            counter!("api_action_total", 1u64, "action" => spec.name, "outcome" => "invalid");
            return ResultEnvelope::fail(
                target_hint,
                ErrorKind::Validation,
                format!("mutating actions are disabled; '{}' was not run", spec.name),
            );
        }

        info!(action = spec.name, target = %target_hint, "api: invoke start");
        let env = action.run(&self.ctx, &checked, cancel).await;
        let outcome = if env.success() { "ok" } else { "err" };
        counter!("api_action_total", 1u64, "action" => spec.name, "outcome" => outcome);
        histogram!("api_action_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "action" => spec.name);
        info!(
            action = spec.name,
            ok = env.success(),
            error = env.error().map(ErrorKind::as_str).unwrap_or("-"),
            took_ms = %t0.elapsed().as_millis(),
            "api: invoke done"
        );
        env
    }
}
