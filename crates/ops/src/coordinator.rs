//! Per-target serialization of cluster mutations.
//!
//! Each accepted mutation holds a ticket keyed by its [`ResourceRef`]. A
//! second request for the same target while a ticket is live is rejected with
//! `Conflict`; requests are never queued. Tickets leave the live set on every
//! exit path through [`TicketGuard`]'s drop, including a dropped future.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};
use korral_core::{ErrorKind, ResourceKind, ResourceRef, ResultEnvelope};
use korral_kubehub::{ClusterClient, ClusterError};
use metrics::{counter, histogram};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Mutation {
    Restart,
    Scale { replicas: i32 },
}

impl Mutation {
    pub fn name(&self) -> &'static str {
        match self {
            Mutation::Restart => "restart",
            Mutation::Scale { .. } => "scale",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketState {
    Pending,
    InFlight,
    Succeeded,
    Failed,
}

impl TicketState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TicketState::Succeeded | TicketState::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MutationTicket {
    pub id: Uuid,
    pub target: ResourceRef,
    pub action: Mutation,
    pub requested_at: DateTime<Utc>,
    pub state: TicketState,
    /// Patch attempts made so far.
    pub attempts: u32,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<String>,
}

/// Payload of a successful mutation envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutationReport {
    pub ticket_id: Uuid,
    pub deployment_name: String,
    pub namespace: String,
    #[serde(flatten)]
    pub mutation: Mutation,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restarted_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub retry: RetryPolicy,
    /// Terminal tickets kept for inspection; 0 disables the history.
    pub history_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self { retry: RetryPolicy::default(), history_capacity: 64 }
    }
}

/// RFC 3339 UTC with second precision and a `Z` suffix, as `kubectl rollout restart` writes it.
pub fn format_restart_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Default)]
struct Tickets {
    live: HashMap<ResourceRef, MutationTicket>,
    history: VecDeque<MutationTicket>,
}

struct Failure {
    kind: ErrorKind,
    message: String,
    attempts: u32,
}

impl Failure {
    fn cancelled(attempts: u32) -> Self {
        Self { kind: ErrorKind::Cancelled, message: "cancelled".to_string(), attempts }
    }
}

pub struct MutationCoordinator {
    client: Arc<dyn ClusterClient>,
    config: CoordinatorConfig,
    tickets: Mutex<Tickets>,
}

impl MutationCoordinator {
    pub fn new(client: Arc<dyn ClusterClient>, config: CoordinatorConfig) -> Self {
        Self { client, config, tickets: Mutex::new(Tickets::default()) }
    }

    fn lock(&self) -> MutexGuard<'_, Tickets> {
        self.tickets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Live (Pending or InFlight) tickets.
    pub fn in_flight(&self) -> Vec<MutationTicket> {
        self.lock().live.values().cloned().collect()
    }

    pub fn is_in_flight(&self, target: &ResourceRef) -> bool {
        self.lock().live.contains_key(target)
    }

    /// Archived terminal tickets, oldest first.
    pub fn history(&self) -> Vec<MutationTicket> {
        self.lock().history.iter().cloned().collect()
    }

    pub async fn restart(&self, target: &ResourceRef, cancel: &CancellationToken) -> ResultEnvelope<MutationReport> {
        self.submit(target, Mutation::Restart, cancel).await
    }

    pub async fn scale(&self, target: &ResourceRef, replicas: i32, cancel: &CancellationToken) -> ResultEnvelope<MutationReport> {
        self.submit(target, Mutation::Scale { replicas }, cancel).await
    }

    pub async fn submit(&self, target: &ResourceRef, mutation: Mutation, cancel: &CancellationToken) -> ResultEnvelope<MutationReport> {
        let t0 = Instant::now();
        let action = mutation.name();
        let (ns, name) = (target.namespace_str(), target.name());
        if target.kind() != ResourceKind::Deployment {
            return ResultEnvelope::fail(target.clone(), ErrorKind::Validation, format!("{} is only supported for deployments, got {}", action, target));
        }
        if let Mutation::Scale { replicas } = mutation {
            if replicas < 0 {
                return ResultEnvelope::fail(target.clone(), ErrorKind::Validation, format!("replicas must be >= 0, got {}", replicas));
            }
        }

        let Some(guard) = self.acquire(target, mutation) else {
            counter!("ops_mutation_conflict", 1u64, "action" => action);
            warn!(target = %target, action, "ops: mutation rejected; another operation is in flight");
            return ResultEnvelope::fail(
                target.clone(),
                ErrorKind::Conflict,
                format!("operation already in progress for deployment '{}' in namespace '{}'; retry once it completes", name, ns),
            );
        };
        guard.update(|t| t.state = TicketState::InFlight);
        counter!("ops_mutation_attempts", 1u64, "action" => action);
        info!(target = %target, action, ticket = %guard.id, "ops: mutation in flight");

        match self.execute(&guard, target, mutation, cancel).await {
            Ok(restarted_at) => {
                let attempts = guard.attempts();
                let message = match mutation {
                    Mutation::Restart => format!("Deployment '{}' in namespace '{}' rollout restart initiated", name, ns),
                    Mutation::Scale { replicas } => format!("Deployment '{}' in namespace '{}' scaled to {} replicas", name, ns, replicas),
                };
                let report = MutationReport {
                    ticket_id: guard.id,
                    deployment_name: name.to_string(),
                    namespace: ns.to_string(),
                    mutation,
                    attempts,
                    restarted_at,
                };
                guard.finish(TicketState::Succeeded, message.clone());
                counter!("ops_mutation_ok", 1u64, "action" => action);
                histogram!("ops_mutation_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "action" => action);
                info!(target = %target, action, attempts, took_ms = %t0.elapsed().as_millis(), "ops: mutation ok");
                ResultEnvelope::ok(target.clone(), message, report)
            }
            Err(failure) => {
                guard.update(|t| t.attempts = t.attempts.max(failure.attempts));
                guard.finish(TicketState::Failed, failure.message.clone());
                counter!("ops_mutation_err", 1u64, "action" => action, "kind" => failure.kind.as_str());
                warn!(target = %target, action, kind = failure.kind.as_str(), error = %failure.message, took_ms = %t0.elapsed().as_millis(), "ops: mutation failed");
                ResultEnvelope::fail(target.clone(), failure.kind, failure.message)
            }
        }
    }

    /// Check-and-insert under one lock acquisition.
    fn acquire(&self, target: &ResourceRef, mutation: Mutation) -> Option<TicketGuard<'_>> {
        let mut tickets = self.lock();
        match tickets.live.entry(target.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let id = Uuid::new_v4();
                slot.insert(MutationTicket {
                    id,
                    target: target.clone(),
                    action: mutation,
                    requested_at: Utc::now(),
                    state: TicketState::Pending,
                    attempts: 0,
                    finished_at: None,
                    outcome: None,
                });
                Some(TicketGuard { coordinator: self, target: target.clone(), id, released: false })
            }
        }
    }

    fn release(&self, target: &ResourceRef, id: Uuid, state: TicketState, outcome: String) {
        let mut tickets = self.lock();
        let Some(mut ticket) = tickets.live.remove(target).filter(|t| t.id == id) else {
            return;
        };
        ticket.state = state;
        ticket.finished_at = Some(Utc::now());
        ticket.outcome = Some(outcome);
        if self.config.history_capacity == 0 {
            return;
        }
        while tickets.history.len() >= self.config.history_capacity {
            tickets.history.pop_front();
        }
        tickets.history.push_back(ticket);
    }

    async fn execute(
        &self,
        guard: &TicketGuard<'_>,
        target: &ResourceRef,
        mutation: Mutation,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, Failure> {
        let (ns, name) = (target.namespace_str(), target.name());
        let action = mutation.name();

        // Existence check. Transient read failures share the mutation's retry budget shape.
        self.with_retry(action, cancel, |_| (), || self.client.get_deployment(ns, name))
            .await
            .map_err(|f| Failure { attempts: 0, ..f })?;

        match mutation {
            Mutation::Restart => {
                let ts = format_restart_timestamp(Utc::now());
                self.with_retry(action, cancel, |n| guard.update(|t| t.attempts = n), || {
                    self.client.patch_deployment_restart_annotation(ns, name, &ts)
                })
                .await?;
                Ok(Some(ts))
            }
            Mutation::Scale { replicas } => {
                self.with_retry(action, cancel, |n| guard.update(|t| t.attempts = n), || {
                    self.client.patch_deployment_replicas(ns, name, replicas)
                })
                .await?;
                Ok(None)
            }
        }
    }

    /// Run `call` until it succeeds, fails non-transiently, or the attempt
    /// budget is spent. Cancellation is observed before each attempt and
    /// during backoff, never in the middle of an API call.
    async fn with_retry<T, F, Fut>(
        &self,
        action: &'static str,
        cancel: &CancellationToken,
        mut on_attempt: impl FnMut(u32),
        mut call: F,
    ) -> Result<T, Failure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClusterError>>,
    {
        let policy = self.config.retry;
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(Failure::cancelled(attempt));
            }
            attempt += 1;
            on_attempt(attempt);
            let err = match call().await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };
            if !err.is_transient() || attempt >= max_attempts {
                let message = match &err {
                    ClusterError::NotFound { .. } => capitalize(&err.to_string()),
                    _ if err.is_transient() => format!("{} failed after {} attempts: {}", action, attempt, err),
                    _ => format!("API Error: {}", err),
                };
                return Err(Failure { kind: err.kind(), message, attempts: attempt });
            }
            let delay = policy.delay_for(attempt);
            counter!("ops_mutation_retries", 1u64, "action" => action);
            warn!(action, attempt, delay_ms = delay.as_millis() as u64, error = %err, "ops: transient failure; backing off");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Failure::cancelled(attempt)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Owns a live ticket. Dropping it without [`TicketGuard::finish`] (a
/// cancelled or dropped future) archives the ticket as Failed.
struct TicketGuard<'a> {
    coordinator: &'a MutationCoordinator,
    target: ResourceRef,
    id: Uuid,
    released: bool,
}

impl TicketGuard<'_> {
    fn update(&self, f: impl FnOnce(&mut MutationTicket)) {
        let mut tickets = self.coordinator.lock();
        if let Some(t) = tickets.live.get_mut(&self.target).filter(|t| t.id == self.id) {
            f(t);
        }
    }

    fn attempts(&self) -> u32 {
        self.coordinator.lock().live.get(&self.target).map(|t| t.attempts).unwrap_or(0)
    }

    fn finish(mut self, state: TicketState, outcome: String) {
        debug_assert!(state.is_terminal());
        self.released = true;
        self.coordinator.release(&self.target, self.id, state, outcome);
    }
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.coordinator.release(&self.target, self.id, TicketState::Failed, "cancelled".to_string());
        }
    }
}
