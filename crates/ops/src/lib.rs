//! Korral Ops: the two pieces of the core that need real coordination.
//!
//! - [`MutationCoordinator`] runs cluster mutations with at most one in flight
//!   per target and bounded retries of transient failures.
//! - [`LogAggregator`] fans log reads out over a deployment's pods and keeps
//!   per-pod failures local to that pod.

#![forbid(unsafe_code)]

mod coordinator;
mod logs;
mod retry;

pub use coordinator::{
    format_restart_timestamp, CoordinatorConfig, Mutation, MutationCoordinator, MutationReport, MutationTicket, TicketState,
};
pub use logs::{truncate_tail, LogAggregator, LogCancel, LogConfig};
pub use retry::RetryPolicy;
