// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Scheduler error type
#[derive(Error, Debug, Diagnostic)]
pub enum SchedulerError {
    /// No host passed filtering
    #[error("No candidate hosts for pod {pod_name}: {reason}")]
    #[diagnostic(
        code(scheduler::no_candidate_hosts),
        help("The pod falls through to preemption. Check node resources, taints, and pod requirements")
    )]
    NoCandidateHosts {
        pod_name: String,
        reason: String,
    },

    /// No host can fit the pod even after evicting lower-priority pods
    #[error("No preemption possible for pod {pod_name}: {reason}")]
    #[diagnostic(
        code(scheduler::no_preemption_possible),
        help("The pod stays pending. Retry later or add capacity")
    )]
    NoPreemptionPossible {
        pod_name: String,
        reason: String,
    },

    /// Transient failure talking to the orchestrator
    #[error("Accessor unavailable during {operation}: {message}")]
    #[diagnostic(
        code(scheduler::accessor_unavailable),
        help("This is usually transient. The operation is retried with backoff")
    )]
    AccessorUnavailable {
        operation: String,
        message: String,
    },

    /// Every ranked host lost its capacity to a concurrent bind
    #[error("Capacity on node {node_name} was taken before pod {pod_name} could bind")]
    #[diagnostic(
        code(scheduler::capacity_conflict),
        help("Another scheduling decision claimed the capacity first. The pod is retried next cycle")
    )]
    CapacityConflict {
        pod_name: String,
        node_name: String,
    },

    /// Malformed pod specification
    #[error("Invalid spec for pod {pod_name}: {reason}")]
    #[diagnostic(
        code(scheduler::invalid_unit_spec),
        help("Fix the pod's resource requests, affinity, or scheduling annotations")
    )]
    InvalidUnitSpec {
        pod_name: String,
        reason: String,
    },

    /// Rejected configuration
    #[error("Invalid configuration: {message}")]
    #[diagnostic(
        code(scheduler::invalid_config),
        help("{suggestion}")
    )]
    InvalidConfig {
        message: String,
        suggestion: String,
    },

    /// Object not found in the accessor
    #[error("{kind} not found: {name}")]
    #[diagnostic(
        code(scheduler::not_found),
        help("The object may have been deleted since the snapshot was taken")
    )]
    NotFound {
        kind: String,
        name: String,
    },

    /// Pod already has a binding
    #[error("Pod {pod_name} is already bound to node {node_name}")]
    #[diagnostic(
        code(scheduler::already_bound),
        help("A pod can only be bound once. Delete and recreate it to reschedule")
    )]
    AlreadyBound {
        pod_name: String,
        node_name: String,
    },

    /// Core error
    #[error("Core error: {0}")]
    #[diagnostic(
        code(scheduler::core_error),
        help("This is an internal error")
    )]
    CoreError(#[from] corral_core::CorralError),

    /// Internal error
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(scheduler::internal_error),
        help("This is likely a bug. Please report it")
    )]
    InternalError {
        message: String,
    },
}

/// Result type for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;

impl SchedulerError {
    /// Create a NoCandidateHosts error
    pub fn no_candidate_hosts(pod_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NoCandidateHosts {
            pod_name: pod_name.into(),
            reason: reason.into(),
        }
    }

    /// Create a NoPreemptionPossible error
    pub fn no_preemption_possible(pod_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NoPreemptionPossible {
            pod_name: pod_name.into(),
            reason: reason.into(),
        }
    }

    /// Create an AccessorUnavailable error
    pub fn accessor_unavailable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AccessorUnavailable {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a CapacityConflict error
    pub fn capacity_conflict(pod_name: impl Into<String>, node_name: impl Into<String>) -> Self {
        Self::CapacityConflict {
            pod_name: pod_name.into(),
            node_name: node_name.into(),
        }
    }

    /// Create an InvalidUnitSpec error
    pub fn invalid_unit_spec(pod_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUnitSpec {
            pod_name: pod_name.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidConfig error
    pub fn invalid_config(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a NotFound error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an AlreadyBound error
    pub fn already_bound(pod_name: impl Into<String>, node_name: impl Into<String>) -> Self {
        Self::AlreadyBound {
            pod_name: pod_name.into(),
            node_name: node_name.into(),
        }
    }

    /// Create an InternalError
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// Whether retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::AccessorUnavailable { .. } | Self::CapacityConflict { .. }
        )
    }
}
