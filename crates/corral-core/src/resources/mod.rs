pub mod quantities;

pub use quantities::{
    utilization, Dimension, ResourceQuantities, ACCELERATOR_RESOURCE, STORAGE_RESOURCE,
};

use crate::WorkloadKey;
use k8s_openapi::api::core::v1::{Node, Pod, Taint, Toleration};

/// Namespace assumed for pods that do not name one
pub const DEFAULT_NAMESPACE: &str = "default";

/// Resource-related errors
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid quantity for {resource} in container {container}: {reason}")]
    InvalidQuantity {
        container: String,
        resource: String,
        reason: String,
    },

    #[error("Requests of container {container} overflow the pod total")]
    RequestOverflow { container: String },
}

/// Scheduling-relevant accessors for workload units
pub trait PodExt {
    /// Pod name, or "unknown"
    fn name(&self) -> &str;

    /// Pod namespace, or the default namespace
    fn namespace(&self) -> &str;

    /// Namespace/name identity
    fn workload_key(&self) -> Result<WorkloadKey, ResourceError>;

    /// Scheduling priority (higher preempts lower)
    fn priority(&self) -> i32;

    /// Sum of container requests per dimension
    fn resource_requests(&self) -> Result<ResourceQuantities, ResourceError>;

    /// Node the pod is bound to, if any
    fn assigned_node(&self) -> Option<&str>;

    /// Deletion has been requested
    fn is_terminating(&self) -> bool;

    /// Pod has finished running (Succeeded or Failed)
    fn is_terminal(&self) -> bool;

    /// Annotation value
    fn annotation(&self, key: &str) -> Option<&str>;

    /// Tolerations declared by the pod
    fn tolerations(&self) -> &[Toleration];
}

impl PodExt for Pod {
    fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    fn namespace(&self) -> &str {
        self.metadata
            .namespace
            .as_deref()
            .unwrap_or(DEFAULT_NAMESPACE)
    }

    fn workload_key(&self) -> Result<WorkloadKey, ResourceError> {
        let name = self
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ResourceError::MissingField("metadata.name".to_string()))?;
        Ok(WorkloadKey::new(PodExt::namespace(self), name))
    }

    fn priority(&self) -> i32 {
        self.spec.as_ref().and_then(|s| s.priority).unwrap_or(0)
    }

    fn resource_requests(&self) -> Result<ResourceQuantities, ResourceError> {
        let spec = self
            .spec
            .as_ref()
            .ok_or_else(|| ResourceError::MissingField("spec".to_string()))?;

        let mut total = ResourceQuantities::default();

        for container in &spec.containers {
            let Some(requests) = container.resources.as_ref().and_then(|r| r.requests.as_ref())
            else {
                continue;
            };

            let container_requests = ResourceQuantities::try_from_k8s_resource_map(requests)
                .map_err(|reason| ResourceError::InvalidQuantity {
                    container: container.name.clone(),
                    resource: "requests".to_string(),
                    reason,
                })?;
            total = total.checked_add(&container_requests).ok_or_else(|| {
                ResourceError::RequestOverflow {
                    container: container.name.clone(),
                }
            })?;
        }

        Ok(total)
    }

    fn assigned_node(&self) -> Option<&str> {
        self.spec
            .as_ref()
            .and_then(|s| s.node_name.as_deref())
            .filter(|n| !n.is_empty())
    }

    fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self.status.as_ref().and_then(|s| s.phase.as_deref()),
            Some("Succeeded") | Some("Failed")
        )
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    fn tolerations(&self) -> &[Toleration] {
        self.spec
            .as_ref()
            .and_then(|s| s.tolerations.as_deref())
            .unwrap_or(&[])
    }
}

/// Scheduling-relevant accessors for hosts
pub trait NodeExt {
    /// Node name, or "unknown"
    fn name(&self) -> &str;

    /// Allocatable capacity per dimension
    fn allocatable(&self) -> ResourceQuantities;

    /// Maximum number of pods, when the node advertises one
    fn pod_capacity(&self) -> Option<i64>;

    /// Label value
    fn label(&self, key: &str) -> Option<&str>;

    /// Taints currently on the node
    fn taints(&self) -> &[Taint];

    /// Ready condition is not False/Unknown. Nodes without conditions are ready
    fn is_ready(&self) -> bool;

    /// Node is not cordoned
    fn is_schedulable(&self) -> bool;
}

impl NodeExt for Node {
    fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    fn allocatable(&self) -> ResourceQuantities {
        self.status
            .as_ref()
            .and_then(|s| s.allocatable.as_ref())
            .map(ResourceQuantities::from_k8s_resource_map)
            .unwrap_or_default()
    }

    fn pod_capacity(&self) -> Option<i64> {
        self.status
            .as_ref()
            .and_then(|s| s.allocatable.as_ref())
            .and_then(|a| a.get("pods"))
            .and_then(|q| ResourceQuantities::parse_count(&q.0).ok())
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(key))
            .map(String::as_str)
    }

    fn taints(&self) -> &[Taint] {
        self.spec
            .as_ref()
            .and_then(|s| s.taints.as_deref())
            .unwrap_or(&[])
    }

    fn is_ready(&self) -> bool {
        let ready = self
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .and_then(|c| c.iter().find(|c| c.type_ == "Ready"));

        match ready {
            Some(condition) => condition.status == "True",
            None => true,
        }
    }

    fn is_schedulable(&self) -> bool {
        !self
            .spec
            .as_ref()
            .and_then(|s| s.unschedulable)
            .unwrap_or(false)
    }
}
