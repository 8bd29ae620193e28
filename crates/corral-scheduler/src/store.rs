//! Capabilities the scheduling core needs from the orchestrator.
//!
//! Every method may fail with `AccessorUnavailable`; callers decide whether to
//! retry.

use crate::types::Binding;
use crate::Result;
use async_trait::async_trait;
use corral_core::{Node, Pod, PodExt, ResourceQuota, WorkloadKey};
use std::time::Duration;

/// Selects workload units in `UnitStore::list_units`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitFilter {
    /// Only units in this namespace
    pub namespace: Option<String>,
    /// Only units bound to this node
    pub node_name: Option<String>,
    /// Only units without a node
    pub unscheduled_only: bool,
}

impl UnitFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn unscheduled() -> Self {
        Self {
            unscheduled_only: true,
            ..Default::default()
        }
    }

    pub fn in_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }

    pub fn on_node(node_name: impl Into<String>) -> Self {
        Self {
            node_name: Some(node_name.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, pod: &Pod) -> bool {
        if let Some(namespace) = &self.namespace {
            if PodExt::namespace(pod) != namespace {
                return false;
            }
        }
        if let Some(node_name) = &self.node_name {
            if pod.assigned_node() != Some(node_name.as_str()) {
                return false;
            }
        }
        !(self.unscheduled_only && pod.assigned_node().is_some())
    }
}

/// Read and update hosts
#[async_trait]
pub trait HostStore: Send + Sync {
    async fn list_hosts(&self) -> Result<Vec<Node>>;

    async fn get_host(&self, name: &str) -> Result<Node>;

    /// Replace a host's labels and taints
    async fn update_host(&self, node: Node) -> Result<Node>;
}

/// Read, evict and bind workload units
#[async_trait]
pub trait UnitStore: Send + Sync {
    async fn list_units(&self, filter: &UnitFilter) -> Result<Vec<Pod>>;

    /// Request deletion; the unit terminates after the grace period
    async fn delete_unit(&self, key: &WorkloadKey, grace_period: Duration) -> Result<()>;

    /// Record the unit's placement. Fails with `AlreadyBound` if it has one
    async fn bind(&self, key: &WorkloadKey, node_name: &str) -> Result<Binding>;
}

/// Read and write enforced per-namespace quotas
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn get_quota(&self, namespace: &str) -> Result<Option<ResourceQuota>>;

    async fn update_quota(&self, namespace: &str, quota: ResourceQuota) -> Result<ResourceQuota>;

    async fn create_quota(&self, namespace: &str, quota: ResourceQuota) -> Result<ResourceQuota>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{bound_to, pod};

    #[test]
    fn test_unit_filter() {
        let pending = pod("a", "team-a", "1", "1Gi");
        let running = bound_to(pod("b", "team-b", "1", "1Gi"), "node1");

        assert!(UnitFilter::all().matches(&pending));
        assert!(UnitFilter::unscheduled().matches(&pending));
        assert!(!UnitFilter::unscheduled().matches(&running));
        assert!(UnitFilter::in_namespace("team-b").matches(&running));
        assert!(!UnitFilter::in_namespace("team-b").matches(&pending));
        assert!(UnitFilter::on_node("node1").matches(&running));
        assert!(!UnitFilter::on_node("node1").matches(&pending));
    }
}
