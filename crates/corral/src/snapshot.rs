use corral_core::{Node, Pod, PodExt, ResourceQuota, DEFAULT_NAMESPACE};
use corral_scheduler::{
    InMemoryStore, OptimizerConfig, QuotaControllerConfig, SchedulerConfig, TenantQuotaConfig,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Cluster state the driver operates on
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSnapshot {
    pub nodes: Vec<Node>,
    pub pods: Vec<Pod>,
    pub quotas: Vec<ResourceQuota>,
    pub tenants: Vec<TenantQuotaConfig>,
}

impl ClusterSnapshot {
    pub fn load(path: &Path) -> miette::Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| miette::miette!("Failed to read snapshot '{}': {}", path.display(), e))?;
        let snapshot: Self = corral_core::from_yaml(&data)?;

        info!(
            "Loaded snapshot with {} nodes, {} pods, {} quotas, {} tenants",
            snapshot.nodes.len(),
            snapshot.pods.len(),
            snapshot.quotas.len(),
            snapshot.tenants.len()
        );
        Ok(snapshot)
    }

    /// Populate an in-memory store. Tenants are not part of the store.
    pub async fn into_store(self) -> (InMemoryStore, Vec<TenantQuotaConfig>) {
        let store = InMemoryStore::new();
        for node in self.nodes {
            store.add_node(node).await;
        }
        for mut pod in self.pods {
            if pod.metadata.namespace.is_none() {
                pod.metadata.namespace = Some(DEFAULT_NAMESPACE.to_string());
            }
            store.add_pod(pod).await;
        }
        for quota in self.quotas {
            let namespace = quota
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
            store.add_quota(&namespace, quota).await;
        }
        (store, self.tenants)
    }
}

/// Component configuration, all sections optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub scheduler: SchedulerConfig,
    pub quota: QuotaControllerConfig,
    pub optimizer: OptimizerConfig,
}

impl DriverConfig {
    pub fn load(path: Option<&Path>) -> miette::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let data = std::fs::read_to_string(path)
            .map_err(|e| miette::miette!("Failed to read config '{}': {}", path.display(), e))?;
        Ok(corral_core::from_yaml(&data)?)
    }
}

/// Pods in the snapshot that have no node yet
pub fn pending_count(pods: &[Pod]) -> usize {
    pods.iter().filter(|p| p.assigned_node().is_none()).count()
}
