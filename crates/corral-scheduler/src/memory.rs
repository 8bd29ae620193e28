use crate::store::{HostStore, QuotaStore, UnitFilter, UnitStore};
use crate::types::Binding;
use crate::{Result, SchedulerError};
use async_trait::async_trait;
use chrono::Utc;
use corral_core::k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use corral_core::{Node, NodeExt, Pod, PodExt, ResourceQuota, WorkloadKey};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// In-memory cluster state
///
/// Implements every accessor trait over plain maps. Pods deleted with a grace
/// period stay visible as terminating until `finalize_terminating` runs.
/// `fail_next` injects `AccessorUnavailable` errors.
#[derive(Default)]
pub struct InMemoryStore {
    nodes: Arc<RwLock<BTreeMap<String, Node>>>,
    pods: Arc<RwLock<BTreeMap<WorkloadKey, Pod>>>,
    quotas: Arc<RwLock<BTreeMap<String, ResourceQuota>>>,
    bindings: Arc<RwLock<Vec<Binding>>>,
    injected_failures: AtomicU32,
    quota_writes: AtomicU32,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_node(&self, node: Node) {
        let name = node.name().to_string();
        self.nodes.write().await.insert(name.clone(), node);
        debug!("Memory: node added: {}", name);
    }

    /// Add a pod. Pods without a name are keyed as "unknown"
    pub async fn add_pod(&self, pod: Pod) {
        let key = WorkloadKey::new(PodExt::namespace(&pod), pod.name());
        debug!("Memory: pod added: {}", key);
        self.pods.write().await.insert(key, pod);
    }

    pub async fn add_quota(&self, namespace: &str, mut quota: ResourceQuota) {
        quota.metadata.namespace = Some(namespace.to_string());
        self.quotas.write().await.insert(namespace.to_string(), quota);
        debug!("Memory: quota added in namespace {}", namespace);
    }

    pub async fn pod(&self, key: &WorkloadKey) -> Option<Pod> {
        self.pods.read().await.get(key).cloned()
    }

    /// Bindings in the order they were made
    pub async fn bindings(&self) -> Vec<Binding> {
        self.bindings.read().await.clone()
    }

    /// Number of successful quota updates and creations
    pub fn quota_writes(&self) -> u32 {
        self.quota_writes.load(Ordering::SeqCst)
    }

    /// Make the next `count` accessor calls fail as unavailable
    pub fn fail_next(&self, count: u32) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    /// Remove pods whose deletion was requested, as if their grace period
    /// elapsed
    pub async fn finalize_terminating(&self) -> Vec<WorkloadKey> {
        let mut pods = self.pods.write().await;
        let gone: Vec<WorkloadKey> = pods
            .iter()
            .filter(|(_, pod)| pod.is_terminating())
            .map(|(key, _)| key.clone())
            .collect();

        for key in &gone {
            pods.remove(key);
            debug!("Memory: pod terminated: {}", key);
        }
        gone
    }

    fn check_available(&self, operation: &str) -> Result<()> {
        let injected = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            debug!("Memory: injected failure for {}", operation);
            return Err(SchedulerError::accessor_unavailable(
                operation,
                "injected failure",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl HostStore for InMemoryStore {
    async fn list_hosts(&self) -> Result<Vec<Node>> {
        self.check_available("list_hosts")?;
        Ok(self.nodes.read().await.values().cloned().collect())
    }

    async fn get_host(&self, name: &str) -> Result<Node> {
        self.check_available("get_host")?;
        self.nodes
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::not_found("Node", name))
    }

    async fn update_host(&self, node: Node) -> Result<Node> {
        self.check_available("update_host")?;
        let name = node.name().to_string();
        let mut nodes = self.nodes.write().await;
        let slot = nodes
            .get_mut(&name)
            .ok_or_else(|| SchedulerError::not_found("Node", &name))?;
        *slot = node.clone();
        debug!("Memory: node updated: {}", name);
        Ok(node)
    }
}

#[async_trait]
impl UnitStore for InMemoryStore {
    async fn list_units(&self, filter: &UnitFilter) -> Result<Vec<Pod>> {
        self.check_available("list_units")?;
        Ok(self
            .pods
            .read()
            .await
            .values()
            .filter(|pod| filter.matches(pod))
            .cloned()
            .collect())
    }

    async fn delete_unit(&self, key: &WorkloadKey, grace_period: Duration) -> Result<()> {
        self.check_available("delete_unit")?;
        let mut pods = self.pods.write().await;

        if grace_period.is_zero() {
            pods.remove(key)
                .ok_or_else(|| SchedulerError::not_found("Pod", key.to_string()))?;
            debug!("Memory: pod deleted: {}", key);
            return Ok(());
        }

        let pod = pods
            .get_mut(key)
            .ok_or_else(|| SchedulerError::not_found("Pod", key.to_string()))?;
        if pod.metadata.deletion_timestamp.is_none() {
            pod.metadata.deletion_timestamp = Some(Time(Utc::now()));
            pod.metadata.deletion_grace_period_seconds =
                Some(grace_period.as_secs().try_into().unwrap_or(i64::MAX));
        }
        debug!("Memory: pod terminating: {} (grace {:?})", key, grace_period);
        Ok(())
    }

    async fn bind(&self, key: &WorkloadKey, node_name: &str) -> Result<Binding> {
        self.check_available("bind")?;

        if !self.nodes.read().await.contains_key(node_name) {
            return Err(SchedulerError::not_found("Node", node_name));
        }

        let mut pods = self.pods.write().await;
        let pod = pods
            .get_mut(key)
            .ok_or_else(|| SchedulerError::not_found("Pod", key.to_string()))?;

        if let Some(existing) = pod.assigned_node() {
            return Err(SchedulerError::already_bound(key.to_string(), existing));
        }

        pod.spec.get_or_insert_with(Default::default).node_name = Some(node_name.to_string());

        let binding = Binding::new(key.clone(), node_name);
        self.bindings.write().await.push(binding.clone());
        debug!("Memory: pod {} bound to {}", key, node_name);
        Ok(binding)
    }
}

#[async_trait]
impl QuotaStore for InMemoryStore {
    async fn get_quota(&self, namespace: &str) -> Result<Option<ResourceQuota>> {
        self.check_available("get_quota")?;
        Ok(self.quotas.read().await.get(namespace).cloned())
    }

    async fn update_quota(&self, namespace: &str, quota: ResourceQuota) -> Result<ResourceQuota> {
        self.check_available("update_quota")?;
        let mut quotas = self.quotas.write().await;
        let slot = quotas
            .get_mut(namespace)
            .ok_or_else(|| SchedulerError::not_found("ResourceQuota", namespace))?;
        *slot = quota.clone();
        self.quota_writes.fetch_add(1, Ordering::SeqCst);
        debug!("Memory: quota updated in namespace {}", namespace);
        Ok(quota)
    }

    async fn create_quota(&self, namespace: &str, quota: ResourceQuota) -> Result<ResourceQuota> {
        self.check_available("create_quota")?;
        let mut quotas = self.quotas.write().await;
        if quotas.contains_key(namespace) {
            return Err(SchedulerError::internal_error(format!(
                "quota already exists in namespace {}",
                namespace
            )));
        }
        quotas.insert(namespace.to_string(), quota.clone());
        self.quota_writes.fetch_add(1, Ordering::SeqCst);
        debug!("Memory: quota created in namespace {}", namespace);
        Ok(quota)
    }
}
