//! Marks overloaded, fragmented and idle hosts.
//!
//! Utilization is the ratio of requested to allocatable resources. Each host
//! gets at most one action per pass; the first matching rule wins.

use crate::store::{HostStore, UnitFilter, UnitStore};
use crate::types::NodeInfo;
use crate::Result;
use corral_core::k8s_openapi::api::core::v1::NodeSpec;
use corral_core::{utilization, Node, NodeExt, Taint};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const HIGH_CPU_TAINT: &str = "corral.io/high-cpu-usage";
pub const HIGH_MEMORY_TAINT: &str = "corral.io/high-memory-usage";
pub const FRAGMENTATION_LABEL: &str = "node.kubernetes.io/fragmentation";
pub const UTILIZATION_LABEL: &str = "node.kubernetes.io/utilization";

/// Host optimizer thresholds, as fractions of allocatable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// CPU above which hosts are tainted
    pub high_cpu: f64,
    /// Memory above which hosts are tainted
    pub high_memory: f64,
    /// Pod slot usage above which a host counts as fragmented...
    pub fragmented_pods: f64,
    /// ...provided its CPU is below this
    pub fragmented_cpu: f64,
    pub low_cpu: f64,
    pub low_memory: f64,
    /// Hosts with this many pods or more are never marked idle
    pub low_pod_count: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            high_cpu: 0.80,
            high_memory: 0.85,
            fragmented_pods: 0.80,
            fragmented_cpu: 0.60,
            low_cpu: 0.20,
            low_memory: 0.30,
            low_pod_count: 5,
        }
    }
}

/// Marking applied to a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HostAction {
    TaintHighCpu,
    TaintHighMemory,
    MarkFragmented,
    MarkUnderutilized,
}

impl HostAction {
    /// Apply to the node. Returns false if the marking was already present
    pub fn apply(&self, node: &mut Node) -> bool {
        match self {
            HostAction::TaintHighCpu => add_taint(node, HIGH_CPU_TAINT),
            HostAction::TaintHighMemory => add_taint(node, HIGH_MEMORY_TAINT),
            HostAction::MarkFragmented => add_label(node, FRAGMENTATION_LABEL, "high"),
            HostAction::MarkUnderutilized => add_label(node, UTILIZATION_LABEL, "low"),
        }
    }
}

fn add_taint(node: &mut Node, key: &str) -> bool {
    if node.taints().iter().any(|t| t.key == key && t.effect == "NoSchedule") {
        return false;
    }
    node.spec
        .get_or_insert_with(NodeSpec::default)
        .taints
        .get_or_insert_with(Vec::new)
        .push(Taint {
            key: key.to_string(),
            value: Some("true".to_string()),
            effect: "NoSchedule".to_string(),
            ..Default::default()
        });
    true
}

fn add_label(node: &mut Node, key: &str, value: &str) -> bool {
    if node.label(key) == Some(value) {
        return false;
    }
    node.metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
    true
}

/// Load of one host
#[derive(Debug, Clone, PartialEq)]
pub struct HostLoad {
    pub cpu: f64,
    pub memory: f64,
    pub pods: usize,
    /// Share of pod slots in use, when the host declares a limit
    pub pod_slots: Option<f64>,
}

impl HostLoad {
    pub fn of(node: &NodeInfo) -> Self {
        let pods = node.pods.len();
        Self {
            cpu: utilization(node.requested.cpu_millicores, node.allocatable.cpu_millicores),
            memory: utilization(node.requested.memory_bytes, node.allocatable.memory_bytes),
            pods,
            pod_slots: node
                .node
                .pod_capacity()
                .filter(|c| *c > 0)
                .map(|c| pods as f64 / c as f64),
        }
    }
}

/// Periodic host marker
pub struct HostOptimizer {
    hosts: Arc<dyn HostStore>,
    units: Arc<dyn UnitStore>,
    config: OptimizerConfig,
}

impl HostOptimizer {
    pub fn new(hosts: Arc<dyn HostStore>, units: Arc<dyn UnitStore>, config: OptimizerConfig) -> Self {
        Self { hosts, units, config }
    }

    /// Action for a host under the given load, if any
    pub fn evaluate(&self, load: &HostLoad) -> Option<HostAction> {
        let c = &self.config;

        if load.cpu > c.high_cpu {
            return Some(HostAction::TaintHighCpu);
        }
        if load.memory > c.high_memory {
            return Some(HostAction::TaintHighMemory);
        }
        if load.pod_slots.is_some_and(|s| s > c.fragmented_pods) && load.cpu < c.fragmented_cpu {
            return Some(HostAction::MarkFragmented);
        }
        if load.cpu < c.low_cpu && load.memory < c.low_memory && load.pods < c.low_pod_count {
            return Some(HostAction::MarkUnderutilized);
        }
        None
    }

    /// One pass over every host. Returns the markings actually written.
    pub async fn optimize(&self) -> Result<Vec<(String, HostAction)>> {
        let nodes = self.hosts.list_hosts().await?;
        let pods = self.units.list_units(&UnitFilter::all()).await?;

        let mut applied = Vec::new();
        for info in NodeInfo::snapshot(nodes, pods) {
            if info.allocatable.cpu_millicores <= 0 || info.allocatable.memory_bytes <= 0 {
                warn!("Skipping node {} without allocatable CPU or memory", info.name());
                continue;
            }

            let load = HostLoad::of(&info);
            let Some(action) = self.evaluate(&load) else {
                continue;
            };

            let name = info.name().to_string();
            let mut node = info.node;
            if !action.apply(&mut node) {
                debug!("Node {} already marked {:?}", name, action);
                continue;
            }

            self.hosts.update_host(node).await?;
            info!(
                "Marked node {} {:?} (cpu {:.0}%, memory {:.0}%, {} pods)",
                name,
                action,
                load.cpu * 100.0,
                load.memory * 100.0,
                load.pods
            );
            applied.push((name, action));
        }

        Ok(applied)
    }

    /// Optimize every interval until cancelled
    pub async fn run(&self, token: CancellationToken) {
        info!("Starting host optimizer (interval: {:?})", self.config.interval);

        let mut interval = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Host optimizer shutting down");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.optimize().await {
                        error!("Host optimization failed: {}", e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use crate::testing::{node, occupant, with_pod_capacity};

    async fn optimizer_with(nodes: Vec<Node>, pods: Vec<corral_core::Pod>) -> (Arc<InMemoryStore>, HostOptimizer) {
        let store = Arc::new(InMemoryStore::new());
        for node in nodes {
            store.add_node(node).await;
        }
        for pod in pods {
            store.add_pod(pod).await;
        }
        let optimizer = HostOptimizer::new(store.clone(), store.clone(), OptimizerConfig::default());
        (store, optimizer)
    }

    #[tokio::test]
    async fn test_taints_cpu_hot_host_once() {
        let (store, optimizer) = optimizer_with(
            vec![node("hot", "4", "16Gi")],
            vec![occupant("busy", "hot", 0, "3500m", "1Gi")],
        )
        .await;

        let applied = optimizer.optimize().await.unwrap();
        assert_eq!(applied, vec![("hot".to_string(), HostAction::TaintHighCpu)]);

        let hot = store.get_host("hot").await.unwrap();
        let taint = &hot.taints()[0];
        assert_eq!(taint.key, HIGH_CPU_TAINT);
        assert_eq!(taint.value.as_deref(), Some("true"));
        assert_eq!(taint.effect, "NoSchedule");

        assert!(optimizer.optimize().await.unwrap().is_empty());
        assert_eq!(store.get_host("hot").await.unwrap().taints().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_pressure() {
        let (store, optimizer) = optimizer_with(
            vec![node("full", "8", "4Gi")],
            vec![occupant("cache", "full", 0, "1", "3800Mi")],
        )
        .await;

        optimizer.optimize().await.unwrap();
        let full = store.get_host("full").await.unwrap();
        assert_eq!(full.taints()[0].key, HIGH_MEMORY_TAINT);
    }

    #[tokio::test]
    async fn test_fragmented_and_idle_labels() {
        let crowded = with_pod_capacity(node("crowded", "10", "64Gi"), 10);
        let mut pods: Vec<_> = (0..9)
            .map(|i| occupant(&format!("tiny-{}", i), "crowded", 0, "300m", "1Gi"))
            .collect();
        pods.push(occupant("lonely", "idle", 0, "100m", "128Mi"));

        let (store, optimizer) =
            optimizer_with(vec![crowded, node("idle", "4", "8Gi"), node("steady", "4", "8Gi")], pods)
                .await;
        store.add_pod(occupant("steady-a", "steady", 0, "2", "4Gi")).await;

        let applied: BTreeMap<String, HostAction> =
            optimizer.optimize().await.unwrap().into_iter().collect();
        assert_eq!(applied["crowded"], HostAction::MarkFragmented);
        assert_eq!(applied["idle"], HostAction::MarkUnderutilized);
        assert!(!applied.contains_key("steady"));

        let idle = store.get_host("idle").await.unwrap();
        assert_eq!(idle.label(UTILIZATION_LABEL), Some("low"));
        let crowded = store.get_host("crowded").await.unwrap();
        assert_eq!(crowded.label(FRAGMENTATION_LABEL), Some("high"));
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let optimizer = HostOptimizer::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryStore::new()),
            OptimizerConfig::default(),
        );
        let both_hot = HostLoad {
            cpu: 0.95,
            memory: 0.95,
            pods: 3,
            pod_slots: Some(0.9),
        };
        assert_eq!(optimizer.evaluate(&both_hot), Some(HostAction::TaintHighCpu));

        let moderate = HostLoad {
            cpu: 0.5,
            memory: 0.5,
            pods: 10,
            pod_slots: None,
        };
        assert_eq!(optimizer.evaluate(&moderate), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let (_store, optimizer) = optimizer_with(vec![node("n", "4", "8Gi")], vec![]).await;
        let token = CancellationToken::new();
        token.cancel();
        optimizer.run(token).await;
    }
}
