//! Victim selection for pods that fit nowhere.
//!
//! For every host that only fails on capacity, the engine picks the smallest
//! irreducible set of lower-priority occupants whose eviction lets the pending
//! pod fit, then ranks the hosts by post-eviction desirability.

use crate::affinity;
use crate::filter::{default_filters, FilterPredicate};
use crate::store::UnitStore;
use crate::types::{occupant_requests, NodeInfo, PreemptionCandidate, SchedulingContext, Victim};
use crate::{Result, SchedulerError};
use corral_core::{utilization, NodeExt, Pod, PodExt, ResourceQuantities};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Static pods created from manifest files
pub const CONFIG_SOURCE_ANNOTATION: &str = "kubernetes.io/config.source";
/// Per-pod opt out from being preempted
pub const PREEMPTION_POLICY_ANNOTATION: &str = "scheduler.alpha.kubernetes.io/preemption-policy";

/// Relative weights of the preemption sub-scores
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreemptionWeights {
    pub victim_count: f64,
    pub victim_priority: f64,
    pub utilization: f64,
    pub affinity: f64,
}

impl Default for PreemptionWeights {
    fn default() -> Self {
        Self {
            victim_count: 40.0,
            victim_priority: 30.0,
            utilization: 20.0,
            affinity: 10.0,
        }
    }
}

/// Preemption configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreemptionConfig {
    /// Grace period given to evicted pods
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
    /// Pause after evicting, before the caller retries
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,
    /// Namespaces whose pods are never evicted
    pub protected_namespaces: Vec<String>,
    /// Priority classes whose pods are never evicted
    pub protected_priority_classes: Vec<String>,
    pub weights: PreemptionWeights,
}

impl Default for PreemptionConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(30),
            settle_delay: Duration::from_secs(5),
            protected_namespaces: vec!["kube-system".to_string()],
            protected_priority_classes: vec![
                "system-cluster-critical".to_string(),
                "system-node-critical".to_string(),
            ],
            weights: PreemptionWeights::default(),
        }
    }
}

/// Preemption engine
pub struct PreemptionEngine {
    config: PreemptionConfig,
    filters: Vec<Box<dyn FilterPredicate>>,
}

impl PreemptionEngine {
    pub fn new(config: PreemptionConfig) -> Self {
        Self {
            config,
            filters: default_filters(),
        }
    }

    pub fn config(&self) -> &PreemptionConfig {
        &self.config
    }

    /// Pods that are never chosen as victims regardless of priority
    pub fn is_protected(&self, pod: &Pod) -> bool {
        let namespace = PodExt::namespace(pod);
        if self.config.protected_namespaces.iter().any(|n| n == namespace) {
            return true;
        }

        let priority_class = pod
            .spec
            .as_ref()
            .and_then(|s| s.priority_class_name.as_deref());
        if let Some(class) = priority_class {
            if self.config.protected_priority_classes.iter().any(|c| c == class) {
                return true;
            }
        }

        let daemon = pod
            .metadata
            .owner_references
            .iter()
            .flatten()
            .any(|owner| owner.kind == "DaemonSet");
        if daemon {
            return true;
        }

        pod.annotation(CONFIG_SOURCE_ANNOTATION) == Some("file")
            || pod.annotation(PREEMPTION_POLICY_ANNOTATION) == Some("Never")
            || pod.is_terminating()
    }

    /// Best host and victim set for the pod.
    ///
    /// Fails with `NoPreemptionPossible` when no host can fit the pod after
    /// evicting any subset of eligible occupants.
    pub fn find_preemption(
        &self,
        context: &SchedulingContext,
        nodes: &[NodeInfo],
    ) -> Result<PreemptionCandidate> {
        let mut candidates: Vec<PreemptionCandidate> = nodes
            .iter()
            .filter_map(|node| self.candidate_for(context, node))
            .collect();

        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.node_name.cmp(&b.node_name))
        });

        let Some(best) = candidates.into_iter().next() else {
            return Err(SchedulerError::no_preemption_possible(
                context.pod_name(),
                format!(
                    "none of {} nodes can fit the pod after evicting lower-priority pods",
                    nodes.len()
                ),
            ));
        };

        debug_assert!(
            best.victims.iter().all(|v| v.priority < context.priority),
            "victim priority must be below the preemptor's"
        );

        info!(
            "Preemption for pod {} chose node {} with {} victim(s), score {:.2}",
            context.key,
            best.node_name,
            best.victims.len(),
            best.score
        );

        Ok(best)
    }

    fn candidate_for(
        &self,
        context: &SchedulingContext,
        node: &NodeInfo,
    ) -> Option<PreemptionCandidate> {
        // Evictions cannot fix anything but capacity
        for filter in self.filters.iter().filter(|f| !f.is_capacity()) {
            let result = filter.filter(context, node);
            if !result.passed {
                debug!(
                    "Node {} not preemptable for pod {}: {}",
                    node.name(),
                    context.key,
                    result.reason.unwrap_or_default()
                );
                return None;
            }
        }

        if !context.requests.fits_within(&node.allocatable) {
            debug!("Node {} is too small for pod {} even when empty", node.name(), context.key);
            return None;
        }

        let mut eligible: Vec<Victim> = node
            .pods
            .iter()
            .filter(|pod| !self.is_protected(pod) && pod.priority() < context.priority)
            .filter_map(|pod| {
                Some(Victim {
                    key: pod.workload_key().ok()?,
                    priority: pod.priority(),
                    requests: occupant_requests(pod),
                })
            })
            .collect();

        // Preferred victims first: low priority, then large requests
        eligible.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| request_size(&b.requests).cmp(&request_size(&a.requests)))
                .then_with(|| a.key.cmp(&b.key))
        });

        let deficit = context.requests.deficit(&node.free());
        let slots_needed = node
            .node
            .pod_capacity()
            .map(|cap| (node.pods.len() as i64 + 1 - cap).max(0) as usize)
            .unwrap_or(0);
        let covers = |victims: &[Victim]| {
            let freed: ResourceQuantities = victims.iter().map(|v| v.requests).sum();
            deficit.fits_within(&freed) && victims.len() >= slots_needed
        };

        let mut victims = Vec::new();
        for victim in eligible {
            if covers(&victims) {
                break;
            }
            victims.push(victim);
        }
        if !covers(&victims) {
            debug!(
                "Node {} cannot free enough for pod {} by preemption",
                node.name(),
                context.key
            );
            return None;
        }

        // Drop the most valuable victims that turned out unnecessary
        let mut index = victims.len();
        while index > 0 {
            index -= 1;
            let removed = victims.remove(index);
            if !covers(&victims) {
                victims.insert(index, removed);
            }
        }

        Some(self.score(context, node, victims))
    }

    fn score(
        &self,
        context: &SchedulingContext,
        node: &NodeInfo,
        victims: Vec<Victim>,
    ) -> PreemptionCandidate {
        let weights = &self.config.weights;
        let mut breakdown = BTreeMap::new();

        let count = if victims.is_empty() {
            100.0
        } else {
            100.0 / victims.len() as f64
        };
        breakdown.insert("victim_count".to_string(), count);

        let victim_priority: f64 = victims.iter().map(|v| f64::from(v.priority.max(0))).sum();
        let pending_priority = f64::from(context.priority.max(1));
        let priority = 100.0 / (1.0 + victim_priority / pending_priority);
        breakdown.insert("victim_priority".to_string(), priority);

        let freed: ResourceQuantities = victims.iter().map(|v| v.requests).sum();
        let after = node.requested.saturating_sub(&freed) + context.requests;
        let avg_util = (utilization(after.cpu_millicores, node.allocatable.cpu_millicores)
            .clamp(0.0, 1.0)
            + utilization(after.memory_bytes, node.allocatable.memory_bytes).clamp(0.0, 1.0))
            / 2.0;
        let util_score = 100.0 * (1.0 - avg_util);
        breakdown.insert("utilization".to_string(), util_score);

        let affinity_score = match affinity::preferred_match_fraction(&context.pod, &node.node) {
            Some(fraction) if fraction > 0.0 => 100.0,
            _ => 0.0,
        };
        breakdown.insert("affinity".to_string(), affinity_score);

        let total_weight =
            weights.victim_count + weights.victim_priority + weights.utilization + weights.affinity;
        let score = if total_weight > 0.0 {
            (count * weights.victim_count
                + priority * weights.victim_priority
                + util_score * weights.utilization
                + affinity_score * weights.affinity)
                / total_weight
        } else {
            0.0
        };

        debug!(
            "Node {} preemption score {:.2} with {} victim(s)",
            node.name(),
            score,
            victims.len()
        );

        PreemptionCandidate {
            node_name: node.name().to_string(),
            victims,
            score,
            breakdown,
        }
    }

    /// Delete the victims with the configured grace period, then wait the
    /// settle delay unless cancelled. Never binds the preemptor.
    pub async fn evict(
        &self,
        units: &dyn UnitStore,
        candidate: &PreemptionCandidate,
        token: &CancellationToken,
    ) -> Result<()> {
        self.delete_victims(units, candidate).await?;
        self.settle(token).await;
        Ok(())
    }

    /// Request deletion of every victim with the configured grace period
    pub async fn delete_victims(
        &self,
        units: &dyn UnitStore,
        candidate: &PreemptionCandidate,
    ) -> Result<()> {
        for victim in &candidate.victims {
            match units.delete_unit(&victim.key, self.config.grace_period).await {
                Ok(()) => info!(
                    "Evicted pod {} (priority {}) from node {}",
                    victim.key, victim.priority, candidate.node_name
                ),
                Err(SchedulerError::NotFound { .. }) => {
                    warn!("Victim {} already gone", victim.key);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Wait the settle delay unless cancelled
    pub async fn settle(&self, token: &CancellationToken) {
        if self.config.settle_delay.is_zero() {
            return;
        }
        tokio::select! {
            _ = token.cancelled() => {
                debug!("Settle delay interrupted by shutdown");
            }
            _ = tokio::time::sleep(self.config.settle_delay) => {}
        }
    }
}

impl Default for PreemptionEngine {
    fn default() -> Self {
        Self::new(PreemptionConfig::default())
    }
}

fn request_size(requests: &ResourceQuantities) -> (i64, i64) {
    (requests.cpu_millicores, requests.memory_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use crate::store::UnitFilter;
    use crate::testing::{node, occupant, pod, with_annotation, with_priority, with_taint};
    use corral_core::k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn context(pod: Pod) -> SchedulingContext {
        SchedulingContext::new(pod).unwrap()
    }

    fn pending(priority: i32, cpu: &str) -> SchedulingContext {
        context(with_priority(pod("urgent", "default", cpu, "128Mi"), priority))
    }

    #[test]
    fn test_both_occupants_are_needed() {
        // 600m host fully taken by two 300m pods; 500m needs both gone
        let snapshot = NodeInfo::snapshot(
            vec![node("b", "600m", "4Gi")],
            vec![
                occupant("low", "b", 1, "300m", "256Mi"),
                occupant("mid", "b", 2, "300m", "256Mi"),
            ],
        );

        let engine = PreemptionEngine::default();
        let candidate = engine.find_preemption(&pending(5, "500m"), &snapshot).unwrap();

        assert_eq!(candidate.node_name, "b");
        let names: Vec<_> = candidate.victims.iter().map(|v| v.key.name.as_str()).collect();
        assert_eq!(names, vec!["low", "mid"]);
    }

    #[test]
    fn test_minimal_set_prefers_lower_priority() {
        let snapshot = NodeInfo::snapshot(
            vec![node("b", "1", "4Gi")],
            vec![
                occupant("p1", "b", 1, "400m", "256Mi"),
                occupant("p2", "b", 2, "300m", "256Mi"),
                occupant("p3", "b", 3, "300m", "256Mi"),
            ],
        );

        let engine = PreemptionEngine::default();
        let candidate = engine.find_preemption(&pending(5, "300m"), &snapshot).unwrap();

        let names: Vec<_> = candidate.victims.iter().map(|v| v.key.name.as_str()).collect();
        assert_eq!(names, vec!["p1"]);
    }

    #[test]
    fn test_reduction_drops_unneeded_victims() {
        // Greedy takes the small p1 first, then p2 covers alone
        let snapshot = NodeInfo::snapshot(
            vec![node("b", "1", "4Gi")],
            vec![
                occupant("p1", "b", 1, "100m", "64Mi"),
                occupant("p2", "b", 2, "900m", "64Mi"),
            ],
        );

        let engine = PreemptionEngine::default();
        let candidate = engine.find_preemption(&pending(5, "800m"), &snapshot).unwrap();

        let names: Vec<_> = candidate.victims.iter().map(|v| v.key.name.as_str()).collect();
        assert_eq!(names, vec!["p2"]);
    }

    #[test]
    fn test_never_evicts_equal_or_higher_priority() {
        let snapshot = NodeInfo::snapshot(
            vec![node("b", "600m", "4Gi")],
            vec![
                occupant("same", "b", 5, "300m", "256Mi"),
                occupant("higher", "b", 9, "300m", "256Mi"),
            ],
        );

        let engine = PreemptionEngine::default();
        let err = engine.find_preemption(&pending(5, "500m"), &snapshot).unwrap_err();
        assert!(matches!(err, SchedulerError::NoPreemptionPossible { .. }));
    }

    #[test]
    fn test_protected_pods() {
        let engine = PreemptionEngine::default();

        let system = pod("dns", "kube-system", "100m", "64Mi");
        assert!(engine.is_protected(&system));

        let mut daemon = pod("agent", "default", "100m", "64Mi");
        daemon.metadata.owner_references = Some(vec![OwnerReference {
            kind: "DaemonSet".to_string(),
            name: "agent".to_string(),
            ..Default::default()
        }]);
        assert!(engine.is_protected(&daemon));

        let static_pod = with_annotation(
            pod("etcd", "default", "100m", "64Mi"),
            CONFIG_SOURCE_ANNOTATION,
            "file",
        );
        assert!(engine.is_protected(&static_pod));

        let opted_out = with_annotation(
            pod("db", "default", "100m", "64Mi"),
            PREEMPTION_POLICY_ANNOTATION,
            "Never",
        );
        assert!(engine.is_protected(&opted_out));

        let mut critical = pod("proxy", "default", "100m", "64Mi");
        critical.spec.as_mut().unwrap().priority_class_name =
            Some("system-node-critical".to_string());
        assert!(engine.is_protected(&critical));

        assert!(!engine.is_protected(&pod("web", "default", "100m", "64Mi")));
    }

    #[test]
    fn test_skips_nodes_failing_non_capacity_predicates() {
        let tainted = with_taint(node("tainted", "600m", "4Gi"), "dedicated", None, "NoSchedule");
        let snapshot = NodeInfo::snapshot(
            vec![tainted, node("open", "600m", "4Gi")],
            vec![
                occupant("a", "tainted", 0, "600m", "256Mi"),
                occupant("b", "open", 1, "300m", "256Mi"),
                occupant("c", "open", 1, "300m", "256Mi"),
            ],
        );

        let engine = PreemptionEngine::default();
        let candidate = engine.find_preemption(&pending(5, "500m"), &snapshot).unwrap();
        assert_eq!(candidate.node_name, "open");
    }

    #[test]
    fn test_fewer_victims_rank_higher() {
        let snapshot = NodeInfo::snapshot(
            vec![node("one", "600m", "4Gi"), node("two", "600m", "4Gi")],
            vec![
                occupant("big", "one", 1, "600m", "256Mi"),
                occupant("x", "two", 1, "300m", "256Mi"),
                occupant("y", "two", 1, "300m", "256Mi"),
            ],
        );

        let engine = PreemptionEngine::default();
        let candidate = engine.find_preemption(&pending(5, "500m"), &snapshot).unwrap();
        assert_eq!(candidate.node_name, "one");
        assert_eq!(candidate.breakdown["victim_count"], 100.0);
    }

    #[test]
    fn test_pod_larger_than_any_node() {
        let snapshot = NodeInfo::snapshot(
            vec![node("b", "1", "4Gi")],
            vec![occupant("p", "b", 0, "500m", "256Mi")],
        );

        let engine = PreemptionEngine::default();
        assert!(engine.find_preemption(&pending(5, "2"), &snapshot).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_deletes_with_grace_period() {
        let store = InMemoryStore::new();
        store.add_node(node("b", "600m", "4Gi")).await;
        store.add_pod(occupant("low", "b", 1, "300m", "256Mi")).await;
        store.add_pod(occupant("mid", "b", 2, "300m", "256Mi")).await;

        let snapshot = NodeInfo::snapshot(
            vec![node("b", "600m", "4Gi")],
            store.list_units(&UnitFilter::all()).await.unwrap(),
        );
        let engine = PreemptionEngine::default();
        let candidate = engine.find_preemption(&pending(5, "500m"), &snapshot).unwrap();

        let token = CancellationToken::new();
        engine.evict(&store, &candidate, &token).await.unwrap();

        let remaining = store.list_units(&UnitFilter::all()).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|p| p.is_terminating()));
    }

    #[tokio::test]
    async fn test_settle_delay_is_cancellable() {
        let store = InMemoryStore::new();
        let engine = PreemptionEngine::new(PreemptionConfig {
            settle_delay: Duration::from_secs(3600),
            ..Default::default()
        });
        let candidate = PreemptionCandidate {
            node_name: "b".to_string(),
            victims: Vec::new(),
            score: 0.0,
            breakdown: BTreeMap::new(),
        };

        let token = CancellationToken::new();
        token.cancel();
        // Returns immediately instead of sleeping an hour
        engine.evict(&store, &candidate, &token).await.unwrap();
    }
}
