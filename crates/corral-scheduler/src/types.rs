use crate::affinity;
use crate::classifier::{self, WorkloadClass};
use crate::requirements::EdgeRequirements;
use crate::{Result, SchedulerError};
use chrono::{DateTime, Utc};
use corral_core::{Node, NodeExt, Pod, PodExt, ResourceQuantities, WorkloadKey};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::warn;

/// Everything the filter and score stages need to know about a pending pod
#[derive(Debug, Clone)]
pub struct SchedulingContext {
    /// Pod to be scheduled
    pub pod: Pod,
    /// Namespace/name of the pod
    pub key: WorkloadKey,
    /// Scheduling priority
    pub priority: i32,
    /// Aggregated container requests
    pub requests: ResourceQuantities,
    /// Edge constraints from annotations
    pub edge: EdgeRequirements,
    /// Class derived from the pod's traits, if any
    pub class: Option<WorkloadClass>,
}

impl SchedulingContext {
    /// Validate the pod and build its scheduling context
    pub fn new(mut pod: Pod) -> Result<Self> {
        let pod_name = pod.name().to_string();

        let key = pod
            .workload_key()
            .map_err(|e| SchedulerError::invalid_unit_spec(&pod_name, e.to_string()))?;

        let requests = pod
            .resource_requests()
            .map_err(|e| SchedulerError::invalid_unit_spec(key.to_string(), e.to_string()))?;

        affinity::validate(&pod)
            .map_err(|reason| SchedulerError::invalid_unit_spec(key.to_string(), reason))?;

        let edge = EdgeRequirements::from_pod(&pod);
        let class = classifier::classify(&pod, &edge);
        if let Some(class) = class {
            classifier::apply(&mut pod, class);
        }

        Ok(Self {
            priority: pod.priority(),
            pod,
            key,
            requests,
            edge,
            class,
        })
    }

    /// Human-readable pod identity
    pub fn pod_name(&self) -> String {
        self.key.to_string()
    }
}

/// A host together with the pods bound to it
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub node: Node,
    /// Allocatable capacity
    pub allocatable: ResourceQuantities,
    /// Sum of requests of pods bound to the node
    pub requested: ResourceQuantities,
    /// Pods bound to the node, terminating ones included
    pub pods: Vec<Pod>,
}

impl NodeInfo {
    pub fn new(node: Node) -> Self {
        Self {
            allocatable: node.allocatable(),
            node,
            requested: ResourceQuantities::default(),
            pods: Vec::new(),
        }
    }

    /// Account a bound pod against this node
    pub fn add_pod(&mut self, pod: Pod) {
        self.requested += occupant_requests(&pod);
        self.pods.push(pod);
    }

    pub fn name(&self) -> &str {
        self.node.name()
    }

    /// Allocatable capacity not yet reserved by bound pods
    pub fn free(&self) -> ResourceQuantities {
        self.allocatable.saturating_sub(&self.requested)
    }

    /// Join nodes with the pods bound to them. Finished pods release their
    /// resources; terminating pods still hold theirs. Sorted by node name.
    pub fn snapshot(nodes: Vec<Node>, pods: Vec<Pod>) -> Vec<NodeInfo> {
        let mut infos: BTreeMap<String, NodeInfo> = nodes
            .into_iter()
            .map(|node| (node.name().to_string(), NodeInfo::new(node)))
            .collect();

        for pod in pods {
            if pod.is_terminal() {
                continue;
            }
            let Some(node_name) = pod.assigned_node() else {
                continue;
            };
            if let Some(info) = infos.get_mut(node_name) {
                info.add_pod(pod);
            }
        }

        infos.into_values().collect()
    }
}

/// Requests of an already-bound pod. A malformed spec counts as zero rather
/// than making the whole node unusable.
pub fn occupant_requests(pod: &Pod) -> ResourceQuantities {
    pod.resource_requests().unwrap_or_else(|e| {
        warn!("Ignoring requests of pod {}: {}", pod.name(), e);
        ResourceQuantities::default()
    })
}

/// Result of filtering a node
#[derive(Debug, Clone)]
pub struct FilterResult {
    /// Node name
    pub node_name: String,
    /// Whether the node passed the filter
    pub passed: bool,
    /// Reason for failure (if any)
    pub reason: Option<String>,
}

impl FilterResult {
    /// Create a passing filter result
    pub fn pass(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            passed: true,
            reason: None,
        }
    }

    /// Create a failing filter result
    pub fn fail(node_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            passed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Composite score of one candidate host
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateScore {
    pub node_name: String,
    /// Weighted composite (0-100, higher is better)
    pub score: f64,
    /// Sub-score per scoring function
    pub breakdown: BTreeMap<String, f64>,
}

/// Immutable record of a scheduling decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Binding {
    pub unit: WorkloadKey,
    pub node_name: String,
    pub bound_at: DateTime<Utc>,
}

impl Binding {
    pub fn new(unit: WorkloadKey, node_name: impl Into<String>) -> Self {
        Self {
            unit,
            node_name: node_name.into(),
            bound_at: Utc::now(),
        }
    }
}

/// A pod selected for eviction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Victim {
    pub key: WorkloadKey,
    pub priority: i32,
    pub requests: ResourceQuantities,
}

/// One possible preemption outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreemptionCandidate {
    pub node_name: String,
    pub victims: Vec<Victim>,
    /// Weighted composite (0-100, higher is better)
    pub score: f64,
    pub breakdown: BTreeMap<String, f64>,
}

impl PreemptionCandidate {
    pub fn victim_keys(&self) -> Vec<WorkloadKey> {
        self.victims.iter().map(|v| v.key.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{bound_to, node, occupant, pod};

    #[test]
    fn test_filter_result() {
        let pass = FilterResult::pass("node1");
        assert!(pass.passed);
        assert!(pass.reason.is_none());

        let fail = FilterResult::fail("node2", "Insufficient CPU");
        assert!(!fail.passed);
        assert_eq!(fail.reason, Some("Insufficient CPU".to_string()));
    }

    #[test]
    fn test_snapshot_accounts_bound_pods() {
        let nodes = vec![node("b", "4", "8Gi"), node("a", "2", "4Gi")];
        let pods = vec![
            occupant("p1", "a", 0, "500m", "1Gi"),
            occupant("p2", "a", 0, "250m", "1Gi"),
            pod("pending", "default", "1", "1Gi"),
            occupant("elsewhere", "missing-node", 0, "1", "1Gi"),
        ];

        let snapshot = NodeInfo::snapshot(nodes, pods);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].name(), "a");
        assert_eq!(snapshot[0].requested.cpu_millicores, 750);
        assert_eq!(snapshot[0].free().cpu_millicores, 1250);
        assert_eq!(snapshot[0].pods.len(), 2);
        assert!(snapshot[1].pods.is_empty());
    }

    #[test]
    fn test_finished_pods_release_resources() {
        let mut finished = bound_to(pod("done", "default", "1", "1Gi"), "a");
        finished.status = Some(corral_core::k8s_openapi::api::core::v1::PodStatus {
            phase: Some("Succeeded".to_string()),
            ..Default::default()
        });

        let snapshot = NodeInfo::snapshot(vec![node("a", "2", "4Gi")], vec![finished]);
        assert!(snapshot[0].requested.is_zero());
    }

    #[test]
    fn test_context_rejects_overflowing_requests() {
        use corral_core::k8s_openapi::api::core::v1::Container;

        let mut hog = pod("hog", "default", "1", "8Ei");
        let second = Container {
            name: "second".to_string(),
            ..hog.spec.as_ref().unwrap().containers[0].clone()
        };
        hog.spec.as_mut().unwrap().containers.push(second);

        let err = SchedulingContext::new(hog).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidUnitSpec { .. }));
        assert!(err.to_string().contains("overflow"));
    }

    #[test]
    fn test_context_rejects_malformed_requests() {
        let bad = pod("bad", "default", "fast", "1Gi");
        let err = SchedulingContext::new(bad).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidUnitSpec { .. }));
    }

    #[test]
    fn test_context_applies_workload_class() {
        use crate::classifier::{WorkloadClass, BATCH_NODE_TAINT, WORKLOAD_CLASS_LABEL};
        use crate::filter::{FilterPredicate, TaintToleration};
        use crate::testing::with_taint;
        use corral_core::k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

        let mut job = pod("report", "default", "1", "1Gi");
        job.metadata.owner_references = Some(vec![OwnerReference {
            kind: "CronJob".to_string(),
            name: "nightly".to_string(),
            ..Default::default()
        }]);

        let context = SchedulingContext::new(job).unwrap();
        assert_eq!(context.class, Some(WorkloadClass::BatchProcessing));
        assert_eq!(
            context.pod.metadata.labels.as_ref().unwrap()[WORKLOAD_CLASS_LABEL],
            "batch-processing"
        );

        let batch_node = NodeInfo::new(with_taint(
            node("batch-1", "4", "8Gi"),
            BATCH_NODE_TAINT,
            Some("true"),
            "NoSchedule",
        ));
        assert!(TaintToleration.filter(&context, &batch_node).passed);

        let plain = SchedulingContext::new(pod("web", "default", "1", "1Gi")).unwrap();
        assert!(plain.class.is_none());
        assert!(!TaintToleration.filter(&plain, &batch_node).passed);
    }

    #[test]
    fn test_context_requires_name() {
        let mut nameless = pod("x", "default", "1", "1Gi");
        nameless.metadata.name = None;
        assert!(matches!(
            SchedulingContext::new(nameless),
            Err(SchedulerError::InvalidUnitSpec { .. })
        ));
    }
}
