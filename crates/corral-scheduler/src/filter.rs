use crate::affinity;
use crate::requirements::{host_bandwidth, host_latency, host_reliability, host_zone};
use crate::types::{FilterResult, NodeInfo, SchedulingContext};
use corral_core::k8s_openapi::api::core::v1::{Taint, Toleration};
use corral_core::{NodeExt, PodExt};
use tracing::debug;

/// Filter predicate trait
pub trait FilterPredicate: Send + Sync {
    /// Filter a node for the given pod
    fn filter(&self, context: &SchedulingContext, node: &NodeInfo) -> FilterResult;

    /// Name of the filter
    fn name(&self) -> &str;

    /// Whether evicting pods from the node can change the outcome
    fn is_capacity(&self) -> bool {
        false
    }
}

/// Rejects nodes that are not ready or are cordoned
pub struct NodeReady;

impl FilterPredicate for NodeReady {
    fn filter(&self, _context: &SchedulingContext, node: &NodeInfo) -> FilterResult {
        if !node.node.is_ready() {
            return FilterResult::fail(node.name(), "Node is not ready");
        }
        if !node.node.is_schedulable() {
            return FilterResult::fail(node.name(), "Node is unschedulable");
        }
        FilterResult::pass(node.name())
    }

    fn name(&self) -> &str {
        "NodeReady"
    }
}

/// Filter for pod resource requirements against unreserved capacity
pub struct PodFitsResources;

impl FilterPredicate for PodFitsResources {
    fn filter(&self, context: &SchedulingContext, node: &NodeInfo) -> FilterResult {
        let free = node.free();

        debug!(
            "Node {} has free {}, pod {} requests {}",
            node.name(),
            free,
            context.key,
            context.requests
        );

        if let Some(dimension) = context.requests.exceeds(&free) {
            return FilterResult::fail(
                node.name(),
                format!(
                    "Insufficient {}: requested {}, available {}",
                    dimension,
                    context.requests.get(dimension),
                    free.get(dimension)
                ),
            );
        }

        if let Some(capacity) = node.node.pod_capacity() {
            if node.pods.len() as i64 >= capacity {
                return FilterResult::fail(
                    node.name(),
                    format!("Too many pods: node allows {}", capacity),
                );
            }
        }

        FilterResult::pass(node.name())
    }

    fn name(&self) -> &str {
        "PodFitsResources"
    }

    fn is_capacity(&self) -> bool {
        true
    }
}

/// Filter for node selector
pub struct NodeSelectorMatch;

impl FilterPredicate for NodeSelectorMatch {
    fn filter(&self, context: &SchedulingContext, node: &NodeInfo) -> FilterResult {
        let Some(node_selector) = context
            .pod
            .spec
            .as_ref()
            .and_then(|s| s.node_selector.as_ref())
        else {
            return FilterResult::pass(node.name());
        };

        for (key, value) in node_selector {
            if node.node.label(key) != Some(value.as_str()) {
                return FilterResult::fail(
                    node.name(),
                    format!("Node selector mismatch: {}={}", key, value),
                );
            }
        }

        FilterResult::pass(node.name())
    }

    fn name(&self) -> &str {
        "NodeSelectorMatch"
    }
}

/// Filter for required node affinity
pub struct NodeAffinityRequired;

impl FilterPredicate for NodeAffinityRequired {
    fn filter(&self, context: &SchedulingContext, node: &NodeInfo) -> FilterResult {
        if affinity::required_matches(&context.pod, &node.node) {
            FilterResult::pass(node.name())
        } else {
            FilterResult::fail(node.name(), "Required node affinity not satisfied")
        }
    }

    fn name(&self) -> &str {
        "NodeAffinityRequired"
    }
}

/// Filter for taints and tolerations
pub struct TaintToleration;

fn tolerates(toleration: &Toleration, taint: &Taint) -> bool {
    let operator = toleration.operator.as_deref().unwrap_or("Equal");
    let key = toleration.key.as_deref().unwrap_or("");

    // Empty key with Exists tolerates everything
    let key_matches = if key.is_empty() {
        operator == "Exists"
    } else {
        key == taint.key
    };
    if !key_matches {
        return false;
    }

    let value_matches = match operator {
        "Exists" => true,
        "Equal" => toleration.value.as_deref().unwrap_or("") == taint.value.as_deref().unwrap_or(""),
        _ => false,
    };

    let effect_matches = match toleration.effect.as_deref() {
        None | Some("") => true,
        Some(effect) => effect == taint.effect,
    };

    value_matches && effect_matches
}

impl FilterPredicate for TaintToleration {
    fn filter(&self, context: &SchedulingContext, node: &NodeInfo) -> FilterResult {
        let tolerations = context.pod.tolerations();

        for taint in node.node.taints() {
            if !tolerations.iter().any(|t| tolerates(t, taint)) {
                return FilterResult::fail(
                    node.name(),
                    format!("Pod does not tolerate taint: {}={}", taint.key, taint.effect),
                );
            }
        }

        FilterResult::pass(node.name())
    }

    fn name(&self) -> &str {
        "TaintToleration"
    }
}

/// Filter for the edge zone a pod pins itself to
pub struct EdgeZoneMatch;

impl FilterPredicate for EdgeZoneMatch {
    fn filter(&self, context: &SchedulingContext, node: &NodeInfo) -> FilterResult {
        let Some(wanted) = context.edge.zone.as_deref() else {
            return FilterResult::pass(node.name());
        };

        match host_zone(&node.node) {
            Some(zone) if zone == wanted => FilterResult::pass(node.name()),
            Some(zone) => FilterResult::fail(
                node.name(),
                format!("Edge zone mismatch: wanted {}, node is in {}", wanted, zone),
            ),
            None => FilterResult::fail(
                node.name(),
                format!("Edge zone mismatch: wanted {}, node has no zone", wanted),
            ),
        }
    }

    fn name(&self) -> &str {
        "EdgeZoneMatch"
    }
}

/// Filter for advertised latency, bandwidth and reliability. A missing or
/// unparseable label never rejects.
pub struct EdgeQualityOfService;

impl FilterPredicate for EdgeQualityOfService {
    fn filter(&self, context: &SchedulingContext, node: &NodeInfo) -> FilterResult {
        let edge = &context.edge;

        if let (Some(max), Some(latency)) = (edge.max_latency, host_latency(&node.node)) {
            if latency > max {
                return FilterResult::fail(
                    node.name(),
                    format!("Latency too high: {:?} > {:?}", latency, max),
                );
            }
        }

        if let (Some(min), Some(bandwidth)) = (edge.min_bandwidth, host_bandwidth(&node.node)) {
            if bandwidth < min {
                return FilterResult::fail(
                    node.name(),
                    format!("Bandwidth too low: {} < {} Mbps", bandwidth, min),
                );
            }
        }

        if let (Some(min), Some(reliability)) =
            (edge.min_reliability, host_reliability(&node.node))
        {
            if reliability < min {
                return FilterResult::fail(
                    node.name(),
                    format!("Reliability too low: {} < {}", reliability, min),
                );
            }
        }

        FilterResult::pass(node.name())
    }

    fn name(&self) -> &str {
        "EdgeQualityOfService"
    }
}

/// Get default filter predicates
pub fn default_filters() -> Vec<Box<dyn FilterPredicate>> {
    vec![
        Box::new(NodeReady),
        Box::new(TaintToleration),
        Box::new(PodFitsResources),
        Box::new(NodeSelectorMatch),
        Box::new(NodeAffinityRequired),
        Box::new(EdgeZoneMatch),
        Box::new(EdgeQualityOfService),
    ]
}

/// Run the first failing predicate, if any
pub fn first_failure(
    filters: &[Box<dyn FilterPredicate>],
    context: &SchedulingContext,
    node: &NodeInfo,
) -> Option<(String, FilterResult)> {
    filters.iter().find_map(|filter| {
        let result = filter.filter(context, node);
        (!result.passed).then(|| (filter.name().to_string(), result))
    })
}

/// Nodes passing every predicate, in input order
pub fn filter_hosts<'a>(
    filters: &[Box<dyn FilterPredicate>],
    context: &SchedulingContext,
    nodes: &'a [NodeInfo],
) -> Vec<&'a NodeInfo> {
    nodes
        .iter()
        .filter(|node| match first_failure(filters, context, node) {
            Some((filter, result)) => {
                debug!(
                    "Node {} filtered out by {}: {}",
                    node.name(),
                    filter,
                    result.reason.unwrap_or_default()
                );
                false
            }
            None => true,
        })
        .collect()
}
