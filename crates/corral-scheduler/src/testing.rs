//! Builders shared by the unit tests of this crate

use corral_core::k8s_openapi::api::core::v1::{
    Container, NodeSpec, NodeStatus, PodSpec, ResourceRequirements, Taint,
};
use corral_core::{Node, ObjectMeta, Pod, Quantity};
use std::collections::BTreeMap;

fn quantities(cpu: &str, memory: &str) -> BTreeMap<String, Quantity> {
    let mut map = BTreeMap::new();
    map.insert("cpu".to_string(), Quantity(cpu.to_string()));
    map.insert("memory".to_string(), Quantity(memory.to_string()));
    map
}

pub fn node(name: &str, cpu: &str, memory: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        status: Some(NodeStatus {
            allocatable: Some(quantities(cpu, memory)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn with_label(mut node: Node, key: &str, value: &str) -> Node {
    node.metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
    node
}

pub fn with_taint(mut node: Node, key: &str, value: Option<&str>, effect: &str) -> Node {
    node.spec
        .get_or_insert_with(NodeSpec::default)
        .taints
        .get_or_insert_with(Vec::new)
        .push(Taint {
            key: key.to_string(),
            value: value.map(str::to_string),
            effect: effect.to_string(),
            ..Default::default()
        });
    node
}

pub fn with_pod_capacity(mut node: Node, pods: i64) -> Node {
    if let Some(allocatable) = node.status.as_mut().and_then(|s| s.allocatable.as_mut()) {
        allocatable.insert("pods".to_string(), Quantity(pods.to_string()));
    }
    node
}

pub fn edge_node(name: &str, zone: &str, latency: &str, bandwidth: &str, reliability: &str) -> Node {
    let node = node(name, "4", "8Gi");
    let node = with_label(node, crate::requirements::EDGE_ZONE_LABEL, zone);
    let node = with_label(node, crate::requirements::EDGE_LATENCY_LABEL, latency);
    let node = with_label(node, crate::requirements::EDGE_BANDWIDTH_LABEL, bandwidth);
    with_label(node, crate::requirements::EDGE_RELIABILITY_LABEL, reliability)
}

pub fn pod(name: &str, namespace: &str, cpu: &str, memory: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "main".to_string(),
                resources: Some(ResourceRequirements {
                    requests: Some(quantities(cpu, memory)),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn with_priority(mut pod: Pod, priority: i32) -> Pod {
    if let Some(spec) = pod.spec.as_mut() {
        spec.priority = Some(priority);
    }
    pod
}

pub fn bound_to(mut pod: Pod, node_name: &str) -> Pod {
    if let Some(spec) = pod.spec.as_mut() {
        spec.node_name = Some(node_name.to_string());
    }
    pod
}

pub fn occupant(name: &str, node_name: &str, priority: i32, cpu: &str, memory: &str) -> Pod {
    bound_to(with_priority(pod(name, "default", cpu, memory), priority), node_name)
}

pub fn with_annotation(mut pod: Pod, key: &str, value: &str) -> Pod {
    pod.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
    pod
}

pub fn pod_with_annotations(annotations: &[(&str, &str)]) -> Pod {
    annotations
        .iter()
        .fold(pod("annotated", "default", "100m", "128Mi"), |pod, (k, v)| {
            with_annotation(pod, k, v)
        })
}
