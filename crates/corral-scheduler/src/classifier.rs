//! Workload classification from pod traits.
//!
//! Pods that do not name a scoring profile are classified by what they
//! request and how they are owned. The class picks the profile and adds the
//! tolerations that class of workload needs.

use crate::requirements::EdgeRequirements;
use crate::score::{BATCH_PROFILE, EDGE_PROFILE, GENERAL_PROFILE};
use corral_core::k8s_openapi::api::core::v1::Toleration;
use corral_core::{Pod, ACCELERATOR_RESOURCE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Label recording the class of a pod
pub const WORKLOAD_CLASS_LABEL: &str = "workload.corral.io/class";
/// Well-known label describing a pod's role
pub const COMPONENT_LABEL: &str = "app.kubernetes.io/component";
/// Taint carried by nodes reserved for batch work
pub const BATCH_NODE_TAINT: &str = "node.kubernetes.io/batch";

const DATABASE_IMAGES: [&str; 9] = [
    "mysql",
    "postgres",
    "mongodb",
    "redis",
    "elasticsearch",
    "cassandra",
    "mariadb",
    "oracle",
    "mssql",
];

const WEB_PORTS: [i32; 3] = [80, 443, 8080];

/// Kind of workload a pod runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkloadClass {
    MlTraining,
    Edge,
    BatchProcessing,
    Database,
    WebFrontend,
}

impl WorkloadClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadClass::MlTraining => "ml-training",
            WorkloadClass::Edge => "edge",
            WorkloadClass::BatchProcessing => "batch-processing",
            WorkloadClass::Database => "database",
            WorkloadClass::WebFrontend => "web-frontend",
        }
    }

    /// Scoring profile used for this class
    pub fn profile(&self) -> &'static str {
        match self {
            WorkloadClass::MlTraining | WorkloadClass::BatchProcessing => BATCH_PROFILE,
            WorkloadClass::Edge => EDGE_PROFILE,
            WorkloadClass::Database | WorkloadClass::WebFrontend => GENERAL_PROFILE,
        }
    }

    /// Tolerations a pod of this class gets on top of its own
    pub fn tolerations(&self) -> Vec<Toleration> {
        match self {
            WorkloadClass::MlTraining => vec![Toleration {
                key: Some(ACCELERATOR_RESOURCE.to_string()),
                operator: Some("Exists".to_string()),
                effect: Some("NoSchedule".to_string()),
                ..Default::default()
            }],
            WorkloadClass::BatchProcessing => vec![Toleration {
                key: Some(BATCH_NODE_TAINT.to_string()),
                operator: Some("Equal".to_string()),
                value: Some("true".to_string()),
                effect: Some("NoSchedule".to_string()),
                ..Default::default()
            }],
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for WorkloadClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// First matching class, or `None` for pods without a telling trait.
///
/// Order: accelerator requests, edge requirements, Job/CronJob ownership,
/// database images, web frontends.
pub fn classify(pod: &Pod, edge: &EdgeRequirements) -> Option<WorkloadClass> {
    if requests_accelerator(pod) {
        return Some(WorkloadClass::MlTraining);
    }
    if !edge.is_empty() {
        return Some(WorkloadClass::Edge);
    }
    if is_batch(pod) {
        return Some(WorkloadClass::BatchProcessing);
    }
    if is_database(pod) {
        return Some(WorkloadClass::Database);
    }
    if is_web_frontend(pod) {
        return Some(WorkloadClass::WebFrontend);
    }
    None
}

/// Label the pod with its class and add the class tolerations it lacks
pub fn apply(pod: &mut Pod, class: WorkloadClass) {
    pod.metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(WORKLOAD_CLASS_LABEL.to_string(), class.as_str().to_string());

    let extra = class.tolerations();
    if extra.is_empty() {
        return;
    }
    let Some(spec) = pod.spec.as_mut() else {
        return;
    };
    let tolerations = spec.tolerations.get_or_insert_with(Vec::new);
    for toleration in extra {
        if !tolerations.contains(&toleration) {
            tolerations.push(toleration);
        }
    }
}

fn component(pod: &Pod) -> Option<String> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(COMPONENT_LABEL))
        .map(|c| c.to_lowercase())
}

fn requests_accelerator(pod: &Pod) -> bool {
    pod.spec.iter().flat_map(|s| &s.containers).any(|c| {
        c.resources
            .as_ref()
            .and_then(|r| r.requests.as_ref())
            .is_some_and(|r| r.contains_key(ACCELERATOR_RESOURCE))
    })
}

fn is_batch(pod: &Pod) -> bool {
    let owned_by_job = pod
        .metadata
        .owner_references
        .iter()
        .flatten()
        .any(|owner| owner.kind == "Job" || owner.kind == "CronJob");

    owned_by_job || component(pod).is_some_and(|c| c.contains("batch") || c.contains("job"))
}

fn is_database(pod: &Pod) -> bool {
    let database_image = pod.spec.iter().flat_map(|s| &s.containers).any(|c| {
        let image = c.image.as_deref().unwrap_or_default().to_lowercase();
        DATABASE_IMAGES.iter().any(|pattern| image.contains(pattern))
    });

    database_image || component(pod).is_some_and(|c| c.contains("database") || c.contains("db"))
}

fn is_web_frontend(pod: &Pod) -> bool {
    if let Some(component) = component(pod) {
        return component.contains("frontend") || component.contains("web");
    }

    pod.spec
        .iter()
        .flat_map(|s| &s.containers)
        .flat_map(|c| c.ports.iter().flatten())
        .any(|p| WEB_PORTS.contains(&p.container_port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requirements::POD_MAX_LATENCY_ANNOTATION;
    use crate::testing::{pod, with_annotation};
    use corral_core::k8s_openapi::api::core::v1::ContainerPort;
    use corral_core::k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use corral_core::{PodExt, Quantity};

    fn class_of(pod: &Pod) -> Option<WorkloadClass> {
        classify(pod, &EdgeRequirements::from_pod(pod))
    }

    fn with_component(mut pod: Pod, component: &str) -> Pod {
        pod.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(COMPONENT_LABEL.to_string(), component.to_string());
        pod
    }

    fn with_gpu(mut pod: Pod) -> Pod {
        let container = &mut pod.spec.as_mut().unwrap().containers[0];
        container
            .resources
            .as_mut()
            .unwrap()
            .requests
            .as_mut()
            .unwrap()
            .insert(ACCELERATOR_RESOURCE.to_string(), Quantity("1".to_string()));
        pod
    }

    fn with_image(mut pod: Pod, image: &str) -> Pod {
        pod.spec.as_mut().unwrap().containers[0].image = Some(image.to_string());
        pod
    }

    fn owned_by(mut pod: Pod, kind: &str) -> Pod {
        pod.metadata.owner_references = Some(vec![OwnerReference {
            kind: kind.to_string(),
            name: "owner".to_string(),
            ..Default::default()
        }]);
        pod
    }

    #[test]
    fn test_accelerator_request_is_ml_training() {
        let trainer = with_gpu(pod("trainer", "ml", "4", "16Gi"));
        assert_eq!(class_of(&trainer), Some(WorkloadClass::MlTraining));
        assert_eq!(WorkloadClass::MlTraining.profile(), BATCH_PROFILE);

        // Wins over every other trait
        let labelled = with_component(owned_by(trainer, "Job"), "web");
        assert_eq!(class_of(&labelled), Some(WorkloadClass::MlTraining));
    }

    #[test]
    fn test_edge_requirements_are_edge() {
        let sensor = with_annotation(
            pod("sensor", "iot", "100m", "64Mi"),
            POD_MAX_LATENCY_ANNOTATION,
            "10ms",
        );
        assert_eq!(class_of(&sensor), Some(WorkloadClass::Edge));
        assert_eq!(WorkloadClass::Edge.profile(), EDGE_PROFILE);
    }

    #[test]
    fn test_job_and_cronjob_pods_are_batch() {
        assert_eq!(
            class_of(&owned_by(pod("report", "default", "1", "1Gi"), "Job")),
            Some(WorkloadClass::BatchProcessing)
        );
        assert_eq!(
            class_of(&owned_by(pod("nightly", "default", "1", "1Gi"), "CronJob")),
            Some(WorkloadClass::BatchProcessing)
        );
        assert_eq!(
            class_of(&with_component(pod("etl", "default", "1", "1Gi"), "Batch-Worker")),
            Some(WorkloadClass::BatchProcessing)
        );
        assert_eq!(
            class_of(&owned_by(pod("web", "default", "1", "1Gi"), "ReplicaSet")),
            None
        );
    }

    #[test]
    fn test_database_images_and_labels() {
        let postgres = with_image(
            pod("pg-0", "data", "2", "8Gi"),
            "docker.io/library/Postgres:16",
        );
        assert_eq!(class_of(&postgres), Some(WorkloadClass::Database));

        let labelled = with_component(pod("store", "data", "1", "1Gi"), "database");
        assert_eq!(class_of(&labelled), Some(WorkloadClass::Database));
        assert_eq!(WorkloadClass::Database.profile(), GENERAL_PROFILE);
    }

    #[test]
    fn test_web_frontend_labels_and_ports() {
        let labelled = with_component(pod("shop", "default", "500m", "512Mi"), "frontend");
        assert_eq!(class_of(&labelled), Some(WorkloadClass::WebFrontend));

        let mut served = pod("site", "default", "500m", "512Mi");
        served.spec.as_mut().unwrap().containers[0].ports = Some(vec![ContainerPort {
            container_port: 8080,
            ..Default::default()
        }]);
        assert_eq!(class_of(&served), Some(WorkloadClass::WebFrontend));

        // A component label that says nothing about the web skips the port check
        let cache = with_component(served, "cache");
        assert_eq!(class_of(&cache), None);
    }

    #[test]
    fn test_plain_pod_has_no_class() {
        assert_eq!(class_of(&pod("plain", "default", "1", "1Gi")), None);
    }

    #[test]
    fn test_apply_labels_and_tolerates() {
        let mut job = owned_by(pod("report", "default", "1", "1Gi"), "Job");
        apply(&mut job, WorkloadClass::BatchProcessing);
        apply(&mut job, WorkloadClass::BatchProcessing);

        assert_eq!(
            job.metadata.labels.as_ref().unwrap()[WORKLOAD_CLASS_LABEL],
            "batch-processing"
        );
        assert_eq!(job.tolerations().len(), 1);
        assert_eq!(job.tolerations()[0].key.as_deref(), Some(BATCH_NODE_TAINT));

        let mut frontend = pod("shop", "default", "1", "1Gi");
        apply(&mut frontend, WorkloadClass::WebFrontend);
        assert!(frontend.tolerations().is_empty());
    }
}
