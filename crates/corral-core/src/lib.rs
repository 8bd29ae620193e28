//! Corral Core - Fundamental types for the Corral scheduling core
//!
//! This crate provides:
//! - Resource quantities across CPU, memory, storage and accelerators
//! - Scheduling accessors over Kubernetes Pod and Node objects
//! - Error types with miette diagnostics
//! - Serialization helpers

pub mod error;
pub mod resources;
pub mod types;

// Re-export commonly used types
pub use error::{CorralError, Result};
pub use resources::{
    utilization, Dimension, NodeExt, PodExt, ResourceError, ResourceQuantities,
    ACCELERATOR_RESOURCE, DEFAULT_NAMESPACE, STORAGE_RESOURCE,
};
pub use types::WorkloadKey;

// Re-export k8s-openapi types for convenience
pub use k8s_openapi;
pub use k8s_openapi::api::core::v1::{Node, Pod, ResourceQuota, Taint, Toleration};
pub use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Serialize a resource to YAML
pub fn to_yaml<T: serde::Serialize>(resource: &T) -> Result<String> {
    serde_yaml::to_string(resource).map_err(|e| {
        CorralError::serialization_error(
            format!("Failed to serialize to YAML: {}", e),
            Some(Box::new(e)),
        )
    })
}

/// Deserialize a resource from YAML
pub fn from_yaml<T: for<'de> serde::Deserialize<'de>>(data: &str) -> Result<T> {
    serde_yaml::from_str(data).map_err(|e| {
        CorralError::serialization_error(
            format!("Failed to deserialize from YAML: {}", e),
            Some(Box::new(e)),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_node_with_allocatable() {
        let yaml = r#"
metadata:
  name: edge-1
status:
  allocatable:
    cpu: "4"
    memory: 8Gi
"#;
        let node: Node = from_yaml(yaml).unwrap();
        assert_eq!(node.name(), "edge-1");
        assert_eq!(node.allocatable().cpu_millicores, 4000);

        let back = to_yaml(&node).unwrap();
        assert!(back.contains("edge-1"));
    }
}
