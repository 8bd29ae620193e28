use serde::{Deserialize, Serialize};
use std::fmt;

/// WorkloadKey uniquely identifies a workload unit
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkloadKey {
    /// Namespace the unit lives in
    pub namespace: String,
    /// Unit name
    pub name: String,
}

impl WorkloadKey {
    /// Create a new WorkloadKey
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workload_key_display() {
        let key = WorkloadKey::new("team-a", "api-0");
        assert_eq!(key.to_string(), "team-a/api-0");
    }

    #[test]
    fn test_workload_key_ordering() {
        let mut keys = vec![
            WorkloadKey::new("b", "x"),
            WorkloadKey::new("a", "z"),
            WorkloadKey::new("a", "y"),
        ];
        keys.sort();
        assert_eq!(keys[0], WorkloadKey::new("a", "y"));
        assert_eq!(keys[2], WorkloadKey::new("b", "x"));
    }
}
