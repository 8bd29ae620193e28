//! Corral Scheduler - Pod to host placement and tenant capacity control
//!
//! This crate provides:
//! - Filter predicates (readiness, resources, selectors, affinity, taints, edge QoS)
//! - Profile-driven scoring functions (general, batch, edge)
//! - Workload classification that picks a profile from pod traits
//! - Priority preemption with minimal victim sets
//! - Pod binding with per-host serialization
//! - Closed-loop tenant quota tuning
//! - Host marking for overload, fragmentation and idleness
//! - Accessor traits with an in-memory implementation

pub mod affinity;
pub mod classifier;
pub mod error;
pub mod filter;
pub mod memory;
pub mod optimizer;
pub mod preemption;
pub mod quota;
pub mod requirements;
pub mod retry;
pub mod scheduler;
pub mod score;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use classifier::WorkloadClass;
pub use error::{Result, SchedulerError};
pub use memory::InMemoryStore;
pub use optimizer::{HostAction, HostOptimizer, OptimizerConfig};
pub use preemption::{PreemptionConfig, PreemptionEngine};
pub use quota::{
    MetricType, QuotaCeiling, QuotaController, QuotaControllerConfig, QuotaOutcome, ScalingRule,
    TenantQuotaConfig,
};
pub use retry::RetryPolicy;
pub use scheduler::{CycleReport, PreemptionOutcome, ScheduleOutcome, Scheduler, SchedulerConfig};
pub use score::{ScoringConfig, ScoringProfile};
pub use store::{HostStore, QuotaStore, UnitFilter, UnitStore};
pub use types::{Binding, FilterResult, NodeInfo, SchedulingContext};
