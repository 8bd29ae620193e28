use crate::affinity;
use crate::requirements::{
    host_bandwidth, host_latency, host_reliability, host_zone, ZoneRegistry,
};
use crate::types::{CandidateScore, NodeInfo, SchedulingContext};
use crate::{Result, SchedulerError};
use corral_core::{utilization, PodExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Pod annotation naming the scoring profile
pub const PROFILE_ANNOTATION: &str = "scheduler.corral.io/profile";

pub const GENERAL_PROFILE: &str = "general";
pub const BATCH_PROFILE: &str = "batch";
pub const EDGE_PROFILE: &str = "edge";

/// Score used when a host lacks the metadata a scorer needs
const NEUTRAL_SCORE: f64 = 50.0;

/// Scoring function trait
pub trait ScoreFunction: Send + Sync {
    /// Score a node for the given pod (0-100, higher is better)
    fn score(&self, context: &SchedulingContext, node: &NodeInfo) -> f64;

    /// Name of the scoring function
    fn name(&self) -> &str;
}

/// Tunables of the scoring functions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Share of CPU in the resource fit score
    pub cpu_weight: f64,
    /// Share of memory in the resource fit score
    pub memory_weight: f64,
    /// Score of a host matching every preferred affinity term
    pub affinity_bonus: f64,
    /// Distance at which the location score reaches zero
    pub max_distance_km: f64,
    /// Coordinates of the known edge zones
    pub zones: ZoneRegistry,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            cpu_weight: 50.0,
            memory_weight: 50.0,
            affinity_bonus: 100.0,
            max_distance_km: 10_000.0,
            zones: ZoneRegistry::default(),
        }
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cpu_weight < 0.0 || self.memory_weight < 0.0 {
            return Err(SchedulerError::invalid_config(
                "resource fit weights must not be negative",
                "Set scoring.cpu_weight and scoring.memory_weight to 0 or more",
            ));
        }
        if self.cpu_weight + self.memory_weight <= 0.0 {
            return Err(SchedulerError::invalid_config(
                "resource fit weights sum to zero",
                "Give CPU or memory a positive weight",
            ));
        }
        if self.max_distance_km <= 0.0 {
            return Err(SchedulerError::invalid_config(
                format!("max_distance_km must be positive, got {}", self.max_distance_km),
                "Use the default of 10000 km unless the deployment is regional",
            ));
        }
        Ok(())
    }
}

/// Post-allocation utilization of CPU and memory. A dimension the node
/// does not advertise counts as half used.
fn projected_utilization(context: &SchedulingContext, node: &NodeInfo) -> (f64, f64) {
    let after = node.requested + context.requests;
    let fraction = |used: i64, capacity: i64| {
        if capacity <= 0 {
            1.0 - NEUTRAL_SCORE / 100.0
        } else {
            utilization(used, capacity).clamp(0.0, 1.0)
        }
    };
    (
        fraction(after.cpu_millicores, node.allocatable.cpu_millicores),
        fraction(after.memory_bytes, node.allocatable.memory_bytes),
    )
}

/// Prefers nodes that stay lightly loaded after placement
pub struct ResourceFit {
    pub cpu_weight: f64,
    pub memory_weight: f64,
}

impl ScoreFunction for ResourceFit {
    fn score(&self, context: &SchedulingContext, node: &NodeInfo) -> f64 {
        let (cpu_util, mem_util) = projected_utilization(context, node);
        let total_weight = self.cpu_weight + self.memory_weight;
        if total_weight <= 0.0 {
            return 0.0;
        }

        let score = ((1.0 - cpu_util) * self.cpu_weight + (1.0 - mem_util) * self.memory_weight)
            * 100.0
            / total_weight;

        debug!(
            "Node {} resource fit: {:.1} (CPU util: {:.1}%, Memory util: {:.1}%)",
            node.name(),
            score,
            cpu_util * 100.0,
            mem_util * 100.0
        );

        score.clamp(0.0, 100.0)
    }

    fn name(&self) -> &str {
        "ResourceFit"
    }
}

/// Score based on balanced resource allocation
pub struct BalancedAllocation;

impl ScoreFunction for BalancedAllocation {
    fn score(&self, context: &SchedulingContext, node: &NodeInfo) -> f64 {
        if node.allocatable.cpu_millicores <= 0 || node.allocatable.memory_bytes <= 0 {
            return NEUTRAL_SCORE;
        }

        // CPU and memory usage should be similar
        let (cpu_fraction, memory_fraction) = projected_utilization(context, node);
        let variance = (cpu_fraction - memory_fraction).abs();

        debug!(
            "Node {} balanced allocation variance: {:.3}",
            node.name(),
            variance
        );

        ((1.0 - variance) * 100.0).clamp(0.0, 100.0)
    }

    fn name(&self) -> &str {
        "BalancedAllocation"
    }
}

/// Weighted share of matched preferred affinity terms
pub struct NodeAffinityScore {
    pub bonus: f64,
}

impl ScoreFunction for NodeAffinityScore {
    fn score(&self, context: &SchedulingContext, node: &NodeInfo) -> f64 {
        affinity::preferred_match_fraction(&context.pod, &node.node)
            .map(|fraction| (self.bonus * fraction).clamp(0.0, 100.0))
            .unwrap_or(0.0)
    }

    fn name(&self) -> &str {
        "NodeAffinity"
    }
}

pub struct LatencyScore;

impl ScoreFunction for LatencyScore {
    fn score(&self, context: &SchedulingContext, node: &NodeInfo) -> f64 {
        let Some(max) = context.edge.max_latency else {
            return 100.0;
        };
        let Some(observed) = host_latency(&node.node) else {
            return NEUTRAL_SCORE;
        };

        if observed > max {
            return 0.0;
        }
        100.0 * (1.0 - observed.as_secs_f64() / max.as_secs_f64())
    }

    fn name(&self) -> &str {
        "Latency"
    }
}

pub struct BandwidthScore;

impl ScoreFunction for BandwidthScore {
    fn score(&self, context: &SchedulingContext, node: &NodeInfo) -> f64 {
        let Some(required) = context.edge.min_bandwidth else {
            return 100.0;
        };
        let Some(available) = host_bandwidth(&node.node) else {
            return NEUTRAL_SCORE;
        };

        if available < required {
            return 0.0;
        }
        // Logarithmic: 50 at exactly the requirement, 100 at ten times it
        (50.0 + 50.0 * (available as f64 / required as f64).log10()).min(100.0)
    }

    fn name(&self) -> &str {
        "Bandwidth"
    }
}

pub struct ReliabilityScore;

impl ScoreFunction for ReliabilityScore {
    fn score(&self, context: &SchedulingContext, node: &NodeInfo) -> f64 {
        let Some(floor) = context.edge.min_reliability else {
            return 100.0;
        };
        let Some(reliability) = host_reliability(&node.node) else {
            return NEUTRAL_SCORE;
        };

        if reliability < floor {
            0.0
        } else {
            100.0 * reliability
        }
    }

    fn name(&self) -> &str {
        "Reliability"
    }
}

/// Geographic proximity between the pod's clients and the host's zone
pub struct LocationScore {
    pub max_distance_km: f64,
    pub zones: ZoneRegistry,
}

impl ScoreFunction for LocationScore {
    fn score(&self, context: &SchedulingContext, node: &NodeInfo) -> f64 {
        let Some(hint) = context.edge.location else {
            return 100.0;
        };
        let Some(zone) = host_zone(&node.node).and_then(|z| self.zones.get(z)) else {
            return NEUTRAL_SCORE;
        };

        let distance = hint.distance_km(&zone.location);
        debug!("Node {} is {:.0} km from pod {}", node.name(), distance, context.key);

        (100.0 * (1.0 - distance / self.max_distance_km)).max(0.0)
    }

    fn name(&self) -> &str {
        "Location"
    }
}

/// A named set of weighted scoring functions
pub struct ScoringProfile {
    name: String,
    entries: Vec<(Box<dyn ScoreFunction>, f64)>,
}

impl ScoringProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    /// Add a scoring function with its weight
    pub fn with(mut self, scorer: impl ScoreFunction + 'static, weight: f64) -> Self {
        self.entries.push((Box::new(scorer), weight));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resource fit 70, node affinity 30
    pub fn general(config: &ScoringConfig) -> Self {
        Self::new(GENERAL_PROFILE)
            .with(resource_fit(config), 70.0)
            .with(NodeAffinityScore { bonus: config.affinity_bonus }, 30.0)
    }

    /// Resource fit 60, balanced allocation 20, node affinity 20
    pub fn batch(config: &ScoringConfig) -> Self {
        Self::new(BATCH_PROFILE)
            .with(resource_fit(config), 60.0)
            .with(BalancedAllocation, 20.0)
            .with(NodeAffinityScore { bonus: config.affinity_bonus }, 20.0)
    }

    /// Latency 30, bandwidth 25, reliability 20, resource fit 15, location 10
    pub fn edge(config: &ScoringConfig) -> Self {
        Self::new(EDGE_PROFILE)
            .with(LatencyScore, 30.0)
            .with(BandwidthScore, 25.0)
            .with(ReliabilityScore, 20.0)
            .with(resource_fit(config), 15.0)
            .with(
                LocationScore {
                    max_distance_km: config.max_distance_km,
                    zones: config.zones.clone(),
                },
                10.0,
            )
    }

    /// Weighted composite of one node
    pub fn score_node(&self, context: &SchedulingContext, node: &NodeInfo) -> CandidateScore {
        let mut breakdown = BTreeMap::new();
        let mut weighted = 0.0;
        let mut total_weight = 0.0;

        for (scorer, weight) in &self.entries {
            let score = scorer.score(context, node);
            breakdown.insert(scorer.name().to_string(), score);
            weighted += score * weight;
            total_weight += weight;
        }

        let score = if total_weight > 0.0 {
            weighted / total_weight
        } else {
            0.0
        };

        CandidateScore {
            node_name: node.name().to_string(),
            score,
            breakdown,
        }
    }

    /// Score and rank candidates: highest composite first, ties by node name
    pub fn score_hosts(
        &self,
        context: &SchedulingContext,
        nodes: &[&NodeInfo],
    ) -> Vec<CandidateScore> {
        let mut scores: Vec<CandidateScore> = nodes
            .iter()
            .map(|node| self.score_node(context, node))
            .collect();

        scores.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.node_name.cmp(&b.node_name))
        });

        for candidate in &scores {
            debug!(
                "Pod {} profile {} node {} score {:.2}",
                context.key, self.name, candidate.node_name, candidate.score
            );
        }

        scores
    }
}

fn resource_fit(config: &ScoringConfig) -> ResourceFit {
    ResourceFit {
        cpu_weight: config.cpu_weight,
        memory_weight: config.memory_weight,
    }
}

/// Profiles by name, with selection per pod
pub struct ProfileRegistry {
    profiles: BTreeMap<String, ScoringProfile>,
    default_profile: String,
}

impl ProfileRegistry {
    /// The built-in general, batch and edge profiles
    pub fn new(config: &ScoringConfig, default_profile: impl Into<String>) -> Result<Self> {
        let mut registry = Self {
            profiles: BTreeMap::new(),
            default_profile: default_profile.into(),
        };
        registry.register(ScoringProfile::general(config));
        registry.register(ScoringProfile::batch(config));
        registry.register(ScoringProfile::edge(config));

        if !registry.profiles.contains_key(&registry.default_profile) {
            return Err(SchedulerError::invalid_config(
                format!("unknown default profile: {}", registry.default_profile),
                "Use one of general, batch or edge",
            ));
        }

        Ok(registry)
    }

    pub fn register(&mut self, profile: ScoringProfile) {
        self.profiles.insert(profile.name().to_string(), profile);
    }

    /// Profile named by the pod, else the profile of its workload class,
    /// else the default
    pub fn select(&self, context: &SchedulingContext) -> Result<&ScoringProfile> {
        let name = match (context.pod.annotation(PROFILE_ANNOTATION), context.class) {
            (Some(name), _) => name,
            (None, Some(class)) => class.profile(),
            (None, None) => self.default_profile.as_str(),
        };

        self.profiles.get(name).ok_or_else(|| {
            SchedulerError::invalid_unit_spec(
                context.pod_name(),
                format!("unknown scoring profile: {}", name),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affinity::tests::{expr, term, with_preferred};
    use crate::requirements::{
        POD_LOCATION_ANNOTATION, POD_MAX_LATENCY_ANNOTATION, POD_MIN_BANDWIDTH_ANNOTATION,
        POD_MIN_RELIABILITY_ANNOTATION,
    };
    use crate::testing::{edge_node, node, pod, pod_with_annotations, with_annotation, with_label};

    fn context(pod: corral_core::Pod) -> SchedulingContext {
        SchedulingContext::new(pod).unwrap()
    }

    fn fit() -> ResourceFit {
        resource_fit(&ScoringConfig::default())
    }

    #[test]
    fn test_resource_fit_scenario() {
        // 1000m of 4000m and a quarter of the memory
        let host = NodeInfo::new(node("a", "4000m", "8Gi"));
        let ctx = context(pod("web", "default", "1000m", "2Gi"));

        assert_eq!(fit().score(&ctx, &host), 75.0);
    }

    #[test]
    fn test_resource_fit_counts_existing_requests() {
        let snapshot = NodeInfo::snapshot(
            vec![node("a", "4", "8Gi")],
            vec![crate::testing::occupant("busy", "a", 0, "2", "4Gi")],
        );
        let ctx = context(pod("web", "default", "1", "2Gi"));

        assert_eq!(fit().score(&ctx, &snapshot[0]), 25.0);
    }

    #[test]
    fn test_resource_fit_without_allocatable() {
        let mut bare = node("bare", "1", "1Gi");
        bare.status = None;
        let ctx = context(pod("web", "default", "1", "1Gi"));

        assert_eq!(fit().score(&ctx, &NodeInfo::new(bare.clone())), 50.0);
        assert_eq!(BalancedAllocation.score(&ctx, &NodeInfo::new(bare)), 50.0);

        // Only memory is known: CPU contributes the neutral half
        let cpu_unknown = node("half", "0", "4Gi");
        let small = context(pod("web", "default", "1", "1Gi"));
        assert_eq!(fit().score(&small, &NodeInfo::new(cpu_unknown)), 62.5);
    }

    #[test]
    fn test_balanced_allocation() {
        let host = NodeInfo::new(node("a", "4", "8Gi"));
        let balanced = context(pod("web", "default", "2", "4Gi"));
        let skewed = context(pod("web", "default", "2", "0"));

        assert_eq!(BalancedAllocation.score(&balanced, &host), 100.0);
        assert_eq!(BalancedAllocation.score(&skewed, &host), 50.0);
    }

    #[test]
    fn test_node_affinity_score() {
        let ssd = NodeInfo::new(with_label(node("a", "4", "8Gi"), "disk", "ssd"));
        let hdd = NodeInfo::new(node("b", "4", "8Gi"));
        let scorer = NodeAffinityScore { bonus: 100.0 };

        let preferring = context(with_preferred(
            pod("web", "default", "1", "1Gi"),
            50,
            term(vec![expr("disk", "In", &["ssd"])]),
        ));
        assert_eq!(scorer.score(&preferring, &ssd), 100.0);
        assert_eq!(scorer.score(&preferring, &hdd), 0.0);

        let indifferent = context(pod("web", "default", "1", "1Gi"));
        assert_eq!(scorer.score(&indifferent, &ssd), 0.0);
    }

    #[test]
    fn test_latency_score() {
        let ctx = context(pod_with_annotations(&[(POD_MAX_LATENCY_ANNOTATION, "20ms")]));

        let fast = NodeInfo::new(edge_node("e", "edge-zone-east", "5ms", "100", "0.9"));
        let slow = NodeInfo::new(edge_node("e", "edge-zone-east", "40ms", "100", "0.9"));
        let unknown = NodeInfo::new(node("core", "4", "8Gi"));

        assert!((LatencyScore.score(&ctx, &fast) - 75.0).abs() < 1e-9);
        assert_eq!(LatencyScore.score(&ctx, &slow), 0.0);
        assert_eq!(LatencyScore.score(&ctx, &unknown), 50.0);

        let no_requirement = context(pod("web", "default", "1", "1Gi"));
        assert_eq!(LatencyScore.score(&no_requirement, &slow), 100.0);
    }

    #[test]
    fn test_bandwidth_score() {
        let ctx = context(pod_with_annotations(&[(POD_MIN_BANDWIDTH_ANNOTATION, "100")]));

        let exact = NodeInfo::new(edge_node("e", "edge-zone-east", "5ms", "100", "0.9"));
        let tenfold = NodeInfo::new(edge_node("e", "edge-zone-east", "5ms", "1000", "0.9"));
        let starved = NodeInfo::new(edge_node("e", "edge-zone-east", "5ms", "10", "0.9"));

        assert_eq!(BandwidthScore.score(&ctx, &exact), 50.0);
        assert!((BandwidthScore.score(&ctx, &tenfold) - 100.0).abs() < 1e-9);
        assert_eq!(BandwidthScore.score(&ctx, &starved), 0.0);
    }

    #[test]
    fn test_reliability_score() {
        let ctx = context(pod_with_annotations(&[(POD_MIN_RELIABILITY_ANNOTATION, "0.9")]));

        let solid = NodeInfo::new(edge_node("e", "edge-zone-east", "5ms", "100", "0.95"));
        let flaky = NodeInfo::new(edge_node("e", "edge-zone-east", "5ms", "100", "0.5"));

        assert!((ReliabilityScore.score(&ctx, &solid) - 95.0).abs() < 1e-9);
        assert_eq!(ReliabilityScore.score(&ctx, &flaky), 0.0);
    }

    #[test]
    fn test_location_score() {
        let config = ScoringConfig::default();
        let scorer = LocationScore {
            max_distance_km: config.max_distance_km,
            zones: config.zones,
        };
        // Near New York
        let ctx = context(pod_with_annotations(&[(POD_LOCATION_ANNOTATION, "40.7,-74.0")]));

        let east = NodeInfo::new(edge_node("e", "edge-zone-east", "5ms", "100", "0.9"));
        let europe = NodeInfo::new(edge_node("eu", "edge-zone-europe", "5ms", "100", "0.9"));
        let nowhere = NodeInfo::new(edge_node("x", "edge-zone-mars", "5ms", "100", "0.9"));

        let east_score = scorer.score(&ctx, &east);
        let europe_score = scorer.score(&ctx, &europe);
        assert!(east_score > 99.0);
        assert!(europe_score > 40.0 && europe_score < 50.0);
        assert_eq!(scorer.score(&ctx, &nowhere), 50.0);
    }

    #[test]
    fn test_composite_is_weighted_mean() {
        let profile = ScoringProfile::general(&ScoringConfig::default());
        let host = NodeInfo::new(node("a", "4000m", "8Gi"));
        let ctx = context(pod("web", "default", "1000m", "2Gi"));

        let scored = profile.score_node(&ctx, &host);
        // (75 * 70 + 0 * 30) / 100
        assert!((scored.score - 52.5).abs() < 1e-9);
        assert_eq!(scored.breakdown["ResourceFit"], 75.0);
        assert_eq!(scored.breakdown["NodeAffinity"], 0.0);
    }

    #[test]
    fn test_ranking_ties_break_by_name() {
        let profile = ScoringProfile::general(&ScoringConfig::default());
        let b = NodeInfo::new(node("b", "4", "8Gi"));
        let a = NodeInfo::new(node("a", "4", "8Gi"));
        let big = NodeInfo::new(node("c", "16", "32Gi"));
        let ctx = context(pod("web", "default", "1", "1Gi"));

        let ranked = profile.score_hosts(&ctx, &[&b, &a, &big]);
        let names: Vec<_> = ranked.iter().map(|s| s.node_name.as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);

        // Deterministic for identical inputs
        assert_eq!(ranked, profile.score_hosts(&ctx, &[&b, &a, &big]));
    }

    #[test]
    fn test_profile_selection() {
        let registry = ProfileRegistry::new(&ScoringConfig::default(), GENERAL_PROFILE).unwrap();

        let plain = context(pod("web", "default", "1", "1Gi"));
        assert_eq!(registry.select(&plain).unwrap().name(), GENERAL_PROFILE);

        let edge = context(pod_with_annotations(&[(POD_MAX_LATENCY_ANNOTATION, "10ms")]));
        assert_eq!(registry.select(&edge).unwrap().name(), EDGE_PROFILE);

        let batch = context(with_annotation(
            pod("job", "default", "1", "1Gi"),
            PROFILE_ANNOTATION,
            BATCH_PROFILE,
        ));
        assert_eq!(registry.select(&batch).unwrap().name(), BATCH_PROFILE);

        let unknown = context(with_annotation(
            pod("job", "default", "1", "1Gi"),
            PROFILE_ANNOTATION,
            "fancy",
        ));
        assert!(matches!(
            registry.select(&unknown),
            Err(SchedulerError::InvalidUnitSpec { .. })
        ));
    }

    #[test]
    fn test_workload_class_selects_profile() {
        use corral_core::k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

        let registry = ProfileRegistry::new(&ScoringConfig::default(), GENERAL_PROFILE).unwrap();

        let mut job = pod("report", "default", "1", "1Gi");
        job.metadata.owner_references = Some(vec![OwnerReference {
            kind: "Job".to_string(),
            name: "report".to_string(),
            ..Default::default()
        }]);
        let ctx = context(job.clone());
        assert_eq!(ctx.class, Some(crate::classifier::WorkloadClass::BatchProcessing));
        assert_eq!(registry.select(&ctx).unwrap().name(), BATCH_PROFILE);

        // An explicit annotation still wins
        let pinned = context(with_annotation(job, PROFILE_ANNOTATION, GENERAL_PROFILE));
        assert_eq!(registry.select(&pinned).unwrap().name(), GENERAL_PROFILE);
    }

    #[test]
    fn test_unknown_default_profile_is_rejected() {
        assert!(ProfileRegistry::new(&ScoringConfig::default(), "fancy").is_err());
    }
}
