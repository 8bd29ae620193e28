//! Closed-loop tenant quota tuning.
//!
//! Each cycle observes the requests of a tenant's live pods, evaluates the
//! tenant's scaling rules and raises or lowers the enforced `dynamic-quota`
//! within `[base, max]`. At most one adjustment happens per cooldown.

use crate::store::{QuotaStore, UnitFilter, UnitStore};
use crate::types::occupant_requests;
use crate::{Result, SchedulerError};
use chrono::{DateTime, Utc};
use corral_core::k8s_openapi::api::core::v1::ResourceQuotaSpec;
use corral_core::{ObjectMeta, PodExt, Quantity, ResourceQuantities, ResourceQuota};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Name of the quota object the controller owns in every tenant namespace
pub const DYNAMIC_QUOTA_NAME: &str = "dynamic-quota";

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// What a scaling rule watches, and which hard limit it adjusts
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    /// CPU cores requested, adjusts `requests.cpu`
    CpuUsage,
    /// Memory GiB requested, adjusts `requests.memory`
    MemoryUsage,
    /// Live pods, adjusts `pods`
    PodCount,
}

impl MetricType {
    pub const ALL: [MetricType; 3] = [
        MetricType::CpuUsage,
        MetricType::MemoryUsage,
        MetricType::PodCount,
    ];

    /// Hard limit key in the quota object
    pub fn resource_name(&self) -> &'static str {
        match self {
            MetricType::CpuUsage => "requests.cpu",
            MetricType::MemoryUsage => "requests.memory",
            MetricType::PodCount => "pods",
        }
    }

    /// Observed value in rule units (cores, GiB, pods)
    pub fn observe(&self, usage: &UsageSnapshot) -> f64 {
        match self {
            MetricType::CpuUsage => usage.cpu_cores,
            MetricType::MemoryUsage => usage.memory_gib,
            MetricType::PodCount => usage.pods as f64,
        }
    }

    /// Rule units to ceiling units (millicores, bytes, pods)
    fn to_ceiling(&self, value: f64) -> i64 {
        let scaled = match self {
            MetricType::CpuUsage => value * 1000.0,
            MetricType::MemoryUsage => value * GIB,
            MetricType::PodCount => value,
        };
        scaled.round().clamp(0.0, i64::MAX as f64) as i64
    }

    fn parse(&self, quantity: &Quantity) -> std::result::Result<i64, String> {
        match self {
            MetricType::CpuUsage => ResourceQuantities::parse_cpu(&quantity.0),
            MetricType::MemoryUsage => ResourceQuantities::parse_memory(&quantity.0),
            MetricType::PodCount => ResourceQuantities::parse_count(&quantity.0),
        }
    }

    fn format(&self, value: i64) -> Quantity {
        let text = match self {
            MetricType::CpuUsage if value % 1000 == 0 => format!("{}", value / 1000),
            MetricType::CpuUsage => format!("{}m", value),
            MetricType::MemoryUsage if value % (1 << 30) == 0 => format!("{}Gi", value >> 30),
            MetricType::MemoryUsage if value % (1 << 20) == 0 => format!("{}Mi", value >> 20),
            MetricType::MemoryUsage | MetricType::PodCount => format!("{}", value),
        };
        Quantity(text)
    }
}

impl std::fmt::Display for MetricType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MetricType::CpuUsage => "cpu_usage",
            MetricType::MemoryUsage => "memory_usage",
            MetricType::PodCount => "pod_count",
        };
        write!(f, "{}", name)
    }
}

/// Hard limits of a tenant. Absent limits are not enforced.
///
/// Serialized as a Kubernetes `hard` map, e.g.
/// `{requests.cpu: "10", requests.memory: 32Gi, pods: "50"}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, Quantity>",
    into = "BTreeMap<String, Quantity>"
)]
pub struct QuotaCeiling {
    pub cpu_millicores: Option<i64>,
    pub memory_bytes: Option<i64>,
    pub pods: Option<i64>,
}

impl QuotaCeiling {
    pub fn get(&self, metric: MetricType) -> Option<i64> {
        match metric {
            MetricType::CpuUsage => self.cpu_millicores,
            MetricType::MemoryUsage => self.memory_bytes,
            MetricType::PodCount => self.pods,
        }
    }

    pub fn set(&mut self, metric: MetricType, value: i64) {
        match metric {
            MetricType::CpuUsage => self.cpu_millicores = Some(value),
            MetricType::MemoryUsage => self.memory_bytes = Some(value),
            MetricType::PodCount => self.pods = Some(value),
        }
    }

    /// Read the limits managed here from a quota's hard map. Unparseable
    /// entries count as absent.
    pub fn from_hard(hard: &BTreeMap<String, Quantity>) -> Self {
        let mut ceiling = Self::default();
        for metric in MetricType::ALL {
            if let Some(quantity) = hard.get(metric.resource_name()) {
                match metric.parse(quantity) {
                    Ok(value) => ceiling.set(metric, value),
                    Err(e) => warn!("Ignoring quota entry {}: {}", metric.resource_name(), e),
                }
            }
        }
        ceiling
    }

    /// Merge the limits into an existing hard map
    pub fn apply_to(&self, hard: &mut BTreeMap<String, Quantity>) {
        for metric in MetricType::ALL {
            if let Some(value) = self.get(metric) {
                hard.insert(metric.resource_name().to_string(), metric.format(value));
            }
        }
    }
}

impl TryFrom<BTreeMap<String, Quantity>> for QuotaCeiling {
    type Error = String;

    fn try_from(hard: BTreeMap<String, Quantity>) -> std::result::Result<Self, String> {
        let mut ceiling = Self::default();
        for (key, quantity) in &hard {
            let metric = MetricType::ALL
                .into_iter()
                .find(|m| m.resource_name() == key)
                .ok_or_else(|| format!("unsupported quota resource: {}", key))?;
            let value = metric
                .parse(quantity)
                .map_err(|e| format!("invalid {}: {}", key, e))?;
            ceiling.set(metric, value);
        }
        Ok(ceiling)
    }
}

impl From<QuotaCeiling> for BTreeMap<String, Quantity> {
    fn from(ceiling: QuotaCeiling) -> Self {
        let mut hard = BTreeMap::new();
        ceiling.apply_to(&mut hard);
        hard
    }
}

impl std::fmt::Display for QuotaCeiling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = MetricType::ALL
            .into_iter()
            .filter_map(|m| self.get(m).map(|v| format!("{}={}", m.resource_name(), m.format(v).0)))
            .collect();
        write!(f, "{}", parts.join(" "))
    }
}

/// When to scale one hard limit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingRule {
    pub metric: MetricType,
    /// Observed value (cores, GiB, pods) above which the rule fires
    pub threshold: f64,
    /// New limit as a multiple of the observed value
    pub scale_factor: f64,
    /// Minimum time between adjustments of this tenant
    #[serde(default, with = "humantime_serde")]
    pub cooldown: Option<Duration>,
}

/// Quota policy of one tenant namespace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantQuotaConfig {
    pub namespace: String,
    /// Limits in force before any adjustment
    pub base: QuotaCeiling,
    /// Limits no adjustment may exceed
    pub max: QuotaCeiling,
    #[serde(default)]
    pub rules: Vec<ScalingRule>,
    /// Higher priority tenants are evaluated first
    #[serde(default)]
    pub priority: i32,
}

impl TenantQuotaConfig {
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(SchedulerError::invalid_config(
                "tenant namespace is empty",
                "Name the namespace the quota applies to",
            ));
        }

        for metric in MetricType::ALL {
            if let (Some(base), Some(max)) = (self.base.get(metric), self.max.get(metric)) {
                if max < base {
                    return Err(SchedulerError::invalid_config(
                        format!(
                            "tenant {}: max {} is below base",
                            self.namespace,
                            metric.resource_name()
                        ),
                        "Raise max or lower base so that base <= max",
                    ));
                }
            }
        }

        for rule in &self.rules {
            if !(rule.scale_factor.is_finite() && rule.scale_factor > 0.0) {
                return Err(SchedulerError::invalid_config(
                    format!(
                        "tenant {}: scale_factor {} of {} rule must be positive",
                        self.namespace, rule.scale_factor, rule.metric
                    ),
                    "Use a factor such as 1.5 to allow 50% headroom",
                ));
            }
            if !(rule.threshold.is_finite() && rule.threshold >= 0.0) {
                return Err(SchedulerError::invalid_config(
                    format!(
                        "tenant {}: threshold {} of {} rule must not be negative",
                        self.namespace, rule.threshold, rule.metric
                    ),
                    "Thresholds are in cores, GiB or pods",
                ));
            }
            if self.max.get(rule.metric).is_none() {
                return Err(SchedulerError::invalid_config(
                    format!(
                        "tenant {}: {} rule has no max {}",
                        self.namespace,
                        rule.metric,
                        rule.metric.resource_name()
                    ),
                    "Every scaled resource needs an upper bound in max",
                ));
            }
        }

        Ok(())
    }
}

/// Aggregate requests of a tenant at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu_cores: f64,
    pub memory_gib: f64,
    pub pods: i64,
}

/// Result of one quota evaluation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaOutcome {
    pub namespace: String,
    /// A new ceiling was written
    pub applied: bool,
    /// Ceiling in force after the evaluation
    pub ceiling: QuotaCeiling,
    /// A rule asked for more than max allows
    pub clamped: bool,
}

/// Quota controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaControllerConfig {
    /// How often every tenant is evaluated
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Cooldown for tenants whose rules name none
    #[serde(with = "humantime_serde")]
    pub default_cooldown: Duration,
    /// How long usage snapshots are kept
    #[serde(with = "humantime_serde")]
    pub history_window: Duration,
}

impl Default for QuotaControllerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            default_cooldown: Duration::from_secs(5 * 60),
            history_window: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Default)]
struct ControllerState {
    history: BTreeMap<String, VecDeque<UsageSnapshot>>,
    last_adjusted: BTreeMap<String, DateTime<Utc>>,
}

/// Adjusts tenant quotas from observed usage
pub struct QuotaController {
    units: Arc<dyn UnitStore>,
    quotas: Arc<dyn QuotaStore>,
    config: QuotaControllerConfig,
    tenants: RwLock<BTreeMap<String, TenantQuotaConfig>>,
    state: RwLock<ControllerState>,
    /// Held from the cooldown check until the adjustment is recorded
    tenant_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl QuotaController {
    pub fn new(
        units: Arc<dyn UnitStore>,
        quotas: Arc<dyn QuotaStore>,
        config: QuotaControllerConfig,
    ) -> Self {
        Self {
            units,
            quotas,
            config,
            tenants: RwLock::new(BTreeMap::new()),
            state: RwLock::new(ControllerState::default()),
            tenant_locks: DashMap::new(),
        }
    }

    /// Register or replace a tenant's policy
    pub async fn add_tenant(&self, tenant: TenantQuotaConfig) -> Result<()> {
        tenant.validate()?;
        info!(
            "Managing quota for namespace {} ({} rule(s))",
            tenant.namespace,
            tenant.rules.len()
        );
        self.tenants
            .write()
            .await
            .insert(tenant.namespace.clone(), tenant);
        Ok(())
    }

    /// Usage snapshots kept for a namespace, oldest first
    pub async fn history(&self, namespace: &str) -> Vec<UsageSnapshot> {
        self.state
            .read()
            .await
            .history
            .get(namespace)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Time of the last successful adjustment
    pub async fn last_adjusted(&self, namespace: &str) -> Option<DateTime<Utc>> {
        self.state.read().await.last_adjusted.get(namespace).copied()
    }

    /// Evaluate one tenant now
    pub async fn tune_quota(&self, namespace: &str) -> Result<QuotaOutcome> {
        self.tune_quota_at(namespace, Utc::now()).await
    }

    /// Evaluate one tenant as of `now`
    pub async fn tune_quota_at(&self, namespace: &str, now: DateTime<Utc>) -> Result<QuotaOutcome> {
        let tenant = self
            .tenants
            .read()
            .await
            .get(namespace)
            .cloned()
            .ok_or_else(|| SchedulerError::not_found("TenantQuotaConfig", namespace))?;

        let lock = self
            .tenant_locks
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let usage = self.observe(namespace, now).await?;
        self.record(namespace, usage.clone()).await;

        let existing = self.quotas.get_quota(namespace).await?;
        let current = Self::enforced_ceiling(&tenant, existing.as_ref());

        let cooldown = tenant
            .rules
            .iter()
            .filter_map(|r| r.cooldown)
            .max()
            .unwrap_or(self.config.default_cooldown);
        if let Some(last) = self.last_adjusted(namespace).await {
            let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
            if elapsed < cooldown {
                debug!(
                    "Quota of {} in cooldown ({:?} of {:?} elapsed)",
                    namespace, elapsed, cooldown
                );
                return Ok(QuotaOutcome {
                    namespace: namespace.to_string(),
                    applied: false,
                    ceiling: current,
                    clamped: false,
                });
            }
        }

        let (proposed, clamped) = Self::propose(&tenant, &usage, current);

        if proposed == current {
            debug!("Quota of {} unchanged at {}", namespace, current);
            return Ok(QuotaOutcome {
                namespace: namespace.to_string(),
                applied: false,
                ceiling: current,
                clamped,
            });
        }

        self.write(namespace, existing, proposed).await?;
        self.state
            .write()
            .await
            .last_adjusted
            .insert(namespace.to_string(), now);

        info!(
            "Adjusted quota of {} from [{}] to [{}]",
            namespace, current, proposed
        );

        Ok(QuotaOutcome {
            namespace: namespace.to_string(),
            applied: true,
            ceiling: proposed,
            clamped,
        })
    }

    /// Sum the requests of the tenant's live pods
    async fn observe(&self, namespace: &str, now: DateTime<Utc>) -> Result<UsageSnapshot> {
        let pods = self
            .units
            .list_units(&UnitFilter::in_namespace(namespace))
            .await?;
        let live: Vec<_> = pods.iter().filter(|p| !p.is_terminal()).collect();
        let requested: ResourceQuantities = live.iter().map(|p| occupant_requests(p)).sum();

        Ok(UsageSnapshot {
            timestamp: now,
            cpu_cores: requested.cpu_millicores as f64 / 1000.0,
            memory_gib: requested.memory_bytes as f64 / GIB,
            pods: live.len() as i64,
        })
    }

    async fn record(&self, namespace: &str, usage: UsageSnapshot) {
        let cutoff = chrono::Duration::from_std(self.config.history_window)
            .ok()
            .and_then(|window| usage.timestamp.checked_sub_signed(window));

        let mut state = self.state.write().await;
        let history = state.history.entry(namespace.to_string()).or_default();
        history.push_back(usage);
        if let Some(cutoff) = cutoff {
            while history.front().is_some_and(|s| s.timestamp < cutoff) {
                history.pop_front();
            }
        }
    }

    /// Ceiling in force: the quota object's limits, else the base
    fn enforced_ceiling(tenant: &TenantQuotaConfig, quota: Option<&ResourceQuota>) -> QuotaCeiling {
        let enforced = quota
            .and_then(|q| q.spec.as_ref())
            .and_then(|s| s.hard.as_ref())
            .map(QuotaCeiling::from_hard)
            .unwrap_or_default();

        let mut current = tenant.base;
        for metric in MetricType::ALL {
            if let Some(value) = enforced.get(metric) {
                current.set(metric, value);
            }
        }
        current
    }

    /// Apply every firing rule to `current`, clamping at max
    fn propose(
        tenant: &TenantQuotaConfig,
        usage: &UsageSnapshot,
        current: QuotaCeiling,
    ) -> (QuotaCeiling, bool) {
        let mut proposed = current;
        let mut clamped = false;

        for rule in &tenant.rules {
            let observed = rule.metric.observe(usage);
            if observed <= rule.threshold {
                continue;
            }

            let wanted = rule.metric.to_ceiling(observed * rule.scale_factor);
            let Some(max) = tenant.max.get(rule.metric) else {
                continue;
            };
            let value = if wanted > max {
                warn!(
                    "Quota of {} clamped: {} wanted {} but max is {}",
                    tenant.namespace,
                    rule.metric.resource_name(),
                    rule.metric.format(wanted).0,
                    rule.metric.format(max).0
                );
                clamped = true;
                max
            } else {
                wanted
            };

            debug!(
                "Rule {} fired for {}: observed {:.2} > {:.2}, limit {}",
                rule.metric,
                tenant.namespace,
                observed,
                rule.threshold,
                rule.metric.format(value).0
            );
            proposed.set(rule.metric, value);
        }

        (proposed, clamped)
    }

    async fn write(
        &self,
        namespace: &str,
        existing: Option<ResourceQuota>,
        ceiling: QuotaCeiling,
    ) -> Result<()> {
        match existing {
            Some(mut quota) => {
                let spec = quota.spec.get_or_insert_with(ResourceQuotaSpec::default);
                ceiling.apply_to(spec.hard.get_or_insert_with(BTreeMap::new));
                self.quotas.update_quota(namespace, quota).await?;
            }
            None => {
                let quota = ResourceQuota {
                    metadata: ObjectMeta {
                        name: Some(DYNAMIC_QUOTA_NAME.to_string()),
                        namespace: Some(namespace.to_string()),
                        ..Default::default()
                    },
                    spec: Some(ResourceQuotaSpec {
                        hard: Some(ceiling.into()),
                        ..Default::default()
                    }),
                    ..Default::default()
                };
                self.quotas.create_quota(namespace, quota).await?;
            }
        }
        Ok(())
    }

    /// Evaluate every tenant once, highest priority first. Stops between
    /// tenants when cancelled.
    pub async fn run_cycle(&self, token: &CancellationToken) -> Vec<QuotaOutcome> {
        let mut tenants: Vec<(i32, String)> = self
            .tenants
            .read()
            .await
            .values()
            .map(|t| (t.priority, t.namespace.clone()))
            .collect();
        tenants.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        let mut outcomes = Vec::new();
        for (_, namespace) in tenants {
            if token.is_cancelled() {
                break;
            }
            match self.tune_quota(&namespace).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!("Quota evaluation for {} failed: {}", namespace, e),
            }
        }
        outcomes
    }

    /// Evaluate all tenants every interval until cancelled
    pub async fn run(&self, token: CancellationToken) {
        info!(
            "Starting quota controller (interval: {:?})",
            self.config.interval
        );

        let mut interval = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Quota controller shutting down");
                    return;
                }
                _ = interval.tick() => {
                    let outcomes = self.run_cycle(&token).await;
                    let applied = outcomes.iter().filter(|o| o.applied).count();
                    debug!("Quota cycle done: {} tenant(s), {} adjusted", outcomes.len(), applied);
                }
            }
        }
    }
}
