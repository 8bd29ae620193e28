use crate::filter::{default_filters, filter_hosts, first_failure, FilterPredicate};
use crate::preemption::{PreemptionConfig, PreemptionEngine};
use crate::retry::RetryPolicy;
use crate::score::{ProfileRegistry, ScoringConfig, GENERAL_PROFILE};
use crate::store::{HostStore, UnitFilter, UnitStore};
use crate::types::{NodeInfo, SchedulingContext};
use crate::{Result, SchedulerError};
use corral_core::{Pod, PodExt, WorkloadKey};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Configuration for the scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Interval between scheduling cycles
    #[serde(with = "humantime_serde")]
    pub schedule_interval: Duration,
    /// Pods evaluated at the same time
    pub max_concurrent: usize,
    /// Profile for pods that name none
    pub default_profile: String,
    pub scoring: ScoringConfig,
    pub preemption: PreemptionConfig,
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            schedule_interval: Duration::from_secs(1),
            max_concurrent: 10,
            default_profile: GENERAL_PROFILE.to_string(),
            scoring: ScoringConfig::default(),
            preemption: PreemptionConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Host chosen by preemption and the pods evicted to make room
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreemptionOutcome {
    pub node_name: String,
    pub victims: Vec<WorkloadKey>,
}

/// What happened to a pod in a scheduling attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ScheduleOutcome {
    Bound(String),
    Preempted(PreemptionOutcome),
    /// Victims of an earlier preemption are still terminating
    AwaitingVictims(PreemptionOutcome),
}

/// Summary of one scheduling cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    /// Pod to node
    pub bound: BTreeMap<String, String>,
    /// Pod to the preemption made on its behalf
    pub preempted: BTreeMap<String, PreemptionOutcome>,
    /// Pods left pending, with the reason
    pub pending: BTreeMap<String, String>,
}

/// Pod scheduler
pub struct Scheduler {
    hosts: Arc<dyn HostStore>,
    units: Arc<dyn UnitStore>,
    config: SchedulerConfig,
    filters: Vec<Box<dyn FilterPredicate>>,
    profiles: ProfileRegistry,
    preemption: PreemptionEngine,
    permits: Arc<Semaphore>,
    host_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Preemptions whose victims may still be terminating, per preemptor
    nominations: DashMap<WorkloadKey, PreemptionOutcome>,
    /// Victim selection sees the evictions of every earlier selection
    preemption_lock: Mutex<()>,
}

impl Scheduler {
    /// Create a new scheduler
    pub fn new(
        hosts: Arc<dyn HostStore>,
        units: Arc<dyn UnitStore>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        config.scoring.validate()?;
        if config.max_concurrent == 0 {
            return Err(SchedulerError::invalid_config(
                "max_concurrent must be at least 1",
                "The default of 10 suits most clusters",
            ));
        }

        let profiles = ProfileRegistry::new(&config.scoring, config.default_profile.clone())?;

        Ok(Self {
            hosts,
            units,
            filters: default_filters(),
            profiles,
            preemption: PreemptionEngine::new(config.preemption.clone()),
            permits: Arc::new(Semaphore::new(config.max_concurrent)),
            host_locks: DashMap::new(),
            nominations: DashMap::new(),
            preemption_lock: Mutex::new(()),
            config,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Hosts joined with the pods bound to them
    pub async fn snapshot(&self) -> Result<Vec<NodeInfo>> {
        let retry = &self.config.retry;
        let nodes = retry
            .execute_with_retry(|| self.hosts.list_hosts())
            .await?;
        let all = UnitFilter::all();
        let pods = retry
            .execute_with_retry(|| self.units.list_units(&all))
            .await?;
        Ok(NodeInfo::snapshot(nodes, pods))
    }

    /// Place a pod on the best feasible host and bind it
    pub async fn schedule(&self, pod: Pod) -> Result<String> {
        let context = SchedulingContext::new(pod)?;
        let nodes = self.snapshot().await?;
        self.schedule_in(&context, &nodes).await
    }

    /// Evict lower-priority pods so that the pod fits somewhere. The pod
    /// itself is not bound; a later attempt places it. While the victims of
    /// an earlier call are still terminating, that preemption is returned
    /// and nothing more is evicted.
    pub async fn preempt(&self, pod: Pod) -> Result<PreemptionOutcome> {
        let context = SchedulingContext::new(pod)?;
        match self.preempt_for(&context, &CancellationToken::new()).await? {
            ScheduleOutcome::Preempted(outcome) | ScheduleOutcome::AwaitingVictims(outcome) => {
                Ok(outcome)
            }
            ScheduleOutcome::Bound(node_name) => Err(SchedulerError::internal_error(format!(
                "preemption bound pod {} to node {}",
                context.key, node_name
            ))),
        }
    }

    /// Preemption recorded for the pod, if any
    pub fn nomination(&self, key: &WorkloadKey) -> Option<PreemptionOutcome> {
        self.nominations.get(key).map(|n| n.value().clone())
    }

    /// Schedule, falling back to preemption when no host passes filtering
    pub async fn schedule_or_preempt(&self, pod: Pod) -> Result<ScheduleOutcome> {
        let context = SchedulingContext::new(pod)?;
        let nodes = self.snapshot().await?;
        self.attempt(&context, &nodes, &CancellationToken::new())
            .await
    }

    async fn attempt(
        &self,
        context: &SchedulingContext,
        nodes: &[NodeInfo],
        token: &CancellationToken,
    ) -> Result<ScheduleOutcome> {
        match self.schedule_in(context, nodes).await {
            Ok(node_name) => Ok(ScheduleOutcome::Bound(node_name)),
            Err(SchedulerError::NoCandidateHosts { reason, .. }) => {
                debug!("Pod {} fits nowhere ({}), trying preemption", context.key, reason);
                self.preempt_for(context, token).await
            }
            Err(e) => Err(e),
        }
    }

    /// Filter, score and bind against the given snapshot
    async fn schedule_in(&self, context: &SchedulingContext, nodes: &[NodeInfo]) -> Result<String> {
        let profile = self.profiles.select(context)?;

        let feasible = filter_hosts(&self.filters, context, nodes);
        if feasible.is_empty() {
            return Err(SchedulerError::no_candidate_hosts(
                context.pod_name(),
                format!("0/{} nodes passed filtering", nodes.len()),
            ));
        }

        debug!(
            "Pod {} has {} feasible nodes, scoring with profile {}",
            context.key,
            feasible.len(),
            profile.name()
        );

        let ranked = profile.score_hosts(context, &feasible);

        for candidate in &ranked {
            match self.bind_to(context, &candidate.node_name).await {
                Ok(()) => {
                    self.nominations.remove(&context.key);
                    info!(
                        "Scheduled pod {} to node {} with score {:.2}",
                        context.key, candidate.node_name, candidate.score
                    );
                    return Ok(candidate.node_name.clone());
                }
                Err(SchedulerError::CapacityConflict { .. }) => {
                    debug!(
                        "Node {} no longer fits pod {}, trying the next one",
                        candidate.node_name, context.key
                    );
                }
                Err(e) => return Err(e),
            }
        }

        let best = ranked
            .first()
            .map(|c| c.node_name.clone())
            .unwrap_or_default();
        Err(SchedulerError::capacity_conflict(context.pod_name(), best))
    }

    fn host_lock(&self, node_name: &str) -> Arc<Mutex<()>> {
        self.host_locks
            .entry(node_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Re-check the host under its lock, then bind
    async fn bind_to(&self, context: &SchedulingContext, node_name: &str) -> Result<()> {
        let lock = self.host_lock(node_name);
        let _guard = lock.lock().await;

        let retry = &self.config.retry;
        let node = match retry.execute_with_retry(|| self.hosts.get_host(node_name)).await {
            Ok(node) => node,
            Err(SchedulerError::NotFound { .. }) => {
                return Err(SchedulerError::capacity_conflict(context.pod_name(), node_name));
            }
            Err(e) => return Err(e),
        };
        let on_node = UnitFilter::on_node(node_name);
        let occupants = retry
            .execute_with_retry(|| self.units.list_units(&on_node))
            .await?;

        let current = NodeInfo::snapshot(vec![node], occupants);
        let Some(current) = current.first() else {
            return Err(SchedulerError::capacity_conflict(context.pod_name(), node_name));
        };

        if let Some((filter, result)) = first_failure(&self.filters, context, current) {
            debug!(
                "Node {} rejected pod {} on re-check by {}: {}",
                node_name,
                context.key,
                filter,
                result.reason.unwrap_or_default()
            );
            return Err(SchedulerError::capacity_conflict(context.pod_name(), node_name));
        }

        retry
            .execute_with_retry(|| self.units.bind(&context.key, node_name))
            .await?;
        Ok(())
    }

    async fn preempt_for(
        &self,
        context: &SchedulingContext,
        token: &CancellationToken,
    ) -> Result<ScheduleOutcome> {
        if let Some(nomination) = self.outstanding_nomination(&context.key).await? {
            debug!(
                "Pod {} waits for {} victim(s) on node {}",
                context.key,
                nomination.victims.len(),
                nomination.node_name
            );
            return Ok(ScheduleOutcome::AwaitingVictims(nomination));
        }

        let outcome = {
            let _guard = self.preemption_lock.lock().await;

            // Victims of earlier selections are terminating by now, which
            // keeps them reserved and out of the eligible set
            let nodes = self.snapshot().await?;
            let candidate = self.preemption.find_preemption(context, &nodes)?;

            info!(
                "Preempting {} pod(s) on node {} for pod {} (priority {})",
                candidate.victims.len(),
                candidate.node_name,
                context.key,
                context.priority
            );

            self.preemption
                .delete_victims(self.units.as_ref(), &candidate)
                .await?;

            let outcome = PreemptionOutcome {
                victims: candidate.victim_keys(),
                node_name: candidate.node_name,
            };
            self.nominations.insert(context.key.clone(), outcome.clone());
            outcome
        };

        self.preemption.settle(token).await;
        Ok(ScheduleOutcome::Preempted(outcome))
    }

    /// The pod's earlier preemption while any of its victims is still
    /// around. A nomination whose victims are all gone is dropped.
    async fn outstanding_nomination(&self, key: &WorkloadKey) -> Result<Option<PreemptionOutcome>> {
        let Some(nomination) = self.nomination(key) else {
            return Ok(None);
        };

        let on_node = UnitFilter::on_node(nomination.node_name.as_str());
        let occupants = self
            .config
            .retry
            .execute_with_retry(|| self.units.list_units(&on_node))
            .await?;

        let remaining = occupants
            .iter()
            .filter(|pod| !pod.is_terminal())
            .filter_map(|pod| pod.workload_key().ok())
            .any(|k| nomination.victims.contains(&k));
        if remaining {
            return Ok(Some(nomination));
        }

        debug!("Victims evicted for pod {} are gone", key);
        self.nominations.remove(key);
        Ok(None)
    }

    /// One scheduling pass over every pending pod, highest priority first.
    ///
    /// Pods are evaluated concurrently against a shared snapshot; binding is
    /// serialized per host. Once cancelled no new pod is started.
    pub async fn schedule_pending(self: &Arc<Self>, token: &CancellationToken) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        let unscheduled = UnitFilter::unscheduled();
        let pending = self
            .config
            .retry
            .execute_with_retry(|| self.units.list_units(&unscheduled))
            .await?;

        let mut contexts = Vec::new();
        for pod in pending {
            if pod.is_terminal() || pod.is_terminating() {
                continue;
            }
            match SchedulingContext::new(pod) {
                Ok(context) => contexts.push(context),
                Err(e) => {
                    warn!("Rejecting pod: {}", e);
                    if let SchedulerError::InvalidUnitSpec { pod_name, reason } = e {
                        report.pending.insert(pod_name, reason);
                    }
                }
            }
        }

        // Pods bound or deleted elsewhere no longer need their nomination
        self.nominations
            .retain(|key, _| contexts.iter().any(|c| &c.key == key));

        if contexts.is_empty() {
            debug!("No unscheduled pods found");
            return Ok(report);
        }

        contexts.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.key.cmp(&b.key)));
        info!("Found {} unscheduled pods", contexts.len());

        let nodes = Arc::new(self.snapshot().await?);
        if nodes.is_empty() {
            warn!("No nodes available for scheduling");
        }

        let mut tasks = JoinSet::new();
        for context in contexts {
            if token.is_cancelled() {
                break;
            }
            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => permit
                    .map_err(|_| SchedulerError::internal_error("scheduler semaphore closed"))?,
            };

            let scheduler = Arc::clone(self);
            let nodes = Arc::clone(&nodes);
            let token = token.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let result = scheduler.attempt(&context, &nodes, &token).await;
                (context.key, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (key, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!("Scheduling task failed: {}", e);
                    continue;
                }
            };

            let pod_name = key.to_string();
            match result {
                Ok(ScheduleOutcome::Bound(node_name)) => {
                    report.bound.insert(pod_name, node_name);
                }
                Ok(ScheduleOutcome::Preempted(outcome)) => {
                    report.preempted.insert(pod_name, outcome);
                }
                Ok(ScheduleOutcome::AwaitingVictims(outcome)) => {
                    let reason = format!(
                        "waiting for {} victim(s) on node {} to terminate",
                        outcome.victims.len(),
                        outcome.node_name
                    );
                    report.pending.insert(pod_name, reason);
                }
                Err(e) => {
                    match &e {
                        SchedulerError::NoPreemptionPossible { .. }
                        | SchedulerError::CapacityConflict { .. } => {
                            debug!("Pod {} stays pending: {}", pod_name, e)
                        }
                        _ => error!("Failed to schedule pod {}: {}", pod_name, e),
                    }
                    report.pending.insert(pod_name, e.to_string());
                }
            }
        }

        info!(
            "Scheduling cycle done: {} bound, {} preempted, {} pending",
            report.bound.len(),
            report.preempted.len(),
            report.pending.len()
        );

        Ok(report)
    }

    /// Run the scheduler loop until cancelled
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        info!(
            "Starting scheduler (interval: {:?}, concurrency: {})",
            self.config.schedule_interval, self.config.max_concurrent
        );

        let mut interval = tokio::time::interval(self.config.schedule_interval);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Scheduler shutting down");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.schedule_pending(&token).await {
                        error!("Scheduling cycle failed: {}", e);
                    }
                }
            }
        }
    }
}
