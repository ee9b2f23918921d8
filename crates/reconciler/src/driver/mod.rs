//! Reconcile driver.
//!
//! A pass walks a collection in order with a bounded worker pool, then
//! prunes what earlier passes managed and the current pass no longer
//! desires. Per-key failures stay in that key's result; only configuration,
//! prune listing and credential rejection fail the pass itself.
//!
//! Every pass draws a generation from a counter. A key acquired by a newer
//! pass is never taken back by an older one, so overlapping passes settle
//! on the newest desired state.

mod inflight;
mod prune;
mod retry;
mod task;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use converge_core::{DesiredResource, ResourceKey};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub use inflight::{InFlightRegistry, Lease};
pub use retry::{RetryPolicy, calculate_backoff};

use crate::client::ClusterClient;
use crate::collection::ResourceCollection;
use crate::config::ReconcilerConfig;
use crate::equality::EqualityRegistry;
use crate::error::{Error, Result};
use crate::rollout;
use crate::shutdown::PassCancellation;
use crate::sink::{ReconcileSink, TracingSink};
use crate::types::{Outcome, PassSummary, ReconcileResult};
use task::{Abort, ApplyTask, Runner, TaskContext, TaskReport};

/// Converges cluster state toward desired collections.
pub struct Reconciler {
    client: Arc<dyn ClusterClient>,
    registry: Arc<EqualityRegistry>,
    sink: Arc<dyn ReconcileSink>,
    config: ReconcilerConfig,
    retry: RetryPolicy,
    in_flight: Arc<InFlightRegistry>,
    generations: AtomicU64,
    /// Keys managed by earlier passes, the base for pruning.
    inventory: Mutex<Inventory>,
}

#[derive(Debug, Default)]
struct Inventory {
    keys: BTreeSet<ResourceKey>,
    /// Generation of the pass that last replaced `keys`.
    generation: u64,
}

/// One desired resource scheduled in a stage.
struct Job<'a> {
    desired: &'a DesiredResource,
    forced: bool,
}

impl<'a> Job<'a> {
    const fn plain(desired: &'a DesiredResource) -> Self {
        Self {
            desired,
            forced: false,
        }
    }

    const fn forced(desired: &'a DesiredResource) -> Self {
        Self {
            desired,
            forced: true,
        }
    }
}

impl Reconciler {
    /// Create a new reconciler.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `config` fails validation.
    pub fn new(
        client: Arc<dyn ClusterClient>,
        registry: EqualityRegistry,
        sink: Arc<dyn ReconcileSink>,
        config: ReconcilerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let retry = RetryPolicy::from(&config.retry);
        Ok(Self {
            client,
            registry: Arc::new(registry),
            sink,
            config,
            retry,
            in_flight: Arc::new(InFlightRegistry::new()),
            generations: AtomicU64::new(0),
            inventory: Mutex::new(Inventory::default()),
        })
    }

    pub fn builder() -> ReconcilerBuilder {
        ReconcilerBuilder::new()
    }

    /// Run one pass over `collection`.
    ///
    /// # Errors
    ///
    /// See [`Reconciler::reconcile_staged`].
    pub async fn reconcile(&self, collection: &ResourceCollection) -> Result<PassSummary> {
        self.reconcile_with_cancellation(collection, &PassCancellation::new())
            .await
    }

    /// Run one pass over `collection` that stops early once `cancellation`
    /// fires.
    ///
    /// # Errors
    ///
    /// See [`Reconciler::reconcile_staged`].
    pub async fn reconcile_with_cancellation(
        &self,
        collection: &ResourceCollection,
        cancellation: &PassCancellation,
    ) -> Result<PassSummary> {
        self.reconcile_staged(std::slice::from_ref(collection), cancellation)
            .await
    }

    /// Run one pass over several collections in sequence. Every task of a
    /// stage is terminal before the next stage starts; pruning runs once at
    /// the end against the union of all stages.
    ///
    /// With `rollout_on_config_change` set, a ConfigMap or Secret updated by
    /// the pass forces an update of the desired workloads that mount it,
    /// both in later stages and in the stages already run.
    ///
    /// # Errors
    ///
    /// - `Document(DuplicateResource)` if two stages share a key
    /// - `ListFailed` if a prune kind cannot be listed
    /// - `Unauthorized` if credentials were rejected and
    ///   `abort_on_unauthorized` is set
    pub async fn reconcile_staged(
        &self,
        stages: &[ResourceCollection],
        cancellation: &PassCancellation,
    ) -> Result<PassSummary> {
        let started = Instant::now();
        let desired = desired_keys(stages)?;
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        info!(
            generation,
            stages = stages.len(),
            resources = desired.len(),
            max_concurrency = self.config.max_concurrency,
            "Starting reconciliation pass"
        );

        let abort = Abort::default();
        let ctx = self.context(cancellation, &abort, generation);
        let mut results = Vec::new();
        let mut superseded = Vec::new();
        let mut changed = BTreeMap::new();

        for (index, stage) in stages.iter().enumerate() {
            debug!(stage = index, resources = stage.len(), "Starting stage");
            let rolled = self.rollouts(stage, &changed);
            let jobs = stage
                .iter()
                .map(|desired| rolled.get(desired.key()).map_or(Job::plain(desired), Job::forced))
                .collect();
            let reports = self.apply_stage(&ctx, jobs).await;
            let updated = updated_sources(&reports, stage);
            record(reports, &mut results, &mut superseded);
            if let Some(err) = abort.error() {
                return Err(self.aborted(&desired, generation, err).await);
            }
            if updated.is_empty() {
                continue;
            }

            let run = stages.iter().take(index.saturating_add(1)).flatten();
            let rolled = self.rollouts(run, &updated);
            if !rolled.is_empty() {
                let jobs = rolled.values().map(Job::forced).collect();
                let reports = self.apply_stage(&ctx, jobs).await;
                record_replacing(reports, &mut results, &mut superseded);
                if let Some(err) = abort.error() {
                    return Err(self.aborted(&desired, generation, err).await);
                }
            }
            changed.extend(updated);
        }

        let cancelled = cancellation.is_cancelled();
        if cancelled {
            info!("Pass cancelled, skipping prune");
            self.remember(&desired).await;
        } else if !self.config.prune.enabled {
            self.remember(&desired).await;
        } else {
            let mut inventory = self.inventory.lock().await;
            let candidates = match prune::candidates(
                &ctx,
                &inventory.keys,
                &desired,
                &self.config.prune.kinds,
            )
            .await
            {
                Ok(candidates) => candidates,
                Err(err) => {
                    warn!(error = %err, "Prune listing failed");
                    inventory.keys.extend(desired.iter().map(|key| (*key).clone()));
                    return Err(err);
                }
            };
            debug!(candidates = candidates.len(), "Pruning");

            let reports = self.prune_stage(&ctx, candidates).await;
            let retained: Vec<ResourceKey> = reports
                .iter()
                .filter(|report| prune::keeps_in_inventory(report))
                .map(|report| report.key().clone())
                .collect();
            record(reports, &mut results, &mut superseded);

            if let Some(err) = abort.error() {
                error!(error = %err, "Aborting reconciliation pass");
                inventory.keys.extend(desired.iter().map(|key| (*key).clone()));
                return Err(err);
            }
            let managed = desired.iter().map(|key| (*key).clone()).chain(retained);
            if generation >= inventory.generation {
                inventory.keys = managed.collect();
                inventory.generation = generation;
            } else {
                debug!(generation, newest = inventory.generation, "Older pass keeps newer inventory");
                inventory.keys.extend(managed);
            }
        }

        let cancelled = cancelled || cancellation.is_cancelled();
        let summary = PassSummary::new(results, superseded, cancelled, started.elapsed());
        self.sink.on_summary(&summary);
        info!(
            converged = summary.converged(),
            writes = summary.counts.writes(),
            failed = summary.counts.failed,
            elapsed_ms = u64::try_from(summary.elapsed.as_millis()).unwrap_or(u64::MAX),
            "Finished reconciliation pass"
        );
        Ok(summary)
    }

    /// Keys managed by earlier passes.
    pub async fn inventory(&self) -> BTreeSet<ResourceKey> {
        self.inventory.lock().await.keys.clone()
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub fn registry(&self) -> &EqualityRegistry {
        &self.registry
    }

    fn context<'a>(
        &'a self,
        cancellation: &'a PassCancellation,
        abort: &'a Abort,
        generation: u64,
    ) -> TaskContext<'a> {
        TaskContext {
            client: self.client.as_ref(),
            registry: self.registry.as_ref(),
            sink: self.sink.as_ref(),
            retry: &self.retry,
            request_timeout: self.config.request_timeout,
            cancellation,
            abort,
            abort_on_unauthorized: self.config.abort_on_unauthorized,
            generation,
        }
    }

    /// Stamped copies of the workloads among `candidates` that mount a
    /// source in `changed`, keyed by workload.
    fn rollouts<'a, I>(
        &self,
        candidates: I,
        changed: &BTreeMap<ResourceKey, DesiredResource>,
    ) -> BTreeMap<ResourceKey, DesiredResource>
    where
        I: IntoIterator<Item = &'a DesiredResource>,
    {
        if !self.config.rollout_on_config_change {
            return BTreeMap::new();
        }
        let rolled: BTreeMap<_, _> = rollout::plan(candidates, changed)
            .into_iter()
            .map(|workload| (workload.key().clone(), workload))
            .collect();
        if !rolled.is_empty() {
            info!(
                workloads = rolled.len(),
                sources = changed.len(),
                "Rolling workloads that mount changed configuration"
            );
        }
        rolled
    }

    async fn apply_stage<'a>(&'a self, ctx: &'a TaskContext<'a>, jobs: Vec<Job<'a>>) -> Vec<TaskReport> {
        let tasks = jobs
            .into_iter()
            .map(|job| self.apply_one(ctx, job).boxed())
            .collect();
        self.drain(tasks).await
    }

    async fn apply_one<'a>(&'a self, ctx: &'a TaskContext<'a>, job: Job<'a>) -> TaskReport {
        let key = job.desired.key();
        let Some(lease) = self.in_flight.acquire(key, ctx.generation).await else {
            return TaskReport::Superseded(key.clone());
        };
        let task = ApplyTask::new(ctx, job.desired, lease);
        if job.forced {
            task.forced().run().await
        } else {
            task.run().await
        }
    }

    async fn prune_stage<'a>(
        &'a self,
        ctx: &'a TaskContext<'a>,
        candidates: BTreeSet<ResourceKey>,
    ) -> Vec<TaskReport> {
        let tasks = candidates
            .into_iter()
            .map(|key| self.prune_one(ctx, key).boxed())
            .collect();
        self.drain(tasks).await
    }

    async fn prune_one<'a>(&'a self, ctx: &'a TaskContext<'a>, key: ResourceKey) -> TaskReport {
        let Some(lease) = self.in_flight.acquire(&key, ctx.generation).await else {
            return TaskReport::Superseded(key);
        };
        prune::PruneTask::new(Runner::new(ctx, lease)).run().await
    }

    /// Run `tasks` at most `max_concurrency` at a time, reporting each as it
    /// settles.
    async fn drain(&self, tasks: Vec<BoxFuture<'_, TaskReport>>) -> Vec<TaskReport> {
        let mut reports = Vec::with_capacity(tasks.len());
        let mut running = stream::iter(tasks).buffer_unordered(self.config.max_concurrency);
        while let Some(report) = running.next().await {
            self.emit(&report);
            reports.push(report);
        }
        reports
    }

    fn emit(&self, report: &TaskReport) {
        match report {
            TaskReport::Finished(result) => self.sink.on_result(result),
            TaskReport::Superseded(key) => self.sink.on_superseded(key),
            TaskReport::Skipped(_) => {}
        }
    }

    async fn remember(&self, desired: &HashSet<&ResourceKey>) {
        self.inventory
            .lock()
            .await
            .keys
            .extend(desired.iter().map(|key| (*key).clone()));
    }

    async fn aborted(&self, desired: &HashSet<&ResourceKey>, generation: u64, err: Error) -> Error {
        error!(generation, error = %err, "Aborting reconciliation pass");
        self.remember(desired).await;
        err
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn record(
    reports: Vec<TaskReport>,
    results: &mut Vec<ReconcileResult>,
    superseded: &mut Vec<ResourceKey>,
) {
    for report in reports {
        match report {
            TaskReport::Finished(result) => results.push(result),
            TaskReport::Superseded(key) => superseded.push(key),
            TaskReport::Skipped(_) => {}
        }
    }
}

/// Replace earlier reports for the same keys with `reports`.
fn record_replacing(
    reports: Vec<TaskReport>,
    results: &mut Vec<ReconcileResult>,
    superseded: &mut Vec<ResourceKey>,
) {
    let keys: HashSet<&ResourceKey> = reports.iter().map(TaskReport::key).collect();
    results.retain(|result| !keys.contains(&result.key));
    superseded.retain(|key| !keys.contains(key));
    record(reports, results, superseded);
}

/// ConfigMaps and Secrets of `stage` the reports show as updated.
fn updated_sources(
    reports: &[TaskReport],
    stage: &ResourceCollection,
) -> BTreeMap<ResourceKey, DesiredResource> {
    reports
        .iter()
        .filter_map(|report| match report {
            TaskReport::Finished(result)
                if matches!(result.outcome, Outcome::Updated)
                    && rollout::is_volume_source(&result.key) =>
            {
                stage.get(&result.key)
            }
            _ => None,
        })
        .map(|source| (source.key().clone(), source.clone()))
        .collect()
}

fn desired_keys(stages: &[ResourceCollection]) -> Result<HashSet<&ResourceKey>> {
    let mut keys = HashSet::new();
    for key in stages.iter().flat_map(ResourceCollection::keys) {
        if !keys.insert(key) {
            return Err(converge_core::Error::duplicate_resource(key.clone()).into());
        }
    }
    Ok(keys)
}

/// Builder for [`Reconciler`].
pub struct ReconcilerBuilder {
    client: Option<Arc<dyn ClusterClient>>,
    registry: Option<EqualityRegistry>,
    sink: Option<Arc<dyn ReconcileSink>>,
    config: ReconcilerConfig,
}

impl ReconcilerBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            client: None,
            registry: None,
            sink: None,
            config: ReconcilerConfig::default(),
        }
    }

    /// Set the cluster client.
    #[must_use]
    pub fn with_client(mut self, client: Arc<dyn ClusterClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Set the equality registry. Defaults to [`EqualityRegistry::standard`].
    #[must_use]
    pub fn with_registry(mut self, registry: EqualityRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the sink. Defaults to [`TracingSink`].
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ReconcileSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Set the configuration.
    #[must_use]
    pub fn with_config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set max concurrent tasks.
    #[must_use]
    pub const fn max_concurrency(mut self, max: usize) -> Self {
        self.config.max_concurrency = max;
        self
    }

    /// Build the reconciler.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` without a client or with an invalid config.
    pub fn build(self) -> Result<Reconciler> {
        let client = self
            .client
            .ok_or_else(|| Error::invalid_config("Cluster client is required"))?;
        let registry = self.registry.unwrap_or_else(EqualityRegistry::standard);
        let sink = self.sink.unwrap_or_else(|| Arc::new(TracingSink));
        Reconciler::new(client, registry, sink, self.config)
    }
}

impl Default for ReconcilerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
