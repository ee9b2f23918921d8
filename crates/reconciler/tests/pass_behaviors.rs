//! Pass-level behaviors: idempotence, pruning, failure escalation,
//! cancellation, supersession and staging.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use converge_core::{
    DesiredResource, ExistingResource, KindRef, MANAGED_ANNOTATION, Management, ResourceKey,
};
use converge_reconciler::{
    ApiError, ApiResult, ClusterClient, Error, FailureKind, InMemoryCluster, MemorySink, Operation,
    Outcome, PassCancellation, ROLLOUT_ENV, ReconcileSink, Reconciler, ReconcilerConfig,
    ResourceCollection,
};

use common::{Harness, collection, configmap, configmap_key, fast_config, owned, resource};

fn failure_kind(outcome: Option<&Outcome>) -> Option<FailureKind> {
    outcome.and_then(Outcome::failure).map(|f| f.kind)
}

// ============================================================================
// IDEMPOTENCE
// ============================================================================

#[tokio::test]
async fn second_pass_over_converged_cluster_writes_nothing() -> anyhow::Result<()> {
    let harness = Harness::new(fast_config())?;
    let desired = collection([
        resource(r#"{"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "x", "labels": {"team": "core"}}}"#)?,
        configmap("x", "settings", "1"),
        resource(
            r#"{"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "creds", "namespace": "x"},
                "data": {"token": "c2VjcmV0"}}"#,
        )?,
        resource(
            r#"{"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "web", "namespace": "x"},
                "spec": {"template": {"spec": {"containers": [{"name": "web", "image": "web:1",
                "env": [{"name": "EMPTY", "value": ""}]}]}}}}"#,
        )?,
        resource(
            r#"{"apiVersion": "v1", "kind": "Service", "metadata": {"name": "web", "namespace": "x"},
                "spec": {"ports": [{"port": 80}]}}"#,
        )?,
    ])?;

    let first = harness.reconciler.reconcile(&desired).await?;
    assert_eq!(first.counts.created, 5);
    let writes_after_first = harness.cluster.write_calls().await;

    let second = harness.reconciler.reconcile(&desired).await?;

    assert_eq!(second.counts.noop, 5);
    assert!(second.converged());
    assert_eq!(harness.cluster.write_calls().await, writes_after_first);
    Ok(())
}

// ============================================================================
// PRUNING
// ============================================================================

#[tokio::test]
async fn key_dropped_from_desired_is_deleted_exactly_once() -> anyhow::Result<()> {
    let harness = Harness::new(fast_config())?;
    let dropped = configmap_key("x", "b");

    harness
        .reconciler
        .reconcile(&collection([configmap("x", "a", "1"), configmap("x", "b", "1")])?)
        .await?;
    assert!(harness.reconciler.inventory().await.contains(&dropped));

    // WHEN: `b` leaves the desired state
    let second = harness
        .reconciler
        .reconcile(&collection([configmap("x", "a", "1")])?)
        .await?;
    let third = harness
        .reconciler
        .reconcile(&collection([configmap("x", "a", "1")])?)
        .await?;

    // THEN
    assert_eq!(second.outcome_for(&dropped), Some(&Outcome::Deleted));
    assert!(third.outcome_for(&dropped).is_none());
    assert!(third.converged());
    assert_eq!(harness.cluster.calls_for(Operation::Delete, &dropped).await, 1);
    assert!(!harness.cluster.contains(&dropped).await);
    assert!(!harness.reconciler.inventory().await.contains(&dropped));
    Ok(())
}

#[tokio::test]
async fn protected_objects_survive_pruning() -> anyhow::Result<()> {
    let harness = Harness::new(fast_config())?;
    let kept = configmap_key("x", "keep");
    let protected = DesiredResource::new(configmap("x", "keep", "1"))
        .with_management(Management::Protected);

    harness
        .reconciler
        .reconcile(&collection([configmap("x", "a", "1"), protected.into_resource()])?)
        .await?;
    let summary = harness
        .reconciler
        .reconcile(&collection([configmap("x", "a", "1")])?)
        .await?;

    assert!(summary.outcome_for(&kept).is_none());
    assert_eq!(harness.cluster.calls_for(Operation::Delete, &kept).await, 0);
    assert!(harness.cluster.contains(&kept).await);
    Ok(())
}

#[tokio::test]
async fn prune_candidate_already_gone_counts_as_deleted() -> anyhow::Result<()> {
    let harness = Harness::new(fast_config())?;
    let gone = configmap_key("x", "b");
    harness
        .reconciler
        .reconcile(&collection([configmap("x", "a", "1"), configmap("x", "b", "1")])?)
        .await?;

    // GIVEN: someone else removed `b` between passes
    harness.cluster.delete(&gone).await?;

    // WHEN
    let summary = harness
        .reconciler
        .reconcile(&collection([configmap("x", "a", "1")])?)
        .await?;

    // THEN: reported like a delete, without issuing one
    assert_eq!(summary.outcome_for(&gone), Some(&Outcome::Deleted));
    assert_eq!(summary.counts.deleted, 1);
    assert!(summary.converged());
    assert_eq!(harness.cluster.calls_for(Operation::Delete, &gone).await, 1);
    assert!(!harness.reconciler.inventory().await.contains(&gone));
    Ok(())
}

#[tokio::test]
async fn listed_prune_kinds_delete_only_our_orphans() -> anyhow::Result<()> {
    let config = fast_config().prune_kind(KindRef::new("v1", "ConfigMap"));
    let harness = Harness::new(config)?;
    let orphan = configmap_key("x", "orphan");
    let foreign = configmap_key("x", "foreign");
    let owned_elsewhere = configmap_key("x", "child");

    harness.cluster.seed(owned(configmap("x", "orphan", "1"))).await;
    harness.cluster.seed(configmap("x", "foreign", "1")).await;
    let mut child = owned(configmap("x", "child", "1"));
    child
        .metadata_mut()
        .owner_references
        .push(converge_core::from_json_str(r#"{"kind": "Deployment", "name": "web"}"#)?);
    harness.cluster.seed(child).await;

    let summary = harness
        .reconciler
        .reconcile(&collection([configmap("x", "a", "1")])?)
        .await?;

    assert_eq!(summary.outcome_for(&orphan), Some(&Outcome::Deleted));
    assert!(harness.cluster.contains(&foreign).await);
    assert!(harness.cluster.contains(&owned_elsewhere).await);
    assert_eq!(harness.cluster.calls(Operation::Delete).await, 1);
    Ok(())
}

#[tokio::test]
async fn terminating_objects_are_not_deleted_again() -> anyhow::Result<()> {
    let harness = Harness::new(fast_config())?;
    let key = configmap_key("x", "b");
    harness
        .reconciler
        .reconcile(&collection([configmap("x", "b", "1")])?)
        .await?;
    if let Some(mut live) = harness.cluster.object(&key).await {
        live.metadata_mut().deletion_timestamp = Some("2024-01-02T00:00:00Z".to_string());
        harness.cluster.seed(live).await;
    }

    harness
        .reconciler
        .reconcile(&ResourceCollection::new())
        .await?;

    assert_eq!(harness.cluster.calls_for(Operation::Delete, &key).await, 0);
    Ok(())
}

#[tokio::test]
async fn failed_delete_is_retried_next_pass() -> anyhow::Result<()> {
    let harness = Harness::new(fast_config())?;
    let key = configmap_key("x", "b");
    harness
        .reconciler
        .reconcile(&collection([configmap("x", "b", "1")])?)
        .await?;
    harness
        .cluster
        .fail_next(Operation::Delete, &key, ApiError::Forbidden("no delete".into()))
        .await;

    let second = harness.reconciler.reconcile(&ResourceCollection::new()).await?;
    let third = harness.reconciler.reconcile(&ResourceCollection::new()).await?;

    assert_eq!(failure_kind(second.outcome_for(&key)), Some(FailureKind::Forbidden));
    assert_eq!(third.outcome_for(&key), Some(&Outcome::Deleted));
    Ok(())
}

#[tokio::test]
async fn prune_disabled_keeps_everything() -> anyhow::Result<()> {
    let harness = Harness::new(fast_config().prune_enabled(false))?;
    harness
        .reconciler
        .reconcile(&collection([configmap("x", "b", "1")])?)
        .await?;
    harness.reconciler.reconcile(&ResourceCollection::new()).await?;

    assert_eq!(harness.cluster.calls(Operation::Delete).await, 0);
    assert!(harness.cluster.contains(&configmap_key("x", "b")).await);
    Ok(())
}

#[tokio::test]
async fn list_failure_fails_the_pass() -> anyhow::Result<()> {
    let kind = KindRef::new("v1", "ConfigMap");
    let harness = Harness::new(fast_config().prune_kind(kind.clone()))?;
    harness
        .cluster
        .fail_list(&kind, ApiError::Unavailable("apiserver restarting".into()))
        .await;

    let result = harness
        .reconciler
        .reconcile(&collection([configmap("x", "a", "1")])?)
        .await;

    assert!(matches!(result, Err(Error::ListFailed { .. })));
    assert!(harness.cluster.contains(&configmap_key("x", "a")).await);
    Ok(())
}

// ============================================================================
// FAILURES
// ============================================================================

#[tokio::test]
async fn transient_errors_exhaust_the_attempt_budget() -> anyhow::Result<()> {
    let harness = Harness::new(fast_config().max_attempts(3))?;
    let key = configmap_key("x", "a");
    harness
        .cluster
        .fail_times(Operation::Get, &key, ApiError::Unavailable("503".into()), 3)
        .await;

    let summary = harness
        .reconciler
        .reconcile(&collection([configmap("x", "a", "1")])?)
        .await?;

    assert_eq!(
        failure_kind(summary.outcome_for(&key)),
        Some(FailureKind::RetriesExhausted)
    );
    assert_eq!(summary.result_for(&key).map(|r| r.attempts), Some(3));
    assert_eq!(harness.cluster.calls_for(Operation::Get, &key).await, 3);
    assert_eq!(harness.cluster.calls(Operation::Create).await, 0);
    Ok(())
}

#[tokio::test]
async fn slow_calls_time_out_as_transient_errors() -> anyhow::Result<()> {
    let cluster = InMemoryCluster::new().with_latency(Duration::from_millis(200));
    let config = fast_config()
        .max_attempts(2)
        .request_timeout(Duration::from_millis(10));
    let harness = Harness::with_cluster(cluster, config)?;
    let key = configmap_key("x", "a");

    let summary = harness
        .reconciler
        .reconcile(&collection([configmap("x", "a", "1")])?)
        .await?;

    let failure = summary.outcome_for(&key).and_then(Outcome::failure);
    assert_eq!(failure.map(|f| f.kind), Some(FailureKind::RetriesExhausted));
    assert!(failure.is_some_and(|f| f.message.contains("timed out")));
    Ok(())
}

#[tokio::test]
async fn create_racing_another_writer_refetches_once() -> anyhow::Result<()> {
    let harness = Harness::new(fast_config())?;
    let key = configmap_key("x", "a");
    harness
        .cluster
        .fail_next(Operation::Create, &key, ApiError::already_exists(&key))
        .await;

    let summary = harness
        .reconciler
        .reconcile(&collection([configmap("x", "a", "1")])?)
        .await?;

    assert_eq!(summary.outcome_for(&key), Some(&Outcome::Created));
    assert_eq!(harness.cluster.calls_for(Operation::Get, &key).await, 2);
    assert_eq!(harness.cluster.calls_for(Operation::Create, &key).await, 2);
    Ok(())
}

#[tokio::test]
async fn repeated_already_exists_is_a_conflict() -> anyhow::Result<()> {
    let harness = Harness::new(fast_config())?;
    let key = configmap_key("x", "a");
    harness
        .cluster
        .fail_times(Operation::Create, &key, ApiError::already_exists(&key), 2)
        .await;

    let summary = harness
        .reconciler
        .reconcile(&collection([configmap("x", "a", "1")])?)
        .await?;

    assert_eq!(failure_kind(summary.outcome_for(&key)), Some(FailureKind::Conflict));
    Ok(())
}

#[tokio::test]
async fn validation_rejection_is_not_retried() -> anyhow::Result<()> {
    let harness = Harness::new(fast_config())?;
    let key = configmap_key("x", "a");
    harness.cluster.seed(owned(configmap("x", "a", "old"))).await;
    harness
        .cluster
        .fail_next(Operation::Update, &key, ApiError::Invalid("data.value: too long".into()))
        .await;

    let summary = harness
        .reconciler
        .reconcile(&collection([configmap("x", "a", "new")])?)
        .await?;

    assert_eq!(failure_kind(summary.outcome_for(&key)), Some(FailureKind::Invalid));
    assert_eq!(harness.cluster.calls_for(Operation::Update, &key).await, 1);
    Ok(())
}

#[tokio::test]
async fn rejected_credentials_abort_the_pass() -> anyhow::Result<()> {
    let harness = Harness::new(fast_config())?;
    let key = configmap_key("x", "a");
    harness
        .cluster
        .fail_next(Operation::Get, &key, ApiError::Unauthorized("token expired".into()))
        .await;

    let result = harness
        .reconciler
        .reconcile(&collection([configmap("x", "a", "1")])?)
        .await;

    match result {
        Err(Error::Unauthorized { key: failed, .. }) => assert_eq!(failed, key),
        other => anyhow::bail!("expected an unauthorized abort, got {other:?}"),
    }
    assert!(harness.sink.summaries().is_empty());
    assert_eq!(
        harness.sink.results().first().and_then(|r| r.outcome.failure()).map(|f| f.kind),
        Some(FailureKind::Unauthorized)
    );
    Ok(())
}

#[tokio::test]
async fn rejected_credentials_stay_per_key_when_not_escalated() -> anyhow::Result<()> {
    let harness = Harness::new(fast_config().abort_on_unauthorized(false))?;
    let key = configmap_key("x", "a");
    harness
        .cluster
        .fail_next(Operation::Get, &key, ApiError::Unauthorized("token expired".into()))
        .await;

    let summary = harness
        .reconciler
        .reconcile(&collection([configmap("x", "a", "1"), configmap("x", "b", "1")])?)
        .await?;

    assert_eq!(failure_kind(summary.outcome_for(&key)), Some(FailureKind::Unauthorized));
    assert_eq!(summary.outcome_for(&configmap_key("x", "b")), Some(&Outcome::Created));
    Ok(())
}

// ============================================================================
// CANCELLATION AND SUPERSESSION
// ============================================================================

#[tokio::test]
async fn cancelled_pass_settles_every_key_and_skips_prune() -> anyhow::Result<()> {
    let harness = Harness::new(fast_config())?;
    harness
        .reconciler
        .reconcile(&collection([configmap("x", "old", "1")])?)
        .await?;

    let cancellation = PassCancellation::new();
    cancellation.cancel();
    let summary = harness
        .reconciler
        .reconcile_with_cancellation(&collection([configmap("x", "a", "1")])?, &cancellation)
        .await?;

    assert!(summary.cancelled);
    assert!(!summary.converged());
    let result = summary.result_for(&configmap_key("x", "a"));
    assert_eq!(failure_kind(result.map(|r| &r.outcome)), Some(FailureKind::Cancelled));
    assert_eq!(result.map(|r| r.attempts), Some(0));
    assert!(harness.cluster.contains(&configmap_key("x", "old")).await);
    assert!(harness.reconciler.inventory().await.contains(&configmap_key("x", "old")));
    Ok(())
}

#[tokio::test]
async fn cancellation_interrupts_backoff() -> anyhow::Result<()> {
    let harness = Harness::new(
        ReconcilerConfig::default()
            .backoff(10_000, 10_000)
            .jitter(false),
    )?;
    let key = configmap_key("x", "a");
    harness
        .cluster
        .fail_next(Operation::Get, &key, ApiError::RateLimited("slow down".into()))
        .await;

    let cancellation = PassCancellation::new();
    let trigger = cancellation.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let desired = collection([configmap("x", "a", "1")])?;
    let summary = tokio::time::timeout(
        Duration::from_secs(5),
        harness.reconciler.reconcile_with_cancellation(&desired, &cancellation),
    )
    .await??;

    assert_eq!(failure_kind(summary.outcome_for(&key)), Some(FailureKind::Cancelled));
    assert_eq!(harness.cluster.calls_for(Operation::Get, &key).await, 1);
    Ok(())
}

#[tokio::test]
async fn newer_pass_supersedes_in_flight_task() -> anyhow::Result<()> {
    let cluster = Arc::new(InMemoryCluster::new().with_latency(Duration::from_millis(100)));
    let sink = Arc::new(MemorySink::new());
    let reconciler = Arc::new(
        Reconciler::builder()
            .with_client(Arc::clone(&cluster) as Arc<dyn ClusterClient>)
            .with_sink(Arc::clone(&sink) as Arc<dyn ReconcileSink>)
            .with_config(fast_config())
            .build()?,
    );
    let key = configmap_key("x", "a");

    let older = {
        let reconciler = Arc::clone(&reconciler);
        let desired = collection([configmap("x", "a", "old")])?;
        tokio::spawn(async move { reconciler.reconcile(&desired).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let newer = reconciler
        .reconcile(&collection([configmap("x", "a", "new")])?)
        .await?;
    let older = older.await??;

    assert_eq!(older.superseded, vec![key.clone()]);
    assert!(older.result_for(&key).is_none());
    assert_eq!(newer.outcome_for(&key), Some(&Outcome::Created));
    assert_eq!(cluster.calls_for(Operation::Create, &key).await, 1);
    let value = cluster
        .object(&key)
        .await
        .and_then(|r| r.field("data").and_then(|d| d.get("value")).cloned());
    assert_eq!(value, Some(converge_core::Value::from("new")));
    assert_eq!(sink.superseded(), vec![key]);
    Ok(())
}

#[tokio::test]
async fn older_pass_reaching_a_key_late_does_not_override_newer_pass() -> anyhow::Result<()> {
    // GIVEN: one worker per pass, so the older pass reaches `k` only after `slow`
    let harness = Harness::with_cluster(
        InMemoryCluster::new().with_latency(Duration::from_millis(50)),
        fast_config().max_concurrency(1),
    )?;
    let key = configmap_key("x", "k");
    let older_desired = collection([configmap("x", "slow", "1"), configmap("x", "k", "old")])?;
    let newer_desired = collection([configmap("x", "k", "new")])?;

    // WHEN: the newer pass starts while the older one is still on `slow`
    let (older, newer) = tokio::join!(harness.reconciler.reconcile(&older_desired), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        harness.reconciler.reconcile(&newer_desired).await
    });
    let (older, newer) = (older?, newer?);

    // THEN: the older pass gave `k` up instead of taking it back
    assert_eq!(newer.outcome_for(&key), Some(&Outcome::Created));
    assert!(newer.superseded.is_empty());
    assert_eq!(older.superseded, vec![key.clone()]);
    assert!(older.result_for(&key).is_none());
    assert_eq!(older.outcome_for(&configmap_key("x", "slow")), Some(&Outcome::Created));
    assert_eq!(harness.cluster.calls_for(Operation::Create, &key).await, 1);
    let value = harness
        .cluster
        .object(&key)
        .await
        .and_then(|r| r.field("data").and_then(|d| d.get("value")).cloned());
    assert_eq!(value, Some(converge_core::Value::from("new")));
    Ok(())
}

// ============================================================================
// STAGES AND CONCURRENCY
// ============================================================================

#[tokio::test]
async fn stages_run_in_order_and_prune_once() -> anyhow::Result<()> {
    let harness = Harness::new(fast_config())?;
    let namespace = resource(r#"{"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "x"}}"#)?;
    let stages = vec![
        collection([namespace.clone()])?,
        collection([configmap("x", "a", "1"), configmap("x", "b", "1")])?,
    ];

    let first = harness
        .reconciler
        .reconcile_staged(&stages, &PassCancellation::new())
        .await?;
    assert_eq!(
        first.results.first().map(|r| &r.key),
        Some(&ResourceKey::cluster("v1", "Namespace", "x"))
    );
    assert_eq!(first.counts.created, 3);

    let stages = vec![collection([namespace])?, collection([configmap("x", "a", "1")])?];
    let second = harness
        .reconciler
        .reconcile_staged(&stages, &PassCancellation::new())
        .await?;

    assert_eq!(second.counts.noop, 2);
    assert_eq!(second.counts.deleted, 1);
    assert_eq!(second.outcome_for(&configmap_key("x", "b")), Some(&Outcome::Deleted));
    Ok(())
}

/// Tracks the peak number of concurrent calls.
struct ConcurrencyGauge {
    inner: InMemoryCluster,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyGauge {
    async fn observe<T>(&self, call: impl std::future::Future<Output = ApiResult<T>>) -> ApiResult<T> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let result = call.await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl ClusterClient for ConcurrencyGauge {
    async fn get(&self, key: &ResourceKey) -> ApiResult<ExistingResource> {
        self.observe(self.inner.get(key)).await
    }

    async fn create(&self, desired: &DesiredResource) -> ApiResult<ExistingResource> {
        self.observe(self.inner.create(desired)).await
    }

    async fn update(
        &self,
        desired: &DesiredResource,
        resource_version: Option<&str>,
    ) -> ApiResult<ExistingResource> {
        self.observe(self.inner.update(desired, resource_version)).await
    }

    async fn delete(&self, key: &ResourceKey) -> ApiResult<()> {
        self.observe(self.inner.delete(key)).await
    }

    async fn list(&self, api_version: &str, kind: &str) -> ApiResult<Vec<ExistingResource>> {
        self.inner.list(api_version, kind).await
    }
}

#[tokio::test]
async fn worker_pool_respects_max_concurrency() -> anyhow::Result<()> {
    let gauge = Arc::new(ConcurrencyGauge {
        inner: InMemoryCluster::new(),
        current: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let reconciler = Reconciler::builder()
        .with_client(Arc::clone(&gauge) as Arc<dyn ClusterClient>)
        .with_config(fast_config().max_concurrency(2))
        .build()?;
    let desired = collection((0..6).map(|i| configmap("x", &format!("cm-{i}"), "1")))?;

    let summary = reconciler.reconcile(&desired).await?;

    assert_eq!(summary.counts.created, 6);
    assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
    assert!(gauge.peak.load(Ordering::SeqCst) >= 1);
    Ok(())
}

#[tokio::test]
async fn managed_annotation_is_stamped_on_created_objects() -> anyhow::Result<()> {
    let harness = Harness::new(fast_config())?;
    let key = configmap_key("x", "a");
    harness
        .reconciler
        .reconcile(&collection([configmap("x", "a", "1")])?)
        .await?;

    let stored = harness.cluster.object(&key).await;
    let annotation = stored
        .as_ref()
        .and_then(|r| r.metadata().annotations.get(MANAGED_ANNOTATION).cloned());
    assert_eq!(annotation.as_deref(), Some("owned"));
    Ok(())
}

#[tokio::test]
async fn retried_update_reports_its_diff_once() -> anyhow::Result<()> {
    let harness = Harness::new(fast_config())?;
    let key = configmap_key("x", "a");
    harness.cluster.seed(owned(configmap("x", "a", "1"))).await;
    harness
        .cluster
        .fail_times(Operation::Update, &key, ApiError::Unavailable("restarting".into()), 2)
        .await;

    let summary = harness
        .reconciler
        .reconcile(&collection([configmap("x", "a", "2")])?)
        .await?;

    assert_eq!(summary.outcome_for(&key), Some(&Outcome::Updated));
    assert_eq!(harness.cluster.calls_for(Operation::Update, &key).await, 3);
    assert_eq!(harness.sink.diffs().len(), 1);
    Ok(())
}

// ============================================================================
// ROLLOUTS
// ============================================================================

fn mounting_deployment(name: &str, source: &str) -> anyhow::Result<converge_core::Resource> {
    resource(&format!(
        r#"{{"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {{"name": "{name}", "namespace": "x"}},
            "spec": {{"template": {{"spec": {{
                "containers": [{{"name": "app", "image": "app:1"}}],
                "volumes": [{{"name": "cfg", "configMap": {{"name": "{source}"}}}}]}}}}}}}}"#
    ))
}

fn deployment_key(name: &str) -> ResourceKey {
    ResourceKey::namespaced("apps/v1", "Deployment", "x", name)
}

async fn rollout_hashes(harness: &Harness, key: &ResourceKey) -> Vec<String> {
    let Some(stored) = harness.cluster.object(key).await else {
        return Vec::new();
    };
    stored
        .payload()
        .select(&converge_core::FieldPath::parse("spec.template.spec.containers[].env[]"))
        .into_iter()
        .filter(|(_, entry)| entry.get("name").and_then(converge_core::Value::as_str) == Some(ROLLOUT_ENV))
        .filter_map(|(_, entry)| entry.get("value").and_then(converge_core::Value::as_str).map(String::from))
        .collect()
}

#[tokio::test]
async fn configmap_change_rolls_the_workloads_that_mount_it() -> anyhow::Result<()> {
    let harness = Harness::new(fast_config())?;
    let web = deployment_key("web");
    let other = deployment_key("other");
    let desired = |value: &str| -> anyhow::Result<ResourceCollection> {
        collection([
            configmap("x", "app", value),
            mounting_deployment("web", "app")?,
            mounting_deployment("other", "unrelated")?,
        ])
    };
    harness.reconciler.reconcile(&desired("1")?).await?;
    assert!(rollout_hashes(&harness, &web).await.is_empty());

    // WHEN: only the ConfigMap content changes
    let summary = harness.reconciler.reconcile(&desired("2")?).await?;

    // THEN: the mounting Deployment is updated with a rollout hash
    assert_eq!(summary.outcome_for(&configmap_key("x", "app")), Some(&Outcome::Updated));
    assert_eq!(summary.outcome_for(&web), Some(&Outcome::Updated));
    assert_eq!(summary.outcome_for(&other), Some(&Outcome::NoOp));
    assert_eq!(summary.counts.updated, 2);
    let first_hash = rollout_hashes(&harness, &web).await;
    assert_eq!(first_hash.len(), 1);
    assert!(rollout_hashes(&harness, &other).await.is_empty());

    // AND: the stamped Deployment stays converged
    let writes = harness.cluster.write_calls().await;
    let again = harness.reconciler.reconcile(&desired("2")?).await?;
    assert_eq!(again.counts.noop, 3);
    assert_eq!(harness.cluster.write_calls().await, writes);

    // AND: the next content change rolls it again with a new hash
    harness.reconciler.reconcile(&desired("3")?).await?;
    let second_hash = rollout_hashes(&harness, &web).await;
    assert_eq!(second_hash.len(), 1);
    assert_ne!(first_hash, second_hash);
    Ok(())
}

#[tokio::test]
async fn configmap_in_earlier_stage_rolls_workload_in_later_stage() -> anyhow::Result<()> {
    let harness = Harness::new(fast_config())?;
    let web = deployment_key("web");
    let stages = |value: &str| -> anyhow::Result<Vec<ResourceCollection>> {
        Ok(vec![
            collection([configmap("x", "app", value)])?,
            collection([mounting_deployment("web", "app")?])?,
        ])
    };
    harness
        .reconciler
        .reconcile_staged(&stages("1")?, &PassCancellation::new())
        .await?;

    let summary = harness
        .reconciler
        .reconcile_staged(&stages("2")?, &PassCancellation::new())
        .await?;

    assert_eq!(summary.outcome_for(&web), Some(&Outcome::Updated));
    assert_eq!(harness.cluster.calls_for(Operation::Update, &web).await, 1);
    let web_results = harness.sink.results().into_iter().filter(|r| r.key == web).count();
    assert_eq!(web_results, 2);
    assert_eq!(rollout_hashes(&harness, &web).await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn rollout_can_be_switched_off() -> anyhow::Result<()> {
    let harness = Harness::new(fast_config().rollout_on_config_change(false))?;
    let web = deployment_key("web");
    let desired = |value: &str| -> anyhow::Result<ResourceCollection> {
        collection([configmap("x", "app", value), mounting_deployment("web", "app")?])
    };
    harness.reconciler.reconcile(&desired("1")?).await?;

    let summary = harness.reconciler.reconcile(&desired("2")?).await?;

    assert_eq!(summary.outcome_for(&web), Some(&Outcome::NoOp));
    assert_eq!(harness.cluster.calls_for(Operation::Update, &web).await, 0);
    Ok(())
}
