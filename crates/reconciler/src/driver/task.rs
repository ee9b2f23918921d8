//! Per-key state machine.
//!
//! ```text
//! Planned -> Fetching -> Creating -> Settled
//!                     -> Updating -> Settled
//!                     -> Settled(NoOp)
//! ```
//!
//! Stale-version conflicts send an update back to `Fetching`; a create that
//! finds the object already present re-fetches once. Every retry consumes one
//! attempt from a single bounded counter.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use converge_core::{DesiredResource, ExistingResource, ResourceKey};
use tracing::{debug, warn};

use super::inflight::Lease;
use super::retry::RetryPolicy;
use crate::client::{ApiError, ApiResult, ClusterClient, ConflictKind};
use crate::diff;
use crate::equality::EqualityRegistry;
use crate::error::Error;
use crate::shutdown::{CancelToken, PassCancellation};
use crate::sink::ReconcileSink;
use crate::types::{FailureReason, Outcome, ReconcileResult};

/// What a task hands back to the pass.
#[derive(Debug)]
pub(crate) enum TaskReport {
    Finished(ReconcileResult),
    /// A newer task took the key; the result is discarded.
    Superseded(ResourceKey),
    /// Nothing to do for this key and nothing to report.
    Skipped(ResourceKey),
}

impl TaskReport {
    pub(crate) const fn key(&self) -> &ResourceKey {
        match self {
            Self::Finished(result) => &result.key,
            Self::Superseded(key) | Self::Skipped(key) => key,
        }
    }
}

/// Pass-wide abort raised when credentials are rejected. The first cause is
/// kept.
#[derive(Debug, Default)]
pub(crate) struct Abort {
    signal: PassCancellation,
    cause: Mutex<Option<(ResourceKey, String)>>,
}

impl Abort {
    fn trigger(&self, key: &ResourceKey, reason: &str) {
        if let Ok(mut cause) = self.cause.lock() {
            cause.get_or_insert_with(|| (key.clone(), reason.to_string()));
        }
        self.signal.cancel();
    }

    fn token(&self) -> CancelToken {
        self.signal.token()
    }

    /// The pass-level error, once triggered.
    pub(crate) fn error(&self) -> Option<Error> {
        if !self.signal.is_cancelled() {
            return None;
        }
        let cause = self.cause.lock().ok().and_then(|cause| cause.clone());
        cause.map(|(key, reason)| Error::unauthorized(key, reason))
    }
}

/// Shared, read-only inputs of every task in a pass.
pub(crate) struct TaskContext<'a> {
    pub client: &'a dyn ClusterClient,
    pub registry: &'a EqualityRegistry,
    pub sink: &'a dyn ReconcileSink,
    pub retry: &'a RetryPolicy,
    pub request_timeout: Duration,
    pub cancellation: &'a PassCancellation,
    pub abort: &'a Abort,
    pub abort_on_unauthorized: bool,
    /// Pass generation, newer passes have larger values.
    pub generation: u64,
}

/// Why a task stopped before settling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stop {
    Cancelled,
    Superseded,
}

struct Signals {
    pass: CancelToken,
    abort: CancelToken,
    lease: CancelToken,
}

impl Signals {
    fn check(&self) -> Option<Stop> {
        if self.lease.is_cancelled() {
            Some(Stop::Superseded)
        } else if self.pass.is_cancelled() || self.abort.is_cancelled() {
            Some(Stop::Cancelled)
        } else {
            None
        }
    }

    async fn sleep(&mut self, delay: Duration) -> Result<(), Stop> {
        tokio::select! {
            () = tokio::time::sleep(delay) => Ok(()),
            () = self.lease.cancelled() => Err(Stop::Superseded),
            () = self.pass.cancelled() => Err(Stop::Cancelled),
            () = self.abort.cancelled() => Err(Stop::Cancelled),
        }
    }
}

/// Attempt bookkeeping and signal handling shared by apply and prune tasks.
pub(crate) struct Runner<'a> {
    pub ctx: &'a TaskContext<'a>,
    pub key: ResourceKey,
    pub attempt: u32,
    started: Instant,
    signals: Signals,
    _lease: Lease,
}

impl<'a> Runner<'a> {
    pub(crate) fn new(ctx: &'a TaskContext<'a>, lease: Lease) -> Self {
        let signals = Signals {
            pass: ctx.cancellation.token(),
            abort: ctx.abort.token(),
            lease: lease.token(),
        };
        Self {
            ctx,
            key: lease.key().clone(),
            attempt: 0,
            started: Instant::now(),
            signals,
            _lease: lease,
        }
    }

    pub(crate) fn check(&self) -> Option<Stop> {
        self.signals.check()
    }

    /// Run one cluster call under the request timeout.
    pub(crate) async fn call<T, F>(&self, request: F) -> ApiResult<T>
    where
        F: Future<Output = ApiResult<T>>,
    {
        let timeout = self.ctx.request_timeout;
        tokio::time::timeout(timeout, request)
            .await
            .unwrap_or_else(|_| Err(ApiError::Timeout(timeout)))
    }

    /// Back off before another attempt. `Ok(false)` when the attempt budget
    /// is spent.
    pub(crate) async fn backoff(&mut self, error: &ApiError) -> Result<bool, Stop> {
        if !self.ctx.retry.can_retry(self.attempt) {
            return Ok(false);
        }
        let delay = self.ctx.retry.backoff(self.attempt);
        warn!(
            key = %self.key,
            attempt = self.attempt,
            max_attempts = self.ctx.retry.max_attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "Retrying after backoff"
        );
        self.signals.sleep(delay).await?;
        self.attempt = self.attempt.saturating_add(1);
        Ok(true)
    }

    /// Settle with the failure `error` maps to, escalating rejected
    /// credentials when configured.
    pub(crate) fn fail(&self, error: &ApiError) -> Outcome {
        let message = error.to_string();
        if matches!(error, ApiError::Unauthorized(_)) && self.ctx.abort_on_unauthorized {
            self.ctx.abort.trigger(&self.key, &message);
        }
        Outcome::failed(error.failure_kind(), message)
    }

    pub(crate) fn finish(self, outcome: Outcome) -> TaskReport {
        if self.signals.lease.is_cancelled() {
            return TaskReport::Superseded(self.key);
        }
        let elapsed = self.started.elapsed();
        TaskReport::Finished(ReconcileResult::new(self.key, outcome, self.attempt, elapsed))
    }

    pub(crate) fn stopped(self, stop: Stop) -> TaskReport {
        match stop {
            Stop::Superseded => TaskReport::Superseded(self.key),
            Stop::Cancelled => {
                debug!(key = %self.key, attempt = self.attempt, "Task stopped by cancellation");
                let elapsed = self.started.elapsed();
                TaskReport::Finished(ReconcileResult::new(
                    self.key,
                    Outcome::Failed(FailureReason::cancelled()),
                    self.attempt,
                    elapsed,
                ))
            }
        }
    }
}

enum State {
    Planned,
    Fetching,
    Creating,
    Updating(ExistingResource),
    Settled(Outcome),
}

impl State {
    const fn name(&self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Fetching => "fetching",
            Self::Creating => "creating",
            Self::Updating(_) => "updating",
            Self::Settled(_) => "settled",
        }
    }
}

/// Converges one desired resource.
pub(crate) struct ApplyTask<'a> {
    runner: Runner<'a>,
    desired: &'a DesiredResource,
    /// Update even when the existing object already compares equal.
    forced: bool,
    refetched_after_exists: bool,
    /// The diff against the last fetched object was reported.
    explained: bool,
}

impl<'a> ApplyTask<'a> {
    pub(crate) fn new(ctx: &'a TaskContext<'a>, desired: &'a DesiredResource, lease: Lease) -> Self {
        Self {
            runner: Runner::new(ctx, lease),
            desired,
            forced: false,
            refetched_after_exists: false,
            explained: false,
        }
    }

    /// Issue the update whatever the comparison says, unless the resource
    /// is marked no-update.
    pub(crate) fn forced(mut self) -> Self {
        self.forced = true;
        self
    }

    pub(crate) async fn run(mut self) -> TaskReport {
        let mut state = State::Planned;
        loop {
            if let State::Settled(outcome) = state {
                return self.runner.finish(outcome);
            }
            if let Some(stop) = self.runner.check() {
                return self.runner.stopped(stop);
            }
            let from = state.name();
            state = match self.step(state).await {
                Ok(next) => next,
                Err(stop) => return self.runner.stopped(stop),
            };
            debug!(
                key = %self.runner.key,
                from,
                to = state.name(),
                attempt = self.runner.attempt,
                "State transition"
            );
        }
    }

    async fn step(&mut self, state: State) -> Result<State, Stop> {
        match state {
            State::Planned => {
                self.runner.attempt = 1;
                Ok(State::Fetching)
            }
            State::Fetching => self.fetch().await,
            State::Creating => self.create().await,
            State::Updating(existing) => self.update(existing).await,
            State::Settled(outcome) => Ok(State::Settled(outcome)),
        }
    }

    async fn fetch(&mut self) -> Result<State, Stop> {
        let ctx = self.runner.ctx;
        match self.runner.call(ctx.client.get(self.desired.key())).await {
            Ok(existing) => Ok(self.assess(existing)),
            Err(err) if err.is_not_found() => Ok(State::Creating),
            Err(err) if err.is_transient() => self.retry(err, State::Fetching).await,
            Err(err) => Ok(State::Settled(self.runner.fail(&err))),
        }
    }

    fn assess(&mut self, existing: ExistingResource) -> State {
        let key = self.desired.key();
        let immutable = self.desired.as_resource().is_immutable();
        if self.forced && !immutable {
            debug!(key = %key, "Forcing update");
        } else if self.runner.ctx.registry.compare(&key.kind, self.desired, &existing) {
            return State::Settled(Outcome::NoOp);
        } else if immutable {
            debug!(key = %key, "Drift ignored for no-update resource");
            return State::Settled(Outcome::NoOp);
        }
        self.explained = false;
        State::Updating(existing)
    }

    async fn create(&mut self) -> Result<State, Stop> {
        let ctx = self.runner.ctx;
        match self.runner.call(ctx.client.create(self.desired)).await {
            Ok(_) => Ok(State::Settled(Outcome::Created)),
            Err(err)
                if err.conflict_kind() == Some(ConflictKind::AlreadyExists)
                    && !self.refetched_after_exists =>
            {
                debug!(key = %self.runner.key, "Object appeared before create, fetching again");
                self.refetched_after_exists = true;
                Ok(State::Fetching)
            }
            Err(err) if err.is_transient() => self.retry(err, State::Creating).await,
            Err(err) => Ok(State::Settled(self.runner.fail(&err))),
        }
    }

    async fn update(&mut self, existing: ExistingResource) -> Result<State, Stop> {
        let ctx = self.runner.ctx;
        if !self.explained {
            let profile = ctx.registry.comparator_for(&self.desired.key().kind).profile();
            ctx.sink
                .on_diff(&diff::explain(self.desired, &existing, profile));
            self.explained = true;
        }

        let result = self
            .runner
            .call(ctx.client.update(self.desired, existing.resource_version()))
            .await;
        match result {
            Ok(_) => Ok(State::Settled(Outcome::Updated)),
            Err(err) if err.conflict_kind().is_some() || err.is_not_found() => {
                self.retry(err, State::Fetching).await
            }
            Err(err) if err.is_transient() => self.retry(err, State::Updating(existing)).await,
            Err(err) => Ok(State::Settled(self.runner.fail(&err))),
        }
    }

    async fn retry(&mut self, err: ApiError, next: State) -> Result<State, Stop> {
        if self.runner.backoff(&err).await? {
            Ok(next)
        } else {
            Ok(State::Settled(self.runner.fail(&err)))
        }
    }
}
