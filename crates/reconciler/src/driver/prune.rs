//! Pruning of resources that left the desired state.

use std::collections::{BTreeSet, HashSet};

use converge_core::{ExistingResource, KindRef, ResourceKey};
use tracing::debug;

use super::task::{Runner, TaskContext, TaskReport};
use crate::client::ApiError;
use crate::error::{Error, Result};
use crate::types::Outcome;

/// Keys that may need deleting: previously managed keys no longer desired,
/// plus our objects of the prune kinds that nothing desires.
///
/// # Errors
///
/// Returns `ListFailed` when a prune kind cannot be listed.
pub(crate) async fn candidates(
    ctx: &TaskContext<'_>,
    previous: &BTreeSet<ResourceKey>,
    desired: &HashSet<&ResourceKey>,
    kinds: &[KindRef],
) -> Result<BTreeSet<ResourceKey>> {
    let mut candidates: BTreeSet<ResourceKey> = previous
        .iter()
        .filter(|key| !desired.contains(key))
        .cloned()
        .collect();

    for kind in kinds {
        let listed = tokio::time::timeout(
            ctx.request_timeout,
            ctx.client.list(&kind.api_version, &kind.kind),
        )
        .await
        .unwrap_or_else(|_| Err(ApiError::Timeout(ctx.request_timeout)))
        .map_err(|err| Error::list_failed(kind.clone(), err))?;

        candidates.extend(
            listed
                .iter()
                .filter(|object| object.as_resource().is_ours())
                .map(ExistingResource::key)
                .filter(|key| !desired.contains(key))
                .cloned(),
        );
    }
    Ok(candidates)
}

/// Deletes one candidate if it is still ours to delete.
pub(crate) struct PruneTask<'a> {
    runner: Runner<'a>,
}

impl<'a> PruneTask<'a> {
    pub(crate) const fn new(runner: Runner<'a>) -> Self {
        Self { runner }
    }

    pub(crate) async fn run(self) -> TaskReport {
        let mut runner = self.runner;
        if let Some(stop) = runner.check() {
            return runner.stopped(stop);
        }
        runner.attempt = 1;

        let existing = loop {
            match runner.call(runner.ctx.client.get(&runner.key)).await {
                Ok(existing) => break existing,
                Err(err) if err.is_not_found() => {
                    debug!(key = %runner.key, "Prune candidate already gone");
                    return runner.finish(Outcome::Deleted);
                }
                Err(err) if err.is_transient() => match runner.backoff(&err).await {
                    Ok(true) => {}
                    Ok(false) => {
                        let outcome = runner.fail(&err);
                        return runner.finish(outcome);
                    }
                    Err(stop) => return runner.stopped(stop),
                },
                Err(err) => {
                    let outcome = runner.fail(&err);
                    return runner.finish(outcome);
                }
            }
        };

        if let Some(reason) = keep_reason(&existing) {
            debug!(key = %runner.key, reason, "Prune candidate kept");
            return TaskReport::Skipped(runner.key);
        }

        loop {
            if let Some(stop) = runner.check() {
                return runner.stopped(stop);
            }
            match runner.call(runner.ctx.client.delete(&runner.key)).await {
                Ok(()) => return runner.finish(Outcome::Deleted),
                Err(err) if err.is_not_found() => return runner.finish(Outcome::Deleted),
                Err(err) if err.is_transient() => match runner.backoff(&err).await {
                    Ok(true) => {}
                    Ok(false) => {
                        let outcome = runner.fail(&err);
                        return runner.finish(outcome);
                    }
                    Err(stop) => return runner.stopped(stop),
                },
                Err(err) => {
                    let outcome = runner.fail(&err);
                    return runner.finish(outcome);
                }
            }
        }
    }
}

fn keep_reason(existing: &ExistingResource) -> Option<&'static str> {
    let resource = existing.as_resource();
    if !resource.is_ours() {
        Some("not managed by converge")
    } else if resource.is_protected() {
        Some("protected")
    } else if resource.is_terminating() {
        Some("already terminating")
    } else {
        None
    }
}

/// Whether a prune report leaves the key in the inventory for the next pass.
pub(crate) const fn keeps_in_inventory(report: &TaskReport) -> bool {
    match report {
        TaskReport::Finished(result) => result.outcome.is_failed(),
        TaskReport::Superseded(_) => true,
        TaskReport::Skipped(_) => false,
    }
}

