// Copyright (c) Granules Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-worker supervision: a liveness probe raced against the worker's
//! granule status stream, and the teardown path that redistributes a dead
//! worker's granules.

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use granules_core::{
    messages::{AssignKind, GranuleStatusReply, GranuleStatusRequest, HaltWorkerRequest},
    AssignmentSeq, KeyRange, RangeMap,
};

use super::{assignment::RangeAssignment, split, ManagerInner};
use crate::{
    errors::{ManagerError, WorkerRpcError},
    worker_service::WorkerHandle,
};

// Status-stream reconnect backoff bounds.
const STREAM_BACKOFF_MIN: Duration = Duration::from_millis(100);
const STREAM_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Supervises one worker until it fails or the manager is replaced.
///
/// Waits for recovery to finish first, so status reports are validated
/// against a populated assignment map.
#[tracing::instrument(skip_all, fields(epoch = inner.epoch, worker = %worker.worker_id))]
pub(crate) async fn monitor_worker(
    inner: Arc<ManagerInner>,
    worker: WorkerHandle,
) -> Result<(), ManagerError> {
    let mut done = inner.done_recovering.subscribe();
    while !*done.borrow_and_update() {
        if done.changed().await.is_err() {
            return Ok(());
        }
    }

    tokio::select! {
        _ = wait_failure(&inner, &worker) => {
            tracing::info!("worker failed its liveness probe");
        }
        result = monitor_worker_status(&inner, &worker) => match result {
            // The status loop only returns cleanly when the manager has
            // been replaced; nothing left to supervise.
            Ok(()) => return Ok(()),
            Err(WorkerRpcError::StreamClosed) => {
                tracing::info!("worker closed its status stream");
            }
            Err(error) => {
                tracing::error!(?error, "unexpected error monitoring worker status");
                return Err(anyhow::Error::from(error).into());
            }
        }
    }

    kill_worker(&inner, &worker, true).await
}

// Periodic liveness probe; resolves once the worker misses a probe.
async fn wait_failure(inner: &Arc<ManagerInner>, worker: &WorkerHandle) {
    loop {
        match tokio::time::timeout(inner.config.worker_timeout, worker.api.ping()).await {
            Ok(Ok(())) => tokio::time::sleep(inner.config.worker_ping_interval).await,
            Ok(Err(error)) => {
                tracing::debug!(?error, "worker liveness probe failed");
                return;
            }
            Err(_) => {
                tracing::debug!("worker liveness probe timed out");
                return;
            }
        }
    }
}

// Consumes the worker's status stream, reconnecting with backoff on
// transient failures. Returns `Ok(())` only when the manager was replaced.
async fn monitor_worker_status(
    inner: &Arc<ManagerInner>,
    worker: &WorkerHandle,
) -> Result<(), WorkerRpcError> {
    let mut last_seen: RangeMap<AssignmentSeq> =
        RangeMap::new(AssignmentSeq::UNMAPPED, KeyRange::normal().end);
    let mut backoff = STREAM_BACKOFF_MIN;

    loop {
        let request = GranuleStatusRequest {
            manager_epoch: inner.epoch,
        };
        let mut stream = match worker.api.granule_status_stream(request).await {
            Ok(stream) => stream,
            Err(WorkerRpcError::ManagerReplaced) => {
                inner.signal_replaced();
                return Ok(());
            }
            Err(error) if error.is_transient() => {
                tokio::time::sleep(backoff).await;
                backoff = backoff.mul_f64(1.5).min(STREAM_BACKOFF_MAX);
                continue;
            }
            Err(error) => return Err(error),
        };

        loop {
            match stream.next().await {
                Some(Ok(reply)) => {
                    backoff = STREAM_BACKOFF_MIN;
                    if handle_status_reply(inner, worker, &mut last_seen, reply) {
                        return Ok(());
                    }
                }
                Some(Err(WorkerRpcError::ManagerReplaced)) => {
                    inner.signal_replaced();
                    return Ok(());
                }
                Some(Err(error)) if error.is_transient() => {
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.mul_f64(1.5).min(STREAM_BACKOFF_MAX);
                    break;
                }
                Some(Err(error)) => return Err(error),
                None => return Err(WorkerRpcError::StreamClosed),
            }
        }
    }
}

// Returns true iff the manager was replaced.
fn handle_status_reply(
    inner: &Arc<ManagerInner>,
    worker: &WorkerHandle,
    last_seen: &mut RangeMap<AssignmentSeq>,
    reply: GranuleStatusReply,
) -> bool {
    tracing::debug!(
        range = %reply.range,
        seq = %reply.seq,
        do_split = reply.do_split,
        write_hot = reply.write_hot,
        "worker granule status"
    );

    if reply.seq.epoch > inner.epoch {
        tracing::info!(
            reported = reply.seq.epoch,
            "worker reports a manager with a higher epoch"
        );
        inner.signal_replaced();
        return true;
    }

    if !reply.do_split {
        tracing::debug!("ignoring status report without a split request");
        return false;
    }

    // Only act on the report if this worker still owns exactly this granule
    // in our mapping; anything else is a stale report.
    {
        let state = inner.state.lock().expect("state mutex not poisoned");
        let (current_range, current_worker) =
            state.assignments.range_containing(&reply.range.begin);
        if current_range != reply.range || *current_worker != worker.worker_id {
            tracing::debug!(
                owner = %current_worker,
                owned = %current_range,
                "dropping status report for a granule the worker no longer owns"
            );
            return false;
        }
    }

    let (seen_range, seen_seq) = last_seen.range_containing(&reply.range.begin);
    if seen_range == reply.range && *seen_seq == reply.seq {
        tracing::debug!("dropping duplicate status report");
        return false;
    }
    last_seen.insert(reply.range.clone(), reply.seq);

    inner.spawn_task(
        "maybe-split-range",
        split::maybe_split_range(
            inner.clone(),
            worker.worker_id,
            reply.range,
            reply.granule_id,
            reply.start_version,
            reply.latest_version,
            reply.write_hot,
        ),
    );
    false
}

/// Removes a worker from service: drops it from the in-memory sets,
/// deregisters it under the manager lock, redistributes its granules, and
/// triggers replacement recruitment.
#[tracing::instrument(skip_all, fields(epoch = inner.epoch, worker = %worker.worker_id))]
pub(crate) async fn kill_worker(
    inner: &Arc<ManagerInner>,
    worker: &WorkerHandle,
    registered: bool,
) -> Result<(), ManagerError> {
    let worker_id = worker.worker_id;

    if registered {
        let mut state = inner.state.lock().expect("state mutex not poisoned");
        state.dead_workers.insert(worker_id);
        state.workers.remove(&worker_id);
        state.worker_stats.remove(&worker_id);
        state.worker_addresses.remove(&worker.address);
        inner.metrics.live_workers.set(state.workers.len() as i64);
        drop(state);
        inner.bump_membership();
    }

    // Every granule the dead worker owned gets a targeted revoke followed by
    // a fresh assignment.
    let owned: Vec<KeyRange> = {
        let state = inner.state.lock().expect("state mutex not poisoned");
        state
            .assignments
            .ranges()
            .into_iter()
            .filter(|(_, owner)| **owner == worker_id)
            .map(|(range, _)| range)
            .collect()
    };
    tracing::info!(granules = owned.len(), "redistributing granules of dead worker");
    for range in owned {
        inner.queue.send(RangeAssignment::Revoke {
            range: range.clone(),
            worker: Some(worker_id),
            dispose: false,
        });
        inner.queue.send(RangeAssignment::Assign {
            range,
            worker: None,
            kind: AssignKind::Normal,
        });
    }

    // Halt is best-effort; the worker may well be gone already.
    let halt_inner = inner.clone();
    let halt_target = worker.clone();
    inner.spawn_task("halt-worker", async move {
        halt_worker(&halt_inner, &halt_target).await;
        Ok(())
    });

    inner.metadata.deregister_worker(worker_id).await?;
    inner.queue.wait_drained().await;

    inner.restart_recruiting.notify_one();
    if registered {
        let mut state = inner.state.lock().expect("state mutex not poisoned");
        state.dead_workers.remove(&worker_id);
    }
    inner.metrics.workers_killed.inc();
    Ok(())
}

pub(crate) async fn halt_worker(inner: &Arc<ManagerInner>, worker: &WorkerHandle) {
    let request = HaltWorkerRequest {
        manager_epoch: inner.epoch,
    };
    match worker.api.halt(request).await {
        Ok(()) => {}
        Err(WorkerRpcError::ManagerReplaced) => inner.signal_replaced(),
        Err(error) => {
            tracing::debug!(worker = %worker.worker_id, ?error, "halt request failed");
        }
    }
}
