// Copyright (c) Granules Contributors
// SPDX-License-Identifier: Apache-2.0

//! Worker recruitment: asks the cluster controller for candidate processes
//! and initializes one worker per process, backing off on failure.

use std::{sync::Arc, time::Duration};

use granules_core::WorkerId;

use super::{supervisor, ManagerInner};
use crate::{
    errors::{ManagerError, RecruitError},
    worker_service::{CandidateProcess, WorkerHandle},
};

// Keeps the recruit loop from spinning when the controller answers
// instantly.
const PREVENT_FAST_SPIN: Duration = Duration::from_millis(100);

/// Adopts a worker the manager has not seen before: registers it in the
/// in-memory sets and starts its supervisor. A worker whose address is
/// already claimed, or that lives in the wrong datacenter, is killed
/// instead.
pub(crate) fn adopt_worker(inner: &Arc<ManagerInner>, handle: WorkerHandle) {
    let mut state = inner.state.lock().expect("state mutex not poisoned");
    if state.dead_workers.contains(&handle.worker_id) {
        return;
    }

    if !state.worker_addresses.contains(&handle.address) && handle.dc == inner.config.dc {
        state.worker_addresses.insert(handle.address.clone());
        state.workers.insert(handle.worker_id, handle.clone());
        state.worker_stats.entry(handle.worker_id).or_default();
        inner.metrics.live_workers.set(state.workers.len() as i64);
        drop(state);

        tracing::info!(worker = %handle.worker_id, address = %handle.address, "worker adopted");
        inner.bump_membership();
        inner.spawn_task(
            "monitor-worker",
            supervisor::monitor_worker(inner.clone(), handle),
        );
    } else if !state.workers.contains_key(&handle.worker_id) {
        drop(state);
        tracing::info!(
            worker = %handle.worker_id,
            address = %handle.address,
            "killing worker with duplicate address or foreign datacenter"
        );
        let kill_inner = inner.clone();
        inner.spawn_task("kill-unusable-worker", async move {
            supervisor::kill_worker(&kill_inner, &handle, false).await
        });
    }
}

/// The recruitment loop. Idles until recovery has acknowledged the existing
/// workers, then keeps one recruitment request outstanding, restarting when
/// nudged.
#[tracing::instrument(skip_all, fields(epoch = inner.epoch))]
pub(crate) async fn recruit_workers(inner: Arc<ManagerInner>) -> Result<(), ManagerError> {
    let mut started = inner.start_recruiting.subscribe();
    while !*started.borrow_and_update() {
        if started.changed().await.is_err() {
            return Ok(());
        }
    }

    loop {
        let exclude_addresses: Vec<String> = {
            let state = inner.state.lock().expect("state mutex not poisoned");
            let mut addresses: Vec<String> = state
                .worker_addresses
                .iter()
                .chain(state.recruiting_addresses.iter())
                .cloned()
                .collect();
            addresses.sort_unstable();
            addresses
        };

        tokio::select! {
            candidate = inner.recruitment.recruit_worker(exclude_addresses) => match candidate {
                Ok(candidate) => {
                    inner.spawn_task(
                        "initialize-worker",
                        initialize_worker(inner.clone(), candidate),
                    );
                }
                Err(error) if error.is_transient() => {
                    tracing::debug!(?error, "recruitment request failed, retrying");
                    tokio::time::sleep(inner.config.recruitment_delay).await;
                }
                Err(RecruitError::Other(error)) => return Err(error.into()),
                Err(error) => return Err(error.into()),
            },
            // Nudged: the exclusion set changed or a worker died.
            _ = inner.restart_recruiting.notified() => {}
        }
        tokio::time::sleep(PREVENT_FAST_SPIN).await;
    }
}

// Initializes one worker on a candidate process and hands it to
// `adopt_worker`.
async fn initialize_worker(
    inner: Arc<ManagerInner>,
    candidate: CandidateProcess,
) -> Result<(), ManagerError> {
    let already_used = {
        let state = inner.state.lock().expect("state mutex not poisoned");
        state.worker_addresses.contains(&candidate.address)
            || state.recruiting_addresses.contains(&candidate.address)
    };

    if !already_used {
        {
            let mut state = inner.state.lock().expect("state mutex not poisoned");
            state.recruiting_addresses.insert(candidate.address.clone());
        }
        inner.bump_membership();

        let interface_id = inner.with_rng(|rng| WorkerId::generate(rng));
        tracing::info!(address = %candidate.address, %interface_id, "initializing worker");

        match inner
            .recruitment
            .initialize_worker(&candidate, interface_id)
            .await
        {
            Ok(handle) => adopt_worker(&inner, handle),
            Err(error) if error.is_transient() => {
                tracing::debug!(?error, "worker initialization failed, backing off");
                tokio::time::sleep(inner.config.recruitment_delay).await;
            }
            Err(error) => return Err(error.into()),
        }

        {
            let mut state = inner.state.lock().expect("state mutex not poisoned");
            state.recruiting_addresses.remove(&candidate.address);
        }
        inner.bump_membership();
    }

    inner.restart_recruiting.notify_one();
    Ok(())
}
