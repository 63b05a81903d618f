// Copyright (c) Granules Contributors
// SPDX-License-Identifier: Apache-2.0

//! Startup recovery: reconstructs a consistent granule assignment from
//! in-progress splits, live worker reports, and the persisted mapping.
//!
//! Runs once, before any other component consumes the assignment queue.

use std::{collections::HashSet, sync::Arc};

use anyhow::{anyhow, bail};
use futures::future::join_all;
use granules_core::{
    keys::{self, decode_value, SplitBoundaryValue},
    messages::{AssignKind, GetGranuleAssignmentsRequest},
    AssignmentSeq, GranuleId, Key, KeyRange, RangeMap, WorkerId,
};
use tokio::sync::watch;

use super::{assignment::RangeAssignment, recruiter, ManagerInner, WorkerStats};
use crate::{errors::ManagerError, kv::KvError, worker_service::WorkerHandle};

/// One cell of the reconciliation maps: the owner (zero = none) and the
/// sequence that installed it.
pub(crate) type Claim = (WorkerId, AssignmentSeq);

const NO_CLAIM: Claim = (WorkerId::ZERO, AssignmentSeq::UNMAPPED);

/// Reconciles one reported assignment into `map`.
///
/// For every overlapping older claim, the larger `(epoch, seqno)` wins; the
/// loser is recorded in `out_of_date` for revocation. Two different workers
/// reporting the same sequence for overlapping ranges is an invariant
/// violation and aborts recovery. A persisted-mapping claim (the
/// "mapped, owner unknown" sentinel) that exactly matches a newer claim's
/// bounds but disagrees on the owner forces an explicit reassignment by
/// installing the zero owner over the range.
pub(crate) fn add_assignment(
    map: &mut RangeMap<Claim>,
    new_range: &KeyRange,
    new_worker: WorkerId,
    new_seq: AssignmentSeq,
    mut out_of_date: Option<&mut Vec<(WorkerId, KeyRange)>>,
) -> anyhow::Result<()> {
    let mut surviving_older: Vec<(KeyRange, Claim)> = Vec::new();
    let mut all_newer = true;

    let overlapping: Vec<(KeyRange, Claim)> = map
        .intersecting_ranges(new_range)
        .into_iter()
        .map(|(range, claim)| (range, *claim))
        .collect();

    for (old_range, (old_worker, old_seq)) in overlapping {
        if old_seq > new_seq {
            if new_worker != old_worker
                && !new_worker.is_zero()
                && new_seq == AssignmentSeq::UNKNOWN_OWNER
                && old_range == *new_range
            {
                // The persisted mapping disagrees with the freshest claim on
                // the owner; force an explicit reassignment to settle it.
                surviving_older.push((old_range, (WorkerId::ZERO, old_seq)));
                all_newer = false;
            } else {
                surviving_older.push((old_range, (old_worker, old_seq)));
            }
        } else {
            all_newer = false;
            if !new_worker.is_zero() && new_worker != old_worker && old_seq == new_seq {
                bail!(
                    "workers {old_worker} and {new_worker} both claim {new_range} at {new_seq}"
                );
            }
            if let Some(out_of_date) = out_of_date.as_deref_mut() {
                if !old_worker.is_zero() && old_seq < new_seq {
                    out_of_date.push((old_worker, old_range));
                }
            }
        }
    }

    if !all_newer {
        // The new claim supersedes at least part of the map; anything newer
        // than it goes back on top.
        map.insert(new_range.clone(), (new_worker, new_seq));
        if !surviving_older.is_empty() {
            if let Some(out_of_date) = out_of_date.as_deref_mut() {
                if !new_worker.is_zero() {
                    out_of_date.push((new_worker, new_range.clone()));
                }
            }
            for (range, claim) in surviving_older {
                map.insert(range, claim);
            }
        }
    } else if let Some(out_of_date) = out_of_date.as_deref_mut() {
        if !new_worker.is_zero() {
            out_of_date.push((new_worker, new_range.clone()));
        }
    }
    Ok(())
}

// One reassembled in-progress split.
struct PendingSplit {
    boundaries: Vec<Key>,
    seq: AssignmentSeq,
}

// Groups the raw split-boundary family by parent granule and folds each
// parent's children into the reconciliation map.
fn ingest_split_boundaries(
    entries: Vec<(GranuleId, Key, bytes::Bytes)>,
    splits: &mut RangeMap<Claim>,
) -> anyhow::Result<()> {
    let mut current: Option<(GranuleId, PendingSplit)> = None;

    let mut flush = |parent: GranuleId,
                     split: PendingSplit,
                     splits: &mut RangeMap<Claim>|
     -> anyhow::Result<()> {
        let mut boundaries = split.boundaries;
        boundaries.sort();
        if split.seq == AssignmentSeq::UNMAPPED || boundaries.len() < 2 {
            return Err(anyhow!("malformed split state for parent {parent}"));
        }
        tracing::debug!(%parent, seq = %split.seq, children = boundaries.len() - 1, "found in-progress split");
        for pair in boundaries.windows(2) {
            let child = KeyRange::new(pair[0].clone(), pair[1].clone());
            add_assignment(splits, &child, WorkerId::ZERO, split.seq, None)?;
        }
        Ok(())
    };

    for (parent, boundary, value) in entries {
        let same_parent = matches!(&current, Some((current_parent, _)) if *current_parent == parent);
        if !same_parent {
            if let Some((finished_parent, split)) = current.take() {
                flush(finished_parent, split, splits)?;
            }
            current = Some((
                parent,
                PendingSplit {
                    boundaries: Vec::new(),
                    seq: AssignmentSeq::UNMAPPED,
                },
            ));
        }

        let (_, split) = current.as_mut().expect("a group is always open here");
        if boundary == keys::SPLIT_BOUNDARY_MARKER {
            let marker: SplitBoundaryValue = decode_value(&value).map_err(KvError::from)?;
            split.seq = marker.seq;
        } else {
            split.boundaries.push(boundary);
        }
    }
    if let Some((parent, split)) = current.take() {
        flush(parent, split, splits)?;
    }
    Ok(())
}

/// Periodically reads the persisted worker list and adopts unknown workers.
/// Signals `ready` after the first pass so recovery can proceed.
pub(crate) async fn check_worker_list(
    inner: Arc<ManagerInner>,
    ready: watch::Sender<bool>,
) -> Result<(), ManagerError> {
    loop {
        let registrations = inner.metadata.list_workers().await?;
        for registration in &registrations {
            let known = {
                let state = inner.state.lock().expect("state mutex not poisoned");
                state.dead_workers.contains(&registration.worker_id)
                    || state.workers.contains_key(&registration.worker_id)
            };
            if known {
                continue;
            }
            match inner.recruitment.connect_worker(registration).await {
                Ok(handle) => recruiter::adopt_worker(&inner, handle),
                Err(error) => {
                    tracing::warn!(
                        worker = %registration.worker_id,
                        ?error,
                        "failed to connect to registered worker"
                    );
                }
            }
        }
        let _ = ready.send(true);

        tokio::time::sleep(inner.config.worker_list_fetch_interval).await;
    }
}

/// Reconstructs the assignment map and re-establishes ownership of every
/// granule.
#[tracing::instrument(skip_all, fields(epoch = inner.epoch))]
pub(crate) async fn recover(inner: Arc<ManagerInner>) -> Result<(), ManagerError> {
    // Step 1: learn the existing workers before anything else.
    let (ready_tx, mut ready_rx) = watch::channel(false);
    inner.spawn_task(
        "check-worker-list",
        check_worker_list(inner.clone(), ready_tx),
    );
    while !*ready_rx.borrow_and_update() {
        ready_rx
            .changed()
            .await
            .map_err(|_| ManagerError::Internal(anyhow!("worker list task stopped")))?;
    }

    let starting_workers: Vec<WorkerHandle> = {
        let state = inner.state.lock().expect("state mutex not poisoned");
        state.workers.values().cloned().collect()
    };

    // Existing workers acknowledged; recruitment may begin.
    let _ = inner.start_recruiting.send(true);

    // The first manager of a cluster has nothing to recover.
    if inner.epoch == 1 {
        let _ = inner.done_recovering.send(true);
        tracing::info!("first manager epoch, skipping recovery");
        return Ok(());
    }

    // Step 2: reassemble in-progress splits. Read causally before worker
    // assignments: workers clear split boundaries while persisting theirs.
    let mut pending_splits: RangeMap<Claim> = RangeMap::new(NO_CLAIM, KeyRange::normal().end);
    let boundary_entries = inner.metadata.read_split_boundaries().await?;
    ingest_split_boundaries(boundary_entries, &mut pending_splits)?;

    // Step 3: ask every known worker for a consistent snapshot of its
    // assignments.
    let mut assignments: RangeMap<Claim> = RangeMap::new(NO_CLAIM, KeyRange::normal().end);
    let mut out_of_date: Vec<(WorkerId, KeyRange)> = Vec::new();

    let request = GetGranuleAssignmentsRequest {
        manager_epoch: inner.epoch,
    };
    let replies = join_all(starting_workers.iter().map(|worker| {
        tokio::time::timeout(
            inner.config.worker_timeout,
            worker.api.get_granule_assignments(request),
        )
    }))
    .await;

    let mut successful = 0usize;
    for (worker, reply) in starting_workers.iter().zip(replies) {
        match reply {
            Ok(Ok(reply)) => {
                successful += 1;
                let count = reply.assignments.len();
                let mut state = inner.state.lock().expect("state mutex not poisoned");
                for assignment in reply.assignments {
                    state
                        .known_client_ranges
                        .insert(assignment.range.clone(), true);
                    add_assignment(
                        &mut assignments,
                        &assignment.range,
                        worker.worker_id,
                        assignment.seq,
                        Some(&mut out_of_date),
                    )?;
                }
                state.worker_stats.insert(
                    worker.worker_id,
                    WorkerStats {
                        num_granules_assigned: count as i64,
                    },
                );
            }
            Ok(Err(error)) => {
                tracing::warn!(worker = %worker.worker_id, ?error, "assignment query failed");
            }
            Err(_) => {
                tracing::warn!(worker = %worker.worker_id, "assignment query timed out");
            }
        }
    }
    tracing::info!(
        successful,
        total = starting_workers.len(),
        "collected worker assignment snapshots"
    );

    // Step 4: backfill gaps from the persisted mapping. The database is the
    // arbiter for ranges no worker claims; owners recorded there get the
    // "mapped, owner unknown" sentinel.
    let mapping = inner.metadata.read_granule_mapping().await?;
    for pair in mapping.windows(2) {
        let (begin, owner) = &pair[0];
        let (end, _) = &pair[1];
        if let Some(owner) = owner {
            let range = KeyRange::new(begin.clone(), end.clone());
            add_assignment(
                &mut assignments,
                &range,
                *owner,
                AssignmentSeq::UNKNOWN_OWNER,
                None,
            )?;
            let mut state = inner.state.lock().expect("state mutex not poisoned");
            state.known_client_ranges.insert(range, true);
        }
    }

    // Step 5: overlay the split results so an in-progress child wins over a
    // stale parent claim.
    for (range, claim) in pending_splits.ranges() {
        let (_, seq) = *claim;
        if seq == AssignmentSeq::UNMAPPED {
            continue;
        }
        add_assignment(
            &mut assignments,
            &range,
            WorkerId::ZERO,
            seq,
            Some(&mut out_of_date),
        )?;
    }

    // Step 6: make sure we still own the cluster, then install and emit.
    inner.metadata.verify_manager_lock().await?;

    let ending_workers: HashSet<WorkerId> = {
        let state = inner.state.lock().expect("state mutex not poisoned");
        state.workers.keys().copied().collect()
    };

    for (worker, range) in &out_of_date {
        tracing::info!(worker = %worker, %range, "revoking out-of-date assignment");
        inner.queue.send(RangeAssignment::Revoke {
            range: range.clone(),
            worker: Some(*worker),
            dispose: false,
        });
    }

    let mut explicit_assignments = 0usize;
    {
        let mut state = inner.state.lock().expect("state mutex not poisoned");
        for (range, claim) in assignments.ranges() {
            let (worker, seq) = *claim;
            if seq == AssignmentSeq::UNMAPPED {
                continue;
            }
            state.assignments.insert(range.clone(), worker);

            // A live recent owner keeps its granule silently; everything
            // else gets an explicit assignment.
            if worker.is_zero() || seq.is_sentinel() || !ending_workers.contains(&worker) {
                inner.queue.send(RangeAssignment::Assign {
                    range,
                    worker: None,
                    kind: AssignKind::Normal,
                });
                explicit_assignments += 1;
            }
        }
        inner.metrics.granules.set(state.assignments.len() as i64);
    }

    tracing::info!(
        granules = explicit_assignments,
        revoked = out_of_date.len(),
        "granule manager recovered"
    );
    let _ = inner.done_recovering.send(true);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim_map() -> RangeMap<Claim> {
        RangeMap::new(NO_CLAIM, KeyRange::normal().end)
    }

    fn range(begin: &str, end: &str) -> KeyRange {
        KeyRange::new(begin, end)
    }

    fn seq(epoch: u64, seqno: u64) -> AssignmentSeq {
        AssignmentSeq::new(epoch, seqno)
    }

    fn claims(map: &RangeMap<Claim>) -> Vec<(KeyRange, Claim)> {
        map.ranges()
            .into_iter()
            .filter(|(_, claim)| claim.1 != AssignmentSeq::UNMAPPED)
            .map(|(r, c)| (r, *c))
            .collect()
    }

    #[test]
    fn newer_claim_wins_and_older_is_out_of_date() {
        let mut map = claim_map();
        let mut out_of_date = Vec::new();

        add_assignment(&mut map, &range("a", "m"), WorkerId(1), seq(2, 5), None).unwrap();
        add_assignment(
            &mut map,
            &range("a", "m"),
            WorkerId(2),
            seq(3, 1),
            Some(&mut out_of_date),
        )
        .unwrap();

        assert_eq!(claims(&map), vec![(range("a", "m"), (WorkerId(2), seq(3, 1)))]);
        assert_eq!(out_of_date, vec![(WorkerId(1), range("a", "m"))]);
    }

    #[test]
    fn older_claim_loses_and_is_recorded() {
        let mut map = claim_map();
        let mut out_of_date = Vec::new();

        add_assignment(&mut map, &range("a", "m"), WorkerId(2), seq(3, 1), None).unwrap();
        add_assignment(
            &mut map,
            &range("a", "m"),
            WorkerId(1),
            seq(2, 5),
            Some(&mut out_of_date),
        )
        .unwrap();

        assert_eq!(claims(&map), vec![(range("a", "m"), (WorkerId(2), seq(3, 1)))]);
        assert_eq!(out_of_date, vec![(WorkerId(1), range("a", "m"))]);
    }

    #[test]
    fn partial_overlap_keeps_newer_fragment() {
        let mut map = claim_map();
        let mut out_of_date = Vec::new();

        add_assignment(&mut map, &range("f", "m"), WorkerId(2), seq(3, 7), None).unwrap();
        add_assignment(
            &mut map,
            &range("a", "m"),
            WorkerId(1),
            seq(2, 9),
            Some(&mut out_of_date),
        )
        .unwrap();

        assert_eq!(
            claims(&map),
            vec![
                (range("a", "f"), (WorkerId(1), seq(2, 9))),
                (range("f", "m"), (WorkerId(2), seq(3, 7))),
            ]
        );
        // The superseded newcomer is revoked wholesale.
        assert_eq!(out_of_date, vec![(WorkerId(1), range("a", "m"))]);
    }

    #[test]
    fn mapping_owner_disagreement_forces_reassignment() {
        let mut map = claim_map();

        add_assignment(&mut map, &range("a", "m"), WorkerId(2), seq(3, 7), None).unwrap();
        // The persisted mapping names a different owner with the sentinel
        // sequence; the range must fall back to explicit reassignment.
        add_assignment(
            &mut map,
            &range("a", "m"),
            WorkerId(1),
            AssignmentSeq::UNKNOWN_OWNER,
            None,
        )
        .unwrap();

        assert_eq!(
            claims(&map),
            vec![(range("a", "m"), (WorkerId::ZERO, seq(3, 7)))]
        );
    }

    #[test]
    fn equal_sequence_different_workers_is_fatal() {
        let mut map = claim_map();
        add_assignment(&mut map, &range("a", "m"), WorkerId(1), seq(3, 7), None).unwrap();
        let result = add_assignment(&mut map, &range("d", "h"), WorkerId(2), seq(3, 7), None);
        assert!(result.is_err());
    }

    #[test]
    fn split_children_overlay_parent() {
        let mut splits = claim_map();
        let entries = vec![
            (
                GranuleId(1),
                keys::SPLIT_BOUNDARY_MARKER,
                granules_core::keys::encode_value(&SplitBoundaryValue { seq: seq(2, 11) }),
            ),
            (GranuleId(1), Key::from("a"), bytes::Bytes::new()),
            (GranuleId(1), Key::from("f"), bytes::Bytes::new()),
            (GranuleId(1), Key::from("m"), bytes::Bytes::new()),
        ];
        ingest_split_boundaries(entries, &mut splits).unwrap();

        assert_eq!(
            claims(&splits),
            vec![
                (range("a", "f"), (WorkerId::ZERO, seq(2, 11))),
                (range("f", "m"), (WorkerId::ZERO, seq(2, 11))),
            ]
        );
    }

    #[test]
    fn split_groups_are_separated_by_parent() {
        let mut splits = claim_map();
        let marker =
            granules_core::keys::encode_value(&SplitBoundaryValue { seq: seq(2, 4) });
        let entries = vec![
            (GranuleId(1), Key::from("a"), bytes::Bytes::new()),
            (GranuleId(1), Key::from("c"), bytes::Bytes::new()),
            (GranuleId(1), keys::SPLIT_BOUNDARY_MARKER, marker.clone()),
            (GranuleId(2), Key::from("m"), bytes::Bytes::new()),
            (GranuleId(2), Key::from("p"), bytes::Bytes::new()),
            (GranuleId(2), keys::SPLIT_BOUNDARY_MARKER, marker),
        ];
        ingest_split_boundaries(entries, &mut splits).unwrap();
        assert_eq!(claims(&splits).len(), 2);
    }
}
