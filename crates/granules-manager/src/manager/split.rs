// Copyright (c) Granules Contributors
// SPDX-License-Identifier: Apache-2.0

//! Granule splitting: chunking ranges through the store's size estimator
//! and the idempotent transaction that persists a split before any child is
//! assigned.

use std::{sync::Arc, time::Duration};

use granules_core::{
    keys::{self, encode_value, HistoryValue, LockValue, SplitBoundaryValue, SplitState},
    messages::AssignKind,
    AssignmentSeq, GranuleId, Key, KeyRange, SeqNo, Version, WorkerId,
};
use granules_utils::backoff::ExponentialBackoff;
use rand::{rngs::StdRng, SeedableRng};

use super::{assignment::RangeAssignment, ManagerInner};
use crate::{
    errors::{ManagerError, MetadataError},
    metadata::{check_manager_lock, Metadata},
};

// Picks `remaining` boundaries out of `splits[start..end)` by recursive
// median selection, so the surviving boundaries stay evenly spaced across
// the key space.
fn downsample_split(splits: &[Key], out: &mut Vec<Key>, start: usize, end: usize, remaining: usize) {
    assert!(end - start >= remaining);
    if remaining == 0 {
        return;
    }
    if end - start == remaining {
        out.extend_from_slice(&splits[start..start + remaining]);
    } else {
        let mid = (start + end) / 2;
        let head_count = (remaining - 1) / 2;
        let tail_count = remaining - head_count - 1;
        assert!(mid != end && mid + 1 != start);
        downsample_split(splits, out, start, mid, head_count);
        out.push(splits[mid].clone());
        downsample_split(splits, out, mid + 1, end, tail_count);
    }
}

/// Chunks `range` through the size estimator, capping the fanout at the
/// configured maximum by downsampling evenly.
///
/// Returns the chunk boundaries including both endpoints; a range below the
/// target size yields exactly `[begin, end]`.
pub(crate) async fn split_range(
    inner: &Arc<ManagerInner>,
    range: &KeyRange,
    write_hot: bool,
) -> Result<Vec<Key>, ManagerError> {
    let boundaries = inner.estimator.split_points(range, write_hot).await?;
    assert!(boundaries.len() >= 2, "the estimator returns both endpoints");
    debug_assert_eq!(boundaries.first(), Some(&range.begin));
    debug_assert_eq!(boundaries.last(), Some(&range.end));

    // `max_split_fanout` granules need max_split_fanout + 1 boundaries.
    let max_fanout = inner.config.max_split_fanout;
    if boundaries.len() >= max_fanout + 2 {
        let mut downsampled = Vec::with_capacity(max_fanout + 1);
        downsampled.push(boundaries[0].clone());
        downsample_split(
            &boundaries,
            &mut downsampled,
            1,
            boundaries.len() - 1,
            max_fanout - 1,
        );
        downsampled.push(boundaries[boundaries.len() - 1].clone());
        assert_eq!(downsampled.len(), max_fanout + 1);
        tracing::debug!(
            %range,
            from = boundaries.len() - 1,
            to = max_fanout,
            "downsampled split fanout"
        );
        return Ok(downsampled);
    }
    Ok(boundaries)
}

/// Evaluates a worker's split report for one granule.
///
/// If the estimator no longer wants a split, re-assigns the granule to its
/// current worker as a `Continue` so it re-snapshots in place. Otherwise
/// persists the whole split (lock fence, boundary set, per-child split state
/// and history) in one idempotent transaction, then revokes the parent and
/// assigns the children.
#[tracing::instrument(skip_all, fields(epoch = inner.epoch, range = %granule_range, granule = %granule_id))]
pub(crate) async fn maybe_split_range(
    inner: Arc<ManagerInner>,
    current_worker: WorkerId,
    granule_range: KeyRange,
    granule_id: GranuleId,
    start_version: Version,
    latest_version: Version,
    write_hot: bool,
) -> Result<(), ManagerError> {
    let boundaries = split_range(&inner, &granule_range, write_hot).await?;

    if boundaries.len() == 2 {
        tracing::debug!("granule not large enough to split, continuing assignment");
        inner.queue.send(RangeAssignment::Assign {
            range: granule_range,
            worker: Some(current_worker),
            kind: AssignKind::Continue,
        });
        return Ok(());
    }

    // Child ids must be identical across commit retries, or a retried split
    // would leak split state under ids recovery will never see.
    let child_ids: Vec<GranuleId> = inner.with_rng(|rng| {
        (1..boundaries.len())
            .map(|_| GranuleId::generate(rng))
            .collect()
    });
    let split_seqno = inner.next_seqno();
    let split_seq = AssignmentSeq::new(inner.epoch, split_seqno);

    let mut new_lock_seqno: Option<SeqNo> = None;
    let mut retry_rng = StdRng::from_entropy();
    let mut backoff = ExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1));
    loop {
        let mut txn = inner.kv.transaction();
        let attempt: Result<bool, MetadataError> = async {
            check_manager_lock(txn.as_mut(), inner.epoch).await?;

            let lock = Metadata::read_granule_lock(txn.as_mut(), &granule_range)
                .await?
                .expect("a granule reporting status always has a lock");
            if lock.seq.epoch > inner.epoch {
                tracing::info!(owner = %lock.seq, "granule lock held by a newer manager");
                return Ok(false);
            }

            let lock_seqno = match new_lock_seqno {
                None => {
                    let seqno = inner.next_seqno();
                    new_lock_seqno = Some(seqno);
                    assert!(
                        AssignmentSeq::new(inner.epoch, seqno) > lock.seq,
                        "lock sequence numbers go forwards"
                    );
                    seqno
                }
                // The previous attempt may have committed with an unknown
                // result, so equality with our own write is allowed here.
                Some(seqno) => {
                    assert!(AssignmentSeq::new(inner.epoch, seqno) >= lock.seq);
                    seqno
                }
            };

            Metadata::write_granule_lock(
                txn.as_mut(),
                &granule_range,
                &LockValue {
                    seq: AssignmentSeq::new(inner.epoch, lock_seqno),
                    granule_id: lock.granule_id,
                },
            );

            txn.set(
                &keys::split_boundary_key(granule_id, &keys::SPLIT_BOUNDARY_MARKER),
                encode_value(&SplitBoundaryValue { seq: split_seq }),
            );
            for (index, pair) in boundaries.windows(2).enumerate() {
                let child_range = KeyRange::new(pair[0].clone(), pair[1].clone());
                txn.set(
                    &keys::split_boundary_key(granule_id, &pair[0]),
                    bytes::Bytes::new(),
                );
                txn.set(
                    &keys::split_state_key(granule_id, child_ids[index]),
                    encode_value(&SplitState::Initialized),
                );
                txn.set(
                    &keys::history_key(&child_range, latest_version),
                    encode_value(&HistoryValue {
                        granule_id: child_ids[index],
                        parents: vec![(granule_range.clone(), start_version)],
                    }),
                );
            }
            txn.set(
                &keys::split_boundary_key(granule_id, boundaries.last().expect("non-empty")),
                bytes::Bytes::new(),
            );
            Ok(true)
        }
        .await;

        match attempt {
            Ok(true) => match txn.commit().await {
                Ok(()) => break,
                Err(error) if error.is_retryable() => backoff.wait(&mut retry_rng).await,
                Err(error) => return Err(error.into()),
            },
            Ok(false) | Err(MetadataError::Replaced) => {
                inner.signal_replaced();
                return Ok(());
            }
            Err(MetadataError::Kv(error)) if error.is_retryable() => {
                backoff.wait(&mut retry_rng).await;
            }
            Err(MetadataError::Kv(error)) => return Err(error.into()),
        }
    }

    inner.metrics.splits_committed.inc();
    tracing::info!(
        children = boundaries.len() - 1,
        %split_seq,
        "granule split persisted"
    );

    // Hand the parent back first, then let the engine place the children.
    inner.queue.send(RangeAssignment::Revoke {
        range: granule_range,
        worker: Some(current_worker),
        dispose: false,
    });
    for pair in boundaries.windows(2) {
        inner.queue.send(RangeAssignment::Assign {
            range: KeyRange::new(pair[0].clone(), pair[1].clone()),
            worker: None,
            kind: AssignKind::Normal,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use granules_test_utils::param_test;

    use super::*;

    fn keys_from(names: &[&str]) -> Vec<Key> {
        names.iter().map(|name| Key::from(*name)).collect()
    }

    param_test! {
        downsample_keeps_endpoints_and_spacing: [
            thirteen_to_eleven: (13, 10),
            twelve_to_eleven: (12, 10),
            fifty_to_eleven: (50, 10),
        ]
    }
    fn downsample_keeps_endpoints_and_spacing(input_len: usize, max_fanout: usize) {
        let splits: Vec<Key> = (0..input_len)
            .map(|i| Key::from(format!("{i:04}").into_bytes()))
            .collect();

        let mut out = vec![splits[0].clone()];
        downsample_split(&splits, &mut out, 1, splits.len() - 1, max_fanout - 1);
        out.push(splits[splits.len() - 1].clone());

        assert_eq!(out.len(), max_fanout + 1);
        assert_eq!(out[0], splits[0]);
        assert_eq!(out[out.len() - 1], splits[splits.len() - 1]);
        // Result is a sorted subsequence of the input.
        assert!(out.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(out.iter().all(|key| splits.contains(key)));
    }

    #[test]
    fn downsample_noop_when_exact() {
        let splits = keys_from(&["a", "b", "c", "d"]);
        let mut out = Vec::new();
        downsample_split(&splits, &mut out, 1, 3, 2);
        assert_eq!(out, keys_from(&["b", "c"]));
    }
}
