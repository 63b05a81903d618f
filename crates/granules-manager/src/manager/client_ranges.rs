// Copyright (c) Granules Contributors
// SPDX-License-Identifier: Apache-2.0

//! Watches the user-declared blob-range set and reconciles it against the
//! manager's in-memory view, activating new ranges and revoking removed
//! ones.

use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use granules_core::{keys, messages::AssignKind, Key, KeyRange, RangeMap};

use super::{assignment::RangeAssignment, split, ManagerInner};
use crate::{errors::ManagerError, metadata::run_transaction};

/// Ranges that changed state in one reconciliation step.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct RangeDiff {
    /// Ranges that became active and need granules assigned.
    pub to_add: Vec<KeyRange>,
    /// Ranges that became inactive and need their granules revoked.
    pub to_remove: Vec<KeyRange>,
}

// Applies one declared range to the known map, recording the parts whose
// active state actually flips.
fn apply_client_range(
    known: &mut RangeMap<bool>,
    diff: &mut RangeDiff,
    range: KeyRange,
    active: bool,
) {
    for (stored, value) in known.intersecting_ranges(&range) {
        if *value != active {
            let overlap = stored
                .intersection(&range)
                .expect("intersecting ranges overlap");
            if active {
                diff.to_add.push(overlap);
            } else {
                diff.to_remove.push(overlap);
            }
        }
    }
    known.insert(range, active);
}

/// Merges the freshly read boundary list into `known`, returning the net
/// additions and removals clipped to the user key space. The map is
/// coalesced afterwards, so no two adjacent intervals share a value.
pub(crate) fn update_client_ranges(
    known: &mut RangeMap<bool>,
    boundaries: &[(Key, Bytes)],
) -> RangeDiff {
    let normal = KeyRange::normal();
    let mut diff = RangeDiff::default();

    if boundaries.is_empty() {
        // Nothing declared: deactivate the whole key space.
        apply_client_range(known, &mut diff, normal.clone(), false);
    } else {
        if boundaries[0].0 > normal.begin {
            apply_client_range(
                known,
                &mut diff,
                KeyRange::new(normal.begin.clone(), boundaries[0].0.clone()),
                false,
            );
        }
        for pair in boundaries.windows(2) {
            let (begin, value) = &pair[0];
            let (end, _) = &pair[1];
            if *begin >= normal.end {
                tracing::debug!(boundary = %begin, "ignoring boundary outside the user key space");
                break;
            }
            let active = value.as_ref() == b"1";
            let end = end.clone().min(normal.end.clone());
            apply_client_range(known, &mut diff, KeyRange::new(begin.clone(), end), active);
        }
        let last = &boundaries[boundaries.len() - 1].0;
        if *last < normal.end {
            apply_client_range(
                known,
                &mut diff,
                KeyRange::new(last.clone(), normal.end.clone()),
                false,
            );
        }
    }

    known.coalesce(&normal);
    diff
}

/// Long-running reconciliation loop.
///
/// Reads the declared ranges and the change key in one transaction, emits
/// revokes and (split) assigns for the diff, then sleeps on a watch of the
/// change key. A manager at epoch ≥ 2 first overwrites the known map with
/// the persisted boundaries, because recovery populated it from granules
/// rather than client declarations.
#[tracing::instrument(skip_all, fields(epoch = inner.epoch))]
pub(crate) async fn monitor_client_ranges(inner: Arc<ManagerInner>) -> Result<(), ManagerError> {
    let mut need_to_coalesce = inner.epoch > 1;

    loop {
        let metadata = inner.metadata.clone();
        let (change_value, boundaries) = run_transaction(&inner.kv, |txn| {
            let metadata = metadata.clone();
            async move {
                let change_value = txn.get(&keys::client_range_change_key()).await?;
                let boundaries = metadata.read_client_range_boundaries(txn).await?;
                Ok((change_value, boundaries))
            }
            .boxed()
        })
        .await?;

        let diff = {
            let mut state = inner.state.lock().expect("state mutex not poisoned");
            let diff = update_client_ranges(&mut state.known_client_ranges, &boundaries);
            if need_to_coalesce {
                need_to_coalesce = false;
                for pair in boundaries.windows(2) {
                    let (begin, value) = &pair[0];
                    let (end, _) = &pair[1];
                    if *begin >= state.known_client_ranges.map_end().clone() {
                        break;
                    }
                    let end = end.clone().min(state.known_client_ranges.map_end().clone());
                    let active = value.as_ref() == b"1";
                    state
                        .known_client_ranges
                        .insert(KeyRange::new(begin.clone(), end), active);
                }
            }
            diff
        };

        for range in diff.to_remove {
            tracing::info!(%range, "client range removed, revoking");
            inner.queue.send(RangeAssignment::Revoke {
                range,
                worker: None,
                dispose: true,
            });
        }

        for range in diff.to_add {
            let chunks = split::split_range(&inner, &range, false).await?;
            tracing::info!(%range, granules = chunks.len() - 1, "client range added");

            // Persist before assigning, so a successor manager picks up the
            // same granule boundaries.
            inner.metadata.persist_initial_mapping(&chunks).await?;

            for pair in chunks.windows(2) {
                inner
                    .queue
                    .send_backpressured(RangeAssignment::Assign {
                        range: KeyRange::new(pair[0].clone(), pair[1].clone()),
                        worker: None,
                        kind: AssignKind::Normal,
                    })
                    .await;
            }
            inner.queue.wait_drained().await;
        }

        // Re-read the change key in a fresh transaction; if it moved while
        // we were processing, loop immediately, otherwise sleep on a watch.
        let watch = run_transaction(&inner.kv, |txn| {
            let change_value = change_value.clone();
            async move {
                let now = txn.get(&keys::client_range_change_key()).await?;
                if now == change_value {
                    Ok(Some(txn.watch(&keys::client_range_change_key())))
                } else {
                    Ok(None)
                }
            }
            .boxed()
        })
        .await?;

        match watch {
            Some(watch) => {
                tracing::debug!("client ranges processed, awaiting change");
                watch.await;
            }
            None => tracing::debug!("client ranges changed while processing, rescanning"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known() -> RangeMap<bool> {
        RangeMap::new(false, KeyRange::normal().end)
    }

    fn boundary(key: &str, active: bool) -> (Key, Bytes) {
        (
            Key::from(key),
            if active {
                Bytes::from_static(b"1")
            } else {
                Bytes::new()
            },
        )
    }

    fn range(begin: &str, end: &str) -> KeyRange {
        KeyRange::new(begin, end)
    }

    fn active_ranges(known: &RangeMap<bool>) -> Vec<KeyRange> {
        known
            .ranges()
            .into_iter()
            .filter(|(_, active)| **active)
            .map(|(r, _)| r)
            .collect()
    }

    #[test]
    fn empty_to_single_range() {
        let mut known = known();
        let diff = update_client_ranges(&mut known, &[boundary("A", true), boundary("B", false)]);
        assert_eq!(diff.to_add, vec![range("A", "B")]);
        assert!(diff.to_remove.is_empty());
        assert_eq!(active_ranges(&known), vec![range("A", "B")]);
        assert_eq!(known.len(), 3);
    }

    #[test]
    fn fill_gap_between_ranges() {
        let mut known = known();
        update_client_ranges(
            &mut known,
            &[
                boundary("A", true),
                boundary("B", false),
                boundary("C", true),
                boundary("D", false),
            ],
        );

        let diff = update_client_ranges(&mut known, &[boundary("A", true), boundary("D", false)]);
        assert_eq!(diff.to_add, vec![range("B", "C")]);
        assert!(diff.to_remove.is_empty());
        assert_eq!(active_ranges(&known), vec![range("A", "D")]);
    }

    #[test]
    fn shrink_range_on_both_sides() {
        let mut known = known();
        update_client_ranges(&mut known, &[boundary("A", true), boundary("D", false)]);

        let diff = update_client_ranges(&mut known, &[boundary("B", true), boundary("C", false)]);
        assert!(diff.to_add.is_empty());
        assert_eq!(diff.to_remove, vec![range("A", "B"), range("C", "D")]);
        assert_eq!(active_ranges(&known), vec![range("B", "C")]);
    }

    // A full reconciliation walk through adding, merging, shrinking, and
    // re-splitting declared ranges; every step checks the emitted diff and
    // the resulting coalesced map.
    #[test]
    fn reconciliation_walk() {
        let mut known = known();

        // [A - B)
        let diff = update_client_ranges(&mut known, &[boundary("A", true), boundary("B", false)]);
        assert_eq!(diff.to_add, vec![range("A", "B")]);
        assert!(diff.to_remove.is_empty());

        // Nothing declared.
        let diff = update_client_ranges(&mut known, &[]);
        assert!(diff.to_add.is_empty());
        assert_eq!(diff.to_remove, vec![range("A", "B")]);
        assert_eq!(known.len(), 1);

        // [A - B) and [C - D).
        let declared = [
            boundary("A", true),
            boundary("B", false),
            boundary("C", true),
            boundary("D", false),
        ];
        let diff = update_client_ranges(&mut known, &declared);
        assert_eq!(diff.to_add, vec![range("A", "B"), range("C", "D")]);
        assert!(diff.to_remove.is_empty());
        assert_eq!(active_ranges(&known), vec![range("A", "B"), range("C", "D")]);

        // [A - D) closes the gap.
        let diff = update_client_ranges(&mut known, &[boundary("A", true), boundary("D", false)]);
        assert_eq!(diff.to_add, vec![range("B", "C")]);
        assert!(diff.to_remove.is_empty());

        // [A - C) cuts the tail.
        let diff = update_client_ranges(&mut known, &[boundary("A", true), boundary("C", false)]);
        assert!(diff.to_add.is_empty());
        assert_eq!(diff.to_remove, vec![range("C", "D")]);

        // [B - C) cuts the head.
        let diff = update_client_ranges(&mut known, &[boundary("B", true), boundary("C", false)]);
        assert!(diff.to_add.is_empty());
        assert_eq!(diff.to_remove, vec![range("A", "B")]);

        // [B - D) extends the tail.
        let diff = update_client_ranges(&mut known, &[boundary("B", true), boundary("D", false)]);
        assert_eq!(diff.to_add, vec![range("C", "D")]);
        assert!(diff.to_remove.is_empty());

        // [A - D) extends the head.
        let diff = update_client_ranges(&mut known, &[boundary("A", true), boundary("D", false)]);
        assert_eq!(diff.to_add, vec![range("A", "B")]);
        assert!(diff.to_remove.is_empty());

        // Back to [A - B) and [C - D): the middle goes away.
        let diff = update_client_ranges(&mut known, &declared);
        assert!(diff.to_add.is_empty());
        assert_eq!(diff.to_remove, vec![range("B", "C")]);

        // [B - C): everything flips.
        let diff = update_client_ranges(&mut known, &[boundary("B", true), boundary("C", false)]);
        assert_eq!(diff.to_add, vec![range("B", "C")]);
        assert_eq!(diff.to_remove, vec![range("A", "B"), range("C", "D")]);
        assert_eq!(active_ranges(&known), vec![range("B", "C")]);
    }

    #[test]
    fn boundaries_clip_to_user_key_space() {
        let mut known = known();
        let normal_end = KeyRange::normal().end;
        let diff = update_client_ranges(
            &mut known,
            &[
                boundary("A", true),
                (Key::from(&b"\xff\x05"[..]), Bytes::new()),
            ],
        );
        assert_eq!(
            diff.to_add,
            vec![KeyRange::new(Key::from("A"), normal_end.clone())]
        );
        assert_eq!(
            active_ranges(&known),
            vec![KeyRange::new(Key::from("A"), normal_end)]
        );
    }

    // Whatever the intermediate declarations were, the known map always ends
    // up equal to the latest declaration, and the cumulative diffs replay to
    // the same state.
    #[test]
    fn diff_replay_matches_final_declaration() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(17);
        let keys = ["A", "B", "C", "D", "E", "F", "G", "H"];

        for _ in 0..50 {
            let mut known = known();
            let mut replayed = known.clone();

            for _ in 0..6 {
                // Random alternating boundary list over a sorted key subset.
                let mut chosen: Vec<&str> = keys
                    .iter()
                    .copied()
                    .filter(|_| rng.gen_bool(0.5))
                    .collect();
                if chosen.len() % 2 == 1 {
                    chosen.pop();
                }
                let boundaries: Vec<(Key, Bytes)> = chosen
                    .iter()
                    .enumerate()
                    .map(|(i, key)| boundary(key, i % 2 == 0))
                    .collect();

                let diff = update_client_ranges(&mut known, &boundaries);
                for removed in &diff.to_remove {
                    replayed.insert(removed.clone(), false);
                }
                for added in &diff.to_add {
                    replayed.insert(added.clone(), true);
                }
            }

            replayed.coalesce(&KeyRange::normal());
            assert_eq!(
                active_ranges(&known),
                active_ranges(&replayed),
                "replaying emitted diffs diverged from the reconciled map"
            );
        }
    }
}
