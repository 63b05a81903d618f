// Copyright (c) Granules Contributors
// SPDX-License-Identifier: Apache-2.0

//! Retention garbage collection: processes prune intents by walking the
//! granule history backwards from the active granules, deleting files and
//! metadata past the retention boundary.
//!
//! Files are always deleted before their metadata, so a crash leaves at
//! worst orphaned files, and file deletion is idempotent so retries are
//! harmless. GC failures never kill the manager; the intent is retried on
//! the next pass.

use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
};

use futures::{future::join_all, FutureExt};
use granules_core::{
    keys::{self, PruneIntent},
    GranuleId, Key, KeyRange, Version, MAX_VERSION,
};

use super::ManagerInner;
use crate::{errors::ManagerError, metadata::run_transaction};

/// Watches the prune change key and sweeps all pending intents on every
/// change, or after `prune_timeout` in case a change was missed.
#[tracing::instrument(skip_all, fields(epoch = inner.epoch))]
pub(crate) async fn monitor_prune_intents(inner: Arc<ManagerInner>) -> Result<(), ManagerError> {
    let mut last_seen: Option<bytes::Bytes> = None;

    loop {
        // Wait for the change key to move, with a timeout fallback.
        loop {
            let (current, watch) = run_transaction(&inner.kv, |txn| {
                async move {
                    let current = txn.get(&keys::prune_change_key()).await?;
                    let watch = txn.watch(&keys::prune_change_key());
                    Ok((current, watch))
                }
                .boxed()
            })
            .await?;

            if current.is_some() && current != last_seen {
                last_seen = current;
                break;
            }

            tokio::select! {
                _ = watch => tracing::debug!("prune change key moved"),
                _ = tokio::time::sleep(inner.config.prune_timeout) => {
                    tracing::debug!("prune watch timed out, sweeping anyway");
                    break;
                }
            }
        }

        let intents = match inner.metadata.read_prune_intents().await {
            Ok(intents) => intents,
            Err(error) => {
                tracing::warn!(?error, "failed to read prune intents");
                continue;
            }
        };

        // Process this batch to completion before rescanning, so a timeout
        // firing mid-prune cannot race a second prune of the same range.
        for (range, intent) in intents {
            tracing::info!(
                %range,
                prune_version = intent.prune_version,
                force = intent.force,
                "processing prune intent"
            );
            match prune_range(&inner, &range, &intent).await {
                Ok(()) => inner.metrics.prunes_processed.inc(),
                Err(error) => {
                    tracing::warn!(%range, ?error, "prune failed; intent left for retry");
                }
            }
        }
    }
}

// A node of the history traversal: a granule's range and version interval.
#[derive(Debug)]
struct HistoryNode {
    range: KeyRange,
    start_version: Version,
    end_version: Version,
}

/// Prunes `range` at `intent.prune_version`.
///
/// BFS over the history DAG seeded with the currently active granules:
/// every node whose versions end at or before the prune version (or any
/// node, under force) is fully deleted; nodes straddling the boundary are
/// partially deleted. Finally the intent is cleared unless a newer intent
/// replaced it.
async fn prune_range(
    inner: &Arc<ManagerInner>,
    range: &KeyRange,
    intent: &PruneIntent,
) -> Result<(), ManagerError> {
    let mut queue: VecDeque<HistoryNode> = VecDeque::new();
    let mut visited: HashSet<(Key, Version)> = HashSet::new();
    let mut to_fully_delete: Vec<(GranuleId, KeyRange, Version)> = Vec::new();
    let mut to_partially_delete: Vec<GranuleId> = Vec::new();

    // Seed with the active granules lying inside the pruned range. Prune
    // boundaries are expected to respect granule boundaries; partially
    // covered granules are skipped.
    let active: Vec<KeyRange> = {
        let state = inner.state.lock().expect("state mutex not poisoned");
        state
            .assignments
            .intersecting_ranges(range)
            .into_iter()
            .map(|(granule_range, _)| granule_range)
            .collect()
    };
    for granule_range in active {
        if !range.contains_range(&granule_range) {
            continue;
        }
        if let Some((version, _)) = inner.metadata.latest_history(&granule_range).await? {
            visited.insert((granule_range.begin.clone(), version));
            queue.push_back(HistoryNode {
                range: granule_range,
                start_version: version,
                end_version: MAX_VERSION,
            });
        }
    }

    while let Some(node) = queue.pop_front() {
        let Some(history) = inner
            .metadata
            .read_history(&node.range, node.start_version)
            .await?
        else {
            // Already deleted by an earlier, interrupted pass.
            tracing::debug!(range = %node.range, version = node.start_version, "history node gone");
            continue;
        };

        if intent.force || node.end_version <= intent.prune_version {
            to_fully_delete.push((history.granule_id, node.range.clone(), node.start_version));
        } else if node.start_version < intent.prune_version {
            to_partially_delete.push(history.granule_id);
        }

        for (parent_range, parent_start) in history.parents {
            if !visited.insert((parent_range.begin.clone(), parent_start)) {
                continue;
            }
            // The parent's history ends where this node's starts.
            queue.push_back(HistoryNode {
                range: parent_range,
                start_version: parent_start,
                end_version: node.start_version,
            });
        }
    }

    tracing::debug!(
        full = to_fully_delete.len(),
        partial = to_partially_delete.len(),
        "classified history nodes"
    );

    // Full deletes run one at a time, oldest ancestors first, so a crash
    // cannot leave a history node that is only reachable through deleted
    // nodes.
    for (granule_id, node_range, node_version) in to_fully_delete.iter().rev() {
        fully_delete_granule(inner, *granule_id, node_range, *node_version).await?;
    }

    // Partial deletes only trim files of leaves and may run in parallel.
    let partials = to_partially_delete
        .iter()
        .map(|granule_id| partially_delete_granule(inner, *granule_id, intent.prune_version));
    for result in join_all(partials).await {
        result?;
    }

    inner
        .metadata
        .clear_prune_intent_if_matches(&range.begin, intent)
        .await?;
    Ok(())
}

// Deletes every file of the granule, then its history entry and file keys.
async fn fully_delete_granule(
    inner: &Arc<ManagerInner>,
    granule_id: GranuleId,
    range: &KeyRange,
    version: Version,
) -> Result<(), ManagerError> {
    tracing::debug!(%granule_id, "fully deleting granule");
    let files = inner.metadata.granule_files(granule_id).await?;

    let paths = files
        .snapshots
        .iter()
        .chain(files.deltas.iter())
        .map(|(_, info)| info.path.clone());
    delete_files(inner, paths).await?;

    run_transaction(inner.metadata.store(), |txn| {
        let history_key = keys::history_key(range, version);
        let file_range = keys::granule_files_range(granule_id);
        async move {
            txn.clear(&history_key);
            txn.clear_range(&file_range);
            Ok(())
        }
        .boxed()
    })
    .await?;
    Ok(())
}

// Deletes snapshots older than the newest snapshot at or below
// `prune_version`, and all delta files up to that snapshot's version.
async fn partially_delete_granule(
    inner: &Arc<ManagerInner>,
    granule_id: GranuleId,
    prune_version: Version,
) -> Result<(), ManagerError> {
    tracing::debug!(%granule_id, "partially deleting granule");
    let files = inner.metadata.granule_files(granule_id).await?;

    let Some(latest_snapshot) = files
        .snapshots
        .iter()
        .rev()
        .map(|(version, _)| *version)
        .find(|version| *version <= prune_version)
    else {
        // The granule's first snapshot is already past the boundary.
        tracing::debug!(%granule_id, "no snapshot at or below the prune version");
        return Ok(());
    };

    let mut doomed_paths = Vec::new();
    let mut doomed_keys = Vec::new();
    for (version, info) in &files.snapshots {
        if *version < latest_snapshot {
            doomed_paths.push(info.path.clone());
            doomed_keys.push(keys::granule_file_key(
                granule_id,
                keys::FileKind::Snapshot,
                *version,
            ));
        }
    }
    // The delta at the snapshot's own version is covered by the snapshot.
    for (version, info) in &files.deltas {
        if *version <= latest_snapshot {
            doomed_paths.push(info.path.clone());
            doomed_keys.push(keys::granule_file_key(
                granule_id,
                keys::FileKind::Delta,
                *version,
            ));
        }
    }

    delete_files(inner, doomed_paths).await?;

    run_transaction(inner.metadata.store(), |txn| {
        let doomed_keys = doomed_keys.clone();
        async move {
            for key in &doomed_keys {
                txn.clear(key);
            }
            Ok(())
        }
        .boxed()
    })
    .await?;
    Ok(())
}

async fn delete_files(
    inner: &Arc<ManagerInner>,
    paths: impl IntoIterator<Item = String>,
) -> Result<(), ManagerError> {
    let deletions = paths.into_iter().map(|path| {
        let files = inner.files.clone();
        let metrics = inner.metrics.clone();
        async move {
            files.delete(&path).await?;
            metrics.files_deleted.inc();
            Ok::<(), anyhow::Error>(())
        }
    });
    for result in join_all(deletions).await {
        result?;
    }
    Ok(())
}
