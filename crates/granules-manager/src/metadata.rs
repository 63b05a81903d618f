// Copyright (c) Granules Contributors
// SPDX-License-Identifier: Apache-2.0

//! Typed views over the persisted manager metadata.
//!
//! Every family from the key schema gets typed accessors here. Mutations
//! issued on behalf of the manager first call [`check_manager_lock`], which
//! makes the write linearizable against failover: a replaced manager's
//! commit necessarily conflicts on the epoch key.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt};
use granules_core::{
    keys::{
        self, decode_value, encode_value, FileInfo, FileKind, HistoryValue, LockValue, PruneIntent,
    },
    messages::WorkerRegistration,
    Epoch, GranuleId, Key, KeyRange, Version, WorkerId,
};
use granules_utils::backoff::ExponentialBackoff;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    errors::MetadataError,
    kv::{KvStore, KvTransaction},
};

// Retry pacing for metadata transactions.
const RETRY_MIN: Duration = Duration::from_millis(5);
const RETRY_MAX: Duration = Duration::from_secs(1);

/// Runs `body` in a fresh transaction, committing afterwards and retrying on
/// retryable store errors.
pub(crate) async fn run_transaction<T, F>(
    kv: &Arc<dyn KvStore>,
    mut body: F,
) -> Result<T, MetadataError>
where
    F: for<'a> FnMut(&'a mut dyn KvTransaction) -> BoxFuture<'a, Result<T, MetadataError>>,
{
    let mut rng = StdRng::from_entropy();
    let mut backoff = ExponentialBackoff::new(RETRY_MIN, RETRY_MAX);
    loop {
        let mut txn = kv.transaction();
        let outcome = body(txn.as_mut()).await;
        match outcome {
            Ok(value) => match txn.commit().await {
                Ok(()) => return Ok(value),
                Err(error) if error.is_retryable() => {}
                Err(error) => return Err(error.into()),
            },
            Err(MetadataError::Kv(error)) if error.is_retryable() => {}
            Err(error) => return Err(error),
        }
        backoff.wait(&mut rng).await;
    }
}

/// Asserts that the persisted manager epoch still equals `epoch` and adds a
/// read conflict over the epoch key, so that the commit of a replaced
/// manager fails.
pub(crate) async fn check_manager_lock(
    txn: &mut dyn KvTransaction,
    epoch: Epoch,
) -> Result<(), MetadataError> {
    let key = keys::manager_epoch_key();
    let value = txn
        .get(&key)
        .await?
        .ok_or_else(|| MetadataError::Kv(crate::kv::KvError::Corrupt(
            "manager epoch key is missing".into(),
        )))?;
    let persisted: Epoch = decode_value(&value).map_err(crate::kv::KvError::from)?;
    if persisted != epoch {
        debug_assert!(persisted > epoch, "the persisted epoch never goes backwards");
        return Err(MetadataError::Replaced);
    }
    txn.add_read_conflict(&KeyRange::new(key.clone(), key.next()));
    Ok(())
}

/// Claims the next manager epoch: reads the persisted epoch, writes its
/// successor, and returns the claimed value. Epoch 0 is never claimed.
pub async fn acquire_manager_epoch(kv: &Arc<dyn KvStore>) -> Result<Epoch, MetadataError> {
    run_transaction(kv, |txn| {
        async move {
            let key = keys::manager_epoch_key();
            let current: Epoch = match txn.get(&key).await? {
                Some(value) => decode_value(&value).map_err(crate::kv::KvError::from)?,
                None => 0,
            };
            let claimed = current + 1;
            txn.set(&key, encode_value(&claimed));
            Ok(claimed)
        }
        .boxed()
    })
    .await
}

/// Granule file records of one granule, split by kind and sorted by version.
#[derive(Debug, Clone, Default)]
pub struct GranuleFiles {
    /// Snapshot files in ascending version order.
    pub snapshots: Vec<(Version, FileInfo)>,
    /// Delta files in ascending version order.
    pub deltas: Vec<(Version, FileInfo)>,
}

/// Typed metadata accessors bound to one manager generation.
#[derive(Clone)]
pub struct Metadata {
    kv: Arc<dyn KvStore>,
    epoch: Epoch,
    scan_row_limit: usize,
    mapping_chunk_size: usize,
}

impl Metadata {
    /// Binds the accessors to a store and a manager epoch.
    pub fn new(
        kv: Arc<dyn KvStore>,
        epoch: Epoch,
        scan_row_limit: usize,
        mapping_chunk_size: usize,
    ) -> Self {
        Self {
            kv,
            epoch,
            scan_row_limit,
            mapping_chunk_size,
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    /// Re-checks the manager lock in a fresh transaction.
    pub async fn verify_manager_lock(&self) -> Result<(), MetadataError> {
        let epoch = self.epoch;
        run_transaction(&self.kv, move |txn| {
            check_manager_lock(txn, epoch).boxed()
        })
        .await
    }

    // ---- client-declared blob ranges ----------------------------------

    /// Reads the full sparse boundary list of the client blob-range map
    /// inside `txn`, in key order.
    pub(crate) async fn read_client_range_boundaries(
        &self,
        txn: &mut dyn KvTransaction,
    ) -> Result<Vec<(Key, Bytes)>, MetadataError> {
        let mut boundaries = Vec::new();
        let mut range = keys::client_ranges_range();
        loop {
            let page = txn.get_range(&range, self.scan_row_limit, false).await?;
            let more = page.more;
            for (key, value) in page.kvs {
                boundaries.push((keys::decode_client_range_key(&key)?, value));
            }
            if !more {
                return Ok(boundaries);
            }
            let last = boundaries.last().expect("a truncated page is not empty");
            range.begin = keys::client_range_key(&last.0).next();
        }
    }

    /// Declares `range` active or inactive in the client blob-range map and
    /// bumps the change key. This is the client/admin side of the protocol.
    pub async fn declare_client_range(
        &self,
        range: &KeyRange,
        active: bool,
    ) -> Result<(), MetadataError> {
        let value: Bytes = if active {
            Bytes::from_static(b"1")
        } else {
            Bytes::new()
        };
        run_transaction(&self.kv, |txn| {
            let range = range.clone();
            let value = value.clone();
            async move {
                txn.set(&keys::client_range_key(&range.begin), value);
                let end_key = keys::client_range_key(&range.end);
                if txn.get(&end_key).await?.is_none() {
                    txn.set(&end_key, Bytes::new());
                }
                txn.set(&keys::client_range_change_key(), change_token());
                Ok(())
            }
            .boxed()
        })
        .await
    }

    // ---- durable granule mapping --------------------------------------

    /// Persists the initial (unowned) granule mapping for freshly split
    /// boundaries, in chunked transactions so one giant range does not
    /// produce one giant commit.
    pub async fn persist_initial_mapping(&self, boundaries: &[Key]) -> Result<(), MetadataError> {
        assert!(boundaries.len() >= 2, "a mapping needs at least one range");
        let epoch = self.epoch;
        let mut start = 0;
        while start < boundaries.len() - 1 {
            let stop = (start + self.mapping_chunk_size).min(boundaries.len() - 1);
            run_transaction(&self.kv, |txn| {
                let chunk = boundaries[start..=stop].to_vec();
                let is_last_chunk = stop == boundaries.len() - 1;
                async move {
                    check_manager_lock(txn, epoch).await?;
                    for boundary in &chunk[..chunk.len() - 1] {
                        txn.set(
                            &keys::mapping_key(boundary),
                            encode_value(&WorkerId::ZERO),
                        );
                    }
                    if is_last_chunk {
                        // Keep whatever boundary already terminates the map
                        // here; only write the gap marker if there is none.
                        let end_key =
                            keys::mapping_key(chunk.last().expect("chunk is not empty"));
                        if txn.get(&end_key).await?.is_none() {
                            txn.set(&end_key, Bytes::new());
                        }
                    }
                    Ok(())
                }
                .boxed()
            })
            .await?;
            start = stop;
        }
        Ok(())
    }

    /// Reads the whole persisted granule mapping as a sparse boundary list;
    /// `None` marks a gap boundary.
    pub async fn read_granule_mapping(
        &self,
    ) -> Result<Vec<(Key, Option<WorkerId>)>, MetadataError> {
        let mut boundaries: Vec<(Key, Option<WorkerId>)> = Vec::new();
        let mut begin = keys::mapping_range().begin;
        let end = keys::mapping_range().end;
        loop {
            let page = run_transaction(&self.kv, |txn| {
                let range = KeyRange::new(begin.clone(), end.clone());
                let limit = self.scan_row_limit;
                async move { Ok(txn.get_range(&range, limit, false).await?) }.boxed()
            })
            .await?;
            for (key, value) in &page.kvs {
                let user_key = keys::decode_mapping_key(key)?;
                let owner = if value.is_empty() {
                    None
                } else {
                    Some(decode_value(value).map_err(crate::kv::KvError::from)?)
                };
                boundaries.push((user_key, owner));
            }
            if !page.more || page.kvs.is_empty() {
                return Ok(boundaries);
            }
            begin = page.kvs.last().expect("page is not empty").0.next();
        }
    }

    // ---- granule locks -------------------------------------------------

    /// Reads the lock of the granule currently covering `range` inside
    /// `txn`.
    pub(crate) async fn read_granule_lock(
        txn: &mut dyn KvTransaction,
        range: &KeyRange,
    ) -> Result<Option<LockValue>, MetadataError> {
        match txn.get(&keys::granule_lock_key(range)).await? {
            Some(value) => Ok(Some(
                decode_value(&value).map_err(crate::kv::KvError::from)?,
            )),
            None => Ok(None),
        }
    }

    /// Writes the lock of the granule covering `range` inside `txn`.
    pub(crate) fn write_granule_lock(
        txn: &mut dyn KvTransaction,
        range: &KeyRange,
        lock: &LockValue,
    ) {
        txn.set(&keys::granule_lock_key(range), encode_value(lock));
    }

    /// Reads the lock of the granule covering `range` in a fresh
    /// transaction.
    pub async fn granule_lock(&self, range: &KeyRange) -> Result<Option<LockValue>, MetadataError> {
        run_transaction(&self.kv, |txn| {
            let range = range.clone();
            async move { Metadata::read_granule_lock(txn, &range).await }.boxed()
        })
        .await
    }

    /// Seeds a granule lock outside any manager transaction. Worker-side in
    /// production; used by tests and by initial range activation.
    pub async fn seed_granule_lock(
        &self,
        range: &KeyRange,
        lock: &LockValue,
    ) -> Result<(), MetadataError> {
        run_transaction(&self.kv, |txn| {
            let range = range.clone();
            let lock = *lock;
            async move {
                Metadata::write_granule_lock(txn, &range, &lock);
                Ok(())
            }
            .boxed()
        })
        .await
    }

    // ---- split boundaries and split state ------------------------------

    /// Streams the whole split-boundary family in key order, i.e. grouped by
    /// parent granule. Pages run in separate transactions; split boundaries
    /// written while we scan are either wholly seen or wholly missed per
    /// parent because they are written in one transaction.
    pub async fn read_split_boundaries(
        &self,
    ) -> Result<Vec<(GranuleId, Key, Bytes)>, MetadataError> {
        let mut entries = Vec::new();
        let mut begin = keys::split_boundaries_range().begin;
        let end = keys::split_boundaries_range().end;
        loop {
            let page = run_transaction(&self.kv, |txn| {
                let range = KeyRange::new(begin.clone(), end.clone());
                let limit = self.scan_row_limit;
                async move { Ok(txn.get_range(&range, limit, false).await?) }.boxed()
            })
            .await?;
            for (key, value) in &page.kvs {
                let (parent, boundary) = keys::decode_split_boundary_key(key)?;
                entries.push((parent, boundary, value.clone()));
            }
            if !page.more || page.kvs.is_empty() {
                return Ok(entries);
            }
            begin = page.kvs.last().expect("page is not empty").0.next();
        }
    }

    // ---- granule history ------------------------------------------------

    /// Reads the history entry of the granule that covered exactly `range`
    /// starting at `version`.
    pub async fn read_history(
        &self,
        range: &KeyRange,
        version: Version,
    ) -> Result<Option<HistoryValue>, MetadataError> {
        run_transaction(&self.kv, |txn| {
            let key = keys::history_key(range, version);
            async move {
                match txn.get(&key).await? {
                    Some(value) => Ok(Some(
                        decode_value(&value).map_err(crate::kv::KvError::from)?,
                    )),
                    None => Ok(None),
                }
            }
            .boxed()
        })
        .await
    }

    /// Returns the latest history entry recorded for exactly `range`.
    pub async fn latest_history(
        &self,
        range: &KeyRange,
    ) -> Result<Option<(Version, HistoryValue)>, MetadataError> {
        run_transaction(&self.kv, |txn| {
            let family = keys::history_range_for(range);
            async move {
                let page = txn.get_range(&family, 1, true).await?;
                match page.kvs.first() {
                    Some((key, value)) => {
                        let (_, version) = keys::decode_history_key(key)?;
                        let history = decode_value(value).map_err(crate::kv::KvError::from)?;
                        Ok(Some((version, history)))
                    }
                    None => Ok(None),
                }
            }
            .boxed()
        })
        .await
    }

    /// Writes a history entry outside a manager transaction. Used when a
    /// range first becomes active; splits write theirs inside the split
    /// transaction.
    pub async fn seed_history(
        &self,
        range: &KeyRange,
        version: Version,
        value: &HistoryValue,
    ) -> Result<(), MetadataError> {
        run_transaction(&self.kv, |txn| {
            let key = keys::history_key(range, version);
            let value = value.clone();
            async move {
                txn.set(&key, encode_value(&value));
                Ok(())
            }
            .boxed()
        })
        .await
    }

    // ---- granule files --------------------------------------------------

    /// Records one granule file. Worker-side in production; used to seed
    /// tests.
    pub async fn add_granule_file(
        &self,
        granule_id: GranuleId,
        kind: FileKind,
        version: Version,
        info: &FileInfo,
    ) -> Result<(), MetadataError> {
        run_transaction(&self.kv, |txn| {
            let key = keys::granule_file_key(granule_id, kind, version);
            let info = info.clone();
            async move {
                txn.set(&key, encode_value(&info));
                Ok(())
            }
            .boxed()
        })
        .await
    }

    /// Reads all file records of one granule.
    pub async fn granule_files(&self, granule_id: GranuleId) -> Result<GranuleFiles, MetadataError> {
        let page = run_transaction(&self.kv, |txn| {
            let range = keys::granule_files_range(granule_id);
            let limit = self.scan_row_limit;
            async move { Ok(txn.get_range(&range, limit, false).await?) }.boxed()
        })
        .await?;

        let mut files = GranuleFiles::default();
        for (key, value) in &page.kvs {
            let (kind, version) = keys::decode_granule_file_key(key)?;
            let info: FileInfo = decode_value(value).map_err(crate::kv::KvError::from)?;
            match kind {
                FileKind::Snapshot => files.snapshots.push((version, info)),
                FileKind::Delta => files.deltas.push((version, info)),
            }
        }
        Ok(files)
    }

    // ---- prune intents --------------------------------------------------

    /// Files a prune intent for `range` and bumps the prune change key.
    /// This is the client/admin side of the protocol.
    pub async fn request_prune(
        &self,
        range: &KeyRange,
        intent: &PruneIntent,
    ) -> Result<(), MetadataError> {
        run_transaction(&self.kv, |txn| {
            let range = range.clone();
            let intent = *intent;
            async move {
                txn.set(&keys::prune_intent_key(&range.begin), encode_value(&intent));
                let end_key = keys::prune_intent_key(&range.end);
                if txn.get(&end_key).await?.is_none() {
                    txn.set(&end_key, Bytes::new());
                }
                txn.set(&keys::prune_change_key(), change_token());
                Ok(())
            }
            .boxed()
        })
        .await
    }

    /// Reads all pending prune intents as `(range, intent)` pairs.
    pub async fn read_prune_intents(
        &self,
    ) -> Result<Vec<(KeyRange, PruneIntent)>, MetadataError> {
        let page = run_transaction(&self.kv, |txn| {
            let range = keys::prune_intents_range();
            let limit = self.scan_row_limit;
            async move { Ok(txn.get_range(&range, limit, false).await?) }.boxed()
        })
        .await?;

        let mut boundaries = Vec::new();
        for (key, value) in &page.kvs {
            boundaries.push((keys::decode_prune_intent_key(key)?, value.clone()));
        }

        let mut intents = Vec::new();
        for pair in boundaries.windows(2) {
            let (begin, value) = &pair[0];
            let (end, _) = &pair[1];
            if value.is_empty() {
                continue;
            }
            let intent: PruneIntent = decode_value(value).map_err(crate::kv::KvError::from)?;
            intents.push((KeyRange::new(begin.clone(), end.clone()), intent));
        }
        Ok(intents)
    }

    /// Clears the prune intent at `begin` iff its durable value still equals
    /// `intent`; a newer intent filed meanwhile is left for the next pass.
    pub async fn clear_prune_intent_if_matches(
        &self,
        begin: &Key,
        intent: &PruneIntent,
    ) -> Result<(), MetadataError> {
        run_transaction(&self.kv, |txn| {
            let key = keys::prune_intent_key(begin);
            let intent = *intent;
            async move {
                let Some(value) = txn.get(&key).await? else {
                    return Ok(());
                };
                let current: PruneIntent =
                    decode_value(&value).map_err(crate::kv::KvError::from)?;
                if current == intent {
                    txn.clear(&key);
                }
                Ok(())
            }
            .boxed()
        })
        .await
    }

    // ---- worker list ----------------------------------------------------

    /// Persists a worker registration. Worker-side in production; used by
    /// recruitment doubles and tests.
    pub async fn register_worker(
        &self,
        registration: &WorkerRegistration,
    ) -> Result<(), MetadataError> {
        run_transaction(&self.kv, |txn| {
            let registration = registration.clone();
            async move {
                txn.set(
                    &keys::worker_list_key(registration.worker_id),
                    encode_value(&registration),
                );
                Ok(())
            }
            .boxed()
        })
        .await
    }

    /// Removes a worker from the persisted worker list, under the manager
    /// lock and with a read conflict on the worker's key.
    pub async fn deregister_worker(&self, worker_id: WorkerId) -> Result<(), MetadataError> {
        let epoch = self.epoch;
        run_transaction(&self.kv, |txn| {
            async move {
                check_manager_lock(txn, epoch).await?;
                let key = keys::worker_list_key(worker_id);
                txn.add_read_conflict(&KeyRange::new(key.clone(), key.next()));
                txn.clear(&key);
                Ok(())
            }
            .boxed()
        })
        .await
    }

    /// Lists all registered workers.
    pub async fn list_workers(&self) -> Result<Vec<WorkerRegistration>, MetadataError> {
        let page = run_transaction(&self.kv, |txn| {
            let range = keys::worker_list_range();
            let limit = self.scan_row_limit;
            async move { Ok(txn.get_range(&range, limit, false).await?) }.boxed()
        })
        .await?;

        let mut workers = Vec::new();
        for (_, value) in &page.kvs {
            workers.push(decode_value(value).map_err(crate::kv::KvError::from)?);
        }
        Ok(workers)
    }
}

// Opaque token written into the change keys; watchers only compare values.
fn change_token() -> Bytes {
    let token: u128 = rand::thread_rng().r#gen();
    Bytes::copy_from_slice(&token.to_be_bytes())
}

#[cfg(test)]
mod tests {
    use granules_core::AssignmentSeq;

    use super::*;
    use crate::kv::MemoryKv;

    fn store() -> Arc<dyn KvStore> {
        Arc::new(MemoryKv::new(1 << 20))
    }

    fn metadata(kv: &Arc<dyn KvStore>, epoch: Epoch) -> Metadata {
        Metadata::new(kv.clone(), epoch, 10_000, 1000)
    }

    #[tokio::test]
    async fn epochs_are_claimed_in_order() -> granules_test_utils::Result {
        let kv = store();
        assert_eq!(acquire_manager_epoch(&kv).await?, 1);
        assert_eq!(acquire_manager_epoch(&kv).await?, 2);
        assert_eq!(acquire_manager_epoch(&kv).await?, 3);
        Ok(())
    }

    #[tokio::test]
    async fn replaced_manager_cannot_commit() -> granules_test_utils::Result {
        let kv = store();
        let first = acquire_manager_epoch(&kv).await?;
        let old = metadata(&kv, first);

        // The old manager still works.
        old.deregister_worker(WorkerId(1)).await?;

        // A successor claims the epoch; the old manager's guarded writes now
        // fail with Replaced.
        acquire_manager_epoch(&kv).await?;
        assert!(matches!(
            old.deregister_worker(WorkerId(1)).await,
            Err(MetadataError::Replaced)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn initial_mapping_roundtrips() -> granules_test_utils::Result {
        let kv = store();
        let epoch = acquire_manager_epoch(&kv).await?;
        let meta = metadata(&kv, epoch);

        let boundaries: Vec<Key> = ["a", "f", "m", "z"].iter().map(|s| Key::from(*s)).collect();
        meta.persist_initial_mapping(&boundaries).await?;

        let mapping = meta.read_granule_mapping().await?;
        assert_eq!(mapping.len(), 4);
        assert_eq!(mapping[0], (Key::from("a"), Some(WorkerId::ZERO)));
        assert_eq!(mapping[2], (Key::from("m"), Some(WorkerId::ZERO)));
        assert_eq!(mapping[3], (Key::from("z"), None));
        Ok(())
    }

    #[tokio::test]
    async fn mapping_chunking_covers_all_boundaries() -> granules_test_utils::Result {
        let kv = store();
        let epoch = acquire_manager_epoch(&kv).await?;
        let meta = Metadata::new(kv.clone(), epoch, 10_000, 3);

        let boundaries: Vec<Key> = (0..10)
            .map(|i| Key::from(format!("k{i}").into_bytes()))
            .collect();
        meta.persist_initial_mapping(&boundaries).await?;

        let mapping = meta.read_granule_mapping().await?;
        assert_eq!(mapping.len(), 10);
        assert!(mapping[..9].iter().all(|(_, w)| *w == Some(WorkerId::ZERO)));
        assert_eq!(mapping[9].1, None);
        Ok(())
    }

    #[tokio::test]
    async fn latest_history_returns_newest_version() -> granules_test_utils::Result {
        let kv = store();
        let epoch = acquire_manager_epoch(&kv).await?;
        let meta = metadata(&kv, epoch);
        let range = KeyRange::new("a", "m");

        for version in [10u64, 300, 20] {
            meta.seed_history(
                &range,
                version,
                &HistoryValue {
                    granule_id: GranuleId(u128::from(version)),
                    parents: vec![],
                },
            )
            .await?;
        }

        let (version, history) = meta.latest_history(&range).await?.unwrap();
        assert_eq!(version, 300);
        assert_eq!(history.granule_id, GranuleId(300));

        // A different range has no history.
        assert!(meta.latest_history(&KeyRange::new("m", "z")).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn prune_intents_roundtrip_and_conditional_clear() -> granules_test_utils::Result {
        let kv = store();
        let epoch = acquire_manager_epoch(&kv).await?;
        let meta = metadata(&kv, epoch);
        let range = KeyRange::new("a", "m");
        let intent = PruneIntent {
            prune_version: 40,
            force: false,
        };

        meta.request_prune(&range, &intent).await?;
        let intents = meta.read_prune_intents().await?;
        assert_eq!(intents, vec![(range.clone(), intent)]);

        // A newer intent arrives before the old one is cleared; the clear
        // must leave it alone.
        let newer = PruneIntent {
            prune_version: 90,
            force: true,
        };
        meta.request_prune(&range, &newer).await?;
        meta.clear_prune_intent_if_matches(&range.begin, &intent)
            .await?;
        assert_eq!(meta.read_prune_intents().await?, vec![(range, newer)]);
        Ok(())
    }

    #[tokio::test]
    async fn worker_registration_roundtrips() -> granules_test_utils::Result {
        let kv = store();
        let epoch = acquire_manager_epoch(&kv).await?;
        let meta = metadata(&kv, epoch);

        let registration = WorkerRegistration {
            worker_id: WorkerId(7),
            address: "10.0.0.1:4500".into(),
            dc: Some("dc1".into()),
        };
        meta.register_worker(&registration).await?;
        assert_eq!(meta.list_workers().await?, vec![registration]);

        meta.deregister_worker(WorkerId(7)).await?;
        assert!(meta.list_workers().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn granule_files_split_by_kind() -> granules_test_utils::Result {
        let kv = store();
        let epoch = acquire_manager_epoch(&kv).await?;
        let meta = metadata(&kv, epoch);
        let id = GranuleId(9);

        for (kind, version) in [
            (FileKind::Snapshot, 10u64),
            (FileKind::Delta, 12),
            (FileKind::Snapshot, 20),
            (FileKind::Delta, 22),
        ] {
            meta.add_granule_file(
                id,
                kind,
                version,
                &FileInfo {
                    path: format!("g/{version}"),
                    len: 1,
                },
            )
            .await?;
        }

        let files = meta.granule_files(id).await?;
        assert_eq!(
            files.snapshots.iter().map(|(v, _)| *v).collect::<Vec<_>>(),
            vec![10, 20]
        );
        assert_eq!(
            files.deltas.iter().map(|(v, _)| *v).collect::<Vec<_>>(),
            vec![12, 22]
        );
        Ok(())
    }

    #[tokio::test]
    async fn granule_lock_roundtrips() -> granules_test_utils::Result {
        let kv = store();
        let epoch = acquire_manager_epoch(&kv).await?;
        let meta = metadata(&kv, epoch);
        let range = KeyRange::new("a", "m");
        let lock = LockValue {
            seq: AssignmentSeq::new(epoch, 5),
            granule_id: GranuleId(3),
        };
        meta.seed_granule_lock(&range, &lock).await?;

        let mut txn = kv.transaction();
        let read = Metadata::read_granule_lock(txn.as_mut(), &range).await?;
        assert_eq!(read, Some(lock));
        Ok(())
    }
}
